// Domain-name to IP-address cache.
//
// Populated by policy callbacks that observe DNS responses; queried by
// later states that must match a packet against a symbolically named
// destination. Keys come straight off the wire, so the map keeps the std
// hasher (SipHash keyed with per-process random seeds).
//
// Entries live for the whole process: TTLs are parsed for display but
// never enforced here. The cache has no internal lock — callers share it
// behind `Arc<RwLock<DnsCache>>` and writes are serialized through the
// owning interaction's callback (see `policy`).

use std::collections::HashMap;
use std::net::IpAddr;

/// Initial bucket count.
const INITIAL_CAPACITY: usize = 16;

/// Map from fully-qualified domain name to the addresses observed for it,
/// in observation order, duplicates preserved.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Record addresses for `domain_name`.
    ///
    /// A name already present keeps its existing addresses and appends the
    /// new ones after them; there is no deduplication, and iteration order
    /// is the order responses were observed in.
    pub fn add(&mut self, domain_name: &str, ip_addresses: Vec<IpAddr>) {
        match self.entries.get_mut(domain_name) {
            Some(existing) => existing.extend(ip_addresses),
            None => {
                self.entries.insert(domain_name.to_owned(), ip_addresses);
            }
        }
    }

    /// Drop the entry for `domain_name`; no-op if absent.
    pub fn remove(&mut self, domain_name: &str) {
        self.entries.remove(domain_name);
    }

    /// Borrow the addresses recorded for `domain_name`.
    pub fn get(&self, domain_name: &str) -> Option<&[IpAddr]> {
        self.entries.get(domain_name).map(Vec::as_slice)
    }

    /// Detach and return the addresses recorded for `domain_name`.
    pub fn pop(&mut self, domain_name: &str) -> Option<Vec<IpAddr>> {
        self.entries.remove(domain_name)
    }

    /// True if `domain_name` has resolved to `ip` (linear scan;
    /// cross-version addresses never compare equal).
    pub fn contains(&self, domain_name: &str, ip: &IpAddr) -> bool {
        self.entries
            .get(domain_name)
            .is_some_and(|ips| ips.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn add_then_get() {
        let mut cache = DnsCache::new();
        cache.add("example.com", vec![v4(93, 184, 216, 34)]);
        assert_eq!(cache.get("example.com"), Some(&[v4(93, 184, 216, 34)][..]));
        assert_eq!(cache.get("example.org"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn add_appends_in_order() {
        let mut cache = DnsCache::new();
        cache.add("mi.com", vec![v4(20, 47, 97, 231), v4(20, 47, 97, 232)]);
        cache.add("mi.com", vec![v4(20, 47, 97, 231), v4(10, 0, 0, 1)]);
        // L1 ++ L2, order preserved, duplicates kept.
        assert_eq!(
            cache.get("mi.com").unwrap(),
            &[
                v4(20, 47, 97, 231),
                v4(20, 47, 97, 232),
                v4(20, 47, 97, 231),
                v4(10, 0, 0, 1),
            ]
        );
    }

    #[test]
    fn remove_and_pop() {
        let mut cache = DnsCache::new();
        cache.add("a.example", vec![v4(1, 1, 1, 1)]);
        cache.add("b.example", vec![v4(2, 2, 2, 2)]);

        cache.remove("a.example");
        assert_eq!(cache.get("a.example"), None);
        cache.remove("a.example"); // no-op on absent key

        let popped = cache.pop("b.example");
        assert_eq!(popped, Some(vec![v4(2, 2, 2, 2)]));
        assert!(cache.is_empty());
        assert_eq!(cache.pop("b.example"), None);
    }

    #[test]
    fn contains_is_version_sensitive() {
        let mut cache = DnsCache::new();
        // ::ffff:1.2.3.4 and 1.2.3.4 are different addresses here.
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0102, 0x0304));
        cache.add("example.com", vec![v4(1, 2, 3, 4)]);
        assert!(cache.contains("example.com", &v4(1, 2, 3, 4)));
        assert!(!cache.contains("example.com", &mapped));
        assert!(!cache.contains("example.com", &v4(4, 3, 2, 1)));
        assert!(!cache.contains("absent.example", &v4(1, 2, 3, 4)));
    }

    #[test]
    fn key_match_is_exact() {
        let mut cache = DnsCache::new();
        cache.add("api.example.com", vec![v4(5, 5, 5, 5)]);
        assert_eq!(cache.get("example.com"), None);
        assert_eq!(cache.get("API.example.com"), None);
    }
}
