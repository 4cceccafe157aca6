// Compiled device profiles and the reference interaction policy.
//
// The profile translator compiles a declarative device description into a
// kernel ruleset plus per-interaction verdict code. This module carries
// the runtime side of that contract: the deserialized policy tables the
// translator emits, and a DNS-gated interaction — query, response,
// then traffic to the resolved address — that doubles as the reference
// implementation of the `PacketCallback` contract.

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::dns_cache::DnsCache;
use crate::error::FirewallError;
use crate::interaction::{ActivityPeriod, InteractionData};
use crate::nft;
use crate::packet;
use crate::parsers::dns;
use crate::policy::{PacketCallback, PacketView, Verdict};

/// A compiled device profile: one file per device, one entry per
/// interaction, each bound to its own kernel queue.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub device: String,
    pub interactions: Vec<InteractionSpec>,
}

/// Policy table for one interaction, as emitted by the translator.
#[derive(Debug, Clone, Deserialize)]
pub struct InteractionSpec {
    pub name: String,
    /// Kernel queue this interaction's packets are steered to.
    pub queue_id: u16,
    /// Symbolic destination the interaction resolves and then talks to.
    pub domain: String,
    /// Seconds; 0 = default, negative = disabled.
    #[serde(default)]
    pub timeout: f64,
    /// Cron-like "min hour dom dow" start of the activity window.
    #[serde(default)]
    pub activity_start: Option<String>,
    /// Cron-like duration of the activity window.
    #[serde(default)]
    pub activity_duration: Option<String>,
    /// Named nftables counter backing this interaction's rate limit.
    #[serde(default)]
    pub packet_counter: Option<String>,
    /// Packet budget checked against `packet_counter`.
    #[serde(default)]
    pub max_packets: Option<i64>,
}

/// Load a compiled profile from JSON.
pub fn load_profile(path: &Path) -> Result<DeviceProfile, FirewallError> {
    let raw = std::fs::read_to_string(path).map_err(FirewallError::ProfileIo)?;
    let profile: DeviceProfile =
        serde_json::from_str(&raw).map_err(|e| FirewallError::Profile(e.to_string()))?;
    for spec in &profile.interactions {
        if spec.activity_start.is_some() != spec.activity_duration.is_some() {
            return Err(FirewallError::Profile(format!(
                "interaction {:?}: activity start and duration must both be set",
                spec.name
            )));
        }
    }
    Ok(profile)
}

// ---------------------------------------------------------------------------
// Reference interaction: DNS-resolved destination
// ---------------------------------------------------------------------------

/// Interaction states for [`DnsGatedInteraction`].
const STATE_AWAIT_QUERY: u8 = 0;
const STATE_AWAIT_RESPONSE: u8 = 1;
const STATE_TRAFFIC: u8 = 2;
const NUM_STATES: u8 = 3;
const NUM_POLICIES: u8 = 3;

const DNS_PORT: u16 = 53;

/// The canonical three-state interaction: the device asks for its
/// configured domain, the resolver answers, and from then on traffic to
/// the resolved address is accepted subject to the timeout, activity
/// period, and rate gates.
pub struct DnsGatedInteraction {
    name: String,
    domain: String,
    nft_table: String,
    packet_counter: Option<String>,
    max_packets: Option<i64>,
    data: Arc<InteractionData>,
    cache: Arc<RwLock<DnsCache>>,
}

impl DnsGatedInteraction {
    pub fn new(
        spec: &InteractionSpec,
        nft_table: &str,
        cache: Arc<RwLock<DnsCache>>,
    ) -> Result<Self, FirewallError> {
        let activity_period = match (&spec.activity_start, &spec.activity_duration) {
            (Some(start), Some(duration)) => Some(
                ActivityPeriod::new(start, duration).ok_or_else(|| {
                    FirewallError::Profile(format!(
                        "interaction {:?}: bad activity period",
                        spec.name
                    ))
                })?,
            ),
            _ => None,
        };
        Ok(Self {
            name: spec.name.clone(),
            domain: spec.domain.clone(),
            nft_table: nft_table.to_owned(),
            packet_counter: spec.packet_counter.clone(),
            max_packets: spec.max_packets,
            data: Arc::new(InteractionData::new(
                spec.queue_id,
                NUM_POLICIES,
                NUM_STATES,
                spec.timeout,
                activity_period,
            )),
            cache,
        })
    }

    /// The interaction's shared state, for tests and sibling policies.
    pub fn data(&self) -> &Arc<InteractionData> {
        &self.data
    }

    /// The DNS payload of a UDP packet to or from port 53, if any.
    fn dns_payload<'a>(&self, payload: &'a [u8]) -> Option<&'a [u8]> {
        if packet::ip_protocol(payload) != packet::PROTO_UDP {
            return None;
        }
        let l3_len = packet::l3_header_length(payload);
        let l4 = payload.get(l3_len..)?;
        let src_port = u16::from_be_bytes([*l4.first()?, *l4.get(1)?]);
        let dst_port = packet::dst_port(l4)?;
        if src_port != DNS_PORT && dst_port != DNS_PORT {
            return None;
        }
        l4.get(packet::udp_header_length()..)
    }

    /// State 0: a query for the configured domain arms the interaction.
    fn on_query(&self, payload: &[u8]) -> Verdict {
        let Some(dns_payload) = self.dns_payload(payload) else {
            return Verdict::Drop;
        };
        let Some(message) = dns::parse(dns_payload) else {
            // Malformed DNS on the DNS queue: the profile's default.
            return Verdict::Accept;
        };
        if message.header.is_some_and(|h| h.qr)
            || !dns::contains_full(&message.questions, &self.domain)
        {
            return Verdict::Drop;
        }
        self.data.record_match(STATE_AWAIT_QUERY as usize);
        {
            let mut state = self.data.lock();
            state.last_request = crate::interaction::unix_now();
            state.current_state = STATE_AWAIT_RESPONSE;
        }
        Verdict::Accept
    }

    /// State 1: the matching response populates the DNS cache and the
    /// interaction's cached IP.
    fn on_response(&self, payload: &[u8]) -> Verdict {
        if self.data.request_timed_out() {
            // The query is stale; rearm and wait for a fresh one.
            self.data.lock().current_state = STATE_AWAIT_QUERY;
            return Verdict::Drop;
        }
        let Some(dns_payload) = self.dns_payload(payload) else {
            return Verdict::Drop;
        };
        let Some(message) = dns::parse(dns_payload) else {
            return Verdict::Accept;
        };
        if !message.header.is_some_and(|h| h.qr) {
            // Retransmitted query while waiting: let it through unchanged.
            return if dns::contains_full(&message.questions, &self.domain) {
                Verdict::Accept
            } else {
                Verdict::Drop
            };
        }
        let ips = dns::ip_addresses_for(&message.answers, &self.domain);
        if ips.is_empty() {
            return Verdict::Drop;
        }
        self.data.record_match(STATE_AWAIT_RESPONSE as usize);
        {
            let mut state = self.data.lock();
            state.cached_ip = ips.first().copied();
            state.current_state = STATE_TRAFFIC;
        }
        match self.cache.write() {
            Ok(mut cache) => cache.add(&self.domain, ips),
            Err(e) => log::warn!("DNS cache lock poisoned: {e}"),
        }
        Verdict::Accept
    }

    /// State 2: traffic to the resolved address, gated on the activity
    /// period, the request timeout, and the kernel rate counter.
    fn on_traffic(&self, payload: &[u8]) -> Verdict {
        let dst: Option<IpAddr> = match packet::ip_version(payload) {
            4 => packet::ipv4_dst_addr(payload).map(IpAddr::V4),
            6 => packet::ipv6_dst_addr(payload).map(IpAddr::V6),
            _ => None,
        };
        let Some(dst) = dst else {
            return Verdict::Accept; // unparsable header: default
        };

        let cached = self.data.lock().cached_ip;
        if cached != Some(dst) {
            return Verdict::Drop;
        }

        let now = chrono::Local::now().naive_local();
        if !self.data.in_activity_period(now) {
            log::debug!("{}: outside activity period", self.name);
            return Verdict::Drop;
        }
        if self.data.request_timed_out() {
            self.data.lock().current_state = STATE_AWAIT_QUERY;
            return Verdict::Drop;
        }
        if self.rate_exceeded() {
            log::debug!("{}: rate limit exceeded", self.name);
            return Verdict::Drop;
        }

        self.data.record_match(STATE_TRAFFIC as usize);
        self.data.lock().last_request = crate::interaction::unix_now();
        Verdict::Accept
    }

    /// Verify the kernel-side packet counter against the profile budget.
    fn rate_exceeded(&self) -> bool {
        let (Some(counter), Some(max)) = (&self.packet_counter, self.max_packets) else {
            return false;
        };
        let count = nft::read_packet_count(&self.nft_table, counter);
        count != nft::READ_FAILED && count > max
    }
}

impl PacketCallback for DnsGatedInteraction {
    fn name(&self) -> &str {
        &self.name
    }

    fn verdict(&self, pkt: &PacketView<'_>) -> Verdict {
        let state = self.data.lock().current_state;
        match state {
            STATE_AWAIT_QUERY => self.on_query(pkt.payload),
            STATE_AWAIT_RESPONSE => self.on_response(pkt.payload),
            _ => self.on_traffic(pkt.payload),
        }
    }

    fn current_state(&self) -> u8 {
        self.data.lock().current_state
    }
}
