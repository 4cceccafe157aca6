// Verdict contract between the queue runtime and generated policy code.
//
// The profile translator emits one callback per interaction; the runtime
// is generic over the trait so translator output links against this crate
// without it knowing any device specifics. Packet logging is an opaque
// observer rather than a second callback signature, so generated code has
// exactly one shape whether or not logging is enabled.

use std::time::SystemTime;

use crate::addr;

/// The reply owed to the kernel for every queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
        })
    }
}

/// One queued packet as delivered to a policy callback: the kernel packet
/// id, the full layer-3-onward bytes, and the kernel timestamp when the
/// queue provided one.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub id: u32,
    pub payload: &'a [u8],
    pub timestamp: Option<SystemTime>,
}

/// A per-interaction verdict function.
///
/// Implementations hold their `Arc<InteractionData>` and any shared
/// caches; the runtime guarantees calls for one queue arrive from a
/// single thread in kernel-delivery order. A callback must always return;
/// on internal parse failure it should return its configured default
/// (conventionally `Accept`) rather than panic.
pub trait PacketCallback: Send + Sync {
    /// Name used in logs and by the verdict observer.
    fn name(&self) -> &str;

    /// Decide the fate of one packet.
    fn verdict(&self, pkt: &PacketView<'_>) -> Verdict;

    /// The interaction state to attach to verdict records; stateless
    /// policies keep the default.
    fn current_state(&self) -> u8 {
        0
    }
}

/// Sink for per-packet verdict records.
///
/// Attached to a queue worker when verdict logging is requested; the
/// worker invokes it after the callback, outside any interaction lock.
pub trait VerdictObserver: Send + Sync {
    fn record(&self, policy: &str, state: u8, verdict: Verdict, pkt: &PacketView<'_>);
}

/// Observer that writes `policy,state,verdict` records to the log, with
/// the packet's SHA-256 for offline correlation with captures.
#[derive(Debug, Default)]
pub struct LogObserver;

impl VerdictObserver for LogObserver {
    fn record(&self, policy: &str, state: u8, verdict: Verdict, pkt: &PacketView<'_>) {
        let hash = addr::sha256(pkt.payload);
        let ts = pkt
            .timestamp
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        log::info!(
            "{policy},{state},{verdict} id={} len={} ts={ts} sha256={}",
            pkt.id,
            pkt.payload.len(),
            addr::sha256_to_str(&hash)
        );
    }
}
