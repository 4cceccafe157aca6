// Queue workers.
//
// One OS thread per kernel queue id: each interaction binds its own
// queue, so packets of one interaction are processed in kernel-delivery
// order while independent interactions progress in parallel. The worker
// owns the socket; the policy callback and the optional verdict observer
// are shared.

pub mod nfqueue;

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::error::FirewallError;
use crate::policy::{PacketCallback, PacketView, VerdictObserver};

use nfqueue::NfQueueSocket;

/// A worker stops when the shutdown channel delivers a message or every
/// sender is gone.
fn should_shutdown(shutdown: &Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}

/// Bind `queue_num` and process packets until shutdown.
///
/// Per-packet callback failures never kill the worker: the callback
/// contract already folds parse errors into the default verdict, and the
/// runtime always answers the kernel. Socket-level failures are fatal.
pub fn run_queue(
    queue_num: u16,
    callback: &dyn PacketCallback,
    observer: Option<&dyn VerdictObserver>,
    shutdown: &Receiver<()>,
) -> Result<(), FirewallError> {
    let mut socket = NfQueueSocket::open(queue_num)?;
    log::info!("queue {queue_num}: bound, waiting for packets");
    socket.run(
        |packet_id, payload, timestamp| {
            let pkt = PacketView {
                id: packet_id,
                payload,
                timestamp,
            };
            let verdict = callback.verdict(&pkt);
            log::debug!(
                "queue {queue_num}: packet {packet_id} ({} bytes) -> {verdict}",
                payload.len()
            );
            if let Some(obs) = observer {
                obs.record(callback.name(), callback.current_state(), verdict, &pkt);
            }
            verdict
        },
        &|| should_shutdown(shutdown),
    )
}

/// Spawn a named worker thread running [`run_queue`].
pub fn spawn_worker(
    queue_num: u16,
    callback: Arc<dyn PacketCallback>,
    observer: Option<Arc<dyn VerdictObserver>>,
    shutdown: Receiver<()>,
) -> Result<JoinHandle<Result<(), FirewallError>>, FirewallError> {
    thread::Builder::new()
        .name(format!("iotwall-q{queue_num}"))
        .spawn(move || {
            let result = run_queue(queue_num, callback.as_ref(), observer.as_deref(), &shutdown);
            if let Err(ref e) = result {
                log::error!("queue {queue_num}: worker failed: {e}");
            }
            result
        })
        .map_err(|e| FirewallError::Fatal(format!("spawn queue {queue_num} worker: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Verdict;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPolicy {
        hits: AtomicUsize,
    }

    impl PacketCallback for CountingPolicy {
        fn name(&self) -> &str {
            "counting"
        }
        fn verdict(&self, _pkt: &PacketView<'_>) -> Verdict {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Verdict::Accept
        }
    }

    #[test]
    fn callback_objects_are_shareable() {
        // The worker API takes Arc<dyn PacketCallback>; make sure a
        // minimal policy satisfies the object-safety and Send + Sync
        // bounds the spawner needs.
        let policy: Arc<dyn PacketCallback> = Arc::new(CountingPolicy {
            hits: AtomicUsize::new(0),
        });
        let cloned = Arc::clone(&policy);
        let pkt = PacketView {
            id: 1,
            payload: &[],
            timestamp: None,
        };
        assert_eq!(cloned.verdict(&pkt), Verdict::Accept);
        assert_eq!(policy.current_state(), 0);
    }
}
