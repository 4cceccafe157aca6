use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::bounded;

use iotwall::cli::Cli;
use iotwall::dns_cache::DnsCache;
use iotwall::error::FirewallError;
use iotwall::policy::{LogObserver, PacketCallback, VerdictObserver};
use iotwall::profile::{self, DnsGatedInteraction};
use iotwall::queue;

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn exit_code(err: &FirewallError) -> i32 {
    match err {
        FirewallError::InsufficientPermission(_) => 1,
        FirewallError::Netlink(_) | FirewallError::QueueConfig { .. } => 2,
        FirewallError::Profile(_) | FirewallError::ProfileIo(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn check_root() -> Result<(), FirewallError> {
    if unsafe { libc::geteuid() } != 0 {
        return Err(FirewallError::InsufficientPermission(
            "binding NFQUEUE requires root".to_string(),
        ));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), FirewallError> {
    install_signal_handlers();
    check_root()?;

    // One DNS cache for the whole device: interactions resolving the same
    // backend share observed addresses.
    let cache = Arc::new(RwLock::new(DnsCache::new()));
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
    let observer: Option<Arc<dyn VerdictObserver>> = if cli.log_verdicts {
        Some(Arc::new(LogObserver))
    } else {
        None
    };

    let mut handles = Vec::new();
    for path in &cli.profile {
        let device = profile::load_profile(path)?;
        log::info!(
            "loaded profile for {:?}: {} interaction(s)",
            device.device,
            device.interactions.len()
        );
        for spec in &device.interactions {
            let mut spec = spec.clone();
            spec.queue_id = spec.queue_id.saturating_add(cli.queue_base);
            let policy: Arc<dyn PacketCallback> = Arc::new(DnsGatedInteraction::new(
                &spec,
                &cli.nft_table,
                Arc::clone(&cache),
            )?);
            let handle = queue::spawn_worker(
                spec.queue_id,
                policy,
                observer.clone(),
                shutdown_rx.clone(),
            )?;
            handles.push(handle);
        }
    }

    if handles.is_empty() {
        return Err(FirewallError::Profile(
            "no interactions defined in any profile".to_string(),
        ));
    }

    // Workers poll their sockets with a short timeout; dropping the
    // sender disconnects the shutdown channel and drains them.
    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutting down");
    drop(shutdown_tx);
    drop(shutdown_rx);

    let mut result = Ok(());
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result = Err(e),
            Err(_) => result = Err(FirewallError::Fatal("worker panicked".to_string())),
        }
    }
    result
}
