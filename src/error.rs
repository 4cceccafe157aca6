#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("netlink socket error: {0}")]
    Netlink(#[source] std::io::Error),
    #[error("queue {queue} configuration error: {detail}")]
    QueueConfig { queue: u16, detail: String },
    #[error("invalid device profile: {0}")]
    Profile(String),
    #[error("profile I/O error: {0}")]
    ProfileIo(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
