// iotwall — per-device Smart Home firewall DPI engine.
//
// The kernel half of a device profile filters statelessly in nftables;
// whatever needs deep inspection is steered to NFQUEUE, one queue per
// interaction. This crate is the user-space half: protocol parsers over
// the queued bytes, the DNS cache binding symbolic destinations to
// runtime addresses, the per-interaction state machine, and the verdict
// loop answering the kernel.

pub mod addr;
pub mod cli;
pub mod dns_cache;
pub mod error;
pub mod interaction;
pub mod nft;
pub mod packet;
pub mod parsers;
pub mod policy;
pub mod profile;
pub mod queue;
