use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "iotwall",
    version,
    about = "Per-device Smart Home firewall: NFQUEUE deep-packet inspection engine"
)]
pub struct Cli {
    /// Compiled device profile (JSON emitted by the profile translator)
    #[arg(long, required = true)]
    pub profile: Vec<PathBuf>,

    /// nftables table holding the device rulesets and counters
    #[arg(long, default_value = "iotwall")]
    pub nft_table: String,

    /// Offset added to every profile queue id, so several devices can
    /// share a queue numbering plan
    #[arg(long, default_value_t = 0, value_parser = validate_queue_base)]
    pub queue_base: u16,

    /// Log one record per verdict (policy, state, verdict, packet hash)
    #[arg(long)]
    pub log_verdicts: bool,
}

fn validate_queue_base(s: &str) -> Result<u16, String> {
    let val: u16 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid queue number"))?;
    if val > 65000 {
        Err("queue-base must leave room for per-interaction ids (max 65000)".to_string())
    } else {
        Ok(val)
    }
}
