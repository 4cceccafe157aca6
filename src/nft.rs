// nftables command bridge.
//
// The kernel half of each profile lives in nftables: stateless match
// rules, and named counters that back rate and duration limits. This
// module shells out to nft(8) to install and remove rules by handle and
// to read counter values; the generated verdict code polls those counters
// before accepting rate-limited states.
//
// Failures are reported with booleans and the -1 sentinel — the bridge
// never retries, a missed read only delays enforcement by one packet.

use std::process::Command;

/// Sentinel returned by counter and handle reads on failure.
pub const READ_FAILED: i64 = -1;

/// Execute an nft command, discarding output.
pub fn exec_cmd(cmd: &str) -> bool {
    let status = Command::new("nft").args(cmd.split_whitespace()).status();
    match status {
        Ok(s) if s.success() => true,
        Ok(s) => {
            log::warn!("nft command {cmd:?} exited with {s}");
            false
        }
        Err(e) => {
            log::warn!("failed to run nft command {cmd:?}: {e}");
            false
        }
    }
}

/// Execute an nft command and return its stdout.
///
/// `--echo --handle` makes nft print added rules back with their handles,
/// which [`parse_handle`] extracts.
pub fn exec_cmd_output(cmd: &str) -> Option<String> {
    let output = Command::new("nft")
        .arg("--echo")
        .arg("--handle")
        .args(cmd.split_whitespace())
        .output();
    match output {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            log::warn!("nft command {cmd:?} exited with {}", out.status);
            None
        }
        Err(e) => {
            log::warn!("failed to run nft command {cmd:?}: {e}");
            None
        }
    }
}

/// Extract a `handle <N>` token from nft output; -1 if absent.
pub fn parse_handle(output: &str) -> i64 {
    parse_labelled_int(output, "handle")
}

/// Find `label <integer>` in `output` and parse the integer; -1 on
/// missing label or unparsable value.
fn parse_labelled_int(output: &str, label: &str) -> i64 {
    let Some(pos) = output.find(label) else {
        log::warn!("no {label:?} found in nft output {output:?}");
        return READ_FAILED;
    };
    output[pos + label.len()..]
        .split_whitespace()
        .next()
        .and_then(|tok| {
            // Counter lines end the value with a comma or brace.
            tok.trim_end_matches([',', '}', ';']).parse().ok()
        })
        .unwrap_or_else(|| {
            log::warn!("cannot parse {label} value in nft output {output:?}");
            READ_FAILED
        })
}

/// Install a rule and return its kernel handle, or -1 on failure.
pub fn add_rule(table: &str, chain: &str, rule: &str) -> i64 {
    match exec_cmd_output(&format!("add rule {table} {chain} {rule}")) {
        Some(output) => parse_handle(&output),
        None => READ_FAILED,
    }
}

/// Delete a rule by its kernel handle.
pub fn delete_rule_by_handle(table: &str, chain: &str, handle: i64) -> bool {
    let ok = exec_cmd(&format!("delete rule {table} {chain} handle {handle}"));
    if ok {
        log::debug!("deleted rule with handle {handle} from {table}/{chain}");
    }
    ok
}

/// Delete a rule by its literal text: list the chain, locate the rule's
/// line, extract its handle, delete by handle.
pub fn delete_rule(table: &str, chain: &str, rule: &str) -> bool {
    let Some(listing) = exec_cmd_output(&format!("list chain {table} {chain}")) else {
        return false;
    };
    let Some(line) = listing.lines().find(|l| l.contains(rule)) else {
        log::warn!("rule {rule:?} not found in {table}/{chain}");
        return false;
    };
    let handle = parse_handle(line);
    if handle == READ_FAILED {
        log::warn!("failed to retrieve handle for rule {rule:?}");
        return false;
    }
    delete_rule_by_handle(table, chain, handle)
}

/// Read the packet count of a named counter; -1 on failure.
pub fn read_packet_count(table: &str, counter: &str) -> i64 {
    read_counter(table, counter, "packets")
}

/// Read the byte count of a named counter; -1 on failure.
pub fn read_byte_count(table: &str, counter: &str) -> i64 {
    read_counter(table, counter, "bytes")
}

fn read_counter(table: &str, counter: &str, field: &str) -> i64 {
    match exec_cmd_output(&format!("list counter {table} {counter}")) {
        Some(output) => parse_labelled_int(&output, field),
        None => READ_FAILED,
    }
}

/// Wall-clock time as seconds x 1e6 + microseconds.
pub fn now_micros() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let ret = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    if ret != 0 {
        // gettimeofday on a valid pointer cannot fail on Linux.
        return 0;
    }
    (tv.tv_sec as u64) * 1_000_000 + (tv.tv_usec as u64)
}

/// Start-of-measurement marker for a duration limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationInit {
    pub is_initialized: bool,
    pub microseconds: u64,
}

impl DurationInit {
    /// Capture "now" once and mark the duration initialized.
    pub fn start_now() -> Self {
        Self {
            is_initialized: true,
            microseconds: now_micros(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_handle_from_echo_output() {
        let output = "add rule inet iotwall camera-dns udp dport 53 accept # handle 42";
        assert_eq!(parse_handle(output), 42);
    }

    #[test]
    fn parse_handle_from_chain_listing() {
        let output = "\ttype filter hook prerouting priority 0; policy accept;\n\
                      \tip saddr 192.168.1.1 # handle 7\n";
        assert_eq!(parse_handle(output), 7);
    }

    #[test]
    fn parse_handle_missing() {
        assert_eq!(parse_handle("add rule done"), READ_FAILED);
        assert_eq!(parse_handle(""), READ_FAILED);
    }

    #[test]
    fn parse_counter_values() {
        let output = "table inet iotwall {\n\
                      \tcounter camera-rate {\n\
                      \t\tpackets 128 bytes 16384\n\
                      \t}\n}";
        assert_eq!(parse_labelled_int(output, "packets"), 128);
        assert_eq!(parse_labelled_int(output, "bytes"), 16384);
    }

    #[test]
    fn parse_counter_garbage() {
        assert_eq!(parse_labelled_int("packets x", "packets"), READ_FAILED);
        assert_eq!(parse_labelled_int("no counters here", "packets"), READ_FAILED);
    }

    #[test]
    fn micros_is_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000); // after Sep 2020
    }

    #[test]
    fn duration_init_captures_now() {
        let before = now_micros();
        let d = DurationInit::start_now();
        assert!(d.is_initialized);
        assert!(d.microseconds >= before);
        assert!(!DurationInit::default().is_initialized);
    }
}
