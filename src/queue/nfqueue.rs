// NFQUEUE netlink transport.
//
// Speaks the nfnetlink_queue protocol directly over an AF_NETLINK socket:
// config messages to bind the queue and set copy mode, packet messages in,
// verdict messages out. Message layout follows linux/netfilter/nfnetlink_queue.h;
// netlink headers are host byte order, nfnetlink payload fields big-endian.

use std::io;
use std::ops::Range;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, SystemTime};

use crate::error::FirewallError;
use crate::policy::Verdict;

const NETLINK_NETFILTER: i32 = 12;

const NFNL_SUBSYS_QUEUE: u16 = 3;
const NFNETLINK_V0: u8 = 0;

const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_PF_BIND: u8 = 3;
const NFQNL_CFG_CMD_PF_UNBIND: u8 = 4;

const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_FLAGS: u16 = 4;
const NFQA_CFG_MASK: u16 = 5;

const NFQNL_COPY_PACKET: u8 = 2;

const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_TIMESTAMP: u16 = 4;
const NFQA_PAYLOAD: u16 = 10;

/// Ask the kernel to attach process UID/GID to queued packets.
const NFQA_CFG_F_UID_GID: u32 = 1 << 3;
/// Ask the kernel to attach the security context.
const NFQA_CFG_F_SECCTX: u32 = 1 << 4;

const NF_DROP: u32 = 0;
const NF_ACCEPT: u32 = 1;

/// Copy-packet snaplen: the full 64 KiB.
const COPY_RANGE: u32 = 0xffff;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;

/// Receive buffer: one full copy-range packet plus netlink framing.
const RECV_BUF_LEN: usize = 0x20000;

/// Poll interval for the shutdown flag while blocked in recv.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// One packet parsed out of an NFQUEUE message: ranges index into the
/// receive buffer slice the message came from.
#[derive(Debug, PartialEq, Eq)]
struct QueuedPacket {
    packet_id: u32,
    payload: Range<usize>,
    timestamp: Option<SystemTime>,
}

/// A bound NFQUEUE socket for one queue number.
pub struct NfQueueSocket {
    fd: OwnedFd,
    queue_num: u16,
    seq: u32,
    buf: Vec<u8>,
}

impl NfQueueSocket {
    /// Open and configure the queue: netlink socket, address-family
    /// rebind, queue bind, copy-packet mode, and the best-effort UID/GID
    /// and security-context attribute requests.
    pub fn open(queue_num: u16) -> Result<Self, FirewallError> {
        let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_NETFILTER) };
        if raw < 0 {
            return Err(FirewallError::Netlink(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(FirewallError::Netlink(io::Error::last_os_error()));
        }

        // Wake up periodically so the worker can notice shutdown.
        let timeout = libc::timeval {
            tv_sec: RECV_TIMEOUT.as_secs() as libc::time_t,
            tv_usec: RECV_TIMEOUT.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &timeout as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            log::warn!("queue {queue_num}: SO_RCVTIMEO failed: {}", io::Error::last_os_error());
        }

        let mut sock = Self {
            fd,
            queue_num,
            seq: 0,
            buf: vec![0u8; RECV_BUF_LEN],
        };

        // Unbind then rebind the address family, as the kernel may carry
        // a stale handler registration; both are no-ops on recent kernels
        // but the queue bind below is not.
        sock.config_pf(NFQNL_CFG_CMD_PF_UNBIND)?;
        sock.config_pf(NFQNL_CFG_CMD_PF_BIND)?;
        sock.config_bind()?;
        sock.config_params()?;

        // Optional attributes: old kernels reject these, which only costs
        // the extra packet metadata.
        if let Err(e) = sock.config_flags(NFQA_CFG_F_UID_GID) {
            log::warn!("queue {queue_num}: kernel does not provide UID/GID: {e}");
        }
        if let Err(e) = sock.config_flags(NFQA_CFG_F_SECCTX) {
            log::warn!("queue {queue_num}: kernel does not provide security context: {e}");
        }

        Ok(sock)
    }

    /// Blocking receive loop. Invokes `handler` for every queued packet
    /// and returns its verdict to the kernel; ENOBUFS overruns are logged
    /// and survived. Returns when `shutdown` reports true.
    pub fn run<F>(&mut self, mut handler: F, shutdown: &dyn Fn() -> bool) -> Result<(), FirewallError>
    where
        F: FnMut(u32, &[u8], Option<SystemTime>) -> Verdict,
    {
        loop {
            if shutdown() {
                return Ok(());
            }
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    // Socket buffer overran: packets were lost, keep going.
                    Some(libc::ENOBUFS) => {
                        log::warn!("queue {}: losing packets (ENOBUFS)", self.queue_num);
                        continue;
                    }
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => continue,
                    _ => return Err(FirewallError::Netlink(err)),
                }
            }

            let n = n as usize;
            let mut offset = 0;
            while offset + NLMSG_HDRLEN <= n {
                let msg_len =
                    u32::from_ne_bytes(self.buf[offset..offset + 4].try_into().unwrap()) as usize;
                if msg_len < NLMSG_HDRLEN || offset + msg_len > n {
                    break;
                }
                let msg_type =
                    u16::from_ne_bytes(self.buf[offset + 4..offset + 6].try_into().unwrap());
                if msg_type == ((NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET) {
                    let msg = &self.buf[offset..offset + msg_len];
                    match parse_packet_message(msg) {
                        Some(pkt) => {
                            let payload = &msg[pkt.payload.clone()];
                            let verdict = handler(pkt.packet_id, payload, pkt.timestamp);
                            send_verdict(&self.fd, self.queue_num, pkt.packet_id, verdict)?;
                        }
                        None => {
                            log::warn!("queue {}: malformed packet message", self.queue_num);
                        }
                    }
                }
                offset += align4(msg_len);
            }
        }
    }

    // -- configuration ------------------------------------------------------

    fn config_pf(&mut self, command: u8) -> Result<(), FirewallError> {
        // command, pad, protocol family (big-endian).
        let mut cmd = Vec::with_capacity(4);
        cmd.push(command);
        cmd.push(0);
        cmd.extend_from_slice(&(libc::AF_INET as u16).to_be_bytes());
        self.config_transaction(0, &[(NFQA_CFG_CMD, &cmd)])
            .map_err(|e| self.config_error("address-family rebind", e))
    }

    fn config_bind(&mut self) -> Result<(), FirewallError> {
        let cmd = [NFQNL_CFG_CMD_BIND, 0, 0, 0];
        self.config_transaction(self.queue_num, &[(NFQA_CFG_CMD, &cmd)])
            .map_err(|e| self.config_error("queue bind", e))
    }

    fn config_params(&mut self) -> Result<(), FirewallError> {
        // copy_range (big-endian), copy_mode: packed 5 bytes.
        let mut params = Vec::with_capacity(5);
        params.extend_from_slice(&COPY_RANGE.to_be_bytes());
        params.push(NFQNL_COPY_PACKET);
        self.config_transaction(self.queue_num, &[(NFQA_CFG_PARAMS, &params)])
            .map_err(|e| self.config_error("copy-packet mode", e))
    }

    fn config_flags(&mut self, flag: u32) -> Result<(), io::Error> {
        let flags = flag.to_be_bytes();
        self.config_transaction(
            self.queue_num,
            &[(NFQA_CFG_FLAGS, &flags), (NFQA_CFG_MASK, &flags)],
        )
    }

    fn config_error(&self, what: &str, e: io::Error) -> FirewallError {
        FirewallError::QueueConfig {
            queue: self.queue_num,
            detail: format!("{what}: {e}"),
        }
    }

    /// Send one config message and wait for its netlink ack.
    fn config_transaction(&mut self, res_id: u16, attrs: &[(u16, &[u8])]) -> Result<(), io::Error> {
        self.seq = self.seq.wrapping_add(1);
        let msg = build_message(
            (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_CONFIG,
            (libc::NLM_F_REQUEST | libc::NLM_F_ACK) as u16,
            self.seq,
            res_id,
            attrs,
        );
        send_all(&self.fd, &msg)?;
        self.wait_ack()
    }

    /// Read messages until the ack (an NLMSG_ERROR with code 0) arrives.
    fn wait_ack(&mut self) -> Result<(), io::Error> {
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let n = n as usize;
            let mut offset = 0;
            while offset + NLMSG_HDRLEN <= n {
                let msg_len =
                    u32::from_ne_bytes(self.buf[offset..offset + 4].try_into().unwrap()) as usize;
                if msg_len < NLMSG_HDRLEN || offset + msg_len > n {
                    break;
                }
                let msg_type =
                    u16::from_ne_bytes(self.buf[offset + 4..offset + 6].try_into().unwrap());
                if msg_type == NLMSG_ERROR {
                    let body = &self.buf[offset + NLMSG_HDRLEN..offset + msg_len];
                    if body.len() < 4 {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "short ack"));
                    }
                    let code = i32::from_ne_bytes(body[..4].try_into().unwrap());
                    return if code == 0 {
                        Ok(())
                    } else {
                        Err(io::Error::from_raw_os_error(-code))
                    };
                }
                offset += align4(msg_len);
            }
        }
    }
}

/// Reply a verdict for one packet.
fn send_verdict(
    fd: &OwnedFd,
    queue_num: u16,
    packet_id: u32,
    verdict: Verdict,
) -> Result<(), FirewallError> {
    let code = match verdict {
        Verdict::Accept => NF_ACCEPT,
        Verdict::Drop => NF_DROP,
    };
    let mut hdr = Vec::with_capacity(8);
    hdr.extend_from_slice(&code.to_be_bytes());
    hdr.extend_from_slice(&packet_id.to_be_bytes());
    let msg = build_message(
        (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_VERDICT,
        libc::NLM_F_REQUEST as u16,
        0,
        queue_num,
        &[(NFQA_VERDICT_HDR, &hdr)],
    );
    send_all(fd, &msg).map_err(FirewallError::Netlink)
}

fn send_all(fd: &OwnedFd, msg: &[u8]) -> Result<(), io::Error> {
    let ret = unsafe {
        libc::send(
            fd.as_raw_fd(),
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Assemble nlmsghdr + nfgenmsg + attributes.
fn build_message(
    msg_type: u16,
    flags: u16,
    seq: u32,
    res_id: u16,
    attrs: &[(u16, &[u8])],
) -> Vec<u8> {
    let mut msg = vec![0u8; NLMSG_HDRLEN];
    // nfgenmsg: family, version, res_id (big-endian).
    msg.push(libc::AF_UNSPEC as u8);
    msg.push(NFNETLINK_V0);
    msg.extend_from_slice(&res_id.to_be_bytes());
    for (atype, payload) in attrs {
        let nla_len = (4 + payload.len()) as u16;
        msg.extend_from_slice(&nla_len.to_ne_bytes());
        msg.extend_from_slice(&atype.to_ne_bytes());
        msg.extend_from_slice(payload);
        msg.resize(align4(msg.len()), 0);
    }
    let total = msg.len() as u32;
    msg[0..4].copy_from_slice(&total.to_ne_bytes());
    msg[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    msg[6..8].copy_from_slice(&flags.to_ne_bytes());
    msg[8..12].copy_from_slice(&seq.to_ne_bytes());
    // nlmsg_pid stays 0: the kernel addresses us by socket.
    msg
}

/// Extract packet id, payload range, and timestamp from one
/// NFQNL_MSG_PACKET netlink message.
fn parse_packet_message(msg: &[u8]) -> Option<QueuedPacket> {
    let mut packet_id = None;
    let mut payload = None;
    let mut timestamp = None;

    // Skip nlmsghdr + nfgenmsg.
    let mut offset = NLMSG_HDRLEN + 4;
    while offset + 4 <= msg.len() {
        let nla_len = u16::from_ne_bytes(msg.get(offset..offset + 2)?.try_into().ok()?) as usize;
        let nla_type =
            u16::from_ne_bytes(msg.get(offset + 2..offset + 4)?.try_into().ok()?) & 0x3fff;
        if nla_len < 4 || offset + nla_len > msg.len() {
            break;
        }
        let value = &msg[offset + 4..offset + nla_len];
        match nla_type {
            NFQA_PACKET_HDR => {
                // packet_id (be32), hw_protocol (be16), hook (u8).
                if value.len() >= 4 {
                    packet_id = Some(u32::from_be_bytes(value[..4].try_into().ok()?));
                }
            }
            NFQA_PAYLOAD => {
                payload = Some(offset + 4..offset + nla_len);
            }
            NFQA_TIMESTAMP => {
                // seconds (be64), microseconds (be64).
                if value.len() >= 16 {
                    let sec = u64::from_be_bytes(value[..8].try_into().ok()?);
                    let usec = u64::from_be_bytes(value[8..16].try_into().ok()?);
                    timestamp = Some(
                        SystemTime::UNIX_EPOCH
                            + Duration::from_secs(sec)
                            + Duration::from_micros(usec),
                    );
                }
            }
            _ => {}
        }
        offset += align4(nla_len);
    }

    Some(QueuedPacket {
        packet_id: packet_id?,
        payload: payload?,
        timestamp,
    })
}
