use std::io;

use nix::net::if_::if_nametoindex;
use nix::sys::socket::{recv, MsgFlags};
use tracing::{debug, trace};

use crate::{
    endpoint::Endpoint,
    error::errno_io,
    iface::index_to_name,
    service::ServiceHandler,
    supervisor::request_restart,
};

// rtnetlink wire constants; the libc crate does not carry all of them.
const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const IFADDRMSG_LEN: usize = 8;
const RTA_HDRLEN: usize = 4;
const IFA_CACHEINFO: u16 = 6;

const RECV_BUF: usize = 4096;

/// An address event pulled out of one rtnetlink message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddrEvent {
    /// New address on an interface. `fresh` is false for a lifetime
    /// refresh of an existing address (cache creation and update stamps
    /// differ).
    New { index: u32, fresh: bool },
    Del { index: u32 },
}

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn u16_ne(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn u32_ne(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Walk a batch of netlink messages, collecting address events until the
/// batch ends or a `NLMSG_DONE` shows up. Truncated or malformed headers
/// end the walk.
pub(crate) fn addr_events(buf: &[u8]) -> Vec<AddrEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len = u32_ne(buf, offset) as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }
        let msg_type = u16_ne(buf, offset + 4);
        if msg_type == NLMSG_DONE {
            break;
        }
        let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
        if let Some(event) = addr_event(msg_type, payload) {
            events.push(event);
        }
        offset += align4(msg_len);
    }

    events
}

fn addr_event(msg_type: u16, payload: &[u8]) -> Option<AddrEvent> {
    if msg_type != RTM_NEWADDR && msg_type != RTM_DELADDR {
        return None;
    }
    if payload.len() < IFADDRMSG_LEN {
        return None;
    }
    let index = u32_ne(payload, 4);

    if msg_type == RTM_DELADDR {
        return Some(AddrEvent::Del { index });
    }

    // An address whose cache creation stamp differs from its update stamp
    // has merely been refreshed; only genuinely new addresses count.
    let mut fresh = true;
    let mut at = IFADDRMSG_LEN;
    while at + RTA_HDRLEN <= payload.len() {
        let rta_len = u16_ne(payload, at) as usize;
        if rta_len < RTA_HDRLEN || at + rta_len > payload.len() {
            break;
        }
        if u16_ne(payload, at + 2) == IFA_CACHEINFO && rta_len >= RTA_HDRLEN + 16 {
            let cstamp = u32_ne(payload, at + RTA_HDRLEN + 8);
            let tstamp = u32_ne(payload, at + RTA_HDRLEN + 12);
            if cstamp != tstamp {
                fresh = false;
            }
        }
        at += align4(rta_len);
    }

    Some(AddrEvent::New { index, fresh })
}

/// Per-endpoint monitor state: the index the configured interface had when
/// the endpoint set was built. Kept in the endpoint's state slot so a
/// restart re-resolves it.
struct MonitorState {
    ifindex: Option<u32>,
}

/// Does this event concern the interface we were told to watch? With no
/// configured interface every event matters. A renumbered interface (same
/// name, new index) is adopted on first sight.
fn concerns_watched_iface(
    state: &mut Option<u32>,
    configured_name: Option<&str>,
    lookup: &dyn Fn(u32) -> Option<String>,
    event_index: u32,
) -> bool {
    let Some(current) = *state else {
        return true;
    };
    if event_index == current {
        return true;
    }
    let Some(name) = configured_name else {
        return false;
    };
    if lookup(event_index).as_deref() == Some(name) {
        *state = Some(event_index);
        return true;
    }
    false
}

/// Watches kernel link and address notifications and requests a
/// restart-in-place whenever the addressing of the watched interfaces
/// actually changes.
pub struct LinkMonitor {
    ifname: Option<String>,
}

impl LinkMonitor {
    pub fn new(ifname: Option<String>) -> Self {
        LinkMonitor { ifname }
    }
}

impl ServiceHandler for LinkMonitor {
    fn init(&self, ep: &mut Endpoint) -> io::Result<()> {
        let ifindex = match &self.ifname {
            Some(name) => Some(if_nametoindex(name.as_str()).map_err(errno_io)?),
            None => None,
        };
        ep.state = Some(Box::new(MonitorState { ifindex }));
        Ok(())
    }

    fn recv(&self, ep: &mut Endpoint) -> io::Result<()> {
        let mut buf = [0u8; RECV_BUF];
        let len = recv(ep.raw_fd(), &mut buf, MsgFlags::empty()).map_err(errno_io)?;
        trace!(bytes = len, "netlink batch");
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "netlink socket closed",
            ));
        }

        let state = ep
            .state
            .as_mut()
            .and_then(|s| s.downcast_mut::<MonitorState>());
        let Some(state) = state else {
            return Ok(());
        };

        for event in addr_events(&buf[..len]) {
            let (index, triggers) = match event {
                AddrEvent::New { index, fresh } => (index, fresh),
                AddrEvent::Del { index } => (index, true),
            };
            if !triggers {
                continue;
            }
            if concerns_watched_iface(
                &mut state.ifindex,
                self.ifname.as_deref(),
                &index_to_name,
                index,
            ) {
                debug!(index, "address change detected, restarting");
                request_restart();
                break;
            }
        }

        Ok(())
    }
}
