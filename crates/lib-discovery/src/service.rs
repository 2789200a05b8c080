use std::{ffi::CString, io, sync::Arc};

use crate::{endpoint::Endpoint, family::Family};

/// Socket type of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Datagram,
    Stream,
    Raw,
}

impl SocketKind {
    /// Transport name used to query the service name database.
    pub fn transport(&self) -> Option<&'static str> {
        match self {
            SocketKind::Datagram => Some("udp"),
            SocketKind::Stream => Some("tcp"),
            SocketKind::Raw => None,
        }
    }
}

/// Which discovery protocol a service belongs to. Drives the `-w` / `-l`
/// command-line selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceClass {
    Wsdd,
    Llmnr,
    Monitor,
}

/// Callbacks a protocol implementation hangs off an endpoint.
///
/// `init` runs once the socket is bound and any multicast group is joined;
/// a failure closes the endpoint. `recv` runs each time the socket is
/// readable and must consume the queued data; an error is treated as a
/// recoverable socket fault and restarts the endpoint set. `exit` runs
/// during teardown, before the membership is dropped and the socket closed.
pub trait ServiceHandler {
    fn init(&self, ep: &mut Endpoint) -> io::Result<()> {
        let _ = ep;
        Ok(())
    }

    fn recv(&self, ep: &mut Endpoint) -> io::Result<()>;

    fn exit(&self, ep: &mut Endpoint) {
        let _ = ep;
    }
}

/// One entry of the service catalog. Immutable for the process lifetime.
pub struct Service {
    pub name: &'static str,
    pub family: Family,
    pub kind: SocketKind,
    pub class: ServiceClass,
    /// Raw socket protocol, only meaningful for the kernel event monitor.
    pub protocol: i32,
    /// Name looked up in the service database before falling back to `port`.
    pub port_name: &'static str,
    pub port: u16,
    pub mcast_addr: Option<&'static str>,
    /// rtnetlink multicast group mask for the monitor service.
    pub nl_groups: u32,
    pub handler: Option<Arc<dyn ServiceHandler>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Service {
    /// Resolve the port to bind: the service name database wins, the static
    /// default is the fallback. `None` means the service cannot be offered.
    pub fn resolve_port(&self) -> Option<u16> {
        let db = self
            .kind
            .transport()
            .and_then(|transport| servent_port(self.port_name, transport));
        match db {
            Some(port) => Some(port),
            None if self.port != 0 => Some(self.port),
            None => None,
        }
    }
}

/// `getservbyname(3)` lookup. Single-threaded process, so the static result
/// buffer is not a concern.
fn servent_port(name: &str, transport: &str) -> Option<u16> {
    let name = CString::new(name).ok()?;
    let transport = CString::new(transport).ok()?;
    let se = unsafe { libc::getservbyname(name.as_ptr(), transport.as_ptr()) };
    if se.is_null() {
        return None;
    }
    let raw = unsafe { (*se).s_port };
    match u16::from_be(raw as u16) {
        0 => None,
        port => Some(port),
    }
}

pub const WSDD_PORT: u16 = 3702;
pub const LLMNR_PORT: u16 = 5355;

pub const WSDD_GROUP_V4: &str = "239.255.255.250";
pub const WSDD_GROUP_V6: &str = "ff02::c";
pub const LLMNR_GROUP_V4: &str = "224.0.0.252";
pub const LLMNR_GROUP_V6: &str = "ff02::1:3";

/// The full set of services this daemon can offer. The supervisor filters
/// it against the command-line selectors at every build cycle.
pub fn catalog(
    wsd: Arc<dyn ServiceHandler>,
    llmnr: Arc<dyn ServiceHandler>,
    monitor: Arc<dyn ServiceHandler>,
) -> Vec<Arc<Service>> {
    vec![
        Arc::new(Service {
            name: "wsdd-mcast-v4",
            family: Family::Ipv4,
            kind: SocketKind::Datagram,
            class: ServiceClass::Wsdd,
            protocol: 0,
            port_name: "wsdd",
            port: WSDD_PORT,
            mcast_addr: Some(WSDD_GROUP_V4),
            nl_groups: 0,
            handler: Some(wsd.clone()),
        }),
        Arc::new(Service {
            name: "wsdd-mcast-v6",
            family: Family::Ipv6,
            kind: SocketKind::Datagram,
            class: ServiceClass::Wsdd,
            protocol: 0,
            port_name: "wsdd",
            port: WSDD_PORT,
            mcast_addr: Some(WSDD_GROUP_V6),
            nl_groups: 0,
            handler: Some(wsd.clone()),
        }),
        Arc::new(Service {
            name: "wsdd-http-v4",
            family: Family::Ipv4,
            kind: SocketKind::Stream,
            class: ServiceClass::Wsdd,
            protocol: 0,
            port_name: "wsdd",
            port: WSDD_PORT,
            mcast_addr: None,
            nl_groups: 0,
            handler: Some(wsd.clone()),
        }),
        Arc::new(Service {
            name: "wsdd-http-v6",
            family: Family::Ipv6,
            kind: SocketKind::Stream,
            class: ServiceClass::Wsdd,
            protocol: 0,
            port_name: "wsdd",
            port: WSDD_PORT,
            mcast_addr: None,
            nl_groups: 0,
            handler: Some(wsd),
        }),
        Arc::new(Service {
            name: "llmnr-mcast-v4",
            family: Family::Ipv4,
            kind: SocketKind::Datagram,
            class: ServiceClass::Llmnr,
            protocol: 0,
            port_name: "llmnr",
            port: LLMNR_PORT,
            mcast_addr: Some(LLMNR_GROUP_V4),
            nl_groups: 0,
            handler: Some(llmnr.clone()),
        }),
        Arc::new(Service {
            name: "llmnr-mcast-v6",
            family: Family::Ipv6,
            kind: SocketKind::Datagram,
            class: ServiceClass::Llmnr,
            protocol: 0,
            port_name: "llmnr",
            port: LLMNR_PORT,
            mcast_addr: Some(LLMNR_GROUP_V6),
            nl_groups: 0,
            handler: Some(llmnr.clone()),
        }),
        Arc::new(Service {
            name: "llmnr-tcp-v4",
            family: Family::Ipv4,
            kind: SocketKind::Stream,
            class: ServiceClass::Llmnr,
            protocol: 0,
            port_name: "llmnr",
            port: LLMNR_PORT,
            mcast_addr: None,
            nl_groups: 0,
            handler: Some(llmnr.clone()),
        }),
        Arc::new(Service {
            name: "llmnr-tcp-v6",
            family: Family::Ipv6,
            kind: SocketKind::Stream,
            class: ServiceClass::Llmnr,
            protocol: 0,
            port_name: "llmnr",
            port: LLMNR_PORT,
            mcast_addr: None,
            nl_groups: 0,
            handler: Some(llmnr),
        }),
        Arc::new(Service {
            name: "ifaddr-netlink-v4v6",
            family: Family::Netlink,
            kind: SocketKind::Raw,
            class: ServiceClass::Monitor,
            protocol: libc::NETLINK_ROUTE,
            port_name: "",
            port: 0,
            mcast_addr: None,
            nl_groups: (libc::RTMGRP_LINK | libc::RTMGRP_IPV4_IFADDR | libc::RTMGRP_IPV6_IFADDR)
                as u32,
            handler: Some(monitor),
        }),
    ]
}
