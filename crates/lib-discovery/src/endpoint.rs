use std::{
    any::Any,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
    sync::Arc,
};

use nix::sys::socket::{
    self, bind as nl_bind, setsockopt, sockopt, AddressFamily, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use socket2::{Domain, InterfaceIndexOrAddress, SockAddr, Socket, Type};
use tracing::{debug, warn};

use crate::{
    error::{errno_io, EndpointError},
    family::{profile, Family},
    iface::IfaceAddr,
    service::{Service, SocketKind},
};

const LISTEN_BACKLOG: i32 = 5;
const NETLINK_RCVBUF: usize = 128 * 1024;

/// A joined multicast group, remembered so teardown can leave it again.
#[derive(Debug, Clone, Copy)]
pub enum Membership {
    V4 { group: Ipv4Addr, ifindex: u32 },
    V6 { group: Ipv6Addr, ifindex: u32 },
}

/// One service bound on one interface. The socket is open for as long as
/// the endpoint exists; teardown goes through [`close_endpoint`].
pub struct Endpoint {
    pub service: Arc<Service>,
    pub ifname: String,
    pub ifindex: u32,
    /// Address of the interface this endpoint was built for.
    pub ifaddr: Option<IpAddr>,
    pub port: u16,
    /// Group + port the service multicasts on, if any.
    pub mcast: Option<SocketAddr>,
    membership: Option<Membership>,
    socket: Socket,
    /// Slot for whatever per-endpoint state the service init hook wants to
    /// keep around.
    pub state: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("service", &self.service.name)
            .field("ifname", &self.ifname)
            .field("port", &self.port)
            .finish()
    }
}

impl Endpoint {
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn membership(&self) -> Option<Membership> {
        self.membership
    }

    fn leave_group(&self) {
        let result = match self.membership {
            Some(Membership::V4 { group, ifindex }) => self
                .socket
                .leave_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(ifindex)),
            Some(Membership::V6 { group, ifindex }) => {
                self.socket.leave_multicast_v6(&group, ifindex)
            }
            None => return,
        };
        if let Err(err) = result {
            debug!(service = self.service.name, %err, "leaving multicast group failed");
        }
    }
}

/// Build one endpoint for a (service, interface) pair.
///
/// `Ok(Some(_))` is an open, bound, configured endpoint. `Ok(None)` means the
/// address was already taken and this endpoint is silently skipped. `Err`
/// means this endpoint cannot be offered; the caller decides whether that is
/// fatal for the process (it is for the kernel event monitor).
pub fn open_endpoint(
    sv: &Arc<Service>,
    ifa: &IfaceAddr,
) -> Result<Option<Endpoint>, EndpointError> {
    let profile = profile(sv.family).ok_or(EndpointError::UnsupportedFamily)?;

    if sv.family == Family::Netlink {
        return open_monitor(sv, ifa);
    }

    let transport = sv.kind.transport().unwrap_or("-");
    let port = sv
        .resolve_port()
        .ok_or(EndpointError::NoPort(sv.port_name, transport))?;

    let (domain, wildcard): (Domain, IpAddr) = match sv.family {
        Family::Ipv4 => (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        Family::Ipv6 => (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        Family::Netlink => unreachable!(),
    };

    let (membership, mcast) = match sv.mcast_addr {
        Some(literal) => {
            let group: IpAddr = literal
                .parse()
                .map_err(|_| EndpointError::BadMulticastAddress(literal))?;
            let membership = match (sv.family, group) {
                (Family::Ipv4, IpAddr::V4(group)) => Membership::V4 {
                    group,
                    ifindex: ifa.index,
                },
                (Family::Ipv6, IpAddr::V6(group)) => Membership::V6 {
                    group,
                    ifindex: ifa.index,
                },
                _ => return Err(EndpointError::BadMulticastAddress(literal)),
            };
            (Some(membership), Some(SocketAddr::new(group, port)))
        }
        None => (None, None),
    };

    let ty = match sv.kind {
        SocketKind::Datagram => Type::DGRAM,
        SocketKind::Stream => Type::STREAM,
        SocketKind::Raw => Type::RAW,
    };

    // Close-on-exec is set at creation time.
    let socket = Socket::new(domain, ty, None).map_err(EndpointError::SocketOpen)?;

    let _ = socket.set_reuse_address(true);
    let _ = socket.set_reuse_port(true);

    if sv.family == Family::Ipv6 {
        socket.set_only_v6(true).map_err(|source| EndpointError::SockOpt {
            option: "IPV6_V6ONLY",
            source,
        })?;
    }

    // Unicast listeners are tied to their device; multicast receive is
    // steered through the membership instead.
    if membership.is_none() {
        socket
            .bind_device(Some(ifa.name.as_bytes()))
            .map_err(|source| EndpointError::SockOpt {
                option: "SO_BINDTODEVICE",
                source,
            })?;
    }

    let local = SockAddr::from(SocketAddr::new(wildcard, port));
    if let Err(err) = socket.bind(&local) {
        if err.kind() == io::ErrorKind::AddrInUse {
            debug!(
                service = sv.name,
                iface = %ifa.name,
                "address in use, endpoint skipped"
            );
            return Ok(None);
        }
        return Err(EndpointError::Bind(err));
    }

    match membership {
        Some(Membership::V4 { group, ifindex }) => {
            setsockopt(&socket, sockopt::Ipv4PacketInfo, &true).map_err(|err| {
                EndpointError::SockOpt {
                    option: "IP_PKTINFO",
                    source: errno_io(err),
                }
            })?;
            // Pin the outbound multicast path to this interface, otherwise
            // replies can pick a route with no way back to the asker.
            let if_v4 = match ifa.addr {
                IpAddr::V4(v4) => v4,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket
                .set_multicast_if_v4(&if_v4)
                .map_err(|source| EndpointError::SockOpt {
                    option: "IP_MULTICAST_IF",
                    source,
                })?;
            socket
                .set_multicast_loop_v4(false)
                .map_err(|source| EndpointError::SockOpt {
                    option: "IP_MULTICAST_LOOP",
                    source,
                })?;
            socket
                .join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(ifindex))
                .map_err(|source| EndpointError::SockOpt {
                    option: "IP_ADD_MEMBERSHIP",
                    source,
                })?;
        }
        Some(Membership::V6 { group, ifindex }) => {
            socket
                .set_multicast_if_v6(ifindex)
                .map_err(|source| EndpointError::SockOpt {
                    option: "IPV6_MULTICAST_IF",
                    source,
                })?;
            socket
                .set_multicast_loop_v6(false)
                .map_err(|source| EndpointError::SockOpt {
                    option: "IPV6_MULTICAST_LOOP",
                    source,
                })?;
            socket
                .join_multicast_v6(&group, ifindex)
                .map_err(|source| EndpointError::SockOpt {
                    option: "IPV6_ADD_MEMBERSHIP",
                    source,
                })?;
        }
        None => {}
    }

    if sv.kind == SocketKind::Stream {
        socket.listen(LISTEN_BACKLOG).map_err(EndpointError::Listen)?;
    }

    debug!(
        service = sv.name,
        family = profile.name,
        iface = %ifa.name,
        port,
        group = sv.mcast_addr.unwrap_or("-"),
        "endpoint bound"
    );

    finish(Endpoint {
        service: sv.clone(),
        ifname: ifa.name.clone(),
        ifindex: ifa.index,
        ifaddr: Some(ifa.addr),
        port,
        mcast,
        membership,
        socket,
        state: None,
    })
}

/// The kernel event monitor endpoint: a raw rtnetlink socket subscribed to
/// the service's group mask.
fn open_monitor(sv: &Arc<Service>, ifa: &IfaceAddr) -> Result<Option<Endpoint>, EndpointError> {
    let fd = socket::socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkRoute,
    )
    .map_err(|err| EndpointError::SocketOpen(errno_io(err)))?;

    let _ = setsockopt(&fd, sockopt::ReuseAddr, &true);
    let _ = setsockopt(&fd, sockopt::ReusePort, &true);

    // Bursts of address churn overflow the default buffer; losing an event
    // means missing a restart. Needs privilege, hence only a warning.
    if let Err(err) = setsockopt(&fd, sockopt::RcvBufForce, &NETLINK_RCVBUF) {
        warn!(service = sv.name, err = %errno_io(err), "SO_RCVBUFFORCE");
    }

    let local = NetlinkAddr::new(0, sv.nl_groups);
    if let Err(err) = nl_bind(fd.as_raw_fd(), &local) {
        if err == nix::errno::Errno::EADDRINUSE {
            debug!(service = sv.name, "address in use, endpoint skipped");
            return Ok(None);
        }
        return Err(EndpointError::Bind(errno_io(err)));
    }

    debug!(service = sv.name, groups = sv.nl_groups, "monitor bound");

    finish(Endpoint {
        service: sv.clone(),
        ifname: ifa.name.clone(),
        ifindex: 0,
        ifaddr: None,
        port: 0,
        mcast: None,
        membership: None,
        socket: Socket::from(fd),
        state: None,
    })
}

fn finish(mut ep: Endpoint) -> Result<Option<Endpoint>, EndpointError> {
    if let Some(handler) = ep.service.handler.clone() {
        handler
            .init(&mut ep)
            .map_err(EndpointError::ServiceInit)?;
    }
    Ok(Some(ep))
}

/// Tear one endpoint down: exit hook, membership drop, socket close. Always
/// runs to completion.
pub fn close_endpoint(mut ep: Endpoint) {
    if let Some(handler) = ep.service.handler.clone() {
        handler.exit(&mut ep);
    }
    ep.leave_group();
    // Socket closes on drop.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{catalog, ServiceClass, ServiceHandler};

    struct Nop;

    impl ServiceHandler for Nop {
        fn recv(&self, _ep: &mut Endpoint) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn bad_multicast_literal_is_rejected() {
        let services = catalog(Arc::new(Nop), Arc::new(Nop), Arc::new(Nop));
        let sv = services
            .iter()
            .find(|s| s.name == "wsdd-mcast-v4")
            .unwrap();
        // A v6 group on a v4 service is a configuration error, not a skip.
        let broken = Arc::new(Service {
            mcast_addr: Some("ff02::c"),
            handler: None,
            ..clone_service(sv)
        });
        let mut ifa = IfaceAddr::netlink();
        ifa.name = "eth0".into();
        match open_endpoint(&broken, &ifa) {
            Err(EndpointError::BadMulticastAddress(_)) => {}
            other => panic!("expected BadMulticastAddress, got {other:?}"),
        }
    }

    #[test]
    fn missing_port_is_rejected() {
        let services = catalog(Arc::new(Nop), Arc::new(Nop), Arc::new(Nop));
        let sv = services
            .iter()
            .find(|s| s.class == ServiceClass::Llmnr)
            .unwrap();
        let broken = Arc::new(Service {
            port_name: "no-such-service-name",
            port: 0,
            handler: None,
            ..clone_service(sv)
        });
        let mut ifa = IfaceAddr::netlink();
        ifa.name = "eth0".into();
        match open_endpoint(&broken, &ifa) {
            Err(EndpointError::NoPort(..)) => {}
            other => panic!("expected NoPort, got {other:?}"),
        }
    }

    fn clone_service(sv: &Service) -> Service {
        Service {
            name: sv.name,
            family: sv.family,
            kind: sv.kind,
            class: sv.class,
            protocol: sv.protocol,
            port_name: sv.port_name,
            port: sv.port,
            mcast_addr: sv.mcast_addr,
            nl_groups: sv.nl_groups,
            handler: None,
        }
    }
}
