use std::{
    ffi::CStr,
    io,
    net::IpAddr,
    path::{Path, PathBuf},
};

use nix::{
    ifaddrs::getifaddrs,
    net::if_::{if_nametoindex, InterfaceFlags},
    sys::socket::SockaddrStorage,
};

use crate::{error::errno_io, family::Family, service::Service};

/// Interface names that never carry discovery traffic, no matter what.
const EXCLUDED_NAMES: [&str; 1] = ["LeafNets"];
const EXCLUDED_PREFIXES: [&str; 5] = ["docker", "veth", "tun", "ppp", "zt"];

/// Name of the synthetic interface record the kernel event monitor binds to.
pub const NETLINK_IFNAME: &str = "netlink";

/// One interface address as seen by the selector.
#[derive(Debug, Clone)]
pub struct IfaceAddr {
    pub name: String,
    pub index: u32,
    pub addr: IpAddr,
    pub netmask: Option<IpAddr>,
    pub loopback: bool,
    pub slave: bool,
    pub multicast: bool,
    pub bridge_port: bool,
}

impl IfaceAddr {
    /// The synthetic record handed to the kernel event monitor.
    pub fn netlink() -> Self {
        IfaceAddr {
            name: NETLINK_IFNAME.to_string(),
            index: 0,
            addr: IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            netmask: None,
            loopback: false,
            slave: false,
            multicast: false,
            bridge_port: false,
        }
    }
}

/// Enumerates host interface addresses and filters them against the
/// eligibility policy for a given service.
pub struct Selector {
    ifname: Option<String>,
    sysfs_net: PathBuf,
}

impl Selector {
    pub fn new(ifname: Option<String>) -> Self {
        Selector {
            ifname,
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }

    #[cfg(test)]
    fn with_sysfs_net(mut self, root: PathBuf) -> Self {
        self.sysfs_net = root;
        self
    }

    /// All interface addresses a service may bind on, in enumeration order.
    pub fn eligible(&self, sv: &Service) -> io::Result<Vec<IfaceAddr>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|ifa| self.admits(sv, ifa))
            .collect())
    }

    /// The eligibility policy for one candidate address.
    pub fn admits(&self, sv: &Service, ifa: &IfaceAddr) -> bool {
        let family_matches = matches!(
            (sv.family, ifa.addr),
            (Family::Ipv4, IpAddr::V4(_)) | (Family::Ipv6, IpAddr::V6(_))
        );
        if !family_matches || ifa.loopback || ifa.slave {
            return false;
        }
        if let Some(wanted) = &self.ifname {
            if &ifa.name != wanted {
                return false;
            }
        }
        if excluded_name(&ifa.name) {
            return false;
        }
        // Bridge ports only participate when named explicitly.
        if self.ifname.is_none() && ifa.bridge_port {
            return false;
        }
        if sv.mcast_addr.is_some() && !ifa.multicast {
            return false;
        }
        true
    }

    fn scan(&self) -> io::Result<Vec<IfaceAddr>> {
        let mut out = Vec::new();
        for ifa in getifaddrs().map_err(errno_io)? {
            let Some(addr) = ifa.address.as_ref().and_then(storage_ip) else {
                continue;
            };
            let index = if_nametoindex(ifa.interface_name.as_str()).unwrap_or(0);
            out.push(IfaceAddr {
                bridge_port: is_bridge_port(&self.sysfs_net, &ifa.interface_name),
                netmask: ifa.netmask.as_ref().and_then(storage_ip),
                loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                slave: ifa.flags.contains(InterfaceFlags::IFF_SLAVE),
                multicast: ifa.flags.contains(InterfaceFlags::IFF_MULTICAST),
                name: ifa.interface_name,
                index,
                addr,
            });
        }
        Ok(out)
    }
}

pub(crate) fn excluded_name(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
        || EXCLUDED_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

/// A bridge port shows up as a `brport` attribute directory in sysfs. On
/// systems without that view every interface counts as a non-port.
fn is_bridge_port(sysfs_net: &Path, name: &str) -> bool {
    sysfs_net.join(name).join("brport").exists()
}

pub(crate) fn storage_ip(ss: &SockaddrStorage) -> Option<IpAddr> {
    if let Some(sin) = ss.as_sockaddr_in() {
        Some(IpAddr::V4(sin.ip()))
    } else {
        ss.as_sockaddr_in6().map(|sin6| IpAddr::V6(sin6.ip()))
    }
}

/// Translate an interface index back to its current name.
pub(crate) fn index_to_name(index: u32) -> Option<String> {
    let mut buf = [0i8; libc::IF_NAMESIZE];
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr() as *mut libc::c_char) };
    if name.is_null() {
        return None;
    }
    let name = unsafe { CStr::from_ptr(name) };
    name.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    use super::*;
    use crate::service::{catalog, ServiceHandler};

    struct Nop;

    impl ServiceHandler for Nop {
        fn recv(&self, _ep: &mut crate::Endpoint) -> io::Result<()> {
            Ok(())
        }
    }

    fn services() -> Vec<Arc<Service>> {
        catalog(Arc::new(Nop), Arc::new(Nop), Arc::new(Nop))
    }

    fn eth0() -> IfaceAddr {
        IfaceAddr {
            name: "eth0".into(),
            index: 2,
            addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            netmask: Some(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0))),
            loopback: false,
            slave: false,
            multicast: true,
            bridge_port: false,
        }
    }

    fn selector() -> Selector {
        Selector::new(None).with_sysfs_net(PathBuf::from("/nonexistent"))
    }

    fn service(name: &str) -> Arc<Service> {
        services().into_iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn plain_interface_is_admitted() {
        assert!(selector().admits(&service("wsdd-mcast-v4"), &eth0()));
    }

    #[test]
    fn family_must_match() {
        let mut ifa = eth0();
        ifa.addr = IpAddr::V6(Ipv6Addr::LOCALHOST);
        assert!(!selector().admits(&service("wsdd-mcast-v4"), &ifa));
        assert!(!selector().admits(&service("wsdd-mcast-v6"), &eth0()));
    }

    #[test]
    fn loopback_and_slave_are_rejected() {
        let mut ifa = eth0();
        ifa.loopback = true;
        assert!(!selector().admits(&service("wsdd-http-v4"), &ifa));

        let mut ifa = eth0();
        ifa.slave = true;
        assert!(!selector().admits(&service("wsdd-http-v4"), &ifa));
    }

    #[test]
    fn hard_excluded_names_never_participate() {
        for name in ["LeafNets", "docker0", "veth1a2b", "tun0", "ppp0", "zt3jxliddv"] {
            assert!(excluded_name(name), "{name} should be excluded");
            let mut ifa = eth0();
            ifa.name = name.into();
            assert!(!selector().admits(&service("llmnr-mcast-v4"), &ifa));

            // Not even an explicit interface flag overrides the hard list.
            let explicit = Selector::new(Some(name.to_string()))
                .with_sysfs_net(PathBuf::from("/nonexistent"));
            assert!(!explicit.admits(&service("llmnr-mcast-v4"), &ifa));
        }
        assert!(!excluded_name("eth0"));
        assert!(!excluded_name("enp3s0"));
    }

    #[test]
    fn explicit_interface_must_match_exactly() {
        let sel = Selector::new(Some("eth1".into())).with_sysfs_net(PathBuf::from("/nonexistent"));
        assert!(!sel.admits(&service("wsdd-mcast-v4"), &eth0()));

        let sel = Selector::new(Some("eth0".into())).with_sysfs_net(PathBuf::from("/nonexistent"));
        assert!(sel.admits(&service("wsdd-mcast-v4"), &eth0()));
    }

    #[test]
    fn bridge_port_needs_explicit_interface() {
        let mut ifa = eth0();
        ifa.bridge_port = true;
        assert!(!selector().admits(&service("wsdd-mcast-v4"), &ifa));

        let sel = Selector::new(Some("eth0".into())).with_sysfs_net(PathBuf::from("/nonexistent"));
        assert!(sel.admits(&service("wsdd-mcast-v4"), &ifa));
    }

    #[test]
    fn enumeration_is_idempotent() {
        let sel = Selector::new(None);
        let sv = service("wsdd-mcast-v4");
        let snapshot = |ifas: Vec<IfaceAddr>| -> Vec<String> {
            ifas.iter()
                .map(|ifa| format!("{}/{}", ifa.name, ifa.addr))
                .collect()
        };
        let first = snapshot(sel.eligible(&sv).unwrap());
        let second = snapshot(sel.eligible(&sv).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn multicast_services_need_the_multicast_flag() {
        let mut ifa = eth0();
        ifa.multicast = false;
        assert!(!selector().admits(&service("wsdd-mcast-v4"), &ifa));
        // Unicast services do not care.
        assert!(selector().admits(&service("wsdd-http-v4"), &ifa));
    }
}
