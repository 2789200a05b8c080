use std::{io, net::IpAddr};

use nix::{ifaddrs::getifaddrs, net::if_::if_nametoindex};

use crate::{error::errno_io, iface::storage_ip};

/// Pick the local interface address to reply from, given the sender of an
/// inbound datagram: the first address of the same family that shares an
/// on-link prefix with the sender. Side-effect free; callable from any recv
/// hook.
pub fn reply_source(remote: IpAddr, ifindex: Option<u32>) -> io::Result<IpAddr> {
    for ifa in getifaddrs().map_err(errno_io)? {
        let (Some(addr), Some(mask)) = (
            ifa.address.as_ref().and_then(storage_ip),
            ifa.netmask.as_ref().and_then(storage_ip),
        ) else {
            continue;
        };

        if let Some(wanted) = ifindex {
            if if_nametoindex(ifa.interface_name.as_str()).ok() != Some(wanted) {
                continue;
            }
        }

        let matched = match (addr, mask, remote) {
            (IpAddr::V4(a), IpAddr::V4(m), IpAddr::V4(r)) => {
                same_prefix(&a.octets(), &m.octets(), &r.octets())
            }
            (IpAddr::V6(a), IpAddr::V6(m), IpAddr::V6(r)) => {
                same_prefix(&a.octets(), &m.octets(), &r.octets())
            }
            _ => false,
        };
        if matched {
            return Ok(addr);
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "no on-link address for remote",
    ))
}

fn same_prefix(addr: &[u8], mask: &[u8], remote: &[u8]) -> bool {
    addr.len() == mask.len()
        && addr.len() == remote.len()
        && addr
            .iter()
            .zip(mask)
            .zip(remote)
            .all(|((a, m), r)| a & m == r & m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_prefix_match() {
        let addr = [192, 168, 1, 10];
        let mask = [255, 255, 255, 0];
        assert!(same_prefix(&addr, &mask, &[192, 168, 1, 77]));
        assert!(!same_prefix(&addr, &mask, &[192, 168, 2, 77]));
        assert!(!same_prefix(&addr, &mask, &[10, 0, 0, 1]));
    }

    #[test]
    fn v6_prefix_match() {
        let addr: [u8; 16] = "fe80::1".parse::<std::net::Ipv6Addr>().unwrap().octets();
        let mut mask = [0u8; 16];
        mask[..8].fill(0xff);
        let peer: [u8; 16] = "fe80::2:3".parse::<std::net::Ipv6Addr>().unwrap().octets();
        let off_link: [u8; 16] = "2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets();
        assert!(same_prefix(&addr, &mask, &peer));
        assert!(!same_prefix(&addr, &mask, &off_link));
    }

    #[test]
    fn zero_mask_matches_anything() {
        assert!(same_prefix(&[1, 2, 3, 4], &[0, 0, 0, 0], &[9, 9, 9, 9]));
    }

    #[test]
    fn mismatched_lengths_never_match() {
        assert!(!same_prefix(&[1, 2, 3, 4], &[255, 255], &[1, 2, 3, 4]));
    }

    #[test]
    fn unmatchable_remote_reports_addr_not_available() {
        // TEST-NET-3 is never on-link in a test environment.
        let err = reply_source(IpAddr::V4("203.0.113.9".parse().unwrap()), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
