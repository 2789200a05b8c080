use libc::c_int;

/// Address families an endpoint can live in. Everything outside this enum is
/// unsupported by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
    Netlink,
}

/// Per-family socket parameters, looked up once per endpoint build. The
/// option-level constants of the original table collapse into the socket
/// crate's typed calls; what remains is the identity of the family itself.
#[derive(Debug)]
pub struct FamilyProfile {
    pub family: Family,
    pub name: &'static str,
    pub af: c_int,
}

static PROFILES: [FamilyProfile; 3] = [
    FamilyProfile {
        family: Family::Ipv4,
        name: "IPv4",
        af: libc::AF_INET,
    },
    FamilyProfile {
        family: Family::Ipv6,
        name: "IPv6",
        af: libc::AF_INET6,
    },
    FamilyProfile {
        family: Family::Netlink,
        name: "NETLINK",
        af: libc::AF_NETLINK,
    },
];

/// Look up the profile for a family tag. A `None` means the family is not
/// supported and the endpoint must be rejected.
pub fn profile(family: Family) -> Option<&'static FamilyProfile> {
    PROFILES.iter().find(|p| p.family == family)
}
