use std::io;

use thiserror::Error;

/// Errors produced while turning a (service, interface) pair into a bound
/// endpoint. Except for the kernel event monitor, these are fatal for the
/// single endpoint only; the supervisor keeps going with the others.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unsupported address family")]
    UnsupportedFamily,

    #[error("no port number for {0}/{1}")]
    NoPort(&'static str, &'static str),

    #[error("bad multicast group '{0}'")]
    BadMulticastAddress(&'static str),

    #[error("can't open socket: {0}")]
    SocketOpen(#[source] io::Error),

    #[error("{option}: {source}")]
    SockOpt {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("bind: {0}")]
    Bind(#[source] io::Error),

    #[error("listen: {0}")]
    Listen(#[source] io::Error),

    #[error("service init: {0}")]
    ServiceInit(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{service}: {source}")]
    Terminal {
        service: &'static str,
        #[source]
        source: EndpointError,
    },

    #[error("can't enumerate interface addresses: {0}")]
    Interfaces(#[source] io::Error),

    #[error("can't install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

pub(crate) fn errno_io(err: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}
