use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    endpoint::open_endpoint,
    error::{errno_io, SupervisorError},
    family::Family,
    iface::{IfaceAddr, Selector},
    registry::Registry,
    service::{Service, ServiceClass, SocketKind},
};

/// What the process should do next. Written from signal context, read from
/// the supervisor; a single atomic byte either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    Run = 0,
    Restart = 1,
    Terminate = 2,
}

static CONTROL: AtomicU8 = AtomicU8::new(0);

pub fn control() -> Control {
    match CONTROL.load(Ordering::SeqCst) {
        0 => Control::Run,
        1 => Control::Restart,
        _ => Control::Terminate,
    }
}

/// Ask for a teardown-and-rebuild cycle. A pending terminate always wins,
/// so this only ever moves the flag from run to restart.
pub fn request_restart() {
    let _ = CONTROL.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
}

/// Ask for a clean shutdown. Monotonic: once set, nothing lowers it.
pub fn request_terminate() {
    CONTROL.fetch_max(2, Ordering::SeqCst);
}

/// Consume a completed restart cycle. Leaves a terminate request untouched.
fn acknowledge_restart() {
    let _ = CONTROL.compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst);
}

extern "C" fn on_signal(signal: libc::c_int) {
    // Signal context: one atomic store, nothing else.
    if signal == libc::SIGHUP {
        request_restart();
    } else {
        request_terminate();
    }
}

fn install_signal_handlers() -> Result<(), SupervisorError> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action) }
            .map_err(|err| SupervisorError::Signals(errno_io(err)))?;
    }
    Ok(())
}

/// Which services the daemon offers this run. Absence of a whole selector
/// category on the command line enables the category.
#[derive(Debug, Clone)]
pub struct Policy {
    pub ipv4: bool,
    pub ipv6: bool,
    pub stream: bool,
    pub datagram: bool,
    pub wsdd: bool,
    pub llmnr: bool,
    /// Only bind on this interface; bridge-port filtering is skipped.
    pub ifname: Option<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            ipv4: true,
            ipv6: true,
            stream: true,
            datagram: true,
            wsdd: true,
            llmnr: true,
            ifname: None,
        }
    }
}

impl Policy {
    fn wants(&self, sv: &Service) -> bool {
        match sv.family {
            Family::Ipv4 if !self.ipv4 => return false,
            Family::Ipv6 if !self.ipv6 => return false,
            _ => {}
        }
        match sv.kind {
            SocketKind::Stream if !self.stream => return false,
            SocketKind::Datagram if !self.datagram => return false,
            _ => {}
        }
        match sv.class {
            ServiceClass::Wsdd if !self.wsdd => return false,
            ServiceClass::Llmnr if !self.llmnr => return false,
            _ => {}
        }
        true
    }
}

/// Owns the whole endpoint lifecycle: build the set, pump readiness, tear
/// down, and either rebuild (restart-in-place) or stop.
pub struct Supervisor {
    services: Vec<Arc<Service>>,
    policy: Policy,
    selector: Selector,
}

impl Supervisor {
    pub fn new(services: Vec<Arc<Service>>, policy: Policy) -> Self {
        let selector = Selector::new(policy.ifname.clone());
        Supervisor {
            services,
            policy,
            selector,
        }
    }

    pub fn run(&mut self) -> Result<(), SupervisorError> {
        install_signal_handlers()?;

        loop {
            let mut registry = Registry::new();

            let served = match self.build(&mut registry) {
                Err(terminal) => {
                    error!(%terminal, "terminal endpoint failure, tearing down");
                    registry.teardown();
                    return Err(terminal);
                }
                Ok(()) => {
                    info!(endpoints = registry.len(), "endpoint set up");
                    self.serve(&mut registry)
                }
            };

            registry.teardown();
            served?;

            match control() {
                Control::Restart => {
                    acknowledge_restart();
                    info!("restarting service");
                }
                _ => {
                    info!("terminating");
                    return Ok(());
                }
            }
        }
    }

    /// Build phase: one endpoint per admitted (service, interface) pair. A
    /// failing IP endpoint is logged and skipped; a failing kernel event
    /// monitor takes the process down.
    fn build(&self, registry: &mut Registry) -> Result<(), SupervisorError> {
        for sv in &self.services {
            if !self.policy.wants(sv) {
                continue;
            }

            if sv.family == Family::Netlink {
                let ifa = IfaceAddr::netlink();
                debug!(service = sv.name, groups = sv.nl_groups, "building monitor");
                match open_endpoint(sv, &ifa) {
                    Ok(Some(ep)) => registry.push(ep),
                    Ok(None) => {}
                    Err(source) => {
                        return Err(SupervisorError::Terminal {
                            service: sv.name,
                            source,
                        })
                    }
                }
                continue;
            }

            let candidates = self
                .selector
                .eligible(sv)
                .map_err(SupervisorError::Interfaces)?;
            for ifa in candidates {
                debug!(
                    service = sv.name,
                    iface = %ifa.name,
                    addr = %ifa.addr,
                    group = sv.mcast_addr.unwrap_or("-"),
                    "building endpoint"
                );
                match open_endpoint(sv, &ifa) {
                    Ok(Some(ep)) => registry.push(ep),
                    Ok(None) => {}
                    Err(err) => {
                        error!(service = sv.name, iface = %ifa.name, %err, "endpoint failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// Readiness loop: block until something is readable, dispatch each
    /// ready endpoint once, re-check the control flag, repeat.
    fn serve(&self, registry: &mut Registry) -> Result<(), SupervisorError> {
        loop {
            if control() != Control::Run {
                return Ok(());
            }

            let ready = match wait_ready(registry) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(err = %errno_io(err), "readiness wait failed");
                    return Err(SupervisorError::Wait(errno_io(err)));
                }
            };

            for index in ready {
                if control() != Control::Run {
                    break;
                }
                let Some(ep) = registry.get_mut(index) else {
                    continue;
                };
                let Some(handler) = ep.service.handler.clone() else {
                    continue;
                };
                trace!(service = ep.service.name, iface = %ep.ifname, "dispatch recv");
                if let Err(err) = handler.recv(ep) {
                    warn!(service = ep.service.name, %err, "socket error, restarting");
                    request_restart();
                }
            }
        }
    }
}

/// Block on the registry's sockets; readable (or failed) endpoints come back
/// as registry indexes, in registry order.
fn wait_ready(registry: &Registry) -> Result<Vec<usize>, Errno> {
    let mut fds: Vec<PollFd> = registry
        .iter()
        .map(|ep| PollFd::new(ep.fd(), PollFlags::POLLIN))
        .collect();
    let n = poll(&mut fds, PollTimeout::NONE)?;
    trace!(ready = n, "poll woke");

    let wanted = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
    Ok(fds
        .iter()
        .enumerate()
        .filter(|(_, fd)| fd.revents().map_or(false, |r| r.intersects(wanted)))
        .map(|(index, _)| index)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The control flag is process-global, so all transitions are exercised
    // in one test body.
    #[test]
    fn control_flag_transitions() {
        assert_eq!(control(), Control::Run);

        // Run -> Restart, acknowledged back to Run.
        request_restart();
        assert_eq!(control(), Control::Restart);
        acknowledge_restart();
        assert_eq!(control(), Control::Run);

        // Restart -> Terminate is allowed, the reverse is not.
        request_restart();
        request_terminate();
        assert_eq!(control(), Control::Terminate);
        request_restart();
        assert_eq!(control(), Control::Terminate);
        acknowledge_restart();
        assert_eq!(control(), Control::Terminate);

        CONTROL.store(0, Ordering::SeqCst);
    }

    #[test]
    fn policy_defaults_enable_everything() {
        let policy = Policy::default();
        assert!(policy.ipv4 && policy.ipv6);
        assert!(policy.stream && policy.datagram);
        assert!(policy.wsdd && policy.llmnr);
    }
}
