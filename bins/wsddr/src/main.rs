use std::{process::ExitCode, sync::Arc};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use nix::net::if_::if_nametoindex;
use nix::unistd::{fork, setsid, ForkResult};
use tracing::info;

use discovery::{
    catalog,
    proto::{HostIdentity, LlmnrHandler, WsdHandler},
    LinkMonitor, Policy, Supervisor,
};

use crate::cli::{both_if_neither, Cli};
use crate::config::Config;

mod cli;
mod config;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            print!("{err}");
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprint!("{err}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&cli);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let file = Config::load(cli.config.clone())?;

    let mut boot = file.boot;
    if let Some(pairs) = &cli.boot_params {
        boot.parse_pairs(pairs)?;
    }

    let ifname = cli.interface.clone().or(file.interface);
    let ifindex = match &ifname {
        Some(name) => Some(
            if_nametoindex(name.as_str()).map_err(|_| anyhow!("bad interface '{name}'"))?,
        ),
        None => None,
    };

    if cli.daemon {
        daemonize()?;
    }

    let identity = HostIdentity::new(
        cli.netbios_name.clone().or(file.netbios_name),
        cli.workgroup.clone().or(file.workgroup),
        boot,
        ifindex,
    );
    info!(
        host = %identity.netbios_name,
        workgroup = %identity.workgroup,
        "starting"
    );

    let wsd = Arc::new(WsdHandler::new(identity.clone()));
    let llmnr = Arc::new(LlmnrHandler::new(identity));
    let monitor = Arc::new(LinkMonitor::new(ifname.clone()));
    let services = catalog(wsd, llmnr, monitor);

    let (ipv4, ipv6) = both_if_neither(cli.ipv4, cli.ipv6);
    let (stream, datagram) = both_if_neither(cli.tcp, cli.udp);
    let (llmnr, wsdd) = both_if_neither(cli.llmnr, cli.wsdd);
    let policy = Policy {
        ipv4,
        ipv6,
        stream,
        datagram,
        wsdd,
        llmnr,
        ifname,
    };

    Supervisor::new(services, policy).run()?;
    Ok(())
}

fn init_logging(cli: &Cli) {
    use tracing_subscriber::filter::{LevelFilter, Targets};
    use tracing_subscriber::prelude::*;

    let level = |count: u8| match count {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let filter = Targets::new()
        .with_default(LevelFilter::INFO)
        .with_target("discovery", level(cli.wsdd_debug.max(cli.llmnr_debug)))
        .with_target("discovery::proto::wsd", level(cli.wsdd_debug))
        .with_target("discovery::proto::llmnr", level(cli.llmnr_debug));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Single fork; the parent exits 0, the child carries on detached from the
/// controlling terminal.
fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {
            let _ = setsid();
            Ok(())
        }
    }
}
