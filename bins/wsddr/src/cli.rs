use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Debug, Parser)]
#[command(
    name = "wsddr",
    version,
    about = "WSDD and LLMNR responder daemon",
    after_help = "Boot parameter keys: vendor, model, serial, sku, vendorurl, modelurl, presentationurl"
)]
pub struct Cli {
    /// IPv4 only
    #[arg(short = '4')]
    pub ipv4: bool,

    /// IPv6 only
    #[arg(short = '6')]
    pub ipv6: bool,

    /// LLMNR only
    #[arg(short = 'l')]
    pub llmnr: bool,

    /// WSDD only
    #[arg(short = 'w')]
    pub wsdd: bool,

    /// TCP services only
    #[arg(short = 't')]
    pub tcp: bool,

    /// UDP services only
    #[arg(short = 'u')]
    pub udp: bool,

    /// Detach into the background
    #[arg(short = 'd')]
    pub daemon: bool,

    /// LLMNR debug mode (incremental level)
    #[arg(short = 'L', action = ArgAction::Count)]
    pub llmnr_debug: u8,

    /// WSDD debug mode (incremental level)
    #[arg(short = 'W', action = ArgAction::Count)]
    pub wsdd_debug: u8,

    /// Listening interface
    #[arg(short = 'i', value_name = "INTERFACE")]
    pub interface: Option<String>,

    /// Set the NetBIOS name manually
    #[arg(short = 'N', value_name = "NAME")]
    pub netbios_name: Option<String>,

    /// Set the workgroup manually
    #[arg(short = 'G', value_name = "WORKGROUP")]
    pub workgroup: Option<String>,

    /// Boot parameters, "key1:val1,key2:val2,..."
    #[arg(short = 'b', value_name = "PARAMS")]
    pub boot_params: Option<String>,

    /// Sets a custom config file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Absence of a whole selector category on the command line enables the
/// category.
pub fn both_if_neither(a: bool, b: bool) -> (bool, bool) {
    if !a && !b {
        (true, true)
    } else {
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_selectors_default_on() {
        assert_eq!(both_if_neither(false, false), (true, true));
        assert_eq!(both_if_neither(true, false), (true, false));
        assert_eq!(both_if_neither(false, true), (false, true));
        assert_eq!(both_if_neither(true, true), (true, true));
    }

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["wsddr", "-4", "-w", "-W", "-W", "-i", "eth0"]);
        assert!(cli.ipv4 && !cli.ipv6);
        assert!(cli.wsdd && !cli.llmnr);
        assert_eq!(cli.wsdd_debug, 2);
        assert_eq!(cli.interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn boot_params_are_opaque_here() {
        let cli = Cli::parse_from(["wsddr", "-b", "vendor:ACME,model:Widget"]);
        assert_eq!(cli.boot_params.as_deref(), Some("vendor:ACME,model:Widget"));
    }
}
