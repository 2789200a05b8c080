use thiserror::Error;

mod llmnr;
mod wsd;

pub use llmnr::*;
pub use wsd::*;

/// Device metadata announced over WSDD, fed from `-b key:val,...` or the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub sku: Option<String>,
    pub vendor_url: Option<String>,
    pub model_url: Option<String>,
    pub presentation_url: Option<String>,
}

#[derive(Debug, Error)]
#[error("unknown boot parameter key '{0}'")]
pub struct UnknownBootKey(pub String);

impl BootInfo {
    pub const KEYS: [&'static str; 7] = [
        "vendor",
        "model",
        "serial",
        "sku",
        "vendorurl",
        "modelurl",
        "presentationurl",
    ];

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), UnknownBootKey> {
        let slot = match key {
            "vendor" => &mut self.vendor,
            "model" => &mut self.model,
            "serial" => &mut self.serial,
            "sku" => &mut self.sku,
            "vendorurl" => &mut self.vendor_url,
            "modelurl" => &mut self.model_url,
            "presentationurl" => &mut self.presentation_url,
            _ => return Err(UnknownBootKey(key.to_string())),
        };
        *slot = Some(value.to_string());
        Ok(())
    }

    /// Parse the `key1:val1,key2:val2,...` command-line form.
    pub fn parse_pairs(&mut self, pairs: &str) -> Result<(), UnknownBootKey> {
        for pair in pairs.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| UnknownBootKey(pair.to_string()))?;
            self.set(key, value)?;
        }
        Ok(())
    }
}

/// How this host presents itself to the network.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    /// First label of the kernel hostname.
    pub hostname: String,
    pub netbios_name: String,
    pub workgroup: String,
    pub boot: BootInfo,
    /// Index of the explicitly configured interface, if any; constrains
    /// reply-source selection.
    pub ifindex: Option<u32>,
}

impl HostIdentity {
    pub fn new(
        netbios_name: Option<String>,
        workgroup: Option<String>,
        boot: BootInfo,
        ifindex: Option<u32>,
    ) -> Self {
        let hostname = kernel_hostname();
        let netbios_name = netbios_name.unwrap_or_else(|| hostname.to_uppercase());
        let workgroup = workgroup.unwrap_or_else(|| "WORKGROUP".to_string());
        HostIdentity {
            hostname,
            netbios_name,
            workgroup,
            boot,
            ifindex,
        }
    }
}

fn kernel_hostname() -> String {
    let name = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    match name.split('.').next() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_pairs_parse() {
        let mut boot = BootInfo::default();
        boot.parse_pairs("vendor:ACME,model:Widget 9,sku:W9").unwrap();
        assert_eq!(boot.vendor.as_deref(), Some("ACME"));
        assert_eq!(boot.model.as_deref(), Some("Widget 9"));
        assert_eq!(boot.sku.as_deref(), Some("W9"));
        assert_eq!(boot.serial, None);
    }

    #[test]
    fn unknown_boot_key_is_rejected() {
        let mut boot = BootInfo::default();
        assert!(boot.parse_pairs("vendor:ACME,color:red").is_err());
        assert!(boot.parse_pairs("novalue").is_err());
    }

    #[test]
    fn identity_defaults() {
        let id = HostIdentity::new(None, None, BootInfo::default(), None);
        assert!(!id.hostname.is_empty());
        assert_eq!(id.netbios_name, id.hostname.to_uppercase());
        assert_eq!(id.workgroup, "WORKGROUP");
    }

    #[test]
    fn identity_overrides_win() {
        let id = HostIdentity::new(
            Some("FILESERVER".into()),
            Some("LAB".into()),
            BootInfo::default(),
            Some(3),
        );
        assert_eq!(id.netbios_name, "FILESERVER");
        assert_eq!(id.workgroup, "LAB");
        assert_eq!(id.ifindex, Some(3));
    }
}
