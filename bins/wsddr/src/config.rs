use std::{fs, path::PathBuf};

use discovery::proto::{BootInfo, UnknownBootKey};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PATH: &str = "/etc/wsddr/wsddr.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error(transparent)]
    Boot(#[from] UnknownBootKey),
}

#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    pub interface: Option<String>,
    pub netbios_name: Option<String>,
    pub workgroup: Option<String>,
    pub boot: Option<RawBootInfo>,
}

/// Boot parameters in file form; same keys as `-b` accepts.
#[derive(Debug, Default, Deserialize)]
pub struct RawBootInfo {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub sku: Option<String>,
    pub vendorurl: Option<String>,
    pub modelurl: Option<String>,
    pub presentationurl: Option<String>,
}

#[derive(Debug, Default)]
pub struct Config {
    pub interface: Option<String>,
    pub netbios_name: Option<String>,
    pub workgroup: Option<String>,
    pub boot: BootInfo,
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(value: RawConfig) -> Result<Self, Self::Error> {
        let mut boot = BootInfo::default();
        if let Some(raw) = value.boot {
            let pairs = [
                ("vendor", raw.vendor),
                ("model", raw.model),
                ("serial", raw.serial),
                ("sku", raw.sku),
                ("vendorurl", raw.vendorurl),
                ("modelurl", raw.modelurl),
                ("presentationurl", raw.presentationurl),
            ];
            for (key, val) in pairs {
                if let Some(val) = val {
                    boot.set(key, &val)?;
                }
            }
        }
        Ok(Self {
            interface: value.interface,
            netbios_name: value.netbios_name,
            workgroup: value.workgroup,
            boot,
        })
    }
}

impl Config {
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let b = fs::read_to_string(path)?;
        let c: RawConfig = toml::from_str(&b)?;

        Self::try_from(c)
    }

    /// An explicitly named file must exist; the default path is optional.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let path = PathBuf::from(DEFAULT_PATH);
                if path.exists() {
                    Self::from_file(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let raw: RawConfig = toml::from_str(
            r#"
            interface = "eth0"
            netbios_name = "FILESERVER"
            workgroup = "LAB"

            [boot]
            vendor = "ACME"
            model = "Widget 9"
            "#,
        )
        .unwrap();
        let config = Config::try_from(raw).unwrap();
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.netbios_name.as_deref(), Some("FILESERVER"));
        assert_eq!(config.workgroup.as_deref(), Some("LAB"));
        assert_eq!(config.boot.vendor.as_deref(), Some("ACME"));
        assert_eq!(config.boot.model.as_deref(), Some("Widget 9"));
    }

    #[test]
    fn empty_config_is_fine() {
        let raw: RawConfig = toml::from_str("").unwrap();
        let config = Config::try_from(raw).unwrap();
        assert_eq!(config.interface, None);
        assert_eq!(config.boot.vendor, None);
    }

    #[test]
    fn boot_table_alone_parses() {
        let raw: RawConfig = toml::from_str("[boot]\nserial = \"X-1\"").unwrap();
        let config = Config::try_from(raw).unwrap();
        assert_eq!(config.boot.serial.as_deref(), Some("X-1"));
        assert_eq!(config.interface, None);
    }
}
