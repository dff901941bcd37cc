//! Optional configuration file.
//!
//! Everything has a default, so the file only needs to exist to override
//! something. Unknown keys are an error, to catch typos.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::bootorder::TALOS_DESCRIPTION;
use crate::efivars::EFIVARS_PATH;
use crate::kexec::{LegacyLayout, Protocol};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "BOOT_TO_TALOS_CONFIG";
/// Config file used when present and [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/boot-to-talos/config.toml";

/// The `[kexec]` table.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct KexecConfig {
    /// Which kexec interface to use
    pub protocol: Protocol,
    /// Segment placement for the legacy interface
    pub legacy_layout: LegacyLayout,
}

/// The `[efi]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EfiConfig {
    /// Description of the boot entry to promote
    pub boot_entry_description: String,
    /// Where efivarfs is mounted
    pub efivars_path: Utf8PathBuf,
}

impl Default for EfiConfig {
    fn default() -> Self {
        Self {
            boot_entry_description: TALOS_DESCRIPTION.to_owned(),
            efivars_path: EFIVARS_PATH.into(),
        }
    }
}

/// The whole configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// kexec settings
    pub kexec: KexecConfig,
    /// Firmware settings
    pub efi: EfiConfig,
}

impl Config {
    /// Parse and validate TOML text.
    pub fn parse(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config
            .kexec
            .legacy_layout
            .validate()
            .context("Invalid [kexec.legacy-layout]")?;
        Ok(config)
    }

    /// Load from `path`.
    #[context("Loading config from {path}")]
    pub fn load_from(path: &Utf8Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::parse(&s)
    }

    /// Load from the file named by [`CONFIG_ENV`], else [`DEFAULT_CONFIG_PATH`]
    /// if it exists, else use the defaults.
    pub fn load() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            let path = Utf8PathBuf::try_from(std::path::PathBuf::from(path))
                .with_context(|| format!("{CONFIG_ENV} is not UTF-8"))?;
            return Self::load_from(&path);
        }
        let path = Utf8Path::new(DEFAULT_CONFIG_PATH);
        if path.try_exists()? {
            return Self::load_from(path);
        }
        tracing::debug!("no config file, using defaults");
        Ok(Self::default())
    }
}
