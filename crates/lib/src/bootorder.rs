//! The firmware boot order and the boot entries it refers to.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use regex::Regex;

use crate::efivars::{self, Attributes, EfiVars, GLOBAL_VARIABLE};

/// Name of the variable holding the boot order.
pub const BOOT_ORDER: &str = "BootOrder";
/// Description the Talos installer gives its UEFI boot entry.
pub const TALOS_DESCRIPTION: &str = "Talos Linux UKI";

/// `UINT32 Attributes` + `UINT16 FilePathListLength`
const LOAD_OPTION_HEADER: usize = 6;

/// Errors from reading or changing the boot order.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `BootOrder` is not a packed list of `u16`.
    #[error("malformed BootOrder: odd length of {0} bytes")]
    MalformedBootOrder(usize),
    /// A `BootNNNN` variable could not be decoded.
    #[error("malformed load option: {0}")]
    MalformedLoadOption(String),
    /// No boot entry carries the wanted description.
    #[error("no boot entry with description {0:?} found")]
    EntryNotFound(String),
    /// The variable store failed.
    #[error(transparent)]
    Store(#[from] efivars::Error),
}

/// The ordered list of boot entry indices firmware tries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootOrder(pub Vec<u16>);

impl BootOrder {
    /// Decode the raw value of the `BootOrder` variable.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() % 2 != 0 {
            return Err(Error::MalformedBootOrder(raw.len()));
        }
        Ok(Self(
            raw.chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ))
    }

    /// The raw variable value.
    pub fn encode(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Read the current order; a missing variable is an empty order.
    pub fn read(vars: &EfiVars) -> Result<Self, Error> {
        match vars.read(GLOBAL_VARIABLE, BOOT_ORDER) {
            Ok((raw, _)) => Self::decode(&raw),
            Err(efivars::Error::NotFound { .. }) => {
                tracing::debug!("no BootOrder variable");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the order stored in firmware.
    pub fn write(&self, vars: &EfiVars) -> Result<(), Error> {
        let attrs = Attributes::NON_VOLATILE | Attributes::RUNTIME_ACCESS;
        vars.write(GLOBAL_VARIABLE, BOOT_ORDER, attrs, &self.encode())?;
        Ok(())
    }
}

impl fmt::Display for BootOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{v:04X}")?;
        }
        Ok(())
    }
}

/// A decoded `BootNNNN` variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOption {
    /// `LOAD_OPTION_*` flags
    pub attributes: u32,
    /// Human readable description
    pub description: String,
    /// Everything after the description, not interpreted further.
    pub device_path: Vec<u8>,
}

impl LoadOption {
    /// Decode an `EFI_LOAD_OPTION`.
    pub fn decode(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < LOAD_OPTION_HEADER {
            return Err(Error::MalformedLoadOption(format!(
                "minimum {LOAD_OPTION_HEADER} bytes are required, got {}",
                raw.len()
            )));
        }
        let attributes = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let rest = &raw[LOAD_OPTION_HEADER..];
        let units = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        let mut description = Vec::new();
        let mut terminated = false;
        for u in units {
            if u == 0 {
                terminated = true;
                break;
            }
            description.push(u);
        }
        if !terminated {
            return Err(Error::MalformedLoadOption(
                "no null code point marking end of description found".into(),
            ));
        }
        let device_path = rest[(description.len() + 1) * 2..].to_vec();
        let description = String::from_utf16(&description)
            .map_err(|e| Error::MalformedLoadOption(format!("decoding description: {e}")))?;
        Ok(Self {
            attributes,
            description,
            device_path,
        })
    }

    /// Encode as an `EFI_LOAD_OPTION`. The `FilePathListLength` field is
    /// derived from the device path.
    #[cfg(test)]
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.attributes.to_le_bytes());
        let path_len = u16::try_from(self.device_path.len()).unwrap_or(u16::MAX);
        out.extend_from_slice(&path_len.to_le_bytes());
        for u in self.description.encode_utf16().chain(std::iter::once(0)) {
            out.extend_from_slice(&u.to_le_bytes());
        }
        out.extend_from_slice(&self.device_path);
        out
    }
}

/// Parse the index out of a `BootNNNN` variable name.
pub fn parse_boot_var(name: &str) -> Option<u16> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"^Boot([0-9A-Fa-f]{4})$").unwrap());
    let caps = regex.captures(name)?;
    u16::from_str_radix(&caps[1], 16).ok()
}

/// Read and decode `BootNNNN`.
///
/// Firmware normally uses upper case hex digits, but lower case names are
/// also found in the wild, so both are tried.
pub fn read_boot_entry(vars: &EfiVars, index: u16) -> Result<LoadOption, Error> {
    let raw = match vars.read(GLOBAL_VARIABLE, &format!("Boot{index:04X}")) {
        Err(efivars::Error::NotFound { .. }) => {
            vars.read(GLOBAL_VARIABLE, &format!("Boot{index:04x}"))?.0
        }
        r => r?.0,
    };
    LoadOption::decode(&raw)
}

/// All decodable boot entries, keyed by index.
///
/// Entries that fail to decode are skipped with a warning; one broken
/// variable must not prevent promoting another.
pub fn boot_entries(vars: &EfiVars) -> Result<BTreeMap<u16, LoadOption>, Error> {
    let mut entries = BTreeMap::new();
    for name in vars.list(GLOBAL_VARIABLE)? {
        let Some(index) = parse_boot_var(&name) else {
            continue;
        };
        match read_boot_entry(vars, index) {
            Ok(entry) => {
                entries.insert(index, entry);
            }
            Err(e) => tracing::warn!("skipping {name}: {e}"),
        }
    }
    Ok(entries)
}

/// Compute the order that boots `index` first.
///
/// Every index in `stale` (entries sharing the promoted description,
/// including `index` itself) is removed from the old order; everything else
/// keeps its relative position.
pub fn promoted_order(current: &BootOrder, index: u16, stale: &BTreeSet<u16>) -> BootOrder {
    let rest = current.0.iter().copied().filter(|v| !stale.contains(v));
    BootOrder(std::iter::once(index).chain(rest).collect())
}

/// Make the first boot entry described as `description` the first in the
/// boot order. Returns the new order.
pub fn promote_entry(vars: &EfiVars, description: &str) -> Result<BootOrder, Error> {
    let current = BootOrder::read(vars)?;
    tracing::info!("Current BootOrder: {current}");

    let entries = boot_entries(vars)?;
    let matching = entries
        .iter()
        .filter(|(_, e)| e.description == description)
        .map(|(i, _)| *i)
        .collect::<BTreeSet<_>>();
    let Some(&index) = matching.first() else {
        return Err(Error::EntryNotFound(description.to_owned()));
    };
    tracing::info!("Found boot entry {index:04X} described as {description:?}");
    if matching.len() > 1 {
        tracing::debug!(count = matching.len(), "dropping duplicate entries from order");
    }

    let new = promoted_order(&current, index, &matching);
    new.write(vars)?;
    tracing::info!("New BootOrder: {new}");
    Ok(new)
}

/// Open the variable store at `efivars` for writing and promote the entry
/// described as `description`.
#[context("Promoting boot entry {description:?}")]
pub fn promote_boot_entry(efivars: &Utf8Path, description: &str) -> Result<BootOrder> {
    let vars = EfiVars::open_writable(efivars)?;
    let r = promote_entry(&vars, description);
    // Restore the mount before reporting, whatever the outcome
    let closed = vars.close();
    let order = r?;
    closed?;
    Ok(order)
}
