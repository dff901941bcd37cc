//! Working out why the kernel refused to load a new image.

use std::fmt;
use std::io;

use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use btt_utils::ResultExt;

use crate::efivars::{EfiVars, SecureBootState};

const LOCKDOWN: &str = "sys/kernel/security/lockdown";
const KEXEC_LOAD_DISABLED: &str = "proc/sys/kernel/kexec_load_disabled";

/// The specific reason behind an `EPERM` from the kexec syscalls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDenied {
    /// The kernel is in lockdown.
    Lockdown {
        /// Contents of the lockdown file, e.g. `none [integrity] confidentiality`
        mode: String,
        /// Firmware Secure Boot state, which is what usually turns lockdown on
        secure_boot: SecureBootState,
    },
    /// `kernel.kexec_load_disabled` is set.
    AdministrativelyDisabled,
    /// None of the known causes apply.
    Unknown,
}

impl fmt::Display for PermissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lockdown { mode, secure_boot } => {
                write!(f, "kexec blocked: kernel is in lockdown mode ({mode}).")?;
                if secure_boot.enabled {
                    write!(
                        f,
                        "\n  Note: Secure Boot is enabled, which activates kernel lockdown"
                    )?;
                }
                if secure_boot.setup_mode {
                    write!(
                        f,
                        "\n  Note: firmware is in Setup Mode; keys can be enrolled to sign the image"
                    )?;
                }
                write!(
                    f,
                    "\nSolutions:\n  1. Disable Secure Boot in BIOS/UEFI settings\n  2. Boot with 'lockdown=none' kernel parameter"
                )
            }
            Self::AdministrativelyDisabled => write!(
                f,
                "kexec is disabled via sysctl (kernel.kexec_load_disabled=1). \
                 This cannot be undone without a reboot; reboot and keep the sysctl unset"
            ),
            Self::Unknown => write!(
                f,
                "kexec blocked: permission denied. Possible causes:\n  \
                 1. Kernel requires signed image (try booting with 'lockdown=none')\n  \
                 2. Secure Boot is enabled\n  \
                 3. Check /proc/sys/kernel/kexec_load_disabled"
            ),
        }
    }
}

/// Reads the kernel and firmware state that explains permission failures.
#[derive(Debug)]
pub struct Diagnostics {
    root: Dir,
    efivars: Option<EfiVars>,
}

impl Diagnostics {
    /// Inspect `root` as the filesystem root, with firmware state from `efivars`.
    pub fn new(root: Dir, efivars: Option<EfiVars>) -> Self {
        Self { root, efivars }
    }

    /// Inspect the running system. A missing efivarfs only loses the
    /// Secure Boot hint.
    pub fn host(efivars: &camino::Utf8Path) -> io::Result<Self> {
        let root = Dir::open_ambient_dir("/", cap_std::ambient_authority())?;
        let efivars = crate::efivars::is_uefi_boot()
            .then(|| EfiVars::open(efivars).log_err())
            .flatten();
        Ok(Self::new(root, efivars))
    }

    fn read_trimmed(&self, path: &str) -> io::Result<Option<String>> {
        let Some(mut f) = self.root.open_optional(path)? else {
            return Ok(None);
        };
        let mut s = String::new();
        io::Read::read_to_string(&mut f, &mut s)?;
        Ok(Some(s.trim().to_owned()))
    }

    /// The active lockdown mode, if lockdown is in effect.
    pub fn lockdown(&self) -> Option<String> {
        let mode = self.read_trimmed(LOCKDOWN).log_err().flatten()?;
        (mode.contains("[integrity]") || mode.contains("[confidentiality]")).then_some(mode)
    }

    /// Whether `kernel.kexec_load_disabled` is set.
    pub fn kexec_load_disabled(&self) -> bool {
        self.read_trimmed(KEXEC_LOAD_DISABLED)
            .log_err()
            .flatten()
            .is_some_and(|v| v == "1")
    }

    fn secure_boot(&self) -> SecureBootState {
        self.efivars
            .as_ref()
            .and_then(|v| v.secure_boot_state().log_err())
            .unwrap_or_default()
    }

    /// Classify a permission failure. Lockdown takes precedence over the
    /// sysctl since it is the more common cause.
    pub fn permission_denied(&self) -> PermissionDenied {
        if let Some(mode) = self.lockdown() {
            return PermissionDenied::Lockdown {
                mode,
                secure_boot: self.secure_boot(),
            };
        }
        if self.kexec_load_disabled() {
            return PermissionDenied::AdministrativelyDisabled;
        }
        PermissionDenied::Unknown
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::Result;
    use cap_std_ext::cap_tempfile::TempDir;

    use super::*;
    use crate::efivars::{Attributes, GLOBAL_VARIABLE};

    /// A fake root with the given lockdown and sysctl file contents.
    pub(crate) fn fake_root(
        lockdown: Option<&str>,
        disabled: Option<&str>,
    ) -> Result<TempDir> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        if let Some(l) = lockdown {
            td.create_dir_all("sys/kernel/security")?;
            td.write(LOCKDOWN, l)?;
        }
        if let Some(d) = disabled {
            td.create_dir_all("proc/sys/kernel")?;
            td.write(KEXEC_LOAD_DISABLED, d)?;
        }
        Ok(td)
    }

    #[test]
    fn test_lockdown() -> Result<()> {
        let td = fake_root(Some("none [integrity] confidentiality\n"), Some("0\n"))?;
        let diag = Diagnostics::new(td.try_clone()?, None);
        similar_asserts::assert_eq!(
            diag.permission_denied(),
            PermissionDenied::Lockdown {
                mode: "none [integrity] confidentiality".into(),
                secure_boot: SecureBootState::default()
            }
        );
        Ok(())
    }

    #[test]
    fn test_lockdown_secure_boot() -> Result<()> {
        let td = fake_root(Some("none integrity [confidentiality]"), None)?;
        let vars = TempDir::new(cap_std::ambient_authority())?;
        let store = EfiVars::from_dir(vars.try_clone()?, true);
        store.write(
            GLOBAL_VARIABLE,
            "SecureBoot",
            Attributes::BOOTSERVICE_ACCESS | Attributes::RUNTIME_ACCESS,
            &[1],
        )?;
        let diag = Diagnostics::new(td.try_clone()?, Some(store));
        let denied = diag.permission_denied();
        assert!(matches!(
            denied,
            PermissionDenied::Lockdown {
                secure_boot: SecureBootState {
                    enabled: true,
                    setup_mode: false
                },
                ..
            }
        ));
        let msg = denied.to_string();
        assert!(msg.contains("Secure Boot is enabled"), "{msg}");
        assert!(!msg.contains("Setup Mode"), "{msg}");
        assert!(msg.contains("lockdown=none"), "{msg}");
        Ok(())
    }

    #[test]
    fn test_lockdown_setup_mode() {
        let denied = PermissionDenied::Lockdown {
            mode: "none [integrity] confidentiality".into(),
            secure_boot: SecureBootState {
                enabled: false,
                setup_mode: true,
            },
        };
        let msg = denied.to_string();
        assert!(msg.contains("Setup Mode"), "{msg}");
        assert!(!msg.contains("Secure Boot is enabled"), "{msg}");
    }

    #[test]
    fn test_sysctl() -> Result<()> {
        // Lockdown present but inactive
        let td = fake_root(Some("[none] integrity confidentiality"), Some("1\n"))?;
        let diag = Diagnostics::new(td.try_clone()?, None);
        assert!(diag.lockdown().is_none());
        similar_asserts::assert_eq!(
            diag.permission_denied(),
            PermissionDenied::AdministrativelyDisabled
        );
        assert!(diag
            .permission_denied()
            .to_string()
            .contains("kexec_load_disabled"));
        Ok(())
    }

    #[test]
    fn test_unknown() -> Result<()> {
        let td = fake_root(None, None)?;
        let diag = Diagnostics::new(td.try_clone()?, None);
        similar_asserts::assert_eq!(diag.permission_denied(), PermissionDenied::Unknown);
        let td = fake_root(None, Some("0"))?;
        let diag = Diagnostics::new(td.try_clone()?, None);
        similar_asserts::assert_eq!(diag.permission_denied(), PermissionDenied::Unknown);
        Ok(())
    }
}
