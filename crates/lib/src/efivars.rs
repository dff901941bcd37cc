//! Access to UEFI variables through efivarfs.
//!
//! Each variable is one file named `<name>-<vendor guid>`, whose contents are
//! a little-endian `u32` attribute mask followed by the raw value. See
//! <https://docs.kernel.org/filesystems/efivarfs.html>.

use std::fmt;
use std::io::{self, Write};

use anyhow::Result;
use bitflags::bitflags;
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::{Dir, File, OpenOptions};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::IFlags;
use uuid::Uuid;

use btt_mount::RemountGuard;
use btt_utils::ResultExt;

/// Where the kernel exposes firmware state.
pub const EFI_PATH: &str = "/sys/firmware/efi";
/// The standard efivarfs mount point.
pub const EFIVARS_PATH: &str = "/sys/firmware/efi/efivars";

/// `EFI_GLOBAL_VARIABLE`, the vendor GUID of all variables defined by the UEFI specification.
pub const GLOBAL_VARIABLE: Uuid = Uuid::from_u128(0x8be4df61_93ca_11d2_aa0d_00e098032b8c);

const SECURE_BOOT: &str = "SecureBoot";
const SETUP_MODE: &str = "SetupMode";

bitflags! {
    /// Variable attributes stored in front of every value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u32 {
        /// Persisted across power cycles
        const NON_VOLATILE = 0x1;
        /// Visible to boot services
        const BOOTSERVICE_ACCESS = 0x2;
        /// Visible to the OS after ExitBootServices
        const RUNTIME_ACCESS = 0x4;
    }
}

/// Errors from the variable store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file is too short to hold the attribute header.
    #[error("reading {name:?}: malformed, {len} bytes is less than the 4 byte attribute header")]
    MalformedVariable {
        /// Variable name without the GUID suffix
        name: String,
        /// Length of the file
        len: usize,
    },
    /// A mutation was attempted on a store that was opened read-only.
    #[error("efivarfs was opened read-only")]
    ReadOnly,
    /// The variable does not exist.
    #[error("variable {name:?} not found")]
    NotFound {
        /// Variable name without the GUID suffix
        name: String,
    },
    /// Any other failure of the backing filesystem.
    #[error("{op} {name:?}")]
    Io {
        /// What was being done
        op: &'static str,
        /// Variable name, or the directory when listing
        name: String,
        /// The underlying error
        #[source]
        source: io::Error,
    },
}

impl Error {
    fn io(op: &'static str, name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                name: name.to_owned(),
            }
        } else {
            Self::Io {
                op,
                name: name.to_owned(),
                source,
            }
        }
    }
}

/// Secure Boot related firmware state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecureBootState {
    /// `SecureBoot` is 1
    pub enabled: bool,
    /// `SetupMode` is 1, i.e. keys can be enrolled without authentication
    pub setup_mode: bool,
}

/// Returns true if the running system was booted through UEFI.
pub fn is_uefi_boot() -> bool {
    Utf8Path::new(EFI_PATH).try_exists().log_err_default()
}

/// Inode flag access on variable files.
///
/// efivarfs marks most variables `FS_IMMUTABLE_FL`, which has to be cleared
/// before they can be replaced or removed.
pub trait InodeFlags: fmt::Debug {
    /// `FS_IOC_GETFLAGS`
    fn get(&self, f: &File) -> io::Result<IFlags>;
    /// `FS_IOC_SETFLAGS`
    fn set(&self, f: &File, flags: IFlags) -> io::Result<()>;
}

/// The kernel ioctls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ioctl;

impl InodeFlags for Ioctl {
    fn get(&self, f: &File) -> io::Result<IFlags> {
        Ok(rustix::fs::ioctl_getflags(f)?)
    }

    fn set(&self, f: &File, flags: IFlags) -> io::Result<()> {
        Ok(rustix::fs::ioctl_setflags(f, flags)?)
    }
}

fn file_name(scope: Uuid, name: &str) -> String {
    format!("{name}-{scope}")
}

/// An open efivarfs directory.
///
/// A writable store keeps the filesystem mounted read-write until it is
/// closed or dropped. Only one writable store may be live at a time; see
/// [`RemountGuard`].
#[derive(Debug)]
pub struct EfiVars {
    dir: Dir,
    writable: bool,
    remount: Option<RemountGuard>,
    inode_flags: Box<dyn InodeFlags>,
}

impl EfiVars {
    /// Open the store at `path` for reading.
    #[context("Opening firmware variables at {path}")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self::from_dir(dir, false))
    }

    /// Open the store at `path` for reading and writing, remounting it
    /// read-write for the lifetime of the returned value.
    #[context("Opening firmware variables at {path} for writing")]
    pub fn open_writable(path: &Utf8Path) -> Result<Self> {
        let remount = RemountGuard::writable(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self {
            remount: Some(remount),
            ..Self::from_dir(dir, true)
        })
    }

    /// Wrap an already open directory. No remounting is done.
    pub fn from_dir(dir: Dir, writable: bool) -> Self {
        Self {
            dir,
            writable,
            remount: None,
            inode_flags: Box::new(Ioctl),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_inode_flags(mut self, flags: impl InodeFlags + 'static) -> Self {
        self.inode_flags = Box::new(flags);
        self
    }

    /// Release the store, restoring the read-only mount if we changed it.
    pub fn close(mut self) -> Result<()> {
        match self.remount.take() {
            Some(remount) => remount.close(),
            None => Ok(()),
        }
    }

    /// Read a variable, returning its value and attributes.
    pub fn read(&self, scope: Uuid, name: &str) -> Result<(Vec<u8>, Attributes), Error> {
        let mut buf = self
            .dir
            .read(file_name(scope, name))
            .map_err(|e| Error::io("reading", name, e))?;
        if buf.len() < 4 {
            return Err(Error::MalformedVariable {
                name: name.to_owned(),
                len: buf.len(),
            });
        }
        let value = buf.split_off(4);
        let attrs = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok((value, Attributes::from_bits_retain(attrs)))
    }

    /// Create or replace a variable.
    ///
    /// Runtime access implies boot service access (UEFI 2.10 section 8.2.3),
    /// so the latter is added whenever the former is requested.
    pub fn write(
        &self,
        scope: Uuid,
        name: &str,
        mut attrs: Attributes,
        value: &[u8],
    ) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let fname = file_name(scope, name);
        // Must stay best-effort: if the flag really is set, the open below
        // reports EPERM, which says more than the ioctl error would.
        let was_immutable = self.clear_immutable(&fname).log_err_default();

        if attrs.contains(Attributes::RUNTIME_ACCESS) {
            attrs |= Attributes::BOOTSERVICE_ACCESS;
        }

        let mut f = self
            .dir
            .open_with(
                &fname,
                OpenOptions::new().write(true).create(true).truncate(true),
            )
            .map_err(|e| Error::io("writing", name, e))?;
        // efivarfs wants the attributes and the value in a single write
        let mut buf = Vec::with_capacity(value.len() + 4);
        buf.extend_from_slice(&attrs.bits().to_le_bytes());
        buf.extend_from_slice(value);
        let n = f.write(&buf).map_err(|e| Error::io("writing", name, e))?;
        if n != buf.len() {
            return Err(Error::io(
                "writing",
                name,
                io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write of {n}/{} bytes", buf.len()),
                ),
            ));
        }
        drop(f);
        tracing::debug!(name, attrs = ?attrs, len = value.len(), "wrote variable");

        if was_immutable {
            self.set_immutable(&fname)
                .log_err_with("restoring immutable flag");
        }
        Ok(())
    }

    /// Remove a variable.
    pub fn delete(&self, scope: Uuid, name: &str) -> Result<(), Error> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        let fname = file_name(scope, name);
        self.clear_immutable(&fname).log_err();
        self.dir
            .remove_file(&fname)
            .map_err(|e| Error::io("deleting", name, e))?;
        tracing::debug!(name, "deleted variable");
        Ok(())
    }

    /// Names of all variables in `scope`, sorted.
    pub fn list(&self, scope: Uuid) -> Result<Vec<String>, Error> {
        let suffix = format!("-{scope}");
        let mut names = Vec::new();
        let entries = self
            .dir
            .entries()
            .map_err(|e| Error::io("listing", ".", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("listing", ".", e))?;
            if entry
                .file_type()
                .map_err(|e| Error::io("listing", ".", e))?
                .is_dir()
            {
                continue;
            }
            let fname = entry.file_name();
            let Some(name) = fname.to_str().and_then(|n| n.strip_suffix(&suffix)) else {
                continue;
            };
            names.push(name.to_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Read `SecureBoot` and `SetupMode`.
    ///
    /// `SetupMode` is not present on all firmware; it is reported as unset
    /// when missing.
    pub fn secure_boot_state(&self) -> Result<SecureBootState, Error> {
        let flag = |v: &[u8]| v.first() == Some(&1);
        let (sb, _) = self.read(GLOBAL_VARIABLE, SECURE_BOOT)?;
        let setup_mode = match self.read(GLOBAL_VARIABLE, SETUP_MODE) {
            Ok((v, _)) => flag(&v),
            Err(Error::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        Ok(SecureBootState {
            enabled: flag(&sb),
            setup_mode,
        })
    }

    /// Clear `FS_IMMUTABLE_FL` on an existing variable file. Returns whether
    /// the flag was set.
    fn clear_immutable(&self, fname: &str) -> Result<bool> {
        let Some(f) = self.dir.open_optional(fname)? else {
            return Ok(false);
        };
        let flags = self.inode_flags.get(&f)?;
        if !flags.contains(IFlags::IMMUTABLE) {
            return Ok(false);
        }
        self.inode_flags.set(&f, flags - IFlags::IMMUTABLE)?;
        tracing::trace!(fname, "cleared immutable flag");
        Ok(true)
    }

    fn set_immutable(&self, fname: &str) -> Result<()> {
        let f = self.dir.open(fname)?;
        let flags = self.inode_flags.get(&f)?;
        self.inode_flags.set(&f, flags | IFlags::IMMUTABLE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use cap_std_ext::cap_tempfile::TempDir;

    use super::*;

    const TEST_SCOPE: Uuid = Uuid::from_u128(0x4a67b082_0a4c_41cf_b6c7_440b29bb8c4f);

    fn store(td: &TempDir, writable: bool) -> EfiVars {
        EfiVars::from_dir(td.try_clone().unwrap(), writable)
    }

    #[derive(Debug)]
    struct FlagState {
        flags: IFlags,
        fail_get: bool,
        fail_set: bool,
        gets: usize,
        sets: Vec<IFlags>,
    }

    /// Inode flags kept in memory; a tempdir cannot hold `FS_IMMUTABLE_FL`
    /// without `CAP_LINUX_IMMUTABLE`.
    #[derive(Debug, Clone)]
    struct FakeFlags(Rc<RefCell<FlagState>>);

    impl FakeFlags {
        fn new(flags: IFlags) -> Self {
            Self(Rc::new(RefCell::new(FlagState {
                flags,
                fail_get: false,
                fail_set: false,
                gets: 0,
                sets: Vec::new(),
            })))
        }
    }

    impl InodeFlags for FakeFlags {
        fn get(&self, _: &File) -> io::Result<IFlags> {
            let mut st = self.0.borrow_mut();
            st.gets += 1;
            if st.fail_get {
                return Err(io::Error::from_raw_os_error(libc::ENOTTY));
            }
            Ok(st.flags)
        }

        fn set(&self, _: &File, flags: IFlags) -> io::Result<()> {
            let mut st = self.0.borrow_mut();
            st.sets.push(flags);
            if st.fail_set {
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            st.flags = flags;
            Ok(())
        }
    }

    #[test]
    fn test_global_guid() {
        similar_asserts::assert_eq!(
            GLOBAL_VARIABLE.to_string(),
            "8be4df61-93ca-11d2-aa0d-00e098032b8c"
        );
    }

    #[test]
    fn test_write_read() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, true);
        let attrs = Attributes::NON_VOLATILE | Attributes::BOOTSERVICE_ACCESS;
        vars.write(GLOBAL_VARIABLE, "Test", attrs, &[1, 2, 3])?;

        let raw = td.read("Test-8be4df61-93ca-11d2-aa0d-00e098032b8c")?;
        similar_asserts::assert_eq!(raw, [3, 0, 0, 0, 1, 2, 3]);
        let (value, read_attrs) = vars.read(GLOBAL_VARIABLE, "Test")?;
        similar_asserts::assert_eq!(value, [1, 2, 3]);
        assert_eq!(read_attrs, attrs);

        // Replacing truncates
        vars.write(GLOBAL_VARIABLE, "Test", attrs, &[9])?;
        similar_asserts::assert_eq!(vars.read(GLOBAL_VARIABLE, "Test")?.0, [9]);
        Ok(())
    }

    #[test]
    fn test_runtime_implies_bootservice() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, true);
        vars.write(GLOBAL_VARIABLE, "Rt", Attributes::RUNTIME_ACCESS, b"x")?;
        let (_, attrs) = vars.read(GLOBAL_VARIABLE, "Rt")?;
        assert_eq!(
            attrs,
            Attributes::RUNTIME_ACCESS | Attributes::BOOTSERVICE_ACCESS
        );

        let all = Attributes::all();
        vars.write(GLOBAL_VARIABLE, "All", all, b"")?;
        let (value, attrs) = vars.read(GLOBAL_VARIABLE, "All")?;
        assert!(value.is_empty());
        assert_eq!(attrs, all);
        Ok(())
    }

    #[test]
    fn test_read_errors() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, false);
        td.write(file_name(GLOBAL_VARIABLE, "Short"), [7u8, 0, 0])?;
        match vars.read(GLOBAL_VARIABLE, "Short") {
            Err(Error::MalformedVariable { len: 3, .. }) => {}
            o => panic!("unexpected {o:?}"),
        }
        match vars.read(GLOBAL_VARIABLE, "Missing") {
            Err(Error::NotFound { name }) => similar_asserts::assert_eq!(name, "Missing"),
            o => panic!("unexpected {o:?}"),
        }
        // Exactly the header: valid, empty value
        td.write(file_name(GLOBAL_VARIABLE, "Empty"), [7u8, 0, 0, 0])?;
        let (value, attrs) = vars.read(GLOBAL_VARIABLE, "Empty")?;
        assert!(value.is_empty());
        assert_eq!(attrs, Attributes::all());
        Ok(())
    }

    #[test]
    fn test_readonly() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, false);
        assert!(!vars.writable);
        assert!(matches!(
            vars.write(GLOBAL_VARIABLE, "X", Attributes::NON_VOLATILE, b"x"),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(
            vars.delete(GLOBAL_VARIABLE, "X"),
            Err(Error::ReadOnly)
        ));
        assert!(!td.try_exists(file_name(GLOBAL_VARIABLE, "X"))?);
        vars.close()?;
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, true);
        vars.write(GLOBAL_VARIABLE, "Gone", Attributes::NON_VOLATILE, b"x")?;
        vars.delete(GLOBAL_VARIABLE, "Gone")?;
        assert!(matches!(
            vars.read(GLOBAL_VARIABLE, "Gone"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            vars.delete(GLOBAL_VARIABLE, "Gone"),
            Err(Error::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_write_tolerates_flag_errors() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        td.write(file_name(GLOBAL_VARIABLE, "Locked"), [7u8, 0, 0, 0, 1])?;

        // Reading the flags fails
        let flags = FakeFlags::new(IFlags::IMMUTABLE);
        flags.0.borrow_mut().fail_get = true;
        let vars = store(&td, true).with_inode_flags(flags.clone());
        vars.write(GLOBAL_VARIABLE, "Locked", Attributes::NON_VOLATILE, &[2])?;
        similar_asserts::assert_eq!(vars.read(GLOBAL_VARIABLE, "Locked")?.0, [2]);
        assert!(flags.0.borrow().sets.is_empty());

        // Clearing the flag fails; nothing is restored afterwards
        let flags = FakeFlags::new(IFlags::IMMUTABLE | IFlags::APPEND);
        flags.0.borrow_mut().fail_set = true;
        let vars = store(&td, true).with_inode_flags(flags.clone());
        vars.write(GLOBAL_VARIABLE, "Locked", Attributes::NON_VOLATILE, &[3])?;
        similar_asserts::assert_eq!(vars.read(GLOBAL_VARIABLE, "Locked")?.0, [3]);
        similar_asserts::assert_eq!(flags.0.borrow().sets, [IFlags::APPEND]);

        // Deleting goes ahead as well
        vars.delete(GLOBAL_VARIABLE, "Locked")?;
        assert!(!td.try_exists(file_name(GLOBAL_VARIABLE, "Locked"))?);
        Ok(())
    }

    #[test]
    fn test_restores_immutable_only_if_set() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        td.write(file_name(GLOBAL_VARIABLE, "Locked"), [7u8, 0, 0, 0, 1])?;
        td.write(file_name(GLOBAL_VARIABLE, "Open"), [7u8, 0, 0, 0, 1])?;

        let flags = FakeFlags::new(IFlags::IMMUTABLE | IFlags::APPEND);
        let vars = store(&td, true).with_inode_flags(flags.clone());
        vars.write(GLOBAL_VARIABLE, "Locked", Attributes::NON_VOLATILE, &[2])?;
        {
            let st = flags.0.borrow();
            similar_asserts::assert_eq!(
                st.sets,
                [IFlags::APPEND, IFlags::IMMUTABLE | IFlags::APPEND]
            );
            assert_eq!(st.flags, IFlags::IMMUTABLE | IFlags::APPEND);
        }

        let flags = FakeFlags::new(IFlags::APPEND);
        let vars = store(&td, true).with_inode_flags(flags.clone());
        vars.write(GLOBAL_VARIABLE, "Open", Attributes::NON_VOLATILE, &[2])?;
        assert_eq!(flags.0.borrow().gets, 1);
        assert!(flags.0.borrow().sets.is_empty());

        // A new variable has no flags to look at
        let flags = FakeFlags::new(IFlags::IMMUTABLE);
        let vars = store(&td, true).with_inode_flags(flags.clone());
        vars.write(GLOBAL_VARIABLE, "New", Attributes::NON_VOLATILE, &[2])?;
        assert_eq!(flags.0.borrow().gets, 0);
        assert!(flags.0.borrow().sets.is_empty());
        Ok(())
    }

    #[test]
    fn test_list() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, true);
        for name in ["BootOrder", "Boot0001", "Boot0000"] {
            vars.write(GLOBAL_VARIABLE, name, Attributes::NON_VOLATILE, b"")?;
        }
        vars.write(TEST_SCOPE, "LoaderEntries", Attributes::NON_VOLATILE, b"")?;
        td.create_dir(file_name(GLOBAL_VARIABLE, "NotAVariable"))?;

        similar_asserts::assert_eq!(
            vars.list(GLOBAL_VARIABLE)?,
            ["Boot0000", "Boot0001", "BootOrder"]
        );
        similar_asserts::assert_eq!(vars.list(TEST_SCOPE)?, ["LoaderEntries"]);
        Ok(())
    }

    #[test]
    fn test_secure_boot_state() -> Result<()> {
        let td = TempDir::new(cap_std::ambient_authority())?;
        let vars = store(&td, false);
        assert!(matches!(
            vars.secure_boot_state(),
            Err(Error::NotFound { .. })
        ));

        td.write(file_name(GLOBAL_VARIABLE, SECURE_BOOT), [6u8, 0, 0, 0, 1])?;
        similar_asserts::assert_eq!(
            vars.secure_boot_state()?,
            SecureBootState {
                enabled: true,
                setup_mode: false
            }
        );

        td.write(file_name(GLOBAL_VARIABLE, SECURE_BOOT), [6u8, 0, 0, 0, 0])?;
        td.write(file_name(GLOBAL_VARIABLE, SETUP_MODE), [6u8, 0, 0, 0, 1])?;
        similar_asserts::assert_eq!(
            vars.secure_boot_state()?,
            SecureBootState {
                enabled: false,
                setup_mode: true
            }
        );
        Ok(())
    }
}
