//! Helpers for flipping an existing mount between read-only and read-write.
//!
//! The firmware variable filesystem is normally mounted read-only; writers
//! need it read-write for exactly as long as they hold a [`RemountGuard`].

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::fs::StatVfsMountFlags;
use rustix::mount::MountFlags;

use btt_utils::ResultExt;

/// Per-mount flags that `MS_REMOUNT` resets unless they are passed again.
const PRESERVED_FLAGS: [(StatVfsMountFlags, MountFlags); 3] = [
    (StatVfsMountFlags::NOSUID, MountFlags::NOSUID),
    (StatVfsMountFlags::NODEV, MountFlags::NODEV),
    (StatVfsMountFlags::NOEXEC, MountFlags::NOEXEC),
];

fn mount_flags(target: &Utf8Path) -> Result<StatVfsMountFlags> {
    let st = rustix::fs::statvfs(target.as_std_path())
        .with_context(|| format!("Querying mount flags of {target}"))?;
    Ok(st.f_flag)
}

/// The flags to remount with: `current` restrictions kept, read-only as requested.
fn remount_flags(current: StatVfsMountFlags, readonly: bool) -> MountFlags {
    let mut flags = MountFlags::empty();
    for (from, to) in PRESERVED_FLAGS {
        if current.contains(from) {
            flags |= to;
        }
    }
    flags.set(MountFlags::RDONLY, readonly);
    flags
}

/// Change the read-only state of the mount at `target`, keeping its
/// nosuid, nodev and noexec settings.
#[context("Remounting {target} (readonly={readonly})")]
pub fn remount(target: &Utf8Path, readonly: bool) -> Result<()> {
    let flags = remount_flags(mount_flags(target)?, readonly);
    rustix::mount::mount_remount(target.as_std_path(), flags, "")?;
    tracing::debug!(%target, ?flags, "remounted");
    Ok(())
}

/// Returns true if the filesystem holding `target` is mounted read-only.
pub fn is_readonly(target: &Utf8Path) -> Result<bool> {
    Ok(mount_flags(target)?.contains(StatVfsMountFlags::RDONLY))
}

/// A mount that has been switched to read-write and is switched back to
/// read-only when this value is closed or dropped.
///
/// Mount state is process-wide and is not reference counted: two live guards
/// for the same target race each other, and whichever is released first
/// flips the mount back underneath the other. Callers must serialize
/// themselves so that at most one guard per target exists at a time.
#[derive(Debug)]
pub struct RemountGuard {
    target: Utf8PathBuf,
    /// Whether the mount still needs to be flipped back to read-only.
    pending: bool,
}

impl RemountGuard {
    /// Ensure `target` is mounted read-write.
    ///
    /// If it already is, nothing is changed now or on release; a mount we did
    /// not make read-only is never made read-only by us.
    pub fn writable(target: &Utf8Path) -> Result<Self> {
        let pending = is_readonly(target)?;
        if pending {
            remount(target, false)?;
        } else {
            tracing::debug!(%target, "already mounted read-write");
        }
        Ok(Self {
            target: target.to_owned(),
            pending,
        })
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.pending) {
            tracing::trace!(target = %self.target, "nothing to restore");
            return Ok(());
        }
        remount(&self.target, true)
    }

    /// Consume this guard, remounting the target read-only.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for RemountGuard {
    fn drop(&mut self) {
        // Best effort to restore read-only if we're dropped without invoking `close`
        self.impl_close().log_err();
    }
}
