//! # boot-to-talos command line
//!
//! Command line tool to switch a running machine to Talos Linux.

use std::ffi::OsString;

use anyhow::{ensure, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use fn_error_context::context;

use crate::bootorder::{self, BootOrder};
use crate::config::Config;
use crate::efivars::{self, EfiVars};
use crate::kexec::{self, Protocol};

/// Options for booting a UKI in place of the running kernel.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct KexecOpts {
    /// Path to the Unified Kernel Image.
    pub(crate) uki: Utf8PathBuf,

    /// Append an argument to the image's kernel command line.
    /// This option can be provided multiple times.
    ///
    /// Example: --extra-arg=talos.platform=metal --extra-arg=console=ttyS0
    #[clap(long = "extra-arg")]
    pub(crate) extra_args: Vec<String>,

    /// Override the configured kexec interface.
    #[clap(long)]
    pub(crate) protocol: Option<Protocol>,
}

/// Operations on the firmware boot entries and the running kernel.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "boot-to-talos")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Load a UKI with kexec and reboot into it immediately.
    ///
    /// The kernel, initrd and command line are taken from the image's
    /// `.linux`, `.initrd` and `.cmdline` sections. This does not return
    /// on success.
    Kexec(KexecOpts),
    /// Print the command line embedded in a UKI.
    ReadCmdline {
        /// Path to the Unified Kernel Image.
        uki: Utf8PathBuf,
    },
    /// Replace the command line embedded in a UKI.
    ///
    /// The new value must fit in the existing `.cmdline` section.
    PatchCmdline {
        /// Path to the Unified Kernel Image.
        uki: Utf8PathBuf,
        /// The new command line.
        cmdline: String,
    },
    /// Put the installed system's UEFI boot entry first in BootOrder.
    PromoteBootEntry {
        /// Description of the entry to promote; defaults to the configured value.
        #[clap(long)]
        description: Option<String>,
    },
    /// Show BootOrder and the boot entries it refers to.
    ShowBootOrder,
}

/// Everything touching the kernel or firmware needs root.
fn require_root() -> Result<()> {
    ensure!(
        rustix::process::getuid().is_root(),
        "This command must be executed as the root user"
    );
    Ok(())
}

#[context("Showing boot order")]
fn show_boot_order(config: &Config) -> Result<()> {
    ensure!(efivars::is_uefi_boot(), "Not booted through UEFI");
    let vars = EfiVars::open(&config.efi.efivars_path)?;
    let order = BootOrder::read(&vars)?;
    let entries = bootorder::boot_entries(&vars)?;
    println!("BootOrder: {order}");
    for (index, entry) in &entries {
        let active = if order.0.contains(index) { "*" } else { " " };
        println!("Boot{index:04X}{active} {}", entry.description);
    }
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

// The image subcommands never read the config, so a broken config file must
// not stop them.
fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Kexec(opts) => {
            require_root()?;
            let mut config = Config::load()?;
            if let Some(protocol) = opts.protocol {
                config.kexec.protocol = protocol;
            }
            match kexec::kexec_uki(&config, &opts.uki, &opts.extra_args)? {}
        }
        Opt::ReadCmdline { uki } => {
            println!("{}", btt_uki::read_cmdline(&uki)?);
            Ok(())
        }
        Opt::PatchCmdline { uki, cmdline } => {
            btt_uki::patch_cmdline(&uki, &cmdline)?;
            Ok(())
        }
        Opt::PromoteBootEntry { description } => {
            require_root()?;
            ensure!(efivars::is_uefi_boot(), "Not booted through UEFI");
            let config = Config::load()?;
            let description = description.unwrap_or(config.efi.boot_entry_description);
            let order = bootorder::promote_boot_entry(&config.efi.efivars_path, &description)?;
            println!("BootOrder: {order}");
            Ok(())
        }
        Opt::ShowBootOrder => show_boot_order(&Config::load()?),
    }
}
