//! # Switching a running machine to Talos Linux
//!
//! This crate takes a Unified Kernel Image and either boots it directly
//! with kexec, or arranges for firmware to boot the installed system next
//! by rewriting the UEFI boot order.

pub mod bootorder;
pub mod cli;
pub mod config;
pub mod efivars;
pub mod kexec;

// Re-export the image reader for consumers that produce boot assets
pub use btt_uki as uki;
