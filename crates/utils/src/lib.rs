//! Small helpers shared by the boot-to-talos crates: log setup for the
//! binary, and logging of errors that are tolerated rather than returned.
//!
mod tracing_util;
pub use tracing_util::*;
mod result_ext;
pub use result_ext::*;
