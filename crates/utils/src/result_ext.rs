use std::fmt::Display;

/// Extension methods for results whose failure is tolerable.
///
/// Some operations here are best-effort: clearing an immutable flag before
/// writing a firmware variable, or reverting a remount on drop. Their errors
/// are logged and then dropped on the floor, never propagated.
pub trait ResultExt<T, E: Display> {
    /// Return the Ok value unchanged. In the err case, log it, and return None
    fn log_err(self) -> Option<T>;

    /// In the case of an error, log it and return the default value.
    fn log_err_default(self) -> T
    where
        T: Default;

    /// Like [`Self::log_err`], but with a short description of what was attempted.
    fn log_err_with(self, what: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("{e:#}");
                None
            }
        }
    }

    #[track_caller]
    fn log_err_default(self) -> T
    where
        T: Default,
    {
        self.log_err().unwrap_or_default()
    }

    #[track_caller]
    fn log_err_with(self, what: &str) -> Option<T> {
        match self {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("{what}: {e:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err() {
        let ok: Result<u32, String> = Ok(42);
        similar_asserts::assert_eq!(ok.log_err(), Some(42));
        let err: Result<u32, String> = Err("nope".into());
        similar_asserts::assert_eq!(err.log_err(), None);
    }

    #[test]
    fn test_log_err_default() {
        let err: Result<Vec<u8>, String> = Err("nope".into());
        assert!(err.log_err_default().is_empty());
        let err: Result<bool, &str> = Err("flag unsupported");
        assert!(!err.log_err_default());
    }

    #[test]
    fn test_log_err_with() {
        let err: Result<(), std::io::Error> = Err(std::io::Error::other("ioctl failed"));
        assert!(err.log_err_with("clearing immutable flag").is_none());
    }
}
