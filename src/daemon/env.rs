// Fallible environment access for the daemon variables

use crate::error::{DaemonError, Result};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// Read a variable as raw bytes, treating an absent variable as empty.
pub fn get_var(key: &str) -> OsString {
    std::env::var_os(key).unwrap_or_default()
}

/// Set a variable, refusing what `std::env::set_var` would panic on.
pub fn set_var(key: &str, value: &OsStr) -> Result<()> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(DaemonError::EnvError {
            var: key.to_string(),
            reason: "invalid variable name".to_string(),
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(DaemonError::EnvError {
            var: key.to_string(),
            reason: "value contains a NUL byte".to_string(),
        });
    }
    std::env::set_var(key, value);
    Ok(())
}

/// Put a variable back to a value captured before daemonization.
///
/// An empty original means the variable was not there to begin with.
pub fn restore_var(key: &str, original: &OsStr) -> Result<()> {
    if original.is_empty() {
        std::env::remove_var(key);
        Ok(())
    } else {
        set_var(key, original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn test_set_and_get_var() {
        let key = "__STAGED_DAEMON_TEST_ENV_SET";
        set_var(key, OsStr::new("value")).unwrap();
        assert_eq!(get_var(key), OsString::from("value"));
        std::env::remove_var(key);
        assert!(get_var(key).is_empty());
    }

    #[test]
    fn test_set_var_rejects_bad_input() {
        assert!(matches!(
            set_var("", OsStr::new("x")),
            Err(DaemonError::EnvError { .. })
        ));
        assert!(matches!(
            set_var("A=B", OsStr::new("x")),
            Err(DaemonError::EnvError { .. })
        ));
        let nul = OsString::from_vec(b"a\0b".to_vec());
        assert!(matches!(
            set_var("__STAGED_DAEMON_TEST_ENV_NUL", &nul),
            Err(DaemonError::EnvError { .. })
        ));
    }

    #[test]
    fn test_restore_empty_removes_var() {
        let key = "__STAGED_DAEMON_TEST_ENV_RESTORE";
        set_var(key, OsStr::new("chained")).unwrap();
        restore_var(key, OsStr::new("")).unwrap();
        assert!(std::env::var_os(key).is_none());

        restore_var(key, OsStr::new("before")).unwrap();
        assert_eq!(get_var(key), OsString::from("before"));
        std::env::remove_var(key);
    }
}
