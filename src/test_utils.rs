//! Test utilities shared across this crate's unit tests.

use crate::config::Config;
use crate::error::CoreError;
use tempfile::TempDir;

/// Create a temporary directory for testing.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("failed to create temporary directory")
}

/// A default-valued config suitable for tests, rooted under a fresh tempdir
/// so tests never share on-disk state.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.cas_root = dir.path().join("cas");
    config.storage.registry_db_path = dir.path().join("registry.db");
    config.storage.timeline_dir = dir.path().join("timelines");
    config
}

/// Assert that a `CoreError` result's message contains `expected`.
pub fn assert_error_contains<T>(result: Result<T, CoreError>, expected: &str) {
    match result {
        Ok(_) => panic!("expected error containing '{expected}' but got Ok"),
        Err(e) => {
            let msg = e.to_string();
            assert!(msg.contains(expected), "error message '{msg}' does not contain '{expected}'");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_creation_succeeds() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_config_validates() {
        let dir = temp_dir();
        let config = test_config(&dir);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "expected error containing")]
    fn assert_error_contains_panics_on_ok() {
        let result: Result<(), CoreError> = Ok(());
        assert_error_contains(result, "error");
    }
}
