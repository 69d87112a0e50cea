//! Selection of runnable script files by extension and test policy.

use crate::config::TestPolicy;
use crate::error::{Result, SqlWatchError};

/// Filters directory listings down to the files a run should apply.
#[derive(Debug, Clone)]
pub struct FileSelector {
    extensions: Vec<String>,
    test_extensions: Vec<String>,
    policy: TestPolicy,
}

impl Default for FileSelector {
    /// `.sql` files, test files included.
    fn default() -> Self {
        Self::new(
            vec![".sql".to_string()],
            vec![".spec.sql".to_string(), ".test.sql".to_string()],
            TestPolicy::Always,
        )
    }
}

impl FileSelector {
    pub fn new(extensions: Vec<String>, test_extensions: Vec<String>, policy: TestPolicy) -> Self {
        Self {
            extensions,
            test_extensions,
            policy,
        }
    }

    fn is_runnable(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    pub fn is_test(&self, name: &str) -> bool {
        self.test_extensions
            .iter()
            .any(|ext| name.ends_with(ext.as_str()))
    }

    /// Keep runnable names, then apply the test policy. Order is preserved.
    ///
    /// An unrecognized policy is only reported once a runnable file needs it.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<String>> {
        let mut selected = Vec::new();
        for name in names.iter().map(AsRef::as_ref) {
            if !self.is_runnable(name) {
                continue;
            }
            let keep = match self.policy {
                TestPolicy::Always => true,
                TestPolicy::Only => self.is_test(name),
                TestPolicy::Skip => !self.is_test(name),
                TestPolicy::Unrecognized(ref value) => {
                    return Err(SqlWatchError::ConfigError(format!(
                        "Non existent test option '{}'",
                        value
                    )));
                }
            };
            if keep {
                selected.push(name.to_string());
            }
        }
        Ok(selected)
    }
}
