//! Script directory layout: one root with reset, pre-run, run, post-run and seed roles.

use std::path::{Path, PathBuf};

use crate::config::DirectorySettings;
use crate::error::{Result, SqlWatchError};

/// One resolved role directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDir {
    /// Absolute path used for filesystem access.
    pub path: PathBuf,
    /// `<root><role>` as configured, used in log lines.
    pub label: String,
}

impl RoleDir {
    fn resolve(root: &str, role: &str) -> Result<Self> {
        let label = ScriptDirectories::build(root, role)?;
        let path = std::path::absolute(&label)?;
        Ok(Self { path, label })
    }

    /// Whether `changed` lies inside this directory.
    pub fn contains(&self, changed: &Path) -> bool {
        changed.starts_with(&self.path)
    }
}

/// All script directories, validated and made absolute.
#[derive(Debug, Clone)]
pub struct ScriptDirectories {
    pub root: PathBuf,
    pub root_label: String,
    pub reset: Option<RoleDir>,
    pub pre_run: Option<RoleDir>,
    pub run: RoleDir,
    pub post_run: Option<RoleDir>,
    pub seed: Option<RoleDir>,
}

impl ScriptDirectories {
    /// Join a role path onto the root. Role paths must start with `/`.
    pub fn build(root: &str, role_path: &str) -> Result<String> {
        if !role_path.starts_with('/') {
            return Err(SqlWatchError::ConfigError(format!(
                "Directories must start with / which is missing from '{}'",
                role_path
            )));
        }
        Ok(format!("{}{}", root, role_path))
    }

    /// Validate every configured role, then make each path absolute.
    ///
    /// Validation happens for all roles before any path is touched.
    pub fn resolve(settings: &DirectorySettings) -> Result<Self> {
        let optional = [
            &settings.reset,
            &settings.pre_run,
            &settings.post_run,
            &settings.seed,
        ];
        ScriptDirectories::build(&settings.root, &settings.run)?;
        for role in optional.into_iter().flatten() {
            ScriptDirectories::build(&settings.root, role)?;
        }

        let root = &settings.root;
        let role = |r: &Option<String>| -> Result<Option<RoleDir>> {
            r.as_deref().map(|r| RoleDir::resolve(root, r)).transpose()
        };

        Ok(Self {
            root: std::path::absolute(root)?,
            root_label: root.clone(),
            reset: role(&settings.reset)?,
            pre_run: role(&settings.pre_run)?,
            run: RoleDir::resolve(root, &settings.run)?,
            post_run: role(&settings.post_run)?,
            seed: role(&settings.seed)?,
        })
    }

    /// Create the root (recursively) and every configured role directory.
    pub fn create_all(&self) -> Result<()> {
        if !self.root.exists() {
            log::debug!("Creating script root {}", self.root_label);
            std::fs::create_dir_all(&self.root)?;
        }
        let roles = [
            self.post_run.as_ref(),
            self.pre_run.as_ref(),
            self.reset.as_ref(),
            Some(&self.run),
            self.seed.as_ref(),
        ];
        for role in roles.into_iter().flatten() {
            if !role.path.exists() {
                std::fs::create_dir_all(&role.path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_in(root: &Path) -> DirectorySettings {
        DirectorySettings {
            root: root.join("db/scripts").display().to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_joins_root_and_role() {
        assert_eq!(
            ScriptDirectories::build("./db/scripts", "/run").unwrap(),
            "./db/scripts/run"
        );
    }

    #[test]
    fn test_build_requires_leading_slash() {
        let err = ScriptDirectories::build("./db/scripts", "run").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Directories must start with / which is missing from 'run'"
        );
    }

    #[test]
    fn test_resolve_fails_before_touching_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.seed = Some("seed".to_string());

        assert!(ScriptDirectories::resolve(&settings).is_err());
        assert!(!dir.path().join("db").exists());
    }

    #[test]
    fn test_resolve_labels_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let dirs = ScriptDirectories::resolve(&settings).unwrap();

        assert_eq!(dirs.run.label, format!("{}/run", settings.root));
        assert!(dirs.run.path.is_absolute());
        assert!(dirs.run.path.ends_with("db/scripts/run"));
        assert_eq!(
            dirs.pre_run.as_ref().map(|d| d.label.clone()),
            Some(format!("{}/prerun", settings.root))
        );
    }

    #[test]
    fn test_create_all_is_idempotent_and_skips_unset_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.seed = None;
        let dirs = ScriptDirectories::resolve(&settings).unwrap();

        dirs.create_all().unwrap();
        dirs.create_all().unwrap();

        let scripts = dir.path().join("db/scripts");
        for role in ["run", "prerun", "postrun", "reset"] {
            assert!(scripts.join(role).is_dir(), "{} missing", role);
        }
        assert!(!scripts.join("seed").exists());
    }

    #[test]
    fn test_contains_changed_path() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = ScriptDirectories::resolve(&settings_in(dir.path())).unwrap();
        let pre_run = dirs.pre_run.unwrap();

        assert!(pre_run.contains(&pre_run.path.join("001_roles.sql")));
        assert!(!pre_run.contains(&dirs.run.path.join("001_roles.sql")));
    }
}
