//! Binary swap, process restart and the deploy audit trail.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EvolveError;

/// Exit code asking a supervisor to start the replaced binary.
pub const RESTART_EXIT_CODE: i32 = 75;

/// One line of `evolution.jsonl`, written for every deploy attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub commit: Option<String>,
    pub patch_count: usize,
    pub reason: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Replaces the running process once a new binary is in place.
pub trait Restarter: Send + Sync {
    /// Returns only on failure.
    ///
    /// # Errors
    ///
    /// Returns [`EvolveError::Restart`] when the process cannot be replaced.
    fn restart(&self, binary: &Path) -> Result<(), EvolveError>;
}

/// Re-exec the binary in place with the current arguments. Unix only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecRestarter;

impl Restarter for ExecRestarter {
    #[cfg(unix)]
    fn restart(&self, binary: &Path) -> Result<(), EvolveError> {
        use std::os::unix::process::CommandExt as _;

        let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
        tracing::info!(binary = %binary.display(), "replacing process image");
        let err = std::process::Command::new(binary).args(args).exec();
        Err(EvolveError::Restart(err.to_string()))
    }

    #[cfg(not(unix))]
    fn restart(&self, _binary: &Path) -> Result<(), EvolveError> {
        Err(EvolveError::Restart(
            "in-place restart needs unix; set evolution.restart = \"exit\"".into(),
        ))
    }
}

/// Exit and let a supervisor (systemd, a shell loop) start the new binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitRestarter;

impl Restarter for ExitRestarter {
    fn restart(&self, binary: &Path) -> Result<(), EvolveError> {
        tracing::info!(binary = %binary.display(), code = RESTART_EXIT_CODE, "exiting for supervisor restart");
        std::process::exit(RESTART_EXIT_CODE)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Put `new` in place of `current`, keeping the old binary at `<current>.bak`.
///
/// The final step is a rename, so `current` is either the old or the new binary, never a
/// partial copy.
///
/// # Errors
///
/// Returns an error if any copy, permission change or rename fails.
pub async fn swap_binary(current: &Path, new: &Path) -> std::io::Result<PathBuf> {
    let backup = with_suffix(current, ".bak");
    let staged = with_suffix(current, ".new");

    if tokio::fs::try_exists(current).await? {
        tokio::fs::copy(current, &backup).await?;
    }
    tokio::fs::copy(new, &staged).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await?;
    }

    if let Err(e) = tokio::fs::rename(&staged, current).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(e);
    }
    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn swap_keeps_backup_and_installs_new() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("ember");
        let new = dir.path().join("ember-evolve-1");
        std::fs::write(&current, b"old").unwrap();
        std::fs::write(&new, b"new").unwrap();

        let backup = swap_binary(&current, &new).await.unwrap();
        assert_eq!(std::fs::read(&current).unwrap(), b"new");
        assert_eq!(std::fs::read(&backup).unwrap(), b"old");
        assert!(!dir.path().join("ember.new").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(&current).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn missing_new_binary_leaves_current_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("ember");
        std::fs::write(&current, b"old").unwrap();
        let err = swap_binary(&current, &dir.path().join("nope")).await;
        assert!(err.is_err());
        assert_eq!(std::fs::read(&current).unwrap(), b"old");
    }

    #[test]
    fn audit_record_omits_empty_error() {
        let record = AuditRecord {
            timestamp: Utc::now(),
            commit: None,
            patch_count: 2,
            reason: "faster startup".into(),
            success: true,
            error: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""commit":null"#));
        assert!(!json.contains("error"));
    }
}
