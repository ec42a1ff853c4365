//! Working copy management through the `git` command line

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::VcsError;

/// Credentials for one build, passed to every git call that talks to the
/// remote. Nothing here is written to the process environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitCredentials {
    pub ssh_key_path: Option<PathBuf>,
}

impl GitCredentials {
    pub fn with_ssh_key(path: impl Into<PathBuf>) -> Self {
        Self {
            ssh_key_path: Some(path.into()),
        }
    }

    /// Value for `GIT_SSH_COMMAND`, if a key is staged
    pub fn ssh_command(&self) -> Option<String> {
        self.ssh_key_path.as_ref().map(|key| {
            format!(
                "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                key.display()
            )
        })
    }
}

#[async_trait]
pub trait Vcs: Send + Sync {
    /// Fresh clone of `url` into `dest`
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        creds: &GitCredentials,
    ) -> Result<(), VcsError>;

    /// Bring an existing working copy at `dest` up to date
    async fn update(&self, dest: &Path, creds: &GitCredentials) -> Result<(), VcsError>;

    /// Check out exactly `revision`
    async fn checkout(&self, dest: &Path, revision: &str) -> Result<(), VcsError>;
}

/// [`Vcs`] implementation that shells out to `git`
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, cwd: &Path, creds: Option<&GitCredentials>) -> Command {
        let mut command = Command::new(&self.program);
        command.current_dir(cwd).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh_command) = creds.and_then(GitCredentials::ssh_command) {
            command.env("GIT_SSH_COMMAND", ssh_command);
        }
        command
    }

    async fn run(
        &self,
        operation: &'static str,
        mut command: Command,
        cwd: &Path,
    ) -> Result<(), VcsError> {
        info!("Running (cwd = '{}'): git {}", cwd.display(), operation);
        let output = command
            .output()
            .await
            .map_err(|source| VcsError::Spawn { operation, source })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(VcsError::Failed {
                operation,
                code: output.status.code(),
                output: combined,
            });
        }
        debug!("git {} output:\n{}", operation, combined);
        Ok(())
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        creds: &GitCredentials,
    ) -> Result<(), VcsError> {
        let mut command = self.command(dest, Some(creds));
        command.args(clone_args(url));
        self.run("clone", command, dest).await
    }

    async fn update(&self, dest: &Path, creds: &GitCredentials) -> Result<(), VcsError> {
        let mut command = self.command(dest, Some(creds));
        command.args(["fetch", "--quiet", "--prune", "origin"]);
        self.run("fetch", command, dest).await
    }

    async fn checkout(&self, dest: &Path, revision: &str) -> Result<(), VcsError> {
        let mut command = self.command(dest, None);
        command.args(checkout_args(revision));
        self.run("checkout", command, dest).await
    }
}

// URL and revision come from the payload; `--` keeps them from being read
// as options.
fn clone_args(url: &str) -> [&str; 5] {
    ["clone", "--quiet", "--", url, "."]
}

fn checkout_args(revision: &str) -> [&str; 7] {
    [
        "-c",
        "advice.detachedHead=false",
        "checkout",
        "--force",
        "--quiet",
        revision,
        "--",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_key_means_no_ssh_command() {
        assert!(GitCredentials::default().ssh_command().is_none());
    }

    #[test]
    fn ssh_command_points_at_staged_key() {
        let creds = GitCredentials::with_ssh_key("/tmp/pushbuild-key-1");
        let command = creds.ssh_command().unwrap();
        assert!(command.starts_with("ssh -i '/tmp/pushbuild-key-1'"));
        assert!(command.contains("IdentitiesOnly=yes"));
    }

    #[test]
    fn payload_values_follow_end_of_options() {
        let clone = clone_args("--upload-pack=touch /tmp/x");
        let separator = clone.iter().position(|a| *a == "--").unwrap();
        assert!(separator < clone.iter().position(|a| a.starts_with("--upload")).unwrap());
        assert_eq!(clone.last(), Some(&"."));

        let checkout = checkout_args("-b");
        assert_eq!(&checkout[5..], &["-b", "--"]);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitCli::new("/nonexistent/git-binary");
        let err = git
            .clone_repo("https://example.com/r.git", dir.path(), &GitCredentials::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::Spawn { operation: "clone", .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_keeps_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1
        let git = GitCli::new("false");
        let err = git.checkout(dir.path(), "abc123").await.unwrap_err();
        match err {
            VcsError::Failed { operation, code, .. } => {
                assert_eq!(operation, "checkout");
                assert_eq!(code, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
