//! Repository provisioning for agent working copies.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use tracing::{info, info_span, Instrument};

use crate::backend::command;
use crate::{AppError, Result};

/// Prefix of the branch every agent works on.
pub const AGENT_BRANCH_PREFIX: &str = "agent-dev/";

/// Branch name for an agent's working copy.
#[must_use]
pub fn agent_branch(agent_id: &str) -> String {
    format!("{AGENT_BRANCH_PREFIX}{agent_id}")
}

/// Produces a working copy of a repository at a destination path.
pub trait RepoProvisioner: Send + Sync {
    /// Clone `repo_url` into `dest` (which must not exist yet) and check
    /// out a new `branch`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CreateFailed` if the working copy cannot be
    /// produced.
    fn provision<'a>(
        &'a self,
        repo_url: &'a str,
        dest: &'a Path,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Provisioner shelling out to `git`.
#[derive(Debug, Clone)]
pub struct GitProvisioner {
    git_bin: String,
    timeout: Duration,
}

impl GitProvisioner {
    /// Create a provisioner bounded by `timeout` per git call.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            git_bin: "git".into(),
            timeout,
        }
    }

    async fn git(&self, step: &str, args: &[String]) -> Result<()> {
        let out = command::run(&self.git_bin, args, self.timeout, AppError::CreateFailed)
            .await
            .map_err(|err| match err {
                AppError::BackendUnavailable(msg) => AppError::CreateFailed(msg),
                other => other,
            })?;
        out.into_stdout(|stderr| {
            AppError::CreateFailed(format!("git {step} failed: {stderr}"))
        })
        .map(|_| ())
    }
}

impl RepoProvisioner for GitProvisioner {
    fn provision<'a>(
        &'a self,
        repo_url: &'a str,
        dest: &'a Path,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let span = info_span!("provision", repo_url, dest = %dest.display());
        Box::pin(
            async move {
                if dest.exists() {
                    return Err(AppError::CreateFailed(format!(
                        "working copy {} already exists",
                        dest.display()
                    )));
                }
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|err| {
                        AppError::CreateFailed(format!("failed to create agents dir: {err}"))
                    })?;
                }

                let dest_str = dest.to_string_lossy().into_owned();
                self.git("clone", &command::args(["clone", repo_url, &dest_str]))
                    .await?;
                self.git("checkout", &command::args(["-C", &dest_str, "checkout", "-b", branch]))
                    .await?;

                info!(branch, "working copy ready");
                Ok(())
            }
            .instrument(span),
        )
    }
}
