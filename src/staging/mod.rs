//! Staging — sandbox URL resolution and local file-movement actions.
//!
//! The agent lives on the pilot's target resource, so every sandbox URL
//! resolves to a local filesystem path.  Only the local actions (`LINK`,
//! `COPY`, `MOVE`, `TARBALL`) are enacted here; `TRANSFER` belongs to the
//! client side and is an error when it reaches the agent.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::AgentError;
use crate::task::{StagingAction, StagingDirective};

// ── SandboxContext ────────────────────────────────────────────────────────────

/// The sandboxes a staging URL may refer to.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    /// Working directory for relative paths — the task sandbox.
    pub pwd: PathBuf,
    pub task: PathBuf,
    pub pilot: PathBuf,
    pub session: PathBuf,
    pub resource: PathBuf,
    pub endpoint: PathBuf,
}

impl SandboxContext {
    /// Context rooted in one task sandbox under the usual pilot layout
    /// (`session/pilot/task`).
    pub fn for_task(task_sandbox: &Path, pilot_sandbox: &Path, session_sandbox: &Path) -> Self {
        Self {
            pwd: task_sandbox.to_path_buf(),
            task: task_sandbox.to_path_buf(),
            pilot: pilot_sandbox.to_path_buf(),
            session: session_sandbox.to_path_buf(),
            resource: session_sandbox.to_path_buf(),
            endpoint: PathBuf::from("/"),
        }
    }

    /// Resolve a staging URL into a local path.
    ///
    /// Sandbox schemes (`task://`, `pilot://`, …) resolve against their
    /// sandbox root; `file://` strips the scheme and optional host; plain
    /// relative paths resolve against `pwd`.  Any other scheme is handled by
    /// the client-side staging layer and is an error here.
    pub fn resolve(&self, url: &str) -> Result<PathBuf, AgentError> {
        if let Some((scheme, rest)) = url.split_once("://") {
            let path = strip_host(rest);
            let root = match scheme {
                "task" => &self.task,
                "pilot" => &self.pilot,
                "session" => &self.session,
                "resource" => &self.resource,
                "endpoint" => &self.endpoint,
                "file" => return Ok(PathBuf::from(format!("/{}", path.trim_start_matches('/')))),
                other => {
                    return Err(AgentError::Staging(format!(
                        "scheme '{other}://' is not resolvable on the agent side: {url}"
                    )));
                }
            };
            return Ok(root.join(path.trim_start_matches('/')));
        }

        let path = Path::new(url);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.pwd.join(path))
        }
    }
}

/// Drop an optional `host` segment: `localhost/tmp/x` → `/tmp/x`.
fn strip_host(rest: &str) -> &str {
    if rest.starts_with('/') {
        rest
    } else {
        match rest.find('/') {
            Some(i) => &rest[i..],
            None => "",
        }
    }
}

// ── Directive enactment ───────────────────────────────────────────────────────

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Enact one local staging directive for task `uid`.
///
/// Target normalisation: an empty target becomes `task:///basename(src)`;
/// a target that exists and is a directory receives `basename(src)`
/// underneath.  Missing target parents are created, except when the parent
/// is the task sandbox root itself (the executor creates that).
pub async fn enact(uid: &str, sd: &StagingDirective, ctx: &SandboxContext) -> Result<(), AgentError> {
    if sd.action == StagingAction::Transfer {
        return Err(AgentError::Staging(format!(
            "TRANSFER directive reached the agent for task {uid}: {}",
            sd.source
        )));
    }

    let src = ctx.resolve(&sd.source)?;

    let target_url = if sd.target.trim().is_empty() {
        format!("task:///{}", basename(&sd.source))
    } else {
        sd.target.clone()
    };
    let mut tgt = ctx.resolve(&target_url)?;
    if tgt.is_dir() && sd.action != StagingAction::Tarball {
        tgt = tgt.join(basename(&sd.source));
    }

    if let Some(parent) = tgt.parent() {
        if parent != ctx.task && !parent.exists() {
            debug!(parent = %parent.display(), "creating staging target directory");
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    match sd.action {
        StagingAction::Copy => copy_recursive(&src, &tgt).await,
        StagingAction::Link => link(&src, &tgt).await,
        StagingAction::Move => rename_or_copy(&src, &tgt).await,
        StagingAction::Tarball => extract_tarball(uid, &tgt).await,
        StagingAction::Transfer => unreachable!("rejected above"),
    }
}

/// Recursive copy; a plain file falls back to a file copy.
async fn copy_recursive(src: &Path, tgt: &Path) -> Result<(), AgentError> {
    let meta = tokio::fs::metadata(src)
        .await
        .map_err(|e| AgentError::Staging(format!("copy source {}: {e}", src.display())))?;
    if meta.is_dir() {
        copy_dir(src.to_path_buf(), tgt.to_path_buf()).await
    } else {
        tokio::fs::copy(src, tgt)
            .await
            .map_err(|e| AgentError::Staging(format!("copy {} -> {}: {e}", src.display(), tgt.display())))?;
        Ok(())
    }
}

fn copy_dir(
    src: PathBuf,
    tgt: PathBuf,
) -> std::pin::Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(&tgt).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from = entry.path();
            let to = tgt.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir(from, to).await?;
            } else {
                tokio::fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    })
}

/// Symlink; a file source pointed at an existing directory links under the
/// source basename (POSIX `ln` semantics).
async fn link(src: &Path, tgt: &Path) -> Result<(), AgentError> {
    let tgt = if src.is_file() && tgt.is_dir() {
        tgt.join(src.file_name().unwrap_or_default())
    } else {
        tgt.to_path_buf()
    };
    tokio::fs::symlink(src, &tgt)
        .await
        .map_err(|e| AgentError::Staging(format!("link {} -> {}: {e}", src.display(), tgt.display())))
}

/// Rename, falling back to copy-and-remove across filesystems.
async fn rename_or_copy(src: &Path, tgt: &Path) -> Result<(), AgentError> {
    match tokio::fs::rename(src, tgt).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
            copy_recursive(src, tgt).await?;
            if src.is_dir() {
                tokio::fs::remove_dir_all(src).await?;
            } else {
                tokio::fs::remove_file(src).await?;
            }
            Ok(())
        }
        Err(e) => Err(AgentError::Staging(format!(
            "move {} -> {}: {e}",
            src.display(),
            tgt.display()
        ))),
    }
}

/// Extract `{uid}.tar` from the parent of the target path.  Member paths
/// are absolute on the target system; extraction is rooted at `/`.
async fn extract_tarball(uid: &str, tgt: &Path) -> Result<(), AgentError> {
    let parent = tgt
        .parent()
        .ok_or_else(|| AgentError::Staging(format!("tarball target {} has no parent", tgt.display())))?;
    let tarball = parent.join(format!("{uid}.tar"));
    debug!(tarball = %tarball.display(), "extracting staged tarball");

    let status = Command::new("tar")
        .arg("xf")
        .arg(&tarball)
        .arg("-C")
        .arg("/")
        .status()
        .await
        .map_err(|e| AgentError::Staging(format!("tar spawn failed: {e}")))?;
    if !status.success() {
        return Err(AgentError::Staging(format!(
            "tar extraction of {} failed: {status}",
            tarball.display()
        )));
    }
    Ok(())
}
