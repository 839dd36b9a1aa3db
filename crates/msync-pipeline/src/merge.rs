use std::path::Path;
use std::process::Command;

use thiserror::Error;

use msync_core::types::TimeWindow;

#[derive(Debug, Error)]
pub enum HealError {
    #[error("merge command failed: {command}: {output}")]
    CommandFailed { command: String, output: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Merge(String),
}

#[derive(Debug, Clone, Copy)]
pub struct MergerCapabilities {
    /// Whether the underlying engine restricts healing to a time window.
    /// When false the merger falls back to merging all points and the
    /// caller's window is ignored; callers always pass the window.
    pub time_window: bool,
}

/// Storage-merge collaborator: backfills `local` from `staged` in place.
///
/// Semantics: existing local points are preserved; points only present
/// in the staged copy (within the window) are added; points present on
/// both sides keep the local value unless `overwrite`, in which case the
/// staged value wins inside the window. Points outside the window are
/// never touched. Healing is idempotent when `overwrite` is false.
///
/// Deliberately synchronous; the heal pool runs these on blocking
/// threads, and the planner guarantees no two concurrent calls share a
/// `local` path.
pub trait StorageMerger: Send + Sync + 'static {
    fn capabilities(&self) -> MergerCapabilities;

    fn heal(
        &self,
        staged: &Path,
        local: &Path,
        window: Option<TimeWindow>,
        overwrite: bool,
    ) -> Result<(), HealError>;
}

/// Shells out to an external heal binary (one invocation per metric).
#[derive(Debug, Clone)]
pub struct CommandMerger {
    program: String,
    supports_time_window: bool,
}

impl CommandMerger {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            supports_time_window: true,
        }
    }

    /// For engines that predate window support; see
    /// [`MergerCapabilities::time_window`].
    pub fn without_time_window(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            supports_time_window: false,
        }
    }

    fn build_args(
        &self,
        staged: &Path,
        local: &Path,
        window: Option<TimeWindow>,
        overwrite: bool,
    ) -> Vec<String> {
        let mut args = Vec::new();
        if let (true, Some(window)) = (self.supports_time_window, window) {
            args.push("--start-time".to_string());
            args.push(window.start().to_string());
            args.push("--end-time".to_string());
            args.push(window.end().to_string());
        }
        if overwrite {
            args.push("--overwrite".to_string());
        }
        args.push(staged.display().to_string());
        args.push(local.display().to_string());
        args
    }
}

impl StorageMerger for CommandMerger {
    fn capabilities(&self) -> MergerCapabilities {
        MergerCapabilities {
            time_window: self.supports_time_window,
        }
    }

    fn heal(
        &self,
        staged: &Path,
        local: &Path,
        window: Option<TimeWindow>,
        overwrite: bool,
    ) -> Result<(), HealError> {
        let args = self.build_args(staged, local, window, overwrite);
        let output = Command::new(&self.program).args(&args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else if !stdout.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                "<no output>".to_string()
            };
            return Err(HealError::CommandFailed {
                command: format!("{} {}", self.program, args.join(" ")),
                output: detail,
            });
        }
        Ok(())
    }
}
