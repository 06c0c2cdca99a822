//! Hook for the external search indexer, run after a batch changed files.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

use reposync_core::config::ReindexSettings;

#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("failed to start indexer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("indexer '{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("indexer does not support single-repository updates")]
    Unsupported,
}

/// The indexing collaborator. Implementations block; the scheduler calls
/// them from a blocking task.
pub trait Reindexer: Send + Sync {
    /// Rebuild the whole index over every clone under `root`.
    /// Returns the number of documents indexed.
    fn rebuild_index(&self, root: &Path) -> Result<usize, ReindexError>;

    /// Whether [`Reindexer::reindex_repository`] can update one clone alone.
    fn supports_scoped(&self) -> bool {
        false
    }

    /// Update the index for the clone at `path` only.
    fn reindex_repository(&self, _path: &Path) -> Result<usize, ReindexError> {
        Err(ReindexError::Unsupported)
    }
}

/// Runs an external command with the target path appended. The last
/// non-empty stdout line, if numeric, is taken as the document count.
#[derive(Debug, Clone)]
pub struct CommandReindexer {
    program: String,
    args: Vec<String>,
    scoped: bool,
}

impl CommandReindexer {
    pub fn new(program: impl Into<String>, args: Vec<String>, scoped: bool) -> Self {
        Self {
            program: program.into(),
            args,
            scoped,
        }
    }

    /// `None` when no command is configured.
    pub fn from_settings(settings: &ReindexSettings) -> Option<Self> {
        let (program, args) = settings.command.as_deref()?.split_first()?;
        Some(Self::new(program.clone(), args.to_vec(), settings.scoped))
    }

    fn run(&self, target: &Path) -> Result<usize, ReindexError> {
        tracing::debug!(program = %self.program, target = %target.display(), "running indexer");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(target)
            .output()
            .map_err(|source| ReindexError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ReindexError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(document_count(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Reindexer for CommandReindexer {
    fn rebuild_index(&self, root: &Path) -> Result<usize, ReindexError> {
        self.run(root)
    }

    fn supports_scoped(&self) -> bool {
        self.scoped
    }

    fn reindex_repository(&self, path: &Path) -> Result<usize, ReindexError> {
        if !self.scoped {
            return Err(ReindexError::Unsupported);
        }
        self.run(path)
    }
}

fn document_count(stdout: &str) -> usize {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_comes_from_last_non_empty_line() {
        assert_eq!(document_count("indexing...\n42\n\n"), 42);
        assert_eq!(document_count("done"), 0);
        assert_eq!(document_count(""), 0);
    }

    #[test]
    fn from_settings_requires_a_program() {
        assert!(CommandReindexer::from_settings(&ReindexSettings::default()).is_none());
        let empty = ReindexSettings {
            command: Some(Vec::new()),
            scoped: false,
        };
        assert!(CommandReindexer::from_settings(&empty).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn runs_command_with_target_appended() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let indexer = CommandReindexer::new(
            "sh",
            vec!["-c".to_string(), "echo scanning \"$0\"; echo 7".to_string()],
            true,
        );
        assert_eq!(indexer.reindex_repository(tmp.path()).expect("run"), 7);
        assert!(indexer.supports_scoped());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_stderr() {
        let tmp = tempfile::TempDir::new().expect("tmp");
        let indexer = CommandReindexer::new(
            "sh",
            vec!["-c".to_string(), "echo broken index >&2; exit 3".to_string()],
            false,
        );
        let err = indexer.rebuild_index(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("broken index"), "got: {err}");
        assert!(matches!(
            indexer.reindex_repository(tmp.path()),
            Err(ReindexError::Unsupported)
        ));
    }
}
