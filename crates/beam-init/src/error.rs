//! Error types for the boot sequence.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, InitError>;

/// Conditions that stop the boot. The supervisor decides what happens next.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Erlang installation not found. Check that {} exists: {source}", .root.display())]
    InstallRootUnreadable {
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("erts not found. Check that erlang was installed to {}", .root.display())]
    RuntimeNotFound { root: PathBuf },

    #[error("Found multiple erts directories in {} ({count}). Clean up the installation.", .root.display())]
    MultipleRuntimes { root: PathBuf, count: usize },

    #[error("Multiple releases found in {} ({count}). Not sure which to run.", .root.display())]
    MultipleReleases { root: PathBuf, count: usize },

    #[error("exec failed to run {}: {source}", .program.display())]
    Exec {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),
}
