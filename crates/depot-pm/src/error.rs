//! Workspace-level errors
//!
//! Component errors convert into [`WorkspaceError`]; operations that keep
//! going after a per-package failure return them together as
//! [`WorkspaceError::Aggregate`].

use crate::artifacts::{ArtifactError, TransportError};
use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::identity::IdentityConflictError;
use crate::manifest::ManifestError;
use crate::pins::PinsError;
use crate::resolver::ResolutionError;
use crate::source_control::SourceControlError;
use crate::state::StateError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Illegal or failed managed dependency transitions
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateTransitionError {
    #[error("dependency '{0}' already in edit mode")]
    AlreadyEdited(String),

    #[error("local dependency '{0}' can't be edited")]
    LocalNotEditable(String),

    #[error("dependency '{0}' not in edit mode")]
    NotEdited(String),

    #[error("could not find dependency '{0}'")]
    UnknownDependency(String),

    #[error("dependency '{0}' can only be resolved to a version, branch or revision")]
    UnversionedRequirement(String),

    #[error("revision '{0}' does not exist")]
    RevisionNotFound(String),

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("dependency '{name}' has uncommitted changes at '{}'", path.display())]
    UncommittedChanges { name: String, path: PathBuf },
}

/// The pins file cannot be used as ground truth
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StaleStateError {
    #[error("an out-of-date resolved file was detected at {}, which is not allowed when automatic dependency resolution is disabled; please make sure to update the file to reflect the changes in dependencies", path.display())]
    OutOfDate { path: PathBuf, reason: String },

    #[error("a resolved file is required when automatic dependency resolution is disabled and should be placed at {}", path.display())]
    ResolvedFileRequired { path: PathBuf },
}

/// Errors collected from independent parts of one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<String>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, error: impl fmt::Display) {
        self.0.push(error.to_string());
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.iter().any(|message| message.contains(needle))
    }

    /// `Ok` when nothing was collected
    pub fn into_result(self) -> Result<(), WorkspaceError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(WorkspaceError::Aggregate(self))
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("\n"))
    }
}

/// Errors surfaced by workspace operations
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Identity(#[from] IdentityConflictError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    StateTransition(#[from] StateTransitionError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    StaleState(#[from] StaleStateError),

    #[error(transparent)]
    SourceControl(#[from] SourceControlError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Workspace state error: {0}")]
    State(#[from] StateError),

    #[error("Pins error: {0}")]
    Pins(#[from] PinsError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation was interrupted: {0}")]
    Interrupted(String),

    #[error("{0}")]
    Aggregate(Diagnostics),
}

impl From<ContainerError> for WorkspaceError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::SourceControl(e) => WorkspaceError::SourceControl(e),
            ContainerError::Manifest(e) => WorkspaceError::Manifest(e),
            other => WorkspaceError::Resolution(ResolutionError::Container(other)),
        }
    }
}

impl WorkspaceError {
    /// Every message carried by this error
    pub fn messages(&self) -> Vec<String> {
        match self {
            WorkspaceError::Aggregate(diagnostics) => diagnostics.messages().to_vec(),
            other => vec![other.to_string()],
        }
    }
}
