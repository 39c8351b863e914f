// src/error.rs
use thiserror::Error;

use crate::source::SourceKind;

/// Domain errors surfaced by the watchlist, patrol and maintenance surfaces.
#[derive(Error, Debug)]
pub enum PatrolError {
    #[error("{kind} '{id}' is already tracked")]
    DuplicateSource { kind: SourceKind, id: String },

    #[error("{kind} '{id}' is not tracked")]
    NotFound { kind: SourceKind, id: String },

    #[error("{kind} '{id}' sits in protected tier {tier}; pass force to override")]
    ProtectedTier {
        kind: SourceKind,
        id: String,
        tier: String,
    },

    #[error("{kind} id must not be empty")]
    EmptyId { kind: SourceKind },

    #[error("tier '{tier}' is not valid for {kind}")]
    InvalidTier { kind: SourceKind, tier: String },

    #[error("fetch failed for {source_label}: {message}")]
    FetchFailure {
        source_label: String,
        message: String,
    },

    #[error("could not resolve author id {raw_id}: {message}")]
    ResolutionFailed { raw_id: String, message: String },

    #[error("persisting {store} failed: {message}")]
    PersistenceFailure { store: &'static str, message: String },

    #[error("another patrol run holds the lock at {0}")]
    RunInProgress(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PatrolError {
    pub(crate) fn persistence(store: &'static str, err: impl std::fmt::Display) -> Self {
        PatrolError::PersistenceFailure {
            store,
            message: format!("{err:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, PatrolError>;
