//! Error types shared by every seedling crate.
//!
//! Variants carry the kind and object key so a failed pass can be traced
//! back to the write that broke it.

use std::time::Duration;

use thiserror::Error;

use crate::{Kind, ObjectKey};

#[derive(Debug, Error)]
pub enum Error {
    /// Expected on the create path; callers match on it rather than surface it.
    #[error("{kind} {key} not found")]
    NotFound { kind: Kind, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: Kind, key: ObjectKey },

    /// Optimistic-concurrency failure (stale resourceVersion).
    #[error("conflict writing {kind} {key}: {message}")]
    Conflict { kind: Kind, key: ObjectKey, message: String },

    /// The store refused the write (validation, immutable field, ...).
    #[error("{kind} {key} rejected: {message}")]
    Rejected { kind: Kind, key: ObjectKey, message: String },

    #[error("timed out after {waited:?} waiting for {kind} {key} to appear in the cache")]
    Timeout { kind: Kind, key: ObjectKey, waited: Duration },

    #[error("cancelled while {context}")]
    Cancelled { context: String },

    #[error("failed syncing project for seed {seed}: {source}")]
    Seed {
        seed: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to build {kind} {name}: {message}")]
    Creator { kind: Kind, name: String, message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("backend error [{context}]: {message}")]
    Backend { context: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn not_found(kind: Kind, key: ObjectKey) -> Self { Self::NotFound { kind, key } }

    pub fn creator(kind: Kind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Creator { kind, name: name.into(), message: message.into() }
    }

    pub fn backend(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend { context: context.into(), message: message.into() }
    }

    pub fn serialization(message: impl Into<String>) -> Self { Self::Serialization { message: message.into() } }

    pub fn cancelled(context: impl Into<String>) -> Self { Self::Cancelled { context: context.into() } }

    /// Wrap an error with the seed it came from. Already-wrapped errors are kept as is.
    pub fn for_seed(self, seed: impl Into<String>) -> Self {
        match self {
            e @ Error::Seed { .. } => e,
            e => Error::Seed { seed: seed.into(), source: Box::new(e) },
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    pub fn is_cancelled(&self) -> bool { matches!(self, Error::Cancelled { .. }) }

    /// Seed identifier of a fan-out failure, if any.
    pub fn seed(&self) -> Option<&str> {
        match self {
            Error::Seed { seed, .. } => Some(seed),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::serialization(e.to_string()) }
}

/// Treat NotFound as success (idempotent delete and friends).
pub fn ignore_not_found<T: Default>(res: Result<T>) -> Result<T> {
    match res {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}
