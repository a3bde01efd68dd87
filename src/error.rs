// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Error taxonomy for stratumdb.
///
/// Variants map to the failure domains a caller actually needs to distinguish:
/// corruption (fatal for the read it occurred on), optimistic conflicts (not
/// an error, surfaced via `success: false` rather than this enum), capacity
/// exhaustion, transient backend failures, user-projection faults, logic
/// errors, and "not ready yet".
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from a file or memory-mapped backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Framed record failed to parse: disagreeing size fields or CRC mismatch.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Fewer bytes available than the trailing probe requires.
    #[error("end of file: expected at least {expected} bytes, found {actual}")]
    EndOfFile { expected: usize, actual: usize },

    /// Payload violates the codec's size or alignment invariant.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Event sequence did not strictly increase as required by the wrapper.
    #[error("sequence regression: expected > {current}, got {attempted}")]
    SequenceRegression { current: u32, attempted: u32 },

    /// Projection name does not match `[-a-zA-Z0-9_]{1,16}`.
    #[error("invalid projection name: {0:?}")]
    InvalidProjectionName(String),

    /// A shard (or mono-blob) has exhausted its append capacity and there is
    /// no further recovery available at this level.
    #[error("mono-blob is full: {0} appends reached")]
    MonoBlobFull(u32),

    /// Backend call failed after exhausting the retry budget.
    #[error("backend unavailable after {attempts} attempts: {source}")]
    BackendUnavailable {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Caller-supplied cancellation fired while an operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// A single attempt's internal deadline expired. Distinct from `Cancelled`: this fires
    /// from inside the retry wrapper and is itself retryable, whereas `Cancelled` propagates
    /// straight through.
    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A cache candidate's sanity header/trailer did not match, or its name did not match
    /// any writer holding the slot.
    #[error("cache candidate invalid: {0}")]
    InvalidCacheCandidate(String),

    /// A user projection's `apply`/`try_load`/`try_save` raised an error.
    #[error("projection {name:?} faulted: {source}")]
    ProjectionFault {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// One or more sub-projections of a group faulted during `apply`.
    #[error("projection group faulted: {0} sub-projection(s) failed")]
    ProjectionGroupFault(usize),

    /// `initial()` or `load()` produced the absent sentinel instead of a state.
    #[error("projection {0:?} produced no initial state")]
    NoInitialState(String),

    /// Stream is not yet caught up; reads and writes through the facade are refused.
    #[error("stream not ready")]
    StreamNotReady,

    /// A connection string or configuration option could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `read_only` storage rejected a write.
    #[error("storage is read-only")]
    ReadOnly,

    /// Azure SDK error surfaced from the append-blob backend.
    #[cfg(feature = "azure-blob")]
    #[error("azure storage error: {0}")]
    Azure(#[from] azure_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures the multi-blob retry wrapper should retry: backend
    /// 5xx / timeouts. `BackendUnavailable` is the terminal form after
    /// retries are exhausted and is therefore never itself retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout(_)) || self.is_azure_transient()
    }

    #[cfg(feature = "azure-blob")]
    fn is_azure_transient(&self) -> bool {
        match self {
            Error::Azure(e) => match e.kind() {
                azure_core::error::ErrorKind::Io => true,
                azure_core::error::ErrorKind::HttpResponse { status, .. } => {
                    status.as_u16() >= 500
                }
                _ => false,
            },
            _ => false,
        }
    }

    #[cfg(not(feature = "azure-blob"))]
    fn is_azure_transient(&self) -> bool {
        false
    }
}
