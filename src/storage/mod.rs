// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The storage driver family (§4.2-§4.6): a position/key-indexed sequence of events, with one
//! implementation per backend, plus two transparent decorators (read cache, tracing). Every
//! driver is owned exclusively by one `EventStream`; none is re-entrant.

pub mod blob_backend;
pub mod cache;
pub mod file;
pub mod memory;
pub mod mono_blob;
pub mod multi_blob;
pub mod trace;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::RawEvent;
use crate::error::{Error, Result};
use crate::metrics::StratumMetrics;

/// Outcome of a compare-and-append `write`. `success = false` means the driver's current
/// end-of-stream position was not `position`; `next_position` is always the refreshed end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub next_position: i64,
    pub success: bool,
}

/// Outcome of a `read`: zero or more fully-parsed events and the position immediately after
/// the last one returned.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub next_position: i64,
    pub events: Vec<RawEvent>,
}

/// The common contract every backend satisfies (§4.2). All operations may perform I/O; none
/// is safe to call re-entrantly from concurrent callers of the *same* driver instance — a
/// driver is owned by exactly one `EventStream`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Latest known end-of-stream position. Must consult the backend; a driver may not cache
    /// this indefinitely since another writer can have grown the stream.
    async fn get_position(&self) -> Result<i64>;

    /// Optimistic compare-and-append: durably appends `events` iff the backend's current
    /// end-of-stream equals `position`.
    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome>;

    /// Fills as much of a `max_len`-byte window starting at `position` as the backend has,
    /// parsing complete events out of it. Returns an empty list iff at end-of-stream.
    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome>;

    /// Sequence of the last event in the stream, 0 if empty.
    async fn get_last_key(&self) -> Result<u32>;

    /// A lower bound on the position at which an event with sequence `>= key` may appear.
    /// `floor_position` is always a legal answer.
    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64>;
}

/// Storage configuration, parsed from a connection string / filesystem path per §6.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Either an Azure Storage connection string (`DefaultEndpointsProtocol=...` or
    /// `BlobEndpoint=...`) or a filesystem path.
    pub connection: String,
    /// Container name; defaults to the root container for cloud connections, or is appended
    /// to the filesystem path as a subdirectory.
    pub container: Option<String>,
    /// When set, wraps the final driver with a local read cache rooted at this path.
    pub cache_path: Option<PathBuf>,
    /// When set, `write` is rejected with `Error::ReadOnly`.
    pub read_only: bool,
    /// When set, wraps the final driver with a stopwatch-logging decorator.
    pub trace: bool,
    /// When set, uses a single-blob driver against this blob name instead of the
    /// container-sharded multi-blob driver.
    pub mono_blob: Option<String>,
    /// When set, the multi-blob driver reports its compaction counter through this registry.
    pub metrics: Option<Arc<StratumMetrics>>,
}

const AZURE_CONNECTION_PREFIXES: [&str; 2] = ["DefaultEndpointsProtocol", "BlobEndpoint"];

/// True iff `connection` looks like an Azure Storage connection string rather than a
/// filesystem path.
pub fn is_cloud_connection_string(connection: &str) -> bool {
    AZURE_CONNECTION_PREFIXES
        .iter()
        .any(|prefix| connection.starts_with(prefix))
}

/// Splits an optional `;Container=NAME` suffix off a connection string, returning the
/// remaining connection string and the container name if present.
pub fn split_container_suffix(connection: &str) -> (&str, Option<&str>) {
    const MARKER: &str = ";Container=";
    match connection.find(MARKER) {
        Some(idx) => (&connection[..idx], Some(&connection[idx + MARKER.len()..])),
        None => (connection, None),
    }
}

/// Builds the final, fully-decorated driver for `config`, per §6's option table: pick the
/// base driver (multi-blob / mono-blob / file) from the connection string, then layer
/// read-cache, read-only, and trace in that order.
pub async fn build_driver(config: &StorageConfig) -> Result<Arc<dyn Driver>> {
    let (base_connection, inline_container) = split_container_suffix(&config.connection);
    let container = config
        .container
        .clone()
        .or_else(|| inline_container.map(str::to_owned));

    let mut driver: Arc<dyn Driver> = if is_cloud_connection_string(base_connection) {
        build_cloud_driver(
            base_connection,
            container.as_deref(),
            config.mono_blob.as_deref(),
            config.metrics.clone(),
        )
        .await?
    } else {
        build_file_driver(base_connection, container.as_deref()).await?
    };

    if let Some(cache_path) = &config.cache_path {
        let cache_driver = file::FileDriver::open(cache_path.join("cache")).await?;
        driver = Arc::new(cache::ReadCacheDriver::new(driver, cache_driver));
    }
    if config.read_only {
        driver = Arc::new(ReadOnlyDriver(driver));
    }
    if config.trace {
        driver = Arc::new(trace::TracingDriver::new(driver));
    }
    Ok(driver)
}

#[cfg(feature = "azure-blob")]
async fn build_cloud_driver(
    connection: &str,
    container: Option<&str>,
    mono_blob: Option<&str>,
    metrics: Option<Arc<StratumMetrics>>,
) -> Result<Arc<dyn Driver>> {
    let container_name = container.unwrap_or("$root");
    let backend = Arc::new(blob_backend::AzureBlobBackend::from_connection_string(
        connection,
        container_name,
    )?);
    if let Some(name) = mono_blob {
        Ok(Arc::new(mono_blob::MonoBlobDriver::new(backend, name.to_owned())))
    } else {
        Ok(Arc::new(multi_blob::MultiBlobDriver::with_metrics(backend, metrics)))
    }
}

#[cfg(not(feature = "azure-blob"))]
async fn build_cloud_driver(
    _connection: &str,
    _container: Option<&str>,
    _mono_blob: Option<&str>,
    _metrics: Option<Arc<StratumMetrics>>,
) -> Result<Arc<dyn Driver>> {
    Err(Error::InvalidConfig(
        "connection string names an Azure Storage account but the azure-blob feature is disabled"
            .into(),
    ))
}

async fn build_file_driver(path: &str, container: Option<&str>) -> Result<Arc<dyn Driver>> {
    let mut dir = PathBuf::from(path);
    if let Some(container) = container {
        dir.push(container);
    }
    Ok(Arc::new(file::FileDriver::open(dir).await?))
}

/// Decorator rejecting every `write` with `Error::ReadOnly`; everything else delegates.
struct ReadOnlyDriver(Arc<dyn Driver>);

#[async_trait]
impl Driver for ReadOnlyDriver {
    async fn get_position(&self) -> Result<i64> {
        self.0.get_position().await
    }

    async fn write(&self, _position: i64, _events: &[RawEvent]) -> Result<WriteOutcome> {
        Err(Error::ReadOnly)
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        self.0.read(position, max_len).await
    }

    async fn get_last_key(&self) -> Result<u32> {
        self.0.get_last_key().await
    }

    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64> {
        self.0.seek(key, floor_position).await
    }
}
