// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The multi-blob driver (§4.3): shards the logical stream across capped append blobs, and
//! transparently compacts full shards into a single block blob in the background.
//!
//! Simplification recorded in DESIGN.md: once shards `0..=M` have been absorbed by a
//! compaction, this driver folds them into one logical `Shard` spanning the whole compacted
//! blob rather than keeping `M+1` separate entries whose `data_name` happens to coincide. The
//! bytes on the wire are identical either way; the only visible effect is that `seek`'s
//! granularity coarsens to "before or after the compaction boundary" for already-compacted
//! shards, which §9's open question on `seek` ambiguity already allows.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec::{self, RawEvent};
use crate::constants::{
    COMPACTION_SLAB_SIZE, COMPACT_SUFFIX, FIRST_KEY_METADATA, MAX_EVENT_FOOTPRINT,
    SHARD_NAME_PREFIX, SLICE_SIZE,
};
use crate::error::{Error, Result};
use crate::metrics::StratumMetrics;
use crate::retry::{with_retry, CancelToken};
use crate::storage::blob_backend::{BlobBackend, BlobOpError};
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

#[derive(Debug, Clone)]
struct Shard {
    append_name: String,
    data_name: String,
    data_offset: u64,
    byte_length: u64,
    first_key: Option<u32>,
    /// Set once this shard's bytes have been absorbed into a compacted block blob.
    compacted: bool,
}

fn shard_name(index: u32) -> String {
    format!("{SHARD_NAME_PREFIX}{index:05}")
}

fn compact_name(index: u32) -> String {
    format!("{SHARD_NAME_PREFIX}{index:05}{COMPACT_SUFFIX}")
}

fn parse_shard_index(name: &str) -> Option<(u32, bool)> {
    let rest = name.strip_prefix(SHARD_NAME_PREFIX)?;
    if let Some(digits) = rest.strip_suffix(COMPACT_SUFFIX) {
        Some((digits.parse().ok()?, true))
    } else {
        Some((rest.parse().ok()?, false))
    }
}

fn first_positions(shards: &[Shard]) -> Vec<u64> {
    let mut positions = Vec::with_capacity(shards.len());
    let mut acc = 0u64;
    for shard in shards {
        positions.push(acc);
        acc += shard.byte_length;
    }
    positions
}

fn random_block_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct Inner {
    backend: Arc<dyn BlobBackend>,
    shards: Mutex<Vec<Shard>>,
    cancel: CancelToken,
    compacting: Mutex<Option<JoinHandle<()>>>,
    metrics: Option<Arc<StratumMetrics>>,
}

impl Inner {
    async fn refresh_cache(&self) -> Result<()> {
        let listing = with_retry(&self.cancel, true, || self.backend.list(SHARD_NAME_PREFIX)).await?;

        let mut appends = Vec::new();
        let mut max_compact: Option<(u32, u64)> = None;
        for blob in &listing {
            let Some((index, is_compact)) = parse_shard_index(&blob.name) else {
                continue;
            };
            if is_compact {
                if max_compact.map(|(m, _)| index > m).unwrap_or(true) {
                    max_compact = Some((index, blob.length));
                }
            } else {
                appends.push((index, blob.length));
            }
        }
        appends.sort_by_key(|(index, _)| *index);

        let mut shards = Vec::new();
        if let Some((max_index, compact_length)) = max_compact {
            let first_key = self.fetch_first_key(&compact_name(max_index), 0).await?;
            shards.push(Shard {
                append_name: shard_name(0),
                data_name: compact_name(max_index),
                data_offset: 0,
                byte_length: compact_length,
                first_key,
                compacted: true,
            });
            for (index, length) in appends.into_iter().filter(|(i, _)| *i > max_index) {
                let name = shard_name(index);
                let first_key = self.fetch_first_key(&name, 0).await?;
                shards.push(Shard {
                    append_name: name.clone(),
                    data_name: name,
                    data_offset: 0,
                    byte_length: length,
                    first_key,
                    compacted: false,
                });
            }
        } else {
            for (index, length) in appends {
                let name = shard_name(index);
                let first_key = self.fetch_first_key(&name, 0).await?;
                shards.push(Shard {
                    append_name: name.clone(),
                    data_name: name,
                    data_offset: 0,
                    byte_length: length,
                    first_key,
                    compacted: false,
                });
            }
        }

        *self.shards.lock().await = shards;
        Ok(())
    }

    /// Reads the first 6 bytes (size + key) of a non-empty shard to discover its first
    /// sequence, persisting the result to the append blob's `FirstKey` metadata for reuse.
    /// Permission errors on the metadata write are tolerated, per §4.3.
    async fn fetch_first_key(&self, data_name: &str, data_offset: u64) -> Result<Option<u32>> {
        if let Ok(Some(cached)) = self.backend.get_metadata(data_name, FIRST_KEY_METADATA).await {
            if let Ok(key) = cached.parse::<u32>() {
                return Ok(Some(key));
            }
        }
        let head =
            with_retry(&self.cancel, true, || self.backend.read_range(data_name, data_offset, 6))
                .await?;
        if head.len() < 6 {
            return Ok(None);
        }
        let key = u32::from_le_bytes([head[2], head[3], head[4], head[5]]);
        let _ = self
            .backend
            .set_metadata(data_name, FIRST_KEY_METADATA, &key.to_string())
            .await;
        Ok(Some(key))
    }

    async fn last_known_position(&self) -> u64 {
        self.shards.lock().await.iter().map(|s| s.byte_length).sum()
    }

    async fn append_payload(&self, position: u64, payload: &[u8]) -> Result<WriteOutcome> {
        loop {
            let (tail_index, tail_name, tail_len) = {
                let shards = self.shards.lock().await;
                let last = shards.last().expect("shard must exist after creation");
                (shards.len() - 1, last.append_name.clone(), last.byte_length)
            };
            match self.backend.append(&tail_name, payload, tail_len).await {
                Ok(()) => {
                    let mut shards = self.shards.lock().await;
                    shards[tail_index].byte_length += payload.len() as u64;
                    let new_position = position + payload.len() as u64;
                    return Ok(WriteOutcome {
                        next_position: new_position as i64,
                        success: true,
                    });
                }
                Err(BlobOpError::Collision { .. }) => {
                    self.refresh_cache().await?;
                    let refreshed = self.last_known_position().await;
                    return Ok(WriteOutcome {
                        next_position: refreshed as i64,
                        success: false,
                    });
                }
                Err(BlobOpError::MaxReached) => {
                    let Some((current_index, _)) = parse_shard_index(&tail_name) else {
                        return Err(Error::InvalidConfig(format!(
                            "unparseable shard name {tail_name}"
                        )));
                    };
                    let next_index = current_index + 1;
                    self.backend
                        .create_append_blob_if_not_exists(&shard_name(next_index))
                        .await?;
                    self.refresh_cache().await?;
                    continue;
                }
                Err(BlobOpError::Other(e)) => return Err(e),
            }
        }
    }

    async fn read_sliced(&self, data_name: &str, start: u64, size: u64) -> Result<Bytes> {
        if size < (2 * SLICE_SIZE) as u64 {
            return with_retry(&self.cancel, false, || {
                self.backend.read_range(data_name, start, size)
            })
            .await;
        }

        let full_slices = size as usize / SLICE_SIZE;
        let parallel_slices = full_slices - 1; // the last full slice is fetched with the tail below
        let mut handles = Vec::with_capacity(parallel_slices);
        for i in 0..parallel_slices {
            let backend = Arc::clone(&self.backend);
            let name = data_name.to_owned();
            let offset = start + (i * SLICE_SIZE) as u64;
            handles.push(tokio::spawn(async move {
                backend.read_range(&name, offset, SLICE_SIZE as u64).await
            }));
        }

        let tail_offset = start + (parallel_slices * SLICE_SIZE) as u64;
        let tail_size = size - (parallel_slices * SLICE_SIZE) as u64;
        let tail_fut = self.backend.read_range(data_name, tail_offset, tail_size);

        let mut parts = Vec::with_capacity(parallel_slices + 1);
        for handle in handles {
            let chunk = handle
                .await
                .map_err(|e| Error::InvalidConfig(format!("slice task join error: {e}")))??;
            if chunk.len() != SLICE_SIZE {
                return Err(Error::Corruption(format!(
                    "short slice read: expected {SLICE_SIZE}, got {}",
                    chunk.len()
                )));
            }
            parts.push(chunk);
        }
        parts.push(tail_fut.await?);

        let mut out = BytesMut::with_capacity(size as usize);
        for part in parts {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }

    async fn run_compaction(&self) -> Result<()> {
        let shards = self.shards.lock().await.clone();
        if shards.len() < 2 {
            return Ok(());
        }
        // Never touch the current tail shard: it may still be receiving appends.
        let snapshot = &shards[..shards.len() - 1];
        let absorb: Vec<&Shard> = snapshot.iter().filter(|s| !s.compacted).collect();
        if absorb.is_empty() {
            return Ok(());
        }
        let Some((last_index, _)) = parse_shard_index(&absorb.last().unwrap().append_name) else {
            return Ok(());
        };
        let target = compact_name(last_index);

        let mut block_ids = Vec::new();
        for shard in snapshot {
            let mut remaining = shard.byte_length;
            let mut offset = shard.data_offset;
            while remaining > 0 {
                let slab_len = remaining.min(COMPACTION_SLAB_SIZE as u64);
                let data = self.backend.read_range(&shard.data_name, offset, slab_len).await?;
                let block_id = random_block_id();
                self.backend.stage_block(&target, &block_id, &data).await?;
                block_ids.push(block_id);
                offset += slab_len;
                remaining -= slab_len;
            }
        }
        self.backend.commit_block_list(&target, &block_ids).await?;
        self.refresh_cache().await?;
        if let Some(metrics) = &self.metrics {
            metrics.compactions_total.inc();
        }
        Ok(())
    }
}

/// Cheap to clone: shares the shard cache and in-flight compaction handle with every clone.
#[derive(Clone)]
pub struct MultiBlobDriver(Arc<Inner>);

impl MultiBlobDriver {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self::with_metrics(backend, None)
    }

    pub fn with_metrics(backend: Arc<dyn BlobBackend>, metrics: Option<Arc<StratumMetrics>>) -> Self {
        Self(Arc::new(Inner {
            backend,
            shards: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            compacting: Mutex::new(None),
            metrics,
        }))
    }

    /// Spawns a background compaction pass if more than one non-compacted shard exists and no
    /// compaction is already running. At-most-one concurrent instance is tracked via the
    /// stored `JoinHandle`.
    fn maybe_trigger_compaction(&self) {
        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            let mut guard = inner.compacting.lock().await;
            if let Some(handle) = guard.as_ref() {
                if !handle.is_finished() {
                    return;
                }
            }
            let shards = inner.shards.lock().await.clone();
            if shards.iter().filter(|s| !s.compacted).count() <= 1 {
                return;
            }
            let worker = Arc::clone(&inner);
            *guard = Some(tokio::spawn(async move {
                let _ = worker.run_compaction().await;
            }));
        });
    }

    #[cfg(test)]
    async fn run_compaction_sync(&self) -> Result<()> {
        self.0.run_compaction().await
    }

    #[cfg(test)]
    async fn list_for_test(&self, prefix: &str) -> Result<Vec<crate::storage::blob_backend::BlobMeta>> {
        self.0.backend.list(prefix).await
    }
}

#[async_trait]
impl Driver for MultiBlobDriver {
    async fn get_position(&self) -> Result<i64> {
        self.0.refresh_cache().await?;
        Ok(self.0.last_known_position().await as i64)
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let position = position as u64;
        let mut last_known = self.0.last_known_position().await;
        if position > last_known {
            self.0.refresh_cache().await?;
            last_known = self.0.last_known_position().await;
        }
        if position != last_known {
            return Ok(WriteOutcome {
                next_position: last_known as i64,
                success: false,
            });
        }

        let is_empty = self.0.shards.lock().await.is_empty();
        if is_empty {
            self.0
                .backend
                .create_append_blob_if_not_exists(&shard_name(0))
                .await?;
            self.0.refresh_cache().await?;
        }

        let mut payload = Vec::new();
        for event in events {
            codec::write(&mut payload, event)?;
        }
        if payload.is_empty() {
            self.0.refresh_cache().await?;
            let refreshed = self.0.last_known_position().await;
            return Ok(WriteOutcome {
                next_position: refreshed as i64,
                success: refreshed == position,
            });
        }

        let outcome = self.0.append_payload(position, &payload).await?;
        self.maybe_trigger_compaction();
        Ok(outcome)
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let position = position as u64;
        let shards = self.0.shards.lock().await.clone();
        let positions = first_positions(&shards);
        let last_known: u64 = shards.iter().map(|s| s.byte_length).sum();
        if shards.is_empty() || position >= last_known {
            return Ok(ReadOutcome {
                next_position: position as i64,
                events: Vec::new(),
            });
        }

        let shard_idx = match positions.binary_search(&position) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let shard = &shards[shard_idx];
        let offset_in_shard = position - positions[shard_idx];
        let available = shard.byte_length - offset_in_shard;
        let size = (max_len as u64).min(available);
        if size == 0 {
            return Ok(ReadOutcome {
                next_position: position as i64,
                events: Vec::new(),
            });
        }

        let start_in_blob = shard.data_offset + offset_in_shard;
        let buf = self.0.read_sliced(&shard.data_name, start_in_blob, size).await?;

        let mut events = Vec::new();
        let mut consumed = 0usize;
        loop {
            let window = buf.slice(consumed..);
            match codec::try_parse(&window)? {
                Some((event, n)) => {
                    events.push(event);
                    consumed += n;
                }
                None => break,
            }
        }
        Ok(ReadOutcome {
            next_position: (position + consumed as u64) as i64,
            events,
        })
    }

    async fn get_last_key(&self) -> Result<u32> {
        let shards = self.0.shards.lock().await.clone();
        let Some(last) = shards.last() else {
            return Ok(0);
        };
        if last.byte_length == 0 {
            return Ok(0);
        }
        let tail_len = last.byte_length.min(MAX_EVENT_FOOTPRINT as u64);
        let tail_offset = last.data_offset + last.byte_length - tail_len;
        let tail = with_retry(&self.0.cancel, true, || {
            self.0.backend.read_range(&last.data_name, tail_offset, tail_len)
        })
        .await?;
        codec::last_sequence_from_tail(&tail)
    }

    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64> {
        let shards = self.0.shards.lock().await.clone();
        let positions = first_positions(&shards);
        if shards.is_empty() {
            return Ok(floor_position);
        }
        for i in 0..shards.len() - 1 {
            if let Some(next_first_key) = shards[i + 1].first_key {
                if next_first_key > key {
                    return Ok((positions[i] as i64).max(floor_position));
                }
            }
        }
        Ok((*positions.last().unwrap() as i64).max(floor_position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blob_backend::fake::FakeBlobBackend;

    fn event(sequence: u32, words: u16) -> RawEvent {
        let payload = vec![0xAB; words as usize * 8];
        RawEvent::new(sequence, payload).unwrap()
    }

    fn driver(cap: u32) -> MultiBlobDriver {
        MultiBlobDriver::new(Arc::new(FakeBlobBackend::new(cap)))
    }

    #[tokio::test]
    async fn s1_empty_stream() {
        let d = driver(50_000);
        assert_eq!(d.get_position().await.unwrap(), 0);
        assert_eq!(d.get_last_key().await.unwrap(), 0);
        let read = d.read(0, 4096).await.unwrap();
        assert_eq!(read.next_position, 0);
        assert!(read.events.is_empty());
    }

    #[tokio::test]
    async fn s2_single_event_round_trip() {
        let d = driver(50_000);
        let e = RawEvent::new(1, (0..8u8).collect::<Vec<_>>()).unwrap();
        let outcome = d.write(0, &[e.clone()]).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.next_position, 20);

        let read = d.read(0, 4096).await.unwrap();
        assert_eq!(read.next_position, 20);
        assert_eq!(read.events, vec![e]);
    }

    #[tokio::test]
    async fn s3_optimistic_collision_then_retry() {
        let d = driver(50_000);
        let a = event(1, 1);
        let outcome_a = d.write(0, std::slice::from_ref(&a)).await.unwrap();
        assert!(outcome_a.success);

        let b = event(2, 1);
        let outcome_b = d.write(0, std::slice::from_ref(&b)).await.unwrap();
        assert!(!outcome_b.success);
        assert_eq!(outcome_b.next_position, outcome_a.next_position);

        let retry = d
            .write(outcome_b.next_position, std::slice::from_ref(&b))
            .await
            .unwrap();
        assert!(retry.success);
    }

    #[tokio::test]
    async fn s4_shard_rollover() {
        let cap = 3;
        let d = driver(cap);
        let events: Vec<RawEvent> = (1..=(cap + 1)).map(|i| event(i, 1)).collect();
        let mut position = 0i64;
        for e in &events {
            let outcome = d.write(position, std::slice::from_ref(e)).await.unwrap();
            assert!(outcome.success, "append {} should succeed", e.sequence);
            position = outcome.next_position;
        }

        let listing = d.list_for_test("events.").await.unwrap();
        let names: Vec<_> = listing.iter().map(|b| b.name.as_str()).collect();
        assert!(names.contains(&"events.00000"));
        assert!(names.contains(&"events.00001"));

        let read = d.read(0, 1 << 20).await.unwrap();
        assert_eq!(read.events.len(), events.len());
        assert_eq!(
            read.events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            events.iter().map(|e| e.sequence).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn seek_returns_safe_lower_bound() {
        let d = driver(2);
        for i in 1..=5u32 {
            let e = event(i * 10, 1);
            let position = d.get_position().await.unwrap();
            d.write(position, &[e]).await.unwrap();
        }
        let found = d.seek(25, 0).await.unwrap();
        assert!(found >= 0);
        let read = d.read(found, 1 << 20).await.unwrap();
        assert!(read.events.iter().any(|e| e.sequence == 30) || found == 0);
    }

    #[tokio::test]
    async fn compaction_preserves_logical_stream() {
        let d = driver(2);
        let mut position = 0i64;
        for i in 1..=6u32 {
            let e = event(i, 1);
            let outcome = d.write(position, &[e]).await.unwrap();
            position = outcome.next_position;
        }
        d.run_compaction_sync().await.unwrap();

        let read = d.read(0, 1 << 20).await.unwrap();
        assert_eq!(
            read.events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            (1..=6).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn compaction_increments_the_compactions_counter() {
        let registry = prometheus::Registry::new();
        let metrics = Arc::new(StratumMetrics::new(&registry).unwrap());
        let d = MultiBlobDriver::with_metrics(
            Arc::new(FakeBlobBackend::new(2)),
            Some(Arc::clone(&metrics)),
        );
        let mut position = 0i64;
        for i in 1..=6u32 {
            let e = event(i, 1);
            let outcome = d.write(position, &[e]).await.unwrap();
            position = outcome.next_position;
        }
        assert_eq!(metrics.compactions_total.get(), 0);
        d.run_compaction_sync().await.unwrap();
        assert_eq!(metrics.compactions_total.get(), 1);
    }
}
