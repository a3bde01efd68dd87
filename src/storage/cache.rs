// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The read-cache decorator (§4.6): mirrors the prefix of the stream that has already been
//! durably written into a local `FileDriver`, so repeated catch-up reads (e.g. a freshly
//! started projection group replaying from zero) do not round-trip to the remote backend.
//! Writes always go to the inner driver first; the local mirror is grown best-effort and is
//! never consulted or required for correctness — a cache miss or a cache write failure simply
//! falls through to `inner`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::RawEvent;
use crate::error::Result;
use crate::storage::file::FileDriver;
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

pub struct ReadCacheDriver {
    inner: Arc<dyn Driver>,
    cache: FileDriver,
}

impl ReadCacheDriver {
    pub fn new(inner: Arc<dyn Driver>, cache: FileDriver) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Driver for ReadCacheDriver {
    async fn get_position(&self) -> Result<i64> {
        self.inner.get_position().await
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let outcome = self.inner.write(position, events).await?;
        if outcome.success {
            if let Ok(cache_position) = self.cache.get_position().await {
                if cache_position == position {
                    let _ = self.cache.write(position, events).await;
                }
            }
        }
        Ok(outcome)
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let cache_position = self.cache.get_position().await.unwrap_or(0);
        if position < cache_position {
            if let Ok(outcome) = self.cache.read(position, max_len).await {
                if !outcome.events.is_empty() {
                    return Ok(outcome);
                }
            }
        }

        let outcome = self.inner.read(position, max_len).await?;
        if position == cache_position && !outcome.events.is_empty() {
            let _ = self.cache.write(position, &outcome.events).await;
        }
        Ok(outcome)
    }

    async fn get_last_key(&self) -> Result<u32> {
        self.inner.get_last_key().await
    }

    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64> {
        self.inner.seek(key, floor_position).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;

    fn event(sequence: u32) -> RawEvent {
        RawEvent::new(sequence, vec![0u8; 8]).unwrap()
    }

    async fn cache_driver() -> (Arc<MemoryDriver>, ReadCacheDriver) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDriver::open(dir.path()).await.unwrap();
        let inner = Arc::new(MemoryDriver::new());
        let d = ReadCacheDriver::new(inner.clone(), cache);
        (inner, d)
    }

    #[tokio::test]
    async fn write_populates_cache_and_read_serves_from_it() {
        let (_inner, d) = cache_driver().await;
        d.write(0, &[event(1), event(2)]).await.unwrap();

        let first = d.read(0, 4096).await.unwrap();
        assert_eq!(first.events, vec![event(1), event(2)]);

        // Second read of the same prefix should still be correct even though it now
        // comes back out of the local mirror instead of the inner driver.
        let second = d.read(0, 4096).await.unwrap();
        assert_eq!(second.events, first.events);
    }

    #[tokio::test]
    async fn falls_through_when_cache_is_behind() {
        let (inner, d) = cache_driver().await;
        // Write directly to the inner driver, bypassing the cache mirror entirely.
        inner.write(0, &[event(1)]).await.unwrap();

        let read = d.read(0, 4096).await.unwrap();
        assert_eq!(read.events, vec![event(1)]);
    }
}
