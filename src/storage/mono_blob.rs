// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The mono-blob driver (§4.4): a single append blob, same codec and write/read protocol as
//! one multi-blob shard, minus sharding and compaction. Capacity exhaustion surfaces as a
//! distinct fatal `Error::MonoBlobFull` rather than being absorbed internally, per §9's open
//! question on mono-blob "full" surfacing — callers must not treat it the same as an
//! optimistic conflict.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::{self, RawEvent};
use crate::constants::MAX_EVENT_FOOTPRINT;
use crate::error::{Error, Result};
use crate::retry::{with_retry, CancelToken};
use crate::storage::blob_backend::{BlobBackend, BlobOpError};
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

pub struct MonoBlobDriver {
    backend: Arc<dyn BlobBackend>,
    name: String,
    cancel: CancelToken,
}

impl MonoBlobDriver {
    pub fn new(backend: Arc<dyn BlobBackend>, name: String) -> Self {
        Self {
            backend,
            name,
            cancel: CancelToken::new(),
        }
    }

    async fn ensure_exists(&self) -> Result<()> {
        self.backend.create_append_blob_if_not_exists(&self.name).await
    }
}

#[async_trait]
impl Driver for MonoBlobDriver {
    async fn get_position(&self) -> Result<i64> {
        self.ensure_exists().await?;
        let len = with_retry(&self.cancel, true, || self.backend.blob_length(&self.name)).await?;
        Ok(len as i64)
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        self.ensure_exists().await?;
        let mut payload = Vec::new();
        for event in events {
            codec::write(&mut payload, event)?;
        }
        if payload.is_empty() {
            let len = with_retry(&self.cancel, true, || self.backend.blob_length(&self.name)).await?;
            return Ok(WriteOutcome {
                next_position: len as i64,
                success: len as i64 == position,
            });
        }

        match self.backend.append(&self.name, &payload, position as u64).await {
            Ok(()) => Ok(WriteOutcome {
                next_position: position + payload.len() as i64,
                success: true,
            }),
            Err(BlobOpError::Collision { current_length }) => Ok(WriteOutcome {
                next_position: current_length as i64,
                success: false,
            }),
            Err(BlobOpError::MaxReached) => Err(Error::MonoBlobFull(position as u32)),
            Err(BlobOpError::Other(e)) => Err(e),
        }
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let len = with_retry(&self.cancel, true, || self.backend.blob_length(&self.name)).await?;
        if position as u64 >= len {
            return Ok(ReadOutcome {
                next_position: position,
                events: Vec::new(),
            });
        }
        let size = (max_len as u64).min(len - position as u64);
        let buf = with_retry(&self.cancel, false, || {
            self.backend.read_range(&self.name, position as u64, size)
        })
        .await?;

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
            next_position: position + consumed as i64,
            events,
        })
    }

    async fn get_last_key(&self) -> Result<u32> {
        let len = with_retry(&self.cancel, true, || self.backend.blob_length(&self.name)).await?;
        if len == 0 {
            return Ok(0);
        }
        let tail_len = len.min(MAX_EVENT_FOOTPRINT as u64);
        let tail = with_retry(&self.cancel, true, || {
            self.backend.read_range(&self.name, len - tail_len, tail_len)
        })
        .await?;
        codec::last_sequence_from_tail(&tail)
    }

    async fn seek(&self, _key: u32, floor_position: i64) -> Result<i64> {
        // No per-shard index to consult; the floor is the only legal answer.
        Ok(floor_position)
    }
}
