// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The memory driver (§4.5): an in-process `Vec<RawEvent>`. Position is the event *index*,
//! not a byte offset, which is the one place this driver's contract deviates visibly from the
//! others — callers must not assume positions are comparable across driver kinds. Used for
//! tests and embedded/ephemeral use.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::codec::RawEvent;
use crate::error::Result;
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

#[derive(Default)]
pub struct MemoryDriver {
    events: Mutex<Vec<RawEvent>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn get_position(&self) -> Result<i64> {
        Ok(self.events.lock().await.len() as i64)
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let mut store = self.events.lock().await;
        let len = store.len() as i64;
        if position != len {
            return Ok(WriteOutcome {
                next_position: len,
                success: false,
            });
        }
        store.extend_from_slice(events);
        Ok(WriteOutcome {
            next_position: store.len() as i64,
            success: true,
        })
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let store = self.events.lock().await;
        let start = position as usize;
        if start >= store.len() {
            return Ok(ReadOutcome {
                next_position: position,
                events: Vec::new(),
            });
        }

        let mut out = Vec::new();
        let mut budget = max_len;
        for event in &store[start..] {
            let size = event.encoded_len();
            if !out.is_empty() && size > budget {
                break;
            }
            out.push(event.clone());
            budget = budget.saturating_sub(size);
        }
        Ok(ReadOutcome {
            next_position: position + out.len() as i64,
            events: out,
        })
    }

    async fn get_last_key(&self) -> Result<u32> {
        Ok(self.events.lock().await.last().map(|e| e.sequence).unwrap_or(0))
    }

    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64> {
        let store = self.events.lock().await;
        let index = store.partition_point(|e| e.sequence < key);
        Ok((index as i64).max(floor_position))
    }
}
