// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! A stopwatch-logging decorator (§3 supplement): wraps any driver and emits a `debug` span per
//! call with elapsed time and outcome, purely for operational visibility. Transparent when the
//! `log_debug` feature is off — the wrapping still happens but no logging calls are compiled in.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::codec::RawEvent;
use crate::error::Result;
use crate::storage::{Driver, ReadOutcome, WriteOutcome};

pub struct TracingDriver(Arc<dyn Driver>);

impl TracingDriver {
    pub fn new(inner: Arc<dyn Driver>) -> Self {
        Self(inner)
    }
}

#[async_trait]
impl Driver for TracingDriver {
    async fn get_position(&self) -> Result<i64> {
        let start = Instant::now();
        let result = self.0.get_position().await;
        #[cfg(feature = "log_debug")]
        crate::log::macros::debug!(elapsed = ?start.elapsed(), result = ?result, "get_position");
        #[cfg(not(feature = "log_debug"))]
        let _ = start;
        result
    }

    async fn write(&self, position: i64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let start = Instant::now();
        let result = self.0.write(position, events).await;
        #[cfg(feature = "log_debug")]
        crate::log::macros::debug!(
            position,
            count = events.len(),
            elapsed = ?start.elapsed(),
            success = ?result.as_ref().map(|o| o.success),
            "write"
        );
        #[cfg(not(feature = "log_debug"))]
        let _ = start;
        result
    }

    async fn read(&self, position: i64, max_len: usize) -> Result<ReadOutcome> {
        let start = Instant::now();
        let result = self.0.read(position, max_len).await;
        #[cfg(feature = "log_debug")]
        crate::log::macros::debug!(
            position,
            max_len,
            elapsed = ?start.elapsed(),
            events = ?result.as_ref().map(|o| o.events.len()),
            "read"
        );
        #[cfg(not(feature = "log_debug"))]
        let _ = start;
        result
    }

    async fn get_last_key(&self) -> Result<u32> {
        self.0.get_last_key().await
    }

    async fn seek(&self, key: u32, floor_position: i64) -> Result<i64> {
        self.0.seek(key, floor_position).await
    }
}
