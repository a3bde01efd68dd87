// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! Prometheus metrics for stratumdb.
//!
//! Attached at construction of the stream wrapper and service facade (not the driver layer
//! itself), the same way the teacher crate's `Writer`/`Reader` take an optional metrics handle —
//! callers that don't want metrics simply never construct a `Registry`.
//!
//! # Metrics
//! - `stratumdb_append_duration_seconds`: histogram of append-with-builder latency.
//! - `stratumdb_bytes_written_total`: counter of bytes written to the driver.
//! - `stratumdb_events_read_total`: counter of events read back out of the stream.
//! - `stratumdb_catchup_lag`: gauge of events applied since the last upkeep opportunity.
//! - `stratumdb_quarantined_total`: counter of events pushed to the quarantine bag.
//! - `stratumdb_compactions_total`: counter of multi-blob compactions completed.

use prometheus::{Gauge, Histogram, IntCounter, Registry};

#[derive(Debug, Clone)]
pub struct StratumMetrics {
    pub append_latency: Histogram,
    pub bytes_written: IntCounter,
    pub events_read: IntCounter,
    pub catchup_lag: Gauge,
    pub quarantined_total: IntCounter,
    pub compactions_total: IntCounter,
}

impl StratumMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let append_latency = Histogram::with_opts(prometheus::HistogramOpts::new(
            "stratumdb_append_duration_seconds",
            "Duration of append-with-builder calls",
        ))?;
        let bytes_written = IntCounter::new(
            "stratumdb_bytes_written_total",
            "Total bytes written to the storage driver",
        )?;
        let events_read = IntCounter::new(
            "stratumdb_events_read_total",
            "Total number of events read back from the stream",
        )?;
        let catchup_lag = Gauge::new(
            "stratumdb_catchup_lag",
            "Events applied since the last upkeep opportunity",
        )?;
        let quarantined_total = IntCounter::new(
            "stratumdb_quarantined_total",
            "Total number of events pushed to the quarantine bag",
        )?;
        let compactions_total = IntCounter::new(
            "stratumdb_compactions_total",
            "Total number of multi-blob compactions completed",
        )?;

        registry.register(Box::new(append_latency.clone()))?;
        registry.register(Box::new(bytes_written.clone()))?;
        registry.register(Box::new(events_read.clone()))?;
        registry.register(Box::new(catchup_lag.clone()))?;
        registry.register(Box::new(quarantined_total.clone()))?;
        registry.register(Box::new(compactions_total.clone()))?;

        Ok(Self {
            append_latency,
            bytes_written,
            events_read,
            catchup_lag,
            quarantined_total,
            compactions_total,
        })
    }
}
