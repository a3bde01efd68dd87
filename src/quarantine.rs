// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The quarantine bag: a thread-safe, append-only collection of events a projection could not
//! apply (deserialization failure or a faulting `apply`). The spec calls this "trivial"; the
//! one addition here is a bounded capacity so a persistently bad producer cannot grow this
//! without limit in a long-lived process — oldest entries are dropped past the cap.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;

use crate::constants::DEFAULT_QUARANTINE_CAPACITY;

/// One event that could not be applied, plus enough context to diagnose it later.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub sequence: u32,
    /// The raw payload, when available (absent for a pure deserialization failure where the
    /// payload was consumed before the error surfaced).
    pub payload: Option<Bytes>,
    pub error: String,
}

/// A bounded-capacity ring of `QuarantineEntry`. Cheap to clone (shares the underlying lock).
#[derive(Clone)]
pub struct QuarantineBag {
    inner: std::sync::Arc<Mutex<VecDeque<QuarantineEntry>>>,
    capacity: usize,
}

impl Default for QuarantineBag {
    fn default() -> Self {
        Self::new(DEFAULT_QUARANTINE_CAPACITY)
    }
}

impl QuarantineBag {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Appends an entry, dropping the oldest one first if at capacity.
    pub fn push(&self, entry: QuarantineEntry) {
        let mut guard = self.inner.lock().expect("quarantine lock poisoned");
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("quarantine lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A point-in-time copy of everything currently quarantined, oldest first.
    pub fn snapshot(&self) -> Vec<QuarantineEntry> {
        self.inner
            .lock()
            .expect("quarantine lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}
