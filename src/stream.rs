// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The event stream (§4.7): a typed decoder over a [`Driver`], with a one-at-a-time background
//! prefetch. Owned exclusively by one [`crate::wrapper::StreamWrapper`]; not re-entrant.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::codec::RawEvent;
use crate::constants::{MAX_EVENT_FOOTPRINT, SLICE_SIZE};
use crate::error::{Error, Result};
use crate::storage::Driver;

/// A spawned `read` in flight, paired with the position it was launched from. Calling
/// [`FetchHandle::commit`] is the language-neutral stand-in for "calling the closure" in §4.7:
/// it is the only way to fold the fetch's result back into the owning stream's state.
pub struct FetchHandle {
    from_position: i64,
    task: JoinHandle<Result<(i64, Vec<RawEvent>)>>,
}

impl FetchHandle {
    /// Folds the fetch result into `stream`. Returns `true` if events were appended to `ready`,
    /// `false` if the fetch found nothing (end-of-stream as of the time it was launched).
    pub async fn commit(self, stream: &mut EventStream) -> Result<bool> {
        let (next_position, events) = match self.task.await {
            Ok(result) => result?,
            Err(join_err) => {
                return Err(Error::Io(std::io::Error::other(join_err.to_string())));
            }
        };
        if stream.position != self.from_position {
            // The owner mutated the stream (e.g. reset) while this fetch was in flight; the
            // result is stale and must be dropped rather than applied out of order.
            return Ok(false);
        }
        if events.is_empty() {
            return Ok(false);
        }
        stream.position = next_position;
        stream.ready.extend(events);
        Ok(true)
    }
}

pub struct EventStream {
    driver: Arc<dyn Driver>,
    position: i64,
    sequence: u32,
    ready: VecDeque<RawEvent>,
    read_window: usize,
}

impl EventStream {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            position: 0,
            sequence: 0,
            ready: VecDeque::new(),
            // Must cover at least one maximally-sized record, or a read landing exactly on one
            // yields zero events and the stream stalls before it forever (it looks identical to
            // end-of-stream to `background_fetch`/`discard_up_to`).
            read_window: MAX_EVENT_FOOTPRINT.max(SLICE_SIZE),
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Pops the head of `ready`, advancing `sequence` to its sequence.
    pub fn try_get_next(&mut self) -> Option<RawEvent> {
        let event = self.ready.pop_front()?;
        self.sequence = event.sequence;
        Some(event)
    }

    /// Spawns a read into a fresh buffer at the current position. The returned handle must be
    /// `commit`ted to take effect; at most one should be outstanding at a time per §5.
    pub fn background_fetch(&self) -> FetchHandle {
        let driver = Arc::clone(&self.driver);
        let position = self.position;
        let window = self.read_window;
        let task = tokio::spawn(async move {
            let outcome = driver.read(position, window).await?;
            Ok((outcome.next_position, outcome.events))
        });
        FetchHandle {
            from_position: position,
            task,
        }
    }

    /// Seeks to a position hint for `seq`, then reads forward discarding events whose sequence
    /// is strictly less than `seq`, stopping as soon as the head of `ready` is at or past the
    /// target (a tight `seek` hint may mean nothing needs discarding at all) or the stream ends.
    /// Returns the sequence reached — the sequence of the last event actually discarded, or
    /// whatever it already was if nothing needed discarding.
    pub async fn discard_up_to(&mut self, seq: u32) -> Result<u32> {
        if seq == 0 {
            return Ok(self.sequence);
        }
        let hint = self.driver.seek(seq, self.position).await?;
        if hint > self.position {
            self.position = hint;
            self.ready.clear();
        }

        loop {
            if self.ready.is_empty() {
                let outcome = self.driver.read(self.position, self.read_window).await?;
                if outcome.events.is_empty() {
                    break;
                }
                self.position = outcome.next_position;
                self.ready.extend(outcome.events);
            }
            match self.ready.front() {
                Some(front) if front.sequence < seq => {
                    let event = self.ready.pop_front().expect("just checked non-empty");
                    self.sequence = event.sequence;
                }
                _ => break,
            }
        }
        Ok(self.sequence)
    }

    pub fn reset(&mut self) {
        self.position = 0;
        self.sequence = 0;
        self.ready.clear();
    }

    /// Batch-formats `events` through the driver at the current position. On success, the
    /// written events are enqueued directly into `ready`, avoiding a re-read. On an optimistic
    /// conflict, returns `None`; hard failures propagate.
    pub async fn write(&mut self, events: &[RawEvent]) -> Result<Option<i64>> {
        if events.is_empty() {
            return Ok(Some(self.position));
        }
        let outcome = self.driver.write(self.position, events).await?;
        if !outcome.success {
            return Ok(None);
        }
        self.position = outcome.next_position;
        self.ready.extend(events.iter().cloned());
        Ok(Some(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;

    fn event(sequence: u32) -> RawEvent {
        RawEvent::new(sequence, vec![0u8; 8]).unwrap()
    }

    #[tokio::test]
    async fn s1_empty_stream() {
        let mut s = EventStream::new(Arc::new(MemoryDriver::new()));
        assert_eq!(s.position(), 0);
        assert_eq!(s.sequence(), 0);
        assert!(s.try_get_next().is_none());
    }

    #[tokio::test]
    async fn write_enqueues_without_a_re_read() {
        let mut s = EventStream::new(Arc::new(MemoryDriver::new()));
        let pos = s.write(&[event(1), event(2)]).await.unwrap();
        assert!(pos.is_some());
        assert_eq!(s.try_get_next().unwrap().sequence, 1);
        assert_eq!(s.try_get_next().unwrap().sequence, 2);
        assert_eq!(s.sequence(), 2);
    }

    #[tokio::test]
    async fn optimistic_conflict_returns_none() {
        let driver = Arc::new(MemoryDriver::new());
        driver.write(0, &[event(1)]).await.unwrap();
        let mut s = EventStream::new(driver);
        // s.position is still 0, but the driver has already moved to 1.
        let result = s.write(&[event(2)]).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn background_fetch_commits_into_ready() {
        let driver = Arc::new(MemoryDriver::new());
        driver.write(0, &[event(1), event(2)]).await.unwrap();
        let mut s = EventStream::new(driver);

        let handle = s.background_fetch();
        let progressed = handle.commit(&mut s).await.unwrap();
        assert!(progressed);
        assert_eq!(s.try_get_next().unwrap().sequence, 1);
        assert_eq!(s.try_get_next().unwrap().sequence, 2);

        let handle = s.background_fetch();
        let progressed = handle.commit(&mut s).await.unwrap();
        assert!(!progressed);
    }

    #[tokio::test]
    async fn discard_up_to_skips_forward() {
        let driver = Arc::new(MemoryDriver::new());
        driver
            .write(0, &[event(1), event(2), event(3), event(4)])
            .await
            .unwrap();
        let mut s = EventStream::new(driver);
        // The memory driver's `seek` is an exact binary search, so it jumps straight to the
        // event with sequence 3 — nothing actually needs discarding, and `sequence` is left
        // untouched (it only advances when an event is genuinely popped).
        let reached = s.discard_up_to(3).await.unwrap();
        assert_eq!(reached, 0);
        assert_eq!(s.try_get_next().unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let driver = Arc::new(MemoryDriver::new());
        driver.write(0, &[event(1)]).await.unwrap();
        let mut s = EventStream::new(driver);
        s.discard_up_to(1).await.unwrap();
        s.reset();
        assert_eq!(s.position(), 0);
        assert_eq!(s.sequence(), 0);
        assert!(s.try_get_next().is_none());
    }
}
