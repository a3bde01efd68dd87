// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! # stratumdb
//!
//! An append-only event store with in-process event-sourced projection.
//!
//! A single logical stream of variable-length, CRC-protected event records is persisted to one
//! of several backends (Azure append-blob object storage, a local file, or in-memory — see
//! [`storage`]) and folded by zero or more in-process [`projection`]s into immutable typed
//! application states kept warm in memory. States may be periodically serialized to a
//! [`projection_cache`] to shorten cold-start time.
//!
//! ## Layering
//!
//! *   [`codec`] — the on-wire event record: size/key/payload/CRC32/size framing.
//! *   [`storage`] — the driver family: multi-blob (sharded, self-compacting), mono-blob, file,
//!     memory, plus the read-cache and tracing decorators.
//! *   [`stream`] — a typed decoder over a driver, with background prefetch.
//! *   [`projection_cache`] / [`projection`] — named snapshot slots, and the reified projection
//!     (and projection group) that owns a user projection's state, sequence, and cache.
//! *   [`wrapper`] — single-threaded orchestration of catch-up, append, and transactions around
//!     one stream and one projection group.
//! *   [`facade`] — the mailbox-serialized, multi-reader external entry point around a wrapper.
//!
//! ## Example
//!
//! ```rust
//! use std::any::Any;
//! use std::sync::Arc;
//!
//! use stratumdb::error::Result;
//! use stratumdb::projection::{GroupMember, ProjectionContext, ReifiedProjection, ReifiedProjectionGroup, UserProjection};
//! use stratumdb::quarantine::QuarantineBag;
//! use stratumdb::storage::memory::MemoryDriver;
//! use stratumdb::stream::EventStream;
//! use stratumdb::wrapper::{EventSerializer, StreamWrapper};
//!
//! #[derive(Clone)]
//! struct Total;
//!
//! #[derive(Clone, Debug, Default, PartialEq, Eq)]
//! struct TotalState(u64);
//!
//! #[async_trait::async_trait]
//! impl UserProjection for Total {
//!     type Event = u64;
//!     type State = TotalState;
//!
//!     fn full_name(&self) -> &str { "total" }
//!     async fn initial(&self, _ctx: &ProjectionContext) -> Result<Self::State> { Ok(TotalState::default()) }
//!     fn apply(&self, _seq: u32, event: &Self::Event, prev: &Self::State) -> Result<Self::State> {
//!         Ok(TotalState(prev.0 + event))
//!     }
//!     async fn try_load(&self, _source: &[u8]) -> Result<Option<Self::State>> { Ok(None) }
//!     async fn try_save(&self, _sink: &mut Vec<u8>, _state: &Self::State) -> Result<bool> { Ok(true) }
//!     async fn commit(&self, _state: &Self::State, _seq: u32) -> Result<()> { Ok(()) }
//!     async fn upkeep(&self, _ctx: &ProjectionContext, _state: &Self::State) -> Result<Option<Self::State>> { Ok(None) }
//! }
//!
//! struct U64Serializer;
//! impl EventSerializer<u64> for U64Serializer {
//!     fn serialize(&self, event: &u64) -> Result<Vec<u8>> { Ok(event.to_le_bytes().to_vec()) }
//!     fn deserialize(&self, _sequence: u32, bytes: &[u8]) -> Result<u64> {
//!         Ok(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let ctx = ProjectionContext::default();
//! let member = ReifiedProjection::create(Total, &ctx).await?;
//! let members: Vec<Box<dyn GroupMember<u64>>> = vec![Box::new(member)];
//! let group = ReifiedProjectionGroup::new(members, |mut states: Vec<Box<dyn Any + Send + Sync>>| {
//!     Ok(*states.remove(0).downcast::<TotalState>().expect("state type"))
//! });
//! let stream = EventStream::new(Arc::new(MemoryDriver::new()));
//! let mut wrapper = StreamWrapper::new(
//!     stream, group, Arc::new(U64Serializer), ctx, QuarantineBag::new(16), 1_000, None,
//! );
//!
//! let outcome = wrapper.append(|_state| (vec![3u64, 4u64], ())).await?;
//! assert_eq!(outcome.count, 2);
//! assert_eq!(wrapper.current()?.0, 7);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod constants;
pub mod error;
pub mod facade;
#[cfg(feature = "log")]
pub mod log;
pub mod metrics;
pub mod projection;
pub mod projection_cache;
pub mod quarantine;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod wrapper;

pub use error::{Error, Result};
