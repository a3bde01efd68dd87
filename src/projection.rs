// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The reified projection (§4.9) and reified projection group (§4.10): the runtime wrapper that
//! owns a user projection's state, sequence, cache, and inconsistent flag, and the composition
//! of several of those into one product state.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::constants::is_valid_projection_name;
use crate::error::{Error, Result};
use crate::projection_cache::CacheProvider;

/// What a reified projection exposes to `initial`/`upkeep`: the cache provider, and an optional
/// memory-mapped folder for projections that need one (§6 "try_restore ... only when a folder
/// is needed" — unused by projections that don't ask for it).
#[derive(Clone, Default)]
pub struct ProjectionContext {
    pub cache: Option<Arc<dyn CacheProvider>>,
    pub mapped_folder: Option<PathBuf>,
}

/// The user-supplied contract (§6). `Event` is shared across every member of a projection
/// group; `State` is private to this projection.
#[async_trait]
pub trait UserProjection: Send + Sync {
    type Event: Send + Sync;
    type State: Clone + Send + Sync + 'static;

    /// Matches `[-a-zA-Z0-9_]{1,16}`; validated once at construction.
    fn full_name(&self) -> &str;

    async fn initial(&self, ctx: &ProjectionContext) -> Result<Self::State>;

    /// Pure and total over valid inputs.
    fn apply(&self, seq: u32, event: &Self::Event, prev: &Self::State) -> Result<Self::State>;

    async fn try_load(&self, source: &[u8]) -> Result<Option<Self::State>>;

    async fn try_save(&self, sink: &mut Vec<u8>, state: &Self::State) -> Result<bool>;

    async fn commit(&self, state: &Self::State, seq: u32) -> Result<()>;

    async fn upkeep(&self, ctx: &ProjectionContext, state: &Self::State) -> Result<Option<Self::State>>;
}

/// Scans cache candidates most-recent-first, returning the first one that deserializes. Never
/// throws: a truncated trailer, mismatched sanity bytes, or a parser error just skips to the
/// next candidate, as §4.9 requires.
async fn load_from_cache<P: UserProjection>(
    projection: &P,
    cache: Option<&dyn CacheProvider>,
) -> Result<Option<(P::State, u32)>> {
    let Some(cache) = cache else {
        return Ok(None);
    };
    let candidates = cache.open_read(projection.full_name()).await?;
    for candidate in candidates {
        if candidate.contents.len() < 8 {
            #[cfg(feature = "log_warn")]
            crate::log::macros::warn!(name = projection.full_name(), "cache candidate truncated");
            continue;
        }
        let (head, rest) = candidate.contents.split_at(4);
        let (middle, tail) = rest.split_at(rest.len() - 4);
        let seq_head = u32::from_le_bytes(head.try_into().expect("split_at(4)"));
        let seq_tail = u32::from_le_bytes(tail.try_into().expect("split_at(len-4)"));
        if seq_head != seq_tail {
            #[cfg(feature = "log_warn")]
            crate::log::macros::warn!(
                name = projection.full_name(),
                seq_head,
                seq_tail,
                "cache candidate sanity mismatch"
            );
            continue;
        }
        match projection.try_load(middle).await {
            Ok(Some(state)) => return Ok(Some((state, seq_head))),
            Ok(None) => continue,
            Err(_err) => {
                #[cfg(feature = "log_warn")]
                crate::log::macros::warn!(name = projection.full_name(), "cache candidate failed to load");
                continue;
            }
        }
    }
    Ok(None)
}

pub struct ReifiedProjection<P: UserProjection> {
    projection: P,
    current: P::State,
    sequence: u32,
    inconsistent: bool,
    unsaved: bool,
    cache: Option<Arc<dyn CacheProvider>>,
}

impl<P: UserProjection> ReifiedProjection<P> {
    /// `create()` (§4.9): tries to load from cache, falling back to `initial`.
    pub async fn create(projection: P, ctx: &ProjectionContext) -> Result<Self> {
        if !is_valid_projection_name(projection.full_name()) {
            return Err(Error::InvalidProjectionName(projection.full_name().to_owned()));
        }
        if let Some((state, sequence)) = load_from_cache(&projection, ctx.cache.as_deref()).await? {
            return Ok(Self {
                projection,
                current: state,
                sequence,
                inconsistent: false,
                unsaved: false,
                cache: ctx.cache.clone(),
            });
        }
        let current = projection.initial(ctx).await?;
        Ok(Self {
            projection,
            current,
            sequence: 0,
            inconsistent: false,
            unsaved: false,
            cache: ctx.cache.clone(),
        })
    }

    pub fn name(&self) -> &str {
        self.projection.full_name()
    }

    pub fn current(&self) -> &P::State {
        &self.current
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent
    }

    pub fn set_possibly_inconsistent(&mut self) {
        self.inconsistent = true;
    }

    pub async fn reset(&mut self, ctx: &ProjectionContext) -> Result<()> {
        self.current = self.projection.initial(ctx).await?;
        self.sequence = 0;
        self.inconsistent = false;
        self.unsaved = false;
        Ok(())
    }

    pub fn apply(&mut self, seq: u32, event: &P::Event) -> Result<()> {
        if seq <= self.sequence {
            return Err(Error::SequenceRegression {
                current: self.sequence,
                attempted: seq,
            });
        }
        self.sequence = seq;
        match self.projection.apply(seq, event, &self.current) {
            Ok(next) => {
                self.current = next;
                self.unsaved = true;
                Ok(())
            }
            Err(e) => {
                self.inconsistent = true;
                Err(e)
            }
        }
    }

    /// Simulates applying `events` starting at `seq + 1` on a copy, without mutating `self`.
    pub fn try_apply(&self, seq: u32, events: &[P::Event]) -> Result<()> {
        let mut next_seq = seq;
        let mut state = self.current.clone();
        for event in events {
            next_seq += 1;
            state = self.projection.apply(next_seq, event, &state)?;
        }
        Ok(())
    }

    pub async fn try_load(&mut self) -> Result<bool> {
        match load_from_cache(&self.projection, self.cache.as_deref()).await? {
            Some((state, sequence)) => {
                self.current = state;
                self.sequence = sequence;
                self.unsaved = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn try_save(&mut self) -> Result<bool> {
        if self.inconsistent {
            return Ok(false);
        }
        let Some(cache) = self.cache.clone() else {
            return Ok(false);
        };
        let seq = self.sequence;
        let mut buf = Vec::new();
        buf.extend_from_slice(&seq.to_le_bytes());
        if !self.projection.try_save(&mut buf, &self.current).await? {
            return Ok(false);
        }
        buf.extend_from_slice(&seq.to_le_bytes());

        let committed = cache.try_write(self.projection.full_name(), buf).await?;
        if committed {
            self.unsaved = false;
        }
        Ok(committed)
    }

    pub async fn commit(&self, seq: u32) -> Result<()> {
        self.projection.commit(&self.current, seq).await
    }

    pub async fn upkeep(&mut self, ctx: &ProjectionContext) -> Result<()> {
        if let Some(next) = self.projection.upkeep(ctx, &self.current).await? {
            self.current = next;
        }
        Ok(())
    }

    /// Decides between the save-then-reset-then-load cycle and plain `upkeep`, skipping the
    /// cycle if nothing has changed since the last persist.
    pub async fn upkeep_or_save_load(&mut self, ctx: &ProjectionContext) -> Result<()> {
        if !self.unsaved {
            return self.upkeep(ctx).await;
        }
        if self.try_save().await? {
            self.reset(ctx).await?;
            self.try_load().await?;
        } else {
            self.upkeep(ctx).await?;
        }
        Ok(())
    }
}

impl<P: UserProjection + Clone> Clone for ReifiedProjection<P> {
    fn clone(&self) -> Self {
        Self {
            projection: self.projection.clone(),
            current: self.current.clone(),
            sequence: self.sequence,
            inconsistent: self.inconsistent,
            unsaved: self.unsaved,
            cache: self.cache.clone(),
        }
    }
}

/// Type-erased member of a [`ReifiedProjectionGroup`] (§9 "collapse the single/group distinction
/// behind one trait"). Every member consumes the same event type `E`; `current_state` returns a
/// cloned, type-erased snapshot for the group's product-building factory closure to downcast —
/// the idiomatic Rust stand-in for the source's reflection-based product construction.
#[async_trait]
pub trait GroupMember<E>: Send + Sync {
    fn sequence(&self) -> u32;
    fn is_inconsistent(&self) -> bool;
    fn set_possibly_inconsistent(&mut self);
    fn apply(&mut self, seq: u32, event: &E) -> Result<()>;
    fn try_apply(&self, seq: u32, events: &[E]) -> Result<()>;
    async fn reset(&mut self, ctx: &ProjectionContext) -> Result<()>;
    async fn try_load(&mut self) -> Result<bool>;
    async fn try_save(&mut self) -> Result<bool>;
    async fn commit(&self, seq: u32) -> Result<()>;
    async fn upkeep(&mut self, ctx: &ProjectionContext) -> Result<()>;
    async fn upkeep_or_save_load(&mut self, ctx: &ProjectionContext) -> Result<()>;
    fn current_state(&self) -> Box<dyn Any + Send + Sync>;
}

#[async_trait]
impl<P> GroupMember<P::Event> for ReifiedProjection<P>
where
    P: UserProjection,
{
    fn sequence(&self) -> u32 {
        ReifiedProjection::sequence(self)
    }

    fn is_inconsistent(&self) -> bool {
        ReifiedProjection::is_inconsistent(self)
    }

    fn set_possibly_inconsistent(&mut self) {
        ReifiedProjection::set_possibly_inconsistent(self)
    }

    fn apply(&mut self, seq: u32, event: &P::Event) -> Result<()> {
        ReifiedProjection::apply(self, seq, event)
    }

    fn try_apply(&self, seq: u32, events: &[P::Event]) -> Result<()> {
        ReifiedProjection::try_apply(self, seq, events)
    }

    async fn reset(&mut self, ctx: &ProjectionContext) -> Result<()> {
        ReifiedProjection::reset(self, ctx).await
    }

    async fn try_load(&mut self) -> Result<bool> {
        ReifiedProjection::try_load(self).await
    }

    async fn try_save(&mut self) -> Result<bool> {
        ReifiedProjection::try_save(self).await
    }

    async fn commit(&self, seq: u32) -> Result<()> {
        ReifiedProjection::commit(self, seq).await
    }

    async fn upkeep(&mut self, ctx: &ProjectionContext) -> Result<()> {
        ReifiedProjection::upkeep(self, ctx).await
    }

    async fn upkeep_or_save_load(&mut self, ctx: &ProjectionContext) -> Result<()> {
        ReifiedProjection::upkeep_or_save_load(self, ctx).await
    }

    fn current_state(&self) -> Box<dyn Any + Send + Sync> {
        Box::new(self.current.clone())
    }
}

type ProductFactory<S> = dyn Fn(Vec<Box<dyn Any + Send + Sync>>) -> Result<S> + Send + Sync;

/// Composes several reified projections, all consuming the same event type, into one product
/// state `S`. If there is exactly one member whose state type is `S`, the caller's factory is
/// simply a downcast-and-clone passthrough.
pub struct ReifiedProjectionGroup<E, S> {
    members: Vec<Box<dyn GroupMember<E>>>,
    factory: Box<ProductFactory<S>>,
    sequence: u32,
    cached_product: Option<(u32, S)>,
}

impl<E, S> ReifiedProjectionGroup<E, S> {
    /// Members may already be caught up to a nonzero sequence (e.g. loaded from cache by
    /// `ReifiedProjection::create` before being boxed into this group), so the group's own
    /// sequence is seeded from their maximum rather than hardcoded to 0 — otherwise the first
    /// `append` after a cache-backed cold start would re-encode already-used sequence numbers.
    pub fn new(
        members: Vec<Box<dyn GroupMember<E>>>,
        factory: impl Fn(Vec<Box<dyn Any + Send + Sync>>) -> Result<S> + Send + Sync + 'static,
    ) -> Self {
        let sequence = members.iter().map(|m| m.sequence()).max().unwrap_or(0);
        Self {
            members,
            factory: Box::new(factory),
            sequence,
            cached_product: None,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_inconsistent(&self) -> bool {
        self.members.iter().any(|m| m.is_inconsistent())
    }

    /// Applies `event` to every sub-projection whose sequence is behind `seq`. `sequence`
    /// advances unconditionally; if any member faults, every member is marked possibly
    /// inconsistent and an aggregate error is returned.
    pub async fn apply(&mut self, seq: u32, event: &E) -> Result<()> {
        let mut failures = 0usize;
        for member in &mut self.members {
            if seq > member.sequence() && member.apply(seq, event).is_err() {
                failures += 1;
            }
        }
        self.sequence = seq;
        self.cached_product = None;

        if failures > 0 {
            for member in &mut self.members {
                member.set_possibly_inconsistent();
            }
            return Err(Error::ProjectionGroupFault(failures));
        }
        Ok(())
    }

    pub fn try_apply(&self, seq: u32, events: &[E]) -> Result<()> {
        for member in &self.members {
            member.try_apply(seq, events)?;
        }
        Ok(())
    }

    pub async fn reset(&mut self, ctx: &ProjectionContext) -> Result<()> {
        for member in &mut self.members {
            member.reset(ctx).await?;
        }
        self.sequence = 0;
        self.cached_product = None;
        Ok(())
    }

    pub async fn try_load(&mut self) -> Result<bool> {
        let mut all = true;
        for member in &mut self.members {
            if !member.try_load().await? {
                all = false;
            }
        }
        if all {
            self.sequence = self.members.iter().map(|m| m.sequence()).max().unwrap_or(0);
        }
        self.cached_product = None;
        Ok(all)
    }

    pub async fn try_save(&mut self) -> Result<bool> {
        let mut all = true;
        for member in &mut self.members {
            if !member.try_save().await? {
                all = false;
            }
        }
        Ok(all)
    }

    pub async fn commit(&self, seq: u32) -> Result<()> {
        for member in &self.members {
            member.commit(seq).await?;
        }
        Ok(())
    }

    pub async fn upkeep(&mut self, ctx: &ProjectionContext) -> Result<()> {
        for member in &mut self.members {
            member.upkeep(ctx).await?;
        }
        self.cached_product = None;
        Ok(())
    }

    pub async fn upkeep_or_save_load(&mut self, ctx: &ProjectionContext) -> Result<()> {
        for member in &mut self.members {
            member.upkeep_or_save_load(ctx).await?;
        }
        self.cached_product = None;
        Ok(())
    }

    /// Builds (or returns the cached) product state for the current sequence.
    pub fn product(&mut self) -> Result<&S> {
        let stale = !matches!(&self.cached_product, Some((seq, _)) if *seq == self.sequence);
        if stale {
            let states: Vec<_> = self.members.iter().map(|m| m.current_state()).collect();
            let product = (self.factory)(states)?;
            self.cached_product = Some((self.sequence, product));
        }
        Ok(&self.cached_product.as_ref().expect("just populated").1)
    }
}
