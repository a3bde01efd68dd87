// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! The service facade (§4.12): a long-lived task owning the single [`StreamWrapper`], fed
//! through a bounded mailbox so that the many threads a host service may call in from are
//! serialized down to the one task allowed to touch the wrapper (§5). A periodic wake-up keeps
//! the projection caught up even when nobody is actively appending.
//!
//! Modeled on the teacher crate's `Processor::run` loop (`tokio::sync::watch` for "a new state
//! is available", awaited with `changed()`), generalized from one `u64` cursor to one published
//! product state `Arc<S>` per §5's "single-writer, multi-reader slot (swap publishes
//! atomically)".
//!
//! Simplification recorded in DESIGN.md: the append builder enqueued through the mailbox is
//! `FnMut(&S) -> Vec<E>` rather than `FnMut(&S) -> (Vec<E>, A)` — the facade boundary is a
//! channel, so a caller-chosen auxiliary type `A` would have to be boxed and downcast on the
//! other side for no real benefit; callers who need `A` call `StreamWrapper::append` directly
//! outside the facade.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::constants::{DEFAULT_MAILBOX_CAPACITY, DEFAULT_WAKE_INTERVAL, FACADE_RETRY_BASE_DELAY};
use crate::error::{Error, Result};
use crate::wrapper::{AppendOutcome, StreamWrapper};

/// `FnMut`, not `FnOnce`: `StreamWrapper::append` re-invokes the builder against a refreshed
/// state on every optimistic-conflict retry, so a builder that could only run once would panic
/// on the second call under contention.
type AppendBuilder<E, S> = Box<dyn FnMut(&S) -> Vec<E> + Send>;

enum Command<E, S> {
    Append(AppendBuilder<E, S>, oneshot::Sender<Result<AppendOutcome<()>>>),
    AppendBlind(Vec<E>, oneshot::Sender<Result<AppendOutcome<()>>>),
    ReadLive(oneshot::Sender<Result<Arc<S>>>),
    Save(oneshot::Sender<Result<bool>>),
    Shutdown,
}

/// Configuration knobs for a [`ServiceFacade`], all defaulted to the constants named in §4.12.
#[derive(Debug, Clone, Copy)]
pub struct FacadeConfig {
    pub wake_interval: Duration,
    pub mailbox_capacity: usize,
    pub retry_base_delay: Duration,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            wake_interval: DEFAULT_WAKE_INTERVAL,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            retry_base_delay: FACADE_RETRY_BASE_DELAY,
        }
    }
}

/// Shared state the background task publishes and the handle reads without going through the
/// mailbox: whether initial catch-up has completed, the last initialization error (if any, kept
/// until a subsequent retry succeeds), and the most recently published product state.
struct Shared<S> {
    ready: AtomicBool,
    init_error: Mutex<Option<String>>,
    current: watch::Sender<Option<Arc<S>>>,
    /// A receiver the background task keeps for itself, so it can read back what it just
    /// published without relying on `Sender::borrow` (not available on every tokio version).
    current_rx: watch::Receiver<Option<Arc<S>>>,
}

/// Mailbox-serialized external entry point (§4.12) around one [`StreamWrapper`]. Cheap to
/// clone: every clone shares the same background task and mailbox.
#[derive(Clone)]
pub struct ServiceFacade<E, S> {
    commands: mpsc::Sender<Command<E, S>>,
    shared: Arc<Shared<S>>,
    current_rx: watch::Receiver<Option<Arc<S>>>,
}

impl<E, S> ServiceFacade<E, S>
where
    E: Send + 'static,
    S: Clone + Send + Sync + 'static,
{
    /// Spawns the background task and returns a handle plus its [`JoinHandle`] (for callers that
    /// want to await a clean shutdown). `wrapper` is moved into the task; nothing outside the
    /// task ever touches it again, per §5's "not re-entrant" contract.
    pub fn spawn(wrapper: StreamWrapper<E, S>, config: FacadeConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let (current_tx, current_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            init_error: Mutex::new(None),
            current_rx: current_tx.subscribe(),
            current: current_tx,
        });

        let task_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            run(wrapper, rx, task_shared, config).await;
        });

        (
            Self {
                commands: tx,
                shared,
                current_rx,
            },
            handle,
        )
    }

    /// True once the initial catch-up has completed at least once. Reads routed through this
    /// facade fail with `Error::StreamNotReady` before that.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// The most recent initialization failure, if the facade is not yet ready. Cleared once a
    /// retry succeeds.
    pub async fn init_error(&self) -> Option<String> {
        self.shared.init_error.lock().await.clone()
    }

    /// Lock-free read of the last published product state — no mailbox round-trip. Fails with
    /// `StreamNotReady` before the first successful catch-up.
    pub fn read_local(&self) -> Result<Arc<S>> {
        if !self.is_ready() {
            return Err(Error::StreamNotReady);
        }
        self.current_rx
            .borrow()
            .clone()
            .ok_or(Error::StreamNotReady)
    }

    /// Enqueues a catch-up-then-read action and awaits the freshly caught-up state.
    pub async fn read_live(&self) -> Result<Arc<S>> {
        if !self.is_ready() {
            return Err(Error::StreamNotReady);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::ReadLive(tx)).await?;
        rx.await.map_err(|_| Error::StreamNotReady)?
    }

    /// Enqueues a state-dependent append; always goes through the mailbox regardless of
    /// readiness, so writes submitted during initial catch-up simply wait their turn.
    pub async fn append<B>(&self, builder: B) -> Result<AppendOutcome<()>>
    where
        B: FnMut(&S) -> Vec<E> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Append(Box::new(builder), tx)).await?;
        rx.await.map_err(|_| Error::StreamNotReady)?
    }

    pub async fn append_blind(&self, events: Vec<E>) -> Result<AppendOutcome<()>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AppendBlind(events, tx)).await?;
        rx.await.map_err(|_| Error::StreamNotReady)?
    }

    pub async fn save(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Save(tx)).await?;
        rx.await.map_err(|_| Error::StreamNotReady)?
    }

    /// Requests the background task stop after draining whatever is already in the mailbox, and
    /// cancels the periodic wake-up. Does not await task completion; use the `JoinHandle`
    /// returned by `spawn` for that.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn send(&self, command: Command<E, S>) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::StreamNotReady)
    }
}

/// The background task body: bounded-exponential-backoff initial catch-up, then an
/// interleaved mailbox/periodic-wake-up loop until `Shutdown` or the mailbox closes.
async fn run<E, S>(
    mut wrapper: StreamWrapper<E, S>,
    mut rx: mpsc::Receiver<Command<E, S>>,
    shared: Arc<Shared<S>>,
    config: FacadeConfig,
) where
    E: Send + 'static,
    S: Clone + Send + Sync + 'static,
{
    let mut delay = config.retry_base_delay;
    loop {
        match wrapper.catch_up_full().await {
            Ok(()) => {
                *shared.init_error.lock().await = None;
                break;
            }
            Err(e) => {
                #[cfg(feature = "log_error")]
                crate::log::macros::error!(error = %e, "initial catch-up failed, retrying");
                *shared.init_error.lock().await = Some(e.to_string());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(300));
            }
        }
    }
    publish(&mut wrapper, &shared);
    shared.ready.store(true, Ordering::Release);

    let mut wake = tokio::time::interval(config.wake_interval);
    wake.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    wake.tick().await; // the first tick fires immediately; consume it so it doesn't race init.

    loop {
        tokio::select! {
            _ = wake.tick() => {
                if wrapper.catch_up_full().await.is_ok() {
                    publish(&mut wrapper, &shared);
                }
            }
            command = rx.recv() => {
                match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Append(mut builder, reply)) => {
                        let outcome = wrapper.append(move |state| (builder(state), ())).await;
                        publish(&mut wrapper, &shared);
                        let _ = reply.send(outcome);
                    }
                    Some(Command::AppendBlind(events, reply)) => {
                        let outcome = wrapper.append_blind(events).await;
                        publish(&mut wrapper, &shared);
                        let _ = reply.send(outcome);
                    }
                    Some(Command::ReadLive(reply)) => {
                        let result = wrapper.catch_up_full().await.map(|()| {
                            publish(&mut wrapper, &shared);
                            shared
                                .current_rx
                                .borrow()
                                .clone()
                                .expect("just published")
                        });
                        let _ = reply.send(result);
                    }
                    Some(Command::Save(reply)) => {
                        let _ = reply.send(wrapper.save().await);
                    }
                }
            }
        }
    }
}

fn publish<E, S>(wrapper: &mut StreamWrapper<E, S>, shared: &Shared<S>)
where
    S: Clone + Send + Sync + 'static,
{
    if let Ok(state) = wrapper.current() {
        let _ = shared.current.send(Some(Arc::new(state.clone())));
    }
}
