// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end coverage wiring every layer together: a file-backed driver, a two-member
//! projection group composed into one product state, a facade in front of it, and a file
//! projection cache that survives a simulated cold restart.

pub mod ledger {
    use std::any::Any;
    use std::sync::Arc;

    use async_trait::async_trait;
    use stratumdb::error::{Error, Result};
    use stratumdb::projection::{GroupMember, ProjectionContext, ReifiedProjection, ReifiedProjectionGroup, UserProjection};
    use stratumdb::wrapper::EventSerializer;

    /// One ledger event: a signed amount against a named account.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LedgerEvent {
        Deposit { account: String, amount: u64 },
        Withdraw { account: String, amount: u64 },
    }

    /// Running balance per account, keyed by insertion order for deterministic assertions.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct BalanceState(pub Vec<(String, i64)>);

    impl BalanceState {
        pub fn balance_of(&self, account: &str) -> i64 {
            self.0.iter().find(|(a, _)| a == account).map_or(0, |(_, b)| *b)
        }

        fn with_delta(&self, account: &str, delta: i64) -> Self {
            let mut next = self.0.clone();
            match next.iter_mut().find(|(a, _)| a == account) {
                Some((_, balance)) => *balance += delta,
                None => next.push((account.to_owned(), delta)),
            }
            Self(next)
        }
    }

    #[derive(Clone)]
    pub struct BalanceProjection;

    #[async_trait]
    impl UserProjection for BalanceProjection {
        type Event = LedgerEvent;
        type State = BalanceState;

        fn full_name(&self) -> &str {
            "balances"
        }

        async fn initial(&self, _ctx: &ProjectionContext) -> Result<Self::State> {
            Ok(BalanceState::default())
        }

        fn apply(&self, _seq: u32, event: &Self::Event, prev: &Self::State) -> Result<Self::State> {
            match event {
                LedgerEvent::Deposit { account, amount } => Ok(prev.with_delta(account, *amount as i64)),
                LedgerEvent::Withdraw { account, amount } => {
                    if prev.balance_of(account) < *amount as i64 {
                        return Err(Error::InvalidConfig(format!("{account} would go negative")));
                    }
                    Ok(prev.with_delta(account, -(*amount as i64)))
                }
            }
        }

        async fn try_load(&self, source: &[u8]) -> Result<Option<Self::State>> {
            if source.is_empty() {
                return Ok(Some(BalanceState::default()));
            }
            let text = std::str::from_utf8(source)
                .map_err(|e| Error::Corruption(e.to_string()))?;
            let mut entries = Vec::new();
            for line in text.lines() {
                let (account, balance) = line
                    .split_once('=')
                    .ok_or_else(|| Error::Corruption("malformed balance line".into()))?;
                let balance: i64 = balance.parse().map_err(|_| Error::Corruption("bad balance".into()))?;
                entries.push((account.to_owned(), balance));
            }
            Ok(Some(BalanceState(entries)))
        }

        async fn try_save(&self, sink: &mut Vec<u8>, state: &Self::State) -> Result<bool> {
            for (account, balance) in &state.0 {
                sink.extend_from_slice(format!("{account}={balance}\n").as_bytes());
            }
            Ok(true)
        }

        async fn commit(&self, _state: &Self::State, _seq: u32) -> Result<()> {
            Ok(())
        }

        async fn upkeep(&self, _ctx: &ProjectionContext, _state: &Self::State) -> Result<Option<Self::State>> {
            Ok(None)
        }
    }

    /// A second, independent projection over the same event stream: a plain count of events
    /// seen, composed alongside `BalanceState` to exercise the multi-member group path.
    #[derive(Clone)]
    pub struct EventCountProjection;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct EventCountState(pub u32);

    #[async_trait]
    impl UserProjection for EventCountProjection {
        type Event = LedgerEvent;
        type State = EventCountState;

        fn full_name(&self) -> &str {
            "event_count"
        }

        async fn initial(&self, _ctx: &ProjectionContext) -> Result<Self::State> {
            Ok(EventCountState::default())
        }

        fn apply(&self, _seq: u32, _event: &Self::Event, prev: &Self::State) -> Result<Self::State> {
            Ok(EventCountState(prev.0 + 1))
        }

        async fn try_load(&self, source: &[u8]) -> Result<Option<Self::State>> {
            if source.len() < 4 {
                return Ok(None);
            }
            let arr: [u8; 4] = source[..4].try_into().expect("length checked above");
            Ok(Some(EventCountState(u32::from_le_bytes(arr))))
        }

        async fn try_save(&self, sink: &mut Vec<u8>, state: &Self::State) -> Result<bool> {
            sink.extend_from_slice(&state.0.to_le_bytes());
            Ok(true)
        }

        async fn commit(&self, _state: &Self::State, _seq: u32) -> Result<()> {
            Ok(())
        }

        async fn upkeep(&self, _ctx: &ProjectionContext, _state: &Self::State) -> Result<Option<Self::State>> {
            Ok(None)
        }
    }

    /// The product state the group composes the two members into.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct LedgerState {
        pub balances: BalanceState,
        pub events_seen: u32,
    }

    pub fn product_factory(mut states: Vec<Box<dyn Any + Send + Sync>>) -> Result<LedgerState> {
        let events_seen = states.pop().expect("two members").downcast::<EventCountState>().expect("state type").0;
        let balances = *states.pop().expect("two members").downcast::<BalanceState>().expect("state type");
        Ok(LedgerState { balances, events_seen })
    }

    pub async fn new_group(ctx: &ProjectionContext) -> Result<ReifiedProjectionGroup<LedgerEvent, LedgerState>> {
        let balances = ReifiedProjection::create(BalanceProjection, ctx).await?;
        let counts = ReifiedProjection::create(EventCountProjection, ctx).await?;
        let members: Vec<Box<dyn GroupMember<LedgerEvent>>> = vec![Box::new(balances), Box::new(counts)];
        Ok(ReifiedProjectionGroup::new(members, product_factory))
    }

    /// Fixed-width, length-prefixed wire format: `[account_len:u8][account][amount:u64][kind:u8]`,
    /// padded with zero bytes up to the codec's 8-byte payload alignment.
    pub struct LedgerSerializer;

    impl EventSerializer<LedgerEvent> for LedgerSerializer {
        fn serialize(&self, event: &LedgerEvent) -> Result<Vec<u8>> {
            let (account, amount, kind) = match event {
                LedgerEvent::Deposit { account, amount } => (account, *amount, 0u8),
                LedgerEvent::Withdraw { account, amount } => (account, *amount, 1u8),
            };
            let mut buf = Vec::new();
            buf.push(account.len() as u8);
            buf.extend_from_slice(account.as_bytes());
            buf.extend_from_slice(&amount.to_le_bytes());
            buf.push(kind);
            while buf.len() % 8 != 0 {
                buf.push(0);
            }
            Ok(buf)
        }

        fn deserialize(&self, _sequence: u32, bytes: &[u8]) -> Result<LedgerEvent> {
            let account_len = bytes[0] as usize;
            let account = std::str::from_utf8(&bytes[1..1 + account_len])
                .map_err(|e| Error::Corruption(e.to_string()))?
                .to_owned();
            let amount_offset = 1 + account_len;
            let amount = u64::from_le_bytes(
                bytes[amount_offset..amount_offset + 8]
                    .try_into()
                    .expect("fixed width"),
            );
            let kind = bytes[amount_offset + 8];
            Ok(match kind {
                0 => LedgerEvent::Deposit { account, amount },
                _ => LedgerEvent::Withdraw { account, amount },
            })
        }
    }

    pub fn serializer() -> Arc<dyn EventSerializer<LedgerEvent>> {
        Arc::new(LedgerSerializer)
    }
}

mod full_stack {
    use std::sync::Arc;
    use std::time::Duration;

    use stratumdb::facade::{FacadeConfig, ServiceFacade};
    use stratumdb::projection::ProjectionContext;
    use stratumdb::quarantine::QuarantineBag;
    use stratumdb::storage::file::FileDriver;
    use stratumdb::stream::EventStream;
    use stratumdb::wrapper::StreamWrapper;

    use super::ledger::{new_group, serializer, LedgerEvent};

    #[tokio::test]
    async fn deposits_and_withdrawals_drive_a_composed_product_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FileDriver::open(dir.path()).await.unwrap());
        let ctx = ProjectionContext::default();
        let group = new_group(&ctx).await.unwrap();
        let stream = EventStream::new(driver);
        let mut wrapper = StreamWrapper::new(
            stream,
            group,
            serializer(),
            ctx,
            QuarantineBag::new(16),
            1_000,
            None,
        );

        wrapper
            .append(|_state| {
                (
                    vec![
                        LedgerEvent::Deposit { account: "alice".into(), amount: 100 },
                        LedgerEvent::Deposit { account: "bob".into(), amount: 50 },
                    ],
                    (),
                )
            })
            .await
            .unwrap();

        wrapper
            .append(|state| {
                assert_eq!(state.events_seen, 2);
                (vec![LedgerEvent::Withdraw { account: "alice".into(), amount: 30 }], ())
            })
            .await
            .unwrap();

        let state = wrapper.current().unwrap();
        assert_eq!(state.events_seen, 3);
        assert_eq!(state.balances.balance_of("alice"), 70);
        assert_eq!(state.balances.balance_of("bob"), 50);

        // A withdrawal that would go negative is rejected before anything is written.
        let before = wrapper.sequence();
        let result = wrapper
            .append(|_state| (vec![LedgerEvent::Withdraw { account: "bob".into(), amount: 1_000 }], ()))
            .await;
        assert!(result.is_err());
        assert_eq!(wrapper.sequence(), before);
    }

    #[tokio::test]
    async fn facade_serializes_concurrent_appends_through_one_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FileDriver::open(dir.path()).await.unwrap());
        let ctx = ProjectionContext::default();
        let group = new_group(&ctx).await.unwrap();
        let stream = EventStream::new(driver);
        let wrapper = StreamWrapper::new(
            stream,
            group,
            serializer(),
            ctx,
            QuarantineBag::new(16),
            1_000,
            None,
        );
        let (facade, _handle): (ServiceFacade<LedgerEvent, _>, _) = ServiceFacade::spawn(
            wrapper,
            FacadeConfig {
                wake_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        while !facade.is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let facade = facade.clone();
            handles.push(tokio::spawn(async move {
                facade
                    .append(move |_state| vec![LedgerEvent::Deposit { account: "pool".into(), amount: i + 1 }])
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let state = facade.read_live().await.unwrap();
        assert_eq!(state.events_seen, 10);
        // 1 + 2 + ... + 10
        assert_eq!(state.balances.balance_of("pool"), 55);
    }
}

mod cold_restart {
    use std::sync::Arc;

    use stratumdb::projection_cache::FileCacheProvider;
    use stratumdb::projection::ProjectionContext;
    use stratumdb::quarantine::QuarantineBag;
    use stratumdb::storage::file::FileDriver;
    use stratumdb::stream::EventStream;
    use stratumdb::wrapper::StreamWrapper;

    use super::ledger::{new_group, serializer, LedgerEvent};

    /// Writes events, saves the projection cache, then rebuilds the whole wrapper from scratch
    /// against the same stream and cache directories — standing in for a process restart — and
    /// asserts the reloaded state matches without replaying from sequence 0.
    #[tokio::test]
    async fn projection_cache_shortens_cold_start() {
        let stream_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCacheProvider::new(cache_dir.path()));

        {
            let driver = Arc::new(FileDriver::open(stream_dir.path()).await.unwrap());
            let ctx = ProjectionContext {
                cache: Some(cache.clone()),
                mapped_folder: None,
            };
            let group = new_group(&ctx).await.unwrap();
            let stream = EventStream::new(driver);
            let mut wrapper = StreamWrapper::new(
                stream,
                group,
                serializer(),
                ctx,
                QuarantineBag::new(16),
                1_000,
                None,
            );
            wrapper
                .append(|_state| {
                    (
                        vec![
                            LedgerEvent::Deposit { account: "alice".into(), amount: 100 },
                            LedgerEvent::Deposit { account: "alice".into(), amount: 25 },
                        ],
                        (),
                    )
                })
                .await
                .unwrap();
            assert!(wrapper.save().await.unwrap());
        }

        // Cold restart: a fresh driver over the same directory, a fresh group that loads from
        // the same cache directory instead of starting at `initial`.
        let driver = Arc::new(FileDriver::open(stream_dir.path()).await.unwrap());
        let ctx = ProjectionContext {
            cache: Some(cache),
            mapped_folder: None,
        };
        let group = new_group(&ctx).await.unwrap();
        assert_eq!(group.sequence(), 2, "group should have loaded from cache, not started at 0");

        let stream = EventStream::new(driver);
        let mut wrapper = StreamWrapper::new(
            stream,
            group,
            serializer(),
            ctx,
            QuarantineBag::new(16),
            1_000,
            None,
        );
        // No new events exist past sequence 2, so catch-up is a no-op; the state is exactly
        // what was cached.
        wrapper.catch_up_full().await.unwrap();
        let state = wrapper.current().unwrap();
        assert_eq!(state.balances.0, vec![("alice".to_owned(), 125)]);
    }
}
