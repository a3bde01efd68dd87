// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use stratumdb::codec::RawEvent;
use stratumdb::storage::memory::MemoryDriver;
use stratumdb::storage::Driver;

const PAYLOAD_LEN: usize = 256;

fn event(sequence: u32) -> RawEvent {
    RawEvent::new(sequence, Bytes::from(vec![0u8; PAYLOAD_LEN])).unwrap()
}

/// Sustained single-event appends against the in-memory driver. `MemoryDriver` is the cheapest
/// `Driver` to benchmark against without a real object-storage backend, and exercises the same
/// optimistic-position contract the sharded blob driver honors.
fn append_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("multiblob_append");
    group.throughput(Throughput::Elements(1));

    let driver = MemoryDriver::new();
    let mut position = rt.block_on(driver.get_position()).unwrap();
    let mut seq = 1u32;
    group.bench_function("append_one_event", |b| {
        b.iter(|| {
            let outcome = rt
                .block_on(driver.write(position, std::slice::from_ref(&event(seq))))
                .unwrap();
            assert!(outcome.success);
            position = outcome.next_position;
            seq += 1;
        })
    });
    group.finish();
}

/// Sequential reads against a driver pre-populated with 10k events, mirroring the teacher
/// crate's read-throughput bench.
fn read_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let driver = MemoryDriver::new();

    let count = 10_000u32;
    rt.block_on(async {
        let mut position = driver.get_position().await.unwrap();
        for seq in 1..=count {
            let outcome = driver
                .write(position, std::slice::from_ref(&event(seq)))
                .await
                .unwrap_or_else(|e| panic!("prepopulate failed at seq {seq}: {e}"));
            position = outcome.next_position;
        }
    });

    let mut group = c.benchmark_group("multiblob_read");
    group.throughput(Throughput::Elements(1));

    let mut position = 0i64;
    group.bench_function("read_sequential", |b| {
        b.iter(|| {
            let outcome = rt.block_on(driver.read(position, PAYLOAD_LEN * 8)).unwrap();
            if outcome.events.is_empty() {
                position = 0;
            } else {
                position = outcome.next_position;
            }
            criterion::black_box(&outcome.events);
        })
    });
    group.finish();
}

criterion_group!(benches, append_benchmark, read_benchmark);
criterion_main!(benches);
