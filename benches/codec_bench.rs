// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use stratumdb::codec::{self, RawEvent};

const PAYLOAD_LEN: usize = 256;

fn write_benchmark(c: &mut Criterion) {
    let event = RawEvent::new(1, Bytes::from(vec![0u8; PAYLOAD_LEN])).unwrap();

    let mut group = c.benchmark_group("codec_write");
    group.throughput(Throughput::Bytes(event.encoded_len() as u64));
    group.bench_function("write_one_event", |b| {
        let mut buf = Vec::with_capacity(event.encoded_len());
        b.iter(|| {
            buf.clear();
            criterion::black_box(codec::write(&mut buf, &event).unwrap());
        })
    });
    group.finish();
}

fn parse_benchmark(c: &mut Criterion) {
    let event = RawEvent::new(1, Bytes::from(vec![0u8; PAYLOAD_LEN])).unwrap();
    let mut buf = Vec::new();
    codec::write(&mut buf, &event).unwrap();
    let buf = Bytes::from(buf);

    let mut group = c.benchmark_group("codec_parse");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("try_parse_one_event", |b| {
        b.iter(|| {
            let (parsed, consumed) = codec::try_parse(&buf).unwrap().unwrap();
            criterion::black_box(&parsed);
            assert_eq!(consumed, buf.len());
        })
    });
    group.finish();
}

criterion_group!(benches, write_benchmark, parse_benchmark);
criterion_main!(benches);
