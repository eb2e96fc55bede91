// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Buffer access microbenchmarks.
//!
//! Measures a write followed by a read through two handles on the in-process
//! backend, for each exclusion strategy and several payload sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shmbuf_core::{
    BufferConfig, BufferName, ExclusionKind, IpcKey, LocalIpc, Role, ShmBuffer,
};
use std::time::Duration;

/// Payload sizes to benchmark (in bytes).
const PAYLOAD_SIZES: &[usize] = &[64, 1024, 16384];

const SEGMENT_SIZE: usize = 64 * 1024;

fn open_pair(ipc: &LocalIpc, kind: ExclusionKind) -> (ShmBuffer, ShmBuffer) {
    let name = BufferName::new("bench").expect("valid name");
    let mut config = BufferConfig::new(name, IpcKey::new(0x6000), SEGMENT_SIZE);
    config.exclusion = kind;
    config.total_connections = 2;

    let mut master = config.clone();
    master.role = Role::Master;
    let writer = ShmBuffer::open(master, ipc).expect("Failed to open writer");

    config.connection_index = 1;
    let reader = ShmBuffer::open(config, ipc).expect("Failed to open reader");
    (writer, reader)
}

/// Benchmark a write and a read of the same message.
fn bench_write_read(c: &mut Criterion) {
    for kind in [
        ExclusionKind::None,
        ExclusionKind::OsSemaphore,
        ExclusionKind::Mao,
        ExclusionKind::MaoWithOsSemaphore,
    ] {
        let mut group = c.benchmark_group(format!("write_read_{}", kind.token().to_lowercase()));
        group.measurement_time(Duration::from_secs(5));

        for &size in PAYLOAD_SIZES {
            group.throughput(Throughput::Bytes(size as u64));

            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let ipc = LocalIpc::new();
                let (mut writer, mut reader) = open_pair(&ipc, kind);
                let payload = vec![0xABu8; size];
                let mut out = Vec::with_capacity(size);

                b.iter(|| {
                    writer.write(black_box(&payload)).expect("Write failed");
                    let status = reader.read(&mut out).expect("Read failed");
                    black_box(status);
                });
            });
        }

        group.finish();
    }
}

/// Benchmark polling a buffer that has nothing new.
fn bench_read_old(c: &mut Criterion) {
    c.bench_function("read_old_os_sem", |b| {
        let ipc = LocalIpc::new();
        let (_writer, mut reader) = open_pair(&ipc, ExclusionKind::OsSemaphore);
        let mut out = Vec::new();

        b.iter(|| black_box(reader.read(&mut out).expect("Read failed")));
    });
}

criterion_group!(benches, bench_write_read, bench_read_old);
criterion_main!(benches);
