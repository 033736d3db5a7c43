//! # Dispatch Benchmark
//!
//! Measures the host-side cost of the record -> finalize -> dispatch -> wait
//! loop and the executor's wave fan-out.
//!
//! Run with: `cargo bench --package anvil_runtime`

#![allow(missing_docs)]

use std::sync::Arc;

use anvil_core::{DeviceInfo, QueueType, SystemAllocator};
use anvil_runtime::{Buffer, DescriptorInfo, Device, KernelLibrary, Memory, MemoryProperties, NdRangeOptions};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bound_buffer(device: &Device, size: u64) -> (Memory, Buffer) {
    let memory = device
        .allocate_memory(size, MemoryProperties::default(), 16)
        .unwrap();
    let mut buffer = device.create_buffer(size).unwrap();
    device.bind_buffer_memory(&mut buffer, &memory, 0).unwrap();
    (memory, buffer)
}

/// Benchmark: empty dispatch round trip through a fence.
fn bench_empty_dispatch(c: &mut Criterion) {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let mut command_buffer = device.create_command_buffer(None).unwrap();
    command_buffer.finalize().unwrap();
    let mut fence = device.create_fence().unwrap();

    c.bench_function("empty_dispatch_round_trip", |b| {
        b.iter(|| {
            fence.reset().unwrap();
            queue
                .dispatch(&mut command_buffer, Some(&fence), &[], &[], None)
                .unwrap();
            black_box(queue.try_wait(&fence, u64::MAX).unwrap())
        });
    });
}

/// Benchmark: recording and finalizing a chain of fills.
fn bench_record_chain(c: &mut Criterion) {
    let device = Device::host().unwrap();
    let (_memory, buffer) = bound_buffer(&device, 4096);
    let mut group = c.benchmark_group("record_chain");

    for length in [16, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            let mut command_buffer = device.create_command_buffer(None).unwrap();
            b.iter(|| {
                command_buffer.reset();
                let mut previous = None;
                for _ in 0..length {
                    let waits: Vec<_> = previous.into_iter().collect();
                    previous = Some(
                        command_buffer
                            .fill_buffer(&buffer, 0, 4096, &[0xAA, 0x55], &waits)
                            .unwrap(),
                    );
                }
                command_buffer.finalize().unwrap();
                black_box(command_buffer.wave_count())
            });
        });
    }

    group.finish();
}

/// Benchmark: one wide wave of independent kernels, sequential vs fanned out.
fn bench_wave_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("wave_fan_out");

    for concurrent in [false, true] {
        let mut info = DeviceInfo::cpu();
        info.executor.concurrent_commands = concurrent;
        let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::with_builtins()).unwrap();
        let queue = device.queue(QueueType::Compute, 0).unwrap();
        let kernel = device.create_built_in_kernel("fill_u32").unwrap();
        let buffers: Vec<_> = (0..8).map(|_| bound_buffer(&device, 4 * 4096)).collect();

        let mut command_buffer = device.create_command_buffer(None).unwrap();
        for (_, buffer) in &buffers {
            let options = NdRangeOptions::new(&[4096])
                .local_size(&[64])
                .descriptor(DescriptorInfo::buffer(buffer).unwrap())
                .descriptor(DescriptorInfo::plain(&7u32));
            command_buffer.nd_range(&kernel, options, &[]).unwrap();
        }
        command_buffer.finalize().unwrap();

        let name = if concurrent { "concurrent" } else { "sequential" };
        group.bench_function(name, |b| {
            b.iter(|| {
                queue
                    .dispatch(&mut command_buffer, None, &[], &[], None)
                    .unwrap();
                queue.wait_all();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_empty_dispatch, bench_record_chain, bench_wave_fan_out);
criterion_main!(benches);
