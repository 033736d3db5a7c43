//! # Golden Path
//!
//! Host uploads a ramp → kernel doubles it → copy back over the input →
//! host reads it back, bracketed by a duration query and a counter query,
//! with a second queue ordered behind the first through a semaphore.
//!
//! Every stage is checked; any mismatch exits with an error.

use std::sync::Arc;
use std::time::Instant;

use anvil::core::DeviceTypeFilter;
use anvil::runtime::CounterValue;
use anvil::{
    create_devices, Buffer, DescriptorInfo, Device, HalError, HalResult, HostAllocator,
    HostMemory, KernelLibrary, Memory, MemoryProperties, NdRangeOptions, Platform, QueryResult,
    QueryType, QueueType, SystemAllocator,
};

const ELEMENTS: usize = 1024;

fn bound_buffer(device: &Device, size: u64) -> HalResult<(Memory, Buffer)> {
    let memory = device.allocate_memory(size, MemoryProperties::default(), 16)?;
    let mut buffer = device.create_buffer(size)?;
    device.bind_buffer_memory(&mut buffer, &memory, 0)?;
    Ok((memory, buffer))
}

fn check(condition: bool, what: &str) -> HalResult<()> {
    if condition {
        Ok(())
    } else {
        Err(HalError::Failure(format!("golden path check failed: {what}")))
    }
}

fn run(device: &Device) -> HalResult<()> {
    let queue = device.queue(QueueType::Compute, 0)?;
    let size = (ELEMENTS * 4) as u64;

    // =========================================================================
    // STEP 1: Resources
    // =========================================================================
    let (_input_memory, input) = bound_buffer(device, size)?;
    let (_output_memory, output) = bound_buffer(device, size)?;
    let kernel = device.create_built_in_kernel("add_u32")?;
    let values: Vec<u32> = (0..ELEMENTS as u32).collect();
    let host_in = HostMemory::from_slice_of(&values);
    let host_out = HostMemory::zeroed(size as usize);

    let timing = device.create_query_pool(queue, QueryType::Duration, 1, &[])?;
    let counters = device.create_query_pool(queue, QueryType::Counter, 2, &[1, 3])?;

    // =========================================================================
    // STEP 2: Record
    // =========================================================================
    let mut command_buffer = device.create_command_buffer(None)?;
    let begin_time = command_buffer.begin_query(&timing, 0, 1, &[])?;
    let begin_counters = command_buffer.begin_query(&counters, 0, 2, &[])?;
    let upload = command_buffer.write_buffer(&input, 0, &host_in, 0, size, &[begin_time, begin_counters])?;
    let double = command_buffer.nd_range(
        &kernel,
        NdRangeOptions::new(&[ELEMENTS])
            .local_size(&[64])
            .descriptor(DescriptorInfo::buffer(&input)?)
            .descriptor(DescriptorInfo::buffer(&input)?)
            .descriptor(DescriptorInfo::buffer(&output)?),
        &[upload],
    )?;
    let copy = command_buffer.copy_buffer(&output, 0, &input, 0, size, &[double])?;
    let download = command_buffer.read_buffer(&input, 0, &host_out, 0, size, &[copy])?;
    let end_counters = command_buffer.end_query(&counters, 0, 2, &[download])?;
    command_buffer.end_query(&timing, 0, 1, &[end_counters])?;
    command_buffer.finalize()?;
    println!(
        "Recorded {} commands in {} waves",
        command_buffer.len(),
        command_buffer.wave_count().unwrap_or(0)
    );

    // =========================================================================
    // STEP 3: Dispatch and wait
    // =========================================================================
    let fence = device.create_fence()?;
    let start = Instant::now();
    queue.dispatch(&mut command_buffer, Some(&fence), &[], &[], None)?;
    queue.try_wait(&fence, u64::MAX)?;
    println!("Dispatch completed in {:.3} ms", start.elapsed().as_secs_f64() * 1000.0);

    let result: Vec<u32> = host_out.to_vec_of();
    check(
        result.iter().enumerate().all(|(i, &v)| v == 2 * i as u32),
        "doubled values",
    )?;

    // =========================================================================
    // STEP 4: Queries
    // =========================================================================
    if let [QueryResult::Duration { start_ns, end_ns }] = queue.get_query_results(&timing, 0, 1)?[..] {
        println!("Measured region: {} ns", end_ns.saturating_sub(start_ns));
    }
    for result in queue.get_query_results(&counters, 0, 2)? {
        if let QueryResult::Counter { uuid, value } = result {
            println!("Counter {uuid}: {value:?}");
            if uuid == 1 {
                check(value == CounterValue::Uint64(4), "command count")?;
            }
        }
    }

    device.destroy_query_pool(counters)?;
    device.destroy_query_pool(timing)?;
    Ok(())
}

fn run_cross_queue(device: &Device) -> HalResult<()> {
    let producer = device.queue(QueueType::Compute, 0)?;
    let consumer = device.queue(QueueType::Compute, 1)?;
    let (_memory, buffer) = bound_buffer(device, 64)?;
    let host = HostMemory::zeroed(64);

    let mut fill = device.create_command_buffer(None)?;
    fill.fill_buffer(&buffer, 0, 64, &[0x5A], &[])?;
    fill.finalize()?;

    let mut read = device.create_command_buffer(None)?;
    read.read_buffer(&buffer, 0, &host, 0, 64, &[])?;
    read.finalize()?;

    let semaphore = device.create_semaphore()?;
    let fence = device.create_fence()?;
    consumer.dispatch(&mut read, Some(&fence), &[&semaphore], &[], None)?;
    producer.dispatch(&mut fill, None, &[], &[&semaphore], None)?;
    consumer.try_wait(&fence, u64::MAX)?;

    check(host.to_vec().iter().all(|&b| b == 0x5A), "cross-queue ordering")?;
    println!("Cross-queue semaphore ordering verified");
    Ok(())
}

fn main() -> HalResult<()> {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║           ANVIL GOLDEN PATH                                      ║");
    println!("║           Upload → Kernel → Copy → Readback                      ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let platform = Platform::host();
    let mut info = platform
        .device_infos(DeviceTypeFilter::ALL)
        .first()
        .map(|info| (*info).clone())
        .ok_or_else(|| HalError::Failure("no host device".to_string()))?;
    info.compute_queues = 2;
    let allocator: Arc<dyn HostAllocator> = Arc::new(SystemAllocator::new());
    let devices = create_devices(&[info], &allocator, &KernelLibrary::with_builtins())?;

    for device in &devices {
        println!("Device {} ({})", device.info().name, device.id());
        run(device)?;
        run_cross_queue(device)?;
        println!("Memory still reserved: {} bytes", device.memory_used());
    }

    println!();
    println!("✓ GOLDEN PATH PASSED");
    Ok(())
}
