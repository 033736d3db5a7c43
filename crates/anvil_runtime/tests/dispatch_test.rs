//! Integration tests for queue dispatch, fences and semaphores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anvil_core::{DeviceInfo, HalError, HostMemory, QueueType, ResultCode, SystemAllocator};
use anvil_runtime::{
    Buffer, CallbackContext, CommandBuffer, CommandBufferState, DescriptorInfo, Device,
    FenceStatus, KernelLibrary, Memory, MemoryProperties, NdRangeOptions,
};
use parking_lot::Mutex;

fn device_with_queues(compute_queues: u32) -> Device {
    let mut info = DeviceInfo::cpu();
    info.compute_queues = compute_queues;
    Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::with_builtins()).unwrap()
}

fn bound_buffer(device: &Device, size: u64) -> (Memory, Buffer) {
    let memory = device
        .allocate_memory(size, MemoryProperties::default(), 16)
        .unwrap();
    let mut buffer = device.create_buffer(size).unwrap();
    device.bind_buffer_memory(&mut buffer, &memory, 0).unwrap();
    (memory, buffer)
}

fn recorder(log: &Arc<Mutex<Vec<usize>>>, tag: usize) -> anvil_runtime::UserCallback {
    let log = Arc::clone(log);
    Arc::new(move |_: &CallbackContext| log.lock().push(tag))
}

#[test]
fn test_two_independent_fills_complete_before_fence() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let (_ma, a) = bound_buffer(&device, 256);
    let (_mb, b) = bound_buffer(&device, 256);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    command_buffer.fill_buffer(&a, 0, 256, &[0x11], &[]).unwrap();
    command_buffer.fill_buffer(&b, 0, 256, &[0x22, 0x33], &[]).unwrap();
    command_buffer.finalize().unwrap();
    assert_eq!(command_buffer.wave_count(), Some(1));

    let fence = device.create_fence().unwrap();
    queue
        .dispatch(&mut command_buffer, Some(&fence), &[], &[], None)
        .unwrap();
    assert_eq!(command_buffer.state(), CommandBufferState::Dispatched);
    assert_eq!(queue.try_wait(&fence, u64::MAX).unwrap(), FenceStatus::Signaled);

    let out_a = HostMemory::zeroed(256);
    let out_b = HostMemory::zeroed(256);
    let mut readback = device.create_command_buffer(None).unwrap();
    readback.read_buffer(&a, 0, &out_a, 0, 256, &[]).unwrap();
    readback.read_buffer(&b, 0, &out_b, 0, 256, &[]).unwrap();
    readback.finalize().unwrap();
    queue.dispatch(&mut readback, None, &[], &[], None).unwrap();
    queue.wait_all();

    assert!(out_a.to_vec().iter().all(|&byte| byte == 0x11));
    assert!(out_b
        .to_vec()
        .chunks_exact(2)
        .all(|pair| pair == [0x22, 0x33]));
}

#[test]
fn test_dependent_command_observes_side_effects() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let (_ma, a) = bound_buffer(&device, 64);
    let (_mb, b) = bound_buffer(&device, 64);
    let host = HostMemory::zeroed(64);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    let fill = command_buffer.fill_buffer(&a, 0, 64, &[0x5A], &[]).unwrap();
    let copy = command_buffer.copy_buffer(&a, 0, &b, 0, 64, &[fill]).unwrap();
    command_buffer.read_buffer(&b, 0, &host, 0, 64, &[copy]).unwrap();
    command_buffer.finalize().unwrap();
    assert_eq!(command_buffer.wave_count(), Some(3));

    let fence = device.create_fence().unwrap();
    queue
        .dispatch(&mut command_buffer, Some(&fence), &[], &[], None)
        .unwrap();
    queue.try_wait(&fence, u64::MAX).unwrap();
    assert_eq!(host.to_vec(), vec![0x5A; 64]);
}

#[test]
fn test_dispatch_requires_finalized_buffer() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let mut command_buffer = device.create_command_buffer(None).unwrap();
    let fence = device.create_fence().unwrap();

    let err = queue
        .dispatch(&mut command_buffer, Some(&fence), &[], &[], None)
        .unwrap_err();
    assert!(matches!(err, HalError::InvalidValue(_)));
    assert!(!fence.is_pending());
    assert_eq!(queue.stats().submitted, 0);
}

#[test]
fn test_dispatch_rejects_foreign_command_buffer() {
    let a = Device::host().unwrap();
    let b = Device::host().unwrap();
    let mut command_buffer = b.create_command_buffer(None).unwrap();
    command_buffer.finalize().unwrap();
    let queue = a.queue(QueueType::Compute, 0).unwrap();
    assert!(matches!(
        queue.dispatch(&mut command_buffer, None, &[], &[], None),
        Err(HalError::InvalidValue(_))
    ));
}

#[test]
fn test_same_queue_dispatches_start_in_order() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut buffers: Vec<CommandBuffer> = (0..8)
        .map(|tag| {
            let mut command_buffer = device.create_command_buffer(None).unwrap();
            command_buffer.user_callback(recorder(&log, tag), &[]).unwrap();
            command_buffer.finalize().unwrap();
            command_buffer
        })
        .collect();
    for command_buffer in &mut buffers {
        queue.dispatch(command_buffer, None, &[], &[], None).unwrap();
    }
    queue.wait_all();

    assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    let stats = queue.stats();
    assert_eq!(stats.submitted, 8);
    assert_eq!(stats.completed, 8);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.commands_executed, 8);
}

#[test]
fn test_semaphore_orders_dispatches_across_queues() {
    let device = device_with_queues(2);
    let first = device.queue(QueueType::Compute, 0).unwrap();
    let second = device.queue(QueueType::Compute, 1).unwrap();
    let (_memory, buffer) = bound_buffer(&device, 64);
    let host = HostMemory::zeroed(64);
    let semaphore = device.create_semaphore().unwrap();

    // the consumer is submitted first; only the semaphore holds it back
    let mut consumer = device.create_command_buffer(None).unwrap();
    consumer.read_buffer(&buffer, 0, &host, 0, 64, &[]).unwrap();
    consumer.finalize().unwrap();
    let consumer_fence = device.create_fence().unwrap();
    second
        .dispatch(&mut consumer, Some(&consumer_fence), &[&semaphore], &[], None)
        .unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(
        second.try_wait(&consumer_fence, 0).unwrap(),
        FenceStatus::NotReady
    );

    let gate = Arc::new(AtomicUsize::new(0));
    let mut producer = device.create_command_buffer(None).unwrap();
    let fill = producer.fill_buffer(&buffer, 0, 64, &[7], &[]).unwrap();
    let seen = Arc::clone(&gate);
    producer
        .user_callback(Arc::new(move |_: &CallbackContext| {
            seen.store(1, Ordering::SeqCst);
        }), &[fill])
        .unwrap();
    producer.finalize().unwrap();
    first
        .dispatch(&mut producer, None, &[], &[&semaphore], None)
        .unwrap();

    assert_eq!(
        second.try_wait(&consumer_fence, u64::MAX).unwrap(),
        FenceStatus::Signaled
    );
    assert_eq!(gate.load(Ordering::SeqCst), 1);
    assert_eq!(host.to_vec(), vec![7; 64]);
    assert!(semaphore.is_signaled());
}

#[test]
fn test_fence_reset_refused_while_pending() {
    let device = device_with_queues(2);
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let other = device.queue(QueueType::Compute, 1).unwrap();
    let blocker = device.create_semaphore().unwrap();
    let mut fence = device.create_fence().unwrap();

    assert_eq!(queue.try_wait(&fence, 0).unwrap(), FenceStatus::NotReady);

    let mut waiting = device.create_command_buffer(None).unwrap();
    waiting.finalize().unwrap();
    queue
        .dispatch(&mut waiting, Some(&fence), &[&blocker], &[], None)
        .unwrap();
    assert!(fence.is_pending());
    assert!(matches!(fence.reset(), Err(HalError::InvalidValue(_))));

    // a second dispatch may not claim the fence either
    let mut second = device.create_command_buffer(None).unwrap();
    second.finalize().unwrap();
    assert!(matches!(
        queue.dispatch(&mut second, Some(&fence), &[], &[], None),
        Err(HalError::InvalidValue(_))
    ));
    assert_eq!(second.state(), CommandBufferState::Finalized);

    // waiting through the wrong queue is a caller error
    assert!(matches!(
        other.try_wait(&fence, 0),
        Err(HalError::InvalidValue(_))
    ));
    assert_eq!(
        queue.try_wait(&fence, 1_000_000).unwrap(),
        FenceStatus::NotReady
    );

    let mut release = device.create_command_buffer(None).unwrap();
    release.finalize().unwrap();
    other
        .dispatch(&mut release, None, &[], &[&blocker], None)
        .unwrap();

    assert_eq!(queue.try_wait(&fence, u64::MAX).unwrap(), FenceStatus::Signaled);
    assert_eq!(fence.result(), Some(ResultCode::Success));
    fence.reset().unwrap();
    assert_eq!(fence.result(), None);
    assert_eq!(queue.try_wait(&fence, 0).unwrap(), FenceStatus::NotReady);
}

#[test]
fn test_semaphore_reset_refused_while_in_use() {
    let device = device_with_queues(2);
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let other = device.queue(QueueType::Compute, 1).unwrap();
    let mut semaphore = device.create_semaphore().unwrap();
    let release = device.create_semaphore().unwrap();

    let mut waiting = device.create_command_buffer(None).unwrap();
    waiting.finalize().unwrap();
    queue
        .dispatch(&mut waiting, None, &[&release], &[&semaphore], None)
        .unwrap();
    assert!(matches!(semaphore.reset(), Err(HalError::InvalidValue(_))));

    let mut releasing = device.create_command_buffer(None).unwrap();
    releasing.finalize().unwrap();
    other
        .dispatch(&mut releasing, None, &[], &[&release], None)
        .unwrap();
    queue.wait_all();

    assert!(semaphore.is_signaled());
    semaphore.reset().unwrap();
    assert!(!semaphore.is_signaled());
}

#[test]
fn test_kernel_failure_reported_through_fence_and_callbacks() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let trap = device.create_built_in_kernel("trap").unwrap();
    let (_memory, buffer) = bound_buffer(&device, 16);

    let messages: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    let mut command_buffer = device
        .create_command_buffer(Some(Arc::new(move |message: &str, data: &[u8]| {
            sink.lock().push((message.to_string(), data.to_vec()));
        })))
        .unwrap();
    let fill = command_buffer.fill_buffer(&buffer, 0, 16, &[1], &[]).unwrap();
    let launch = command_buffer
        .nd_range(&trap, NdRangeOptions::new(&[4]), &[fill])
        .unwrap();
    command_buffer.fill_buffer(&buffer, 0, 16, &[2], &[launch]).unwrap();
    command_buffer.finalize().unwrap();

    let completed: Arc<Mutex<Option<ResultCode>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&completed);
    let fence = device.create_fence().unwrap();
    queue
        .dispatch(
            &mut command_buffer,
            Some(&fence),
            &[],
            &[],
            Some(Box::new(move |code: ResultCode| *slot.lock() = Some(code))),
        )
        .unwrap();

    assert_eq!(
        queue.try_wait(&fence, u64::MAX).unwrap_err(),
        HalError::FenceFailure(ResultCode::Failure)
    );
    queue.wait_all();
    assert_eq!(*completed.lock(), Some(ResultCode::Failure));
    assert_eq!(queue.stats().failed, 1);

    let messages = messages.lock();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].0.contains("trap"));
    assert_eq!(messages[0].1, 1u32.to_le_bytes().to_vec());

    // the command after the failure never ran
    let out = HostMemory::zeroed(16);
    let mut readback = device.create_command_buffer(None).unwrap();
    readback.read_buffer(&buffer, 0, &out, 0, 16, &[]).unwrap();
    readback.finalize().unwrap();
    queue.dispatch(&mut readback, None, &[], &[], None).unwrap();
    queue.wait_all();
    assert_eq!(out.to_vec(), vec![1; 16]);
}

#[test]
fn test_redispatch_and_clone_run_same_commands() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    command_buffer
        .user_callback(Arc::new(move |_: &CallbackContext| {
            counter.fetch_add(1, Ordering::SeqCst);
        }), &[])
        .unwrap();
    command_buffer.finalize().unwrap();
    let mut copy = command_buffer.try_clone().unwrap();

    queue.dispatch(&mut command_buffer, None, &[], &[], None).unwrap();
    queue.dispatch(&mut command_buffer, None, &[], &[], None).unwrap();
    queue.dispatch(&mut copy, None, &[], &[], None).unwrap();
    queue.wait_all();

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(command_buffer.pending_dispatches(), 0);
}

#[test]
fn test_clone_unsupported_without_capability() {
    let mut info = DeviceInfo::cpu();
    info.capabilities.command_buffer_clone = false;
    let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::new()).unwrap();
    let mut command_buffer = device.create_command_buffer(None).unwrap();
    command_buffer.finalize().unwrap();
    assert_eq!(
        command_buffer.try_clone().unwrap_err(),
        HalError::FeatureUnsupported("command buffer clone")
    );
}

#[test]
fn test_update_descriptors_applies_to_next_dispatch() {
    let device = Device::host().unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let fill = device.create_built_in_kernel("fill_u32").unwrap();
    let (_ma, a) = bound_buffer(&device, 16);
    let (_mb, b) = bound_buffer(&device, 16);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    let options = NdRangeOptions::new(&[4])
        .descriptor(DescriptorInfo::buffer(&a).unwrap())
        .descriptor(DescriptorInfo::plain(&9u32));
    command_buffer.nd_range(&fill, options, &[]).unwrap();
    command_buffer.finalize().unwrap();

    queue.dispatch(&mut command_buffer, None, &[], &[], None).unwrap();
    command_buffer
        .update_descriptors(
            0,
            &[0, 1],
            vec![DescriptorInfo::buffer(&b).unwrap(), DescriptorInfo::plain(&3u32)],
        )
        .unwrap();
    queue.dispatch(&mut command_buffer, None, &[], &[], None).unwrap();
    queue.wait_all();

    let out_a = HostMemory::zeroed(16);
    let out_b = HostMemory::zeroed(16);
    let mut readback = device.create_command_buffer(None).unwrap();
    readback.read_buffer(&a, 0, &out_a, 0, 16, &[]).unwrap();
    readback.read_buffer(&b, 0, &out_b, 0, 16, &[]).unwrap();
    readback.finalize().unwrap();
    queue.dispatch(&mut readback, None, &[], &[], None).unwrap();
    queue.wait_all();

    assert_eq!(out_a.to_vec_of::<u32>(), vec![9; 4]);
    assert_eq!(out_b.to_vec_of::<u32>(), vec![3; 4]);
}

#[test]
fn test_update_descriptors_unsupported_leaves_dispatch_unchanged() {
    let mut info = DeviceInfo::cpu();
    info.capabilities.descriptor_updates = false;
    let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::with_builtins()).unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let fill = device.create_built_in_kernel("fill_u32").unwrap();
    let (_memory, buffer) = bound_buffer(&device, 16);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    let options = NdRangeOptions::new(&[4])
        .descriptor(DescriptorInfo::buffer(&buffer).unwrap())
        .descriptor(DescriptorInfo::plain(&5u32));
    command_buffer.nd_range(&fill, options, &[]).unwrap();
    command_buffer.finalize().unwrap();

    assert_eq!(
        command_buffer
            .update_descriptors(0, &[1], vec![DescriptorInfo::plain(&6u32)])
            .unwrap_err(),
        HalError::FeatureUnsupported("descriptor updates")
    );

    assert_eq!(command_buffer.len(), 1);
    let out = HostMemory::zeroed(16);
    let mut readback = device.create_command_buffer(None).unwrap();
    readback.read_buffer(&buffer, 0, &out, 0, 16, &[]).unwrap();
    readback.finalize().unwrap();

    queue.dispatch(&mut command_buffer, None, &[], &[], None).unwrap();
    queue.dispatch(&mut readback, None, &[], &[], None).unwrap();
    queue.wait_all();
    assert_eq!(out.to_vec_of::<u32>(), vec![5; 4]);
}

#[test]
fn test_wrong_descriptor_kind_rejected() {
    let device = Device::host().unwrap();
    let fill = device.create_built_in_kernel("fill_u32").unwrap();
    let (_memory, buffer) = bound_buffer(&device, 16);

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    let options = NdRangeOptions::new(&[4])
        .descriptor(DescriptorInfo::buffer(&buffer).unwrap())
        .descriptor(DescriptorInfo::plain(&5u32));
    command_buffer.nd_range(&fill, options, &[]).unwrap();
    command_buffer.finalize().unwrap();

    assert!(matches!(
        command_buffer.update_descriptors(0, &[0], vec![DescriptorInfo::plain(&1u32)]),
        Err(HalError::InvalidValue(_))
    ));
    assert!(matches!(
        command_buffer.update_descriptors(0, &[1], vec![DescriptorInfo::plain(&1u64)]),
        Err(HalError::InvalidValue(_))
    ));
    assert!(matches!(
        command_buffer.update_descriptors(0, &[2], vec![DescriptorInfo::plain(&1u32)]),
        Err(HalError::InvalidValue(_))
    ));
    assert!(command_buffer
        .update_descriptors(0, &[0], vec![DescriptorInfo::NullBuffer])
        .is_ok());
}

#[test]
fn test_out_of_memory_is_synchronous() {
    let mut info = DeviceInfo::cpu();
    info.memory_capacity = 4096;
    let device = Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::new()).unwrap();
    assert!(matches!(
        device.allocate_memory(8192, MemoryProperties::default(), 16),
        Err(HalError::OutOfMemory { .. })
    ));
}

#[test]
fn test_sequential_executor_runs_wave_in_record_order() {
    let mut info = DeviceInfo::cpu();
    info.executor.concurrent_commands = false;
    let device =
        Device::create(info, Arc::new(SystemAllocator::new()), KernelLibrary::new()).unwrap();
    let queue = device.queue(QueueType::Compute, 0).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut command_buffer = device.create_command_buffer(None).unwrap();
    for tag in 0..6 {
        command_buffer.user_callback(recorder(&log, tag), &[]).unwrap();
    }
    command_buffer.finalize().unwrap();
    assert_eq!(command_buffer.wave_count(), Some(1));

    queue
        .dispatch(&mut command_buffer, None, &[], &[], None)
        .unwrap();
    queue.wait_all();
    assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn test_sync_point_from_other_device_rejected() {
    let first = Device::host().unwrap();
    let second = Device::host().unwrap();
    let (_ma, a) = bound_buffer(&first, 64);
    let (_mb, b) = bound_buffer(&second, 64);

    let mut producer = first.create_command_buffer(None).unwrap();
    let mut consumer = second.create_command_buffer(None).unwrap();
    assert_eq!(producer.id(), consumer.id());

    let point = producer.fill_buffer(&a, 0, 64, &[1], &[]).unwrap();
    consumer.fill_buffer(&b, 0, 64, &[2], &[]).unwrap();
    assert!(matches!(
        consumer.fill_buffer(&b, 0, 64, &[3], &[point]),
        Err(HalError::InvalidValue(_))
    ));
    assert_eq!(consumer.len(), 1);
}
