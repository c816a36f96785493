mod common;

use common::*;
use dashi_compute::*;

#[test]
fn dispatch_before_bind_is_rejected() {
    let mut dev = host_device();
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.dispatch(1, 1, 1);

    assert!(matches!(
        stream.submit(&mut cmd),
        Err(GpuError::InvalidSequence(_))
    ));
    // Nothing was consumed.
    assert_eq!(cmd.state(), ListState::Recording);
    assert_eq!(cmd.len(), 1);
}

#[test]
fn resources_before_pipeline_are_rejected() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::device_local(16)).unwrap();
    let mut binder = ResourceBinder::new();
    binder.buffer_alloc(0, 0, buf);

    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_resources(&binder);
    assert!(matches!(
        stream.submit(&mut cmd),
        Err(GpuError::InvalidSequence(_))
    ));
}

#[test]
fn dispatch_dimensions_are_checked() {
    let mut dev = host_device();
    let pipeline = compute_pipeline(&mut dev, "slow", &[]);
    let max = dev.caps().max_dispatch_groups;

    let stream = dev.compute_stream();
    for dims in [[0, 1, 1], [1, 0, 1], [1, 1, max[2] + 1]] {
        let mut cmd = stream.new_command_list();
        cmd.bind_pipeline(&pipeline);
        cmd.dispatch(dims[0], dims[1], dims[2]);
        assert!(matches!(
            stream.submit(&mut cmd),
            Err(GpuError::InvalidArgument(_))
        ));
    }
}

#[test]
fn resubmission_is_rejected() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.buffer_fill(buf.ptr(0), 16, 0x0101_0101);

    stream.submit_synced(&mut cmd).unwrap();
    assert!(cmd.is_submitted());
    assert!(cmd.is_empty());
    assert!(matches!(
        stream.submit(&mut cmd),
        Err(GpuError::InvalidSequence(_))
    ));

    // Recording into a submitted list is ignored.
    cmd.buffer_fill(buf.ptr(0), 16, 0);
    assert!(cmd.is_empty());
    assert!(download(&mut dev, buf).iter().all(|b| *b == 1));
}

#[test]
fn kernel_writes_every_group() {
    let mut dev = host_device();
    let out = dev.allocate_memory(&AllocParams::host_visible(4 * 64)).unwrap();
    let pipeline = compute_pipeline(&mut dev, "write_index", &[BindingLayout::rw_buffer(0, 0)]);
    let mut binder = pipeline.resource_binder();
    binder.rw_buffer_alloc(0, 0, out);

    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.bind_resources(&binder);
    cmd.dispatch(4, 4, 4);
    stream.submit_synced(&mut cmd).unwrap();

    let expected: Vec<u32> = (0..64).collect();
    assert_eq!(words(&download(&mut dev, out)), expected);
}

#[test]
fn each_dispatch_sees_its_own_snapshot() {
    let mut dev = host_device();
    let a = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let b = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let pipeline = compute_pipeline(&mut dev, "write_index", &[BindingLayout::rw_buffer(0, 0)]);

    let mut binder = pipeline.resource_binder();
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    binder.rw_buffer_alloc(0, 0, a);
    cmd.bind_resources(&binder);
    cmd.dispatch(2, 1, 1);
    binder.rw_buffer_alloc(0, 0, b);
    cmd.bind_resources(&binder);
    cmd.dispatch(4, 1, 1);
    stream.submit_synced(&mut cmd).unwrap();

    assert_eq!(words(&download(&mut dev, a)), vec![0, 1, 0, 0]);
    assert_eq!(words(&download(&mut dev, b)), vec![0, 1, 2, 3]);
}

#[test]
fn materialization_is_deterministic() {
    let mut dev = host_device();
    let a = dev.allocate_memory(&AllocParams::device_local(32)).unwrap();
    let b = dev.allocate_memory(&AllocParams::device_local(32)).unwrap();

    let mut binder = ResourceBinder::new();
    binder.rw_buffer_alloc(1, 0, b).buffer(0, 3, a.ptr(16), 16);
    let first = binder.materialize();
    let second = binder.materialize();
    assert_eq!(first, second);

    let mut reordered = ResourceBinder::new();
    reordered.buffer(0, 3, a.ptr(16), 16).rw_buffer_alloc(1, 0, b);
    assert_eq!(reordered.materialize(), first);

    let slots: Vec<(u32, u32)> = first.iter().map(|r| (r.set, r.binding)).collect();
    assert_eq!(slots, vec![(0, 3), (1, 0)]);

    binder.buffer_alloc(0, 3, b);
    let third = binder.materialize();
    assert_ne!(third, first);
    assert_eq!(first.get(0, 3).unwrap().ptr, a.ptr(16));
    assert_eq!(third.get(0, 3).unwrap().ptr, b.ptr(0));

    binder.clear();
    assert!(binder.materialize().is_empty());
}

#[test]
fn declared_layout_must_be_satisfied() {
    let mut dev = host_device();
    let src = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let dst = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let layout = [BindingLayout::buffer(0, 0), BindingLayout::rw_buffer(0, 1)];
    let pipeline = compute_pipeline(&mut dev, "copy_words", &layout);

    let stream = dev.compute_stream();
    let mut missing = pipeline.resource_binder();
    missing.buffer_alloc(0, 0, src);
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.bind_resources(&missing);
    cmd.dispatch(4, 1, 1);
    assert!(matches!(
        stream.submit(&mut cmd),
        Err(GpuError::InvalidSequence(_))
    ));

    let mut read_only = pipeline.resource_binder();
    read_only.buffer_alloc(0, 0, src).buffer_alloc(0, 1, dst);
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.bind_resources(&read_only);
    cmd.dispatch(4, 1, 1);
    assert!(matches!(
        stream.submit(&mut cmd),
        Err(GpuError::InvalidSequence(_))
    ));

    upload(&mut dev, src, &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0]);
    let mut ok = pipeline.resource_binder();
    ok.buffer_alloc(0, 0, src).rw_buffer_alloc(0, 1, dst);
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.bind_resources(&ok);
    cmd.dispatch(4, 1, 1);
    stream.submit_synced(&mut cmd).unwrap();
    assert_eq!(words(&download(&mut dev, dst)), vec![1, 2, 3, 4]);
}

#[test]
fn fills_must_be_word_aligned() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let stream = dev.compute_stream();
    for (offset, size) in [(2, 4), (0, 6)] {
        let mut cmd = stream.new_command_list();
        cmd.buffer_fill(buf.ptr(offset), size, 0);
        assert!(matches!(
            stream.submit(&mut cmd),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    let mut cmd = stream.new_command_list();
    cmd.buffer_fill(buf.ptr(4), WHOLE_SIZE, 0xDDCC_BBAA);
    stream.submit_synced(&mut cmd).unwrap();
    let bytes = download(&mut dev, buf);
    assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
    assert_eq!(&bytes[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
}

#[test]
fn replay_errors_surface_at_the_next_sync() {
    let mut dev = host_device();
    let small = dev.allocate_memory(&AllocParams::host_visible(8)).unwrap();
    let big = dev.allocate_memory(&AllocParams::host_visible(64)).unwrap();

    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.buffer_copy(small.ptr(0), big.ptr(0), 64);
    stream.submit(&mut cmd).unwrap();

    assert!(matches!(
        stream.command_sync(),
        Err(GpuError::InvalidArgument(_))
    ));
    // Reported once; the device keeps working.
    stream.command_sync().unwrap();
    let mut cmd = stream.new_command_list();
    cmd.buffer_copy(big.ptr(0), small.ptr(0), 8);
    stream.submit_synced(&mut cmd).unwrap();
}

#[test]
fn stale_handles_fail_at_replay() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.buffer_barrier_alloc(buf);
    cmd.memory_barrier();
    cmd.buffer_fill(buf.ptr(0), 16, 0);

    dev.dealloc_memory(buf).unwrap();
    assert_eq!(
        dev.compute_stream().submit_synced(&mut cmd),
        Err(GpuError::InvalidHandle(buf))
    );
}

#[test]
fn raster_operations_are_unsupported() {
    let mut dev = host_device();
    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    assert!(cmd.begin_renderpass().is_err());
    assert!(cmd.draw(3, 0).is_err());
    assert!(cmd.draw_indexed(3, 0).is_err());
    assert!(cmd.clear_color(0.0, 0.0, 0.0, 1.0).is_err());
    assert!(cmd.set_line_width(1.0).is_err());
    assert!(cmd.end_renderpass().is_err());
    assert!(cmd.is_empty());

    let mut binder = ResourceBinder::new();
    let buf = dev.allocate_memory(&AllocParams::device_local(16)).unwrap();
    assert!(matches!(
        binder.vertex_buffer(buf.ptr(0), 0),
        Err(GpuError::Unsupported(_))
    ));
    assert!(binder.index_buffer(buf.ptr(0), 4).is_err());
}
