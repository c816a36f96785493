mod common;

use common::*;
use dashi_compute::*;

#[test]
fn host_visible_round_trip() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(1024)).unwrap();

    let pattern: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 251) as u8).collect();
    dev.map(buf).unwrap().copy_from_slice(&pattern);
    dev.unmap(buf).unwrap();

    assert_eq!(dev.map(buf).unwrap(), &pattern[..]);
    dev.unmap(buf).unwrap();
    dev.dealloc_memory(buf).unwrap();
}

#[test]
fn round_trip_through_device_local_memory() {
    let mut dev = host_device();
    let staging = dev.allocate_memory(&AllocParams::host_visible(64)).unwrap();
    let local = dev.allocate_memory(&AllocParams::device_local(64)).unwrap();
    let readback = dev.allocate_memory(&AllocParams::host_visible(64)).unwrap();

    upload(&mut dev, staging, &[0x5A; 64]);
    dev.memcpy_internal(local.ptr(0), staging.ptr(0), WHOLE_SIZE)
        .unwrap();
    dev.memcpy_internal(readback.ptr(0), local.ptr(0), WHOLE_SIZE)
        .unwrap();
    dev.wait_idle().unwrap();

    assert!(download(&mut dev, readback).iter().all(|b| *b == 0x5A));
}

#[test]
fn map_after_dealloc_fails() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    dev.dealloc_memory(buf).unwrap();

    assert_eq!(dev.map(buf).unwrap_err(), GpuError::InvalidHandle(buf));
    assert_eq!(dev.dealloc_memory(buf), Err(GpuError::InvalidHandle(buf)));
}

#[test]
fn ids_are_not_reused() {
    let mut dev = host_device();
    let a = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    dev.dealloc_memory(a).unwrap();
    let b = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    assert_ne!(a, b);
    assert!(dev.map(a).is_err());
    assert!(dev.map(b).is_ok());
}

#[test]
fn handles_are_device_scoped() {
    let mut a = host_device();
    let mut b = host_device();
    let buf = a.allocate_memory(&AllocParams::host_visible(16)).unwrap();

    assert_eq!(b.map(buf).unwrap_err(), GpuError::InvalidHandle(buf));

    let stream = b.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.buffer_fill(buf.ptr(0), 16, 0);
    assert_eq!(stream.submit(&mut cmd), Err(GpuError::InvalidHandle(buf)));
}

#[test]
fn allocation_parameters_are_checked() {
    let mut dev = host_device();
    assert!(matches!(
        dev.allocate_memory(&AllocParams::host_visible(0)),
        Err(GpuError::InvalidArgument(_))
    ));

    let exported = AllocParams {
        export_sharing: true,
        ..AllocParams::device_local(64)
    };
    assert!(matches!(
        dev.allocate_memory(&exported),
        Err(GpuError::UnsupportedUsage(_))
    ));

    let vertices = AllocParams {
        usage: AllocUsage::VERTEX,
        ..AllocParams::device_local(64)
    };
    assert!(matches!(
        dev.allocate_memory(&vertices),
        Err(GpuError::UnsupportedUsage(_))
    ));
    assert_eq!(dev.live_allocations(), 0);
}

#[test]
fn memory_budget_reports_out_of_memory() {
    let config = DeviceConfig::default().with_memory_budget(1024);
    let mut dev = HostDevice::new(&config).unwrap();

    let a = dev.allocate_memory(&AllocParams::device_local(768)).unwrap();
    assert!(matches!(
        dev.allocate_memory(&AllocParams::device_local(512)),
        Err(GpuError::OutOfMemory(_))
    ));
    assert_eq!(dev.memory_in_use(), 768);

    dev.dealloc_memory(a).unwrap();
    dev.allocate_memory(&AllocParams::device_local(512)).unwrap();
    assert_eq!(dev.memory_in_use(), 512);
}

#[test]
fn dealloc_while_mapped_drops_the_mapping() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    dev.map(buf).unwrap().fill(9);
    dev.dealloc_memory(buf).unwrap();
    assert_eq!(dev.unmap(buf), Err(GpuError::InvalidHandle(buf)));
}

#[test]
fn unknown_kernel_is_a_compilation_error() {
    let mut dev = host_device();
    let desc = PipelineSourceDesc::compute(Vec::new(), "no_such_kernel");
    match dev.create_pipeline(&desc, "missing") {
        Err(GpuError::CompilationError { pipeline, message }) => {
            assert_eq!(pipeline, "missing");
            assert!(message.contains("no_such_kernel"));
            assert!(message.contains("write_index"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn graphics_stages_are_unsupported() {
    let mut dev = host_device();
    let desc = PipelineSourceDesc {
        stage: ShaderStage::Vertex,
        ..PipelineSourceDesc::compute(Vec::new(), "write_index")
    };
    assert_eq!(
        dev.create_pipeline(&desc, "vs").unwrap_err(),
        GpuError::Unsupported("graphics pipelines")
    );
}

#[test]
fn destroyed_pipeline_cannot_be_dispatched() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let pipeline = compute_pipeline(&mut dev, "write_index", &[]);
    let mut binder = pipeline.resource_binder();
    binder.rw_buffer_alloc(0, 0, buf);

    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.bind_resources(&binder);
    cmd.dispatch(4, 1, 1);
    let id = pipeline.id();

    dev.destroy_pipeline(pipeline).unwrap();
    assert_eq!(
        dev.compute_stream().submit_synced(&mut cmd),
        Err(GpuError::InvalidPipeline(id))
    );

    // The allocation the pipeline was bound to is untouched.
    assert!(dev.map(buf).is_ok());
}

#[test]
fn foreign_pipeline_cannot_be_destroyed() {
    let mut a = host_device();
    let mut b = host_device();
    let pipeline = compute_pipeline(&mut a, "write_index", &[]);
    let id = pipeline.id();
    assert_eq!(b.destroy_pipeline(pipeline), Err(GpuError::InvalidPipeline(id)));
}

#[test]
fn device_lost_is_sticky() {
    let mut dev = host_device();
    let buf = dev.allocate_memory(&AllocParams::host_visible(16)).unwrap();
    let pipeline = compute_pipeline(&mut dev, "explode", &[]);

    let stream = dev.compute_stream();
    let mut cmd = stream.new_command_list();
    cmd.bind_pipeline(&pipeline);
    cmd.dispatch(1, 1, 1);
    let err = stream.submit_synced(&mut cmd).unwrap_err();
    assert!(err.is_device_lost());
    assert!(err.to_string().contains("kernel exploded"));

    assert!(stream.command_sync().unwrap_err().is_device_lost());
    let mut next = stream.new_command_list();
    next.buffer_fill(buf.ptr(0), 16, 0);
    assert!(stream.submit(&mut next).unwrap_err().is_device_lost());

    assert!(dev.map(buf).unwrap_err().is_device_lost());
    assert!(dev
        .allocate_memory(&AllocParams::host_visible(16))
        .unwrap_err()
        .is_device_lost());
    assert!(dev.dealloc_memory(buf).unwrap_err().is_device_lost());
    assert_eq!(dev.wait_idle(), Err(err));
}

#[test]
fn adapter_selection() {
    let config = DeviceConfig {
        device_index: 1,
        ..Default::default()
    };
    assert!(matches!(
        HostDevice::new(&config),
        Err(GpuError::InvalidArgument(_))
    ));

    let config = DeviceConfig {
        adapter: AdapterPreference::Software,
        ..Default::default()
    };
    let dev = HostDevice::new(&config).unwrap();
    assert!(!dev.caps().native_mapping);
    assert_ne!(dev.id(), host_device().id());
}
