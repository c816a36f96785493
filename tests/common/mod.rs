#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashi_compute::*;

/// Collects diagnostics so tests can assert on what validation reported.
#[derive(Default)]
pub struct RecordingSink {
    saw_warning: AtomicBool,
    messages: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    pub fn saw_warning(&self) -> bool {
        self.saw_warning.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<(Severity, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, m)| m.contains(needle))
    }
}

impl DiagnosticSink for RecordingSink {
    fn message(&self, severity: Severity, text: &str) {
        if severity >= Severity::Warning {
            self.saw_warning.store(true, Ordering::SeqCst);
        }
        self.messages.lock().unwrap().push((severity, text.to_string()));
    }
}

pub fn host_device() -> HostDevice {
    let mut dev = HostDevice::new(&DeviceConfig::default()).unwrap();
    register_kernels(&mut dev);
    dev
}

/// A host device with validation on, reporting into the returned sink.
pub fn validating_host_device() -> (HostDevice, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let config = DeviceConfig::default()
        .with_validation(true)
        .with_diagnostics(sink.clone());
    let mut dev = HostDevice::new(&config).unwrap();
    register_kernels(&mut dev);
    (dev, sink)
}

/// Kernels shared by the integration suites.
///
/// - `write_index`: element `i` of `(0, 0)` gets the flat group index `i`.
/// - `add_one`: element `i` of `(0, 0)` is incremented.
/// - `copy_words`: element `i` of `(0, 1)` gets element `i` of `(0, 0)`.
/// - `store_readonly`: writes through the read-only slot `(0, 0)`.
/// - `overrun`: writes one element past the end of `(0, 0)`.
/// - `explode`: panics.
/// - `slow`: sleeps, touching nothing.
pub fn register_kernels(dev: &mut HostDevice) {
    dev.register_kernel("write_index", |inv| {
        let i = inv.flat_group_index();
        inv.store(0, 0, i, i as u32)
    });
    dev.register_kernel("add_one", |inv| {
        let i = inv.flat_group_index();
        let v: u32 = inv.load(0, 0, i)?;
        inv.store(0, 0, i, v + 1)
    });
    dev.register_kernel("copy_words", |inv| {
        let i = inv.flat_group_index();
        let v: u32 = inv.load(0, 0, i)?;
        inv.store(0, 1, i, v)
    });
    dev.register_kernel("store_readonly", |inv| inv.store(0, 0, 0, 1u32));
    dev.register_kernel("overrun", |inv| {
        let len = inv.binding_len(0, 0).unwrap_or(0) / 4;
        inv.store(0, 0, len, 0u32)
    });
    dev.register_kernel("explode", |_inv| panic!("kernel exploded"));
    dev.register_kernel("slow", |_inv| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    });
}

pub fn compute_pipeline(dev: &mut HostDevice, entry: &str, layout: &[BindingLayout]) -> Pipeline {
    let desc = PipelineSourceDesc::compute(Vec::new(), entry).with_bindings(layout);
    dev.create_pipeline(&desc, entry).unwrap()
}

pub fn upload<D: Device>(dev: &mut D, alloc: DeviceAllocation, bytes: &[u8]) {
    dev.map_with(alloc, MapAccess::Write).unwrap()[..bytes.len()].copy_from_slice(bytes);
    dev.unmap(alloc).unwrap();
}

pub fn download<D: Device>(dev: &mut D, alloc: DeviceAllocation) -> Vec<u8> {
    let bytes = dev.map_with(alloc, MapAccess::Read).unwrap().to_vec();
    dev.unmap(alloc).unwrap();
    bytes
}

pub fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}
