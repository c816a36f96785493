use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;

use super::sink::HostSink;
use super::{lock, Shared};
use crate::gpu::cmd::CommandList;
use crate::gpu::driver::command::{replay, Command};
use crate::gpu::driver::types::{DeviceCaps, DeviceId};
use crate::gpu::error::{GpuError, Result};
use crate::gpu::Stream;

/// Progress of the worker, guarded by `Shared::timeline`.
#[derive(Debug, Default)]
pub(crate) struct Timeline {
    pub completed: u64,
    /// First replay error not yet reported at a sync point.
    pub error: Option<GpuError>,
    /// Set once and never cleared.
    pub lost: Option<String>,
}

struct Submission {
    seq: u64,
    commands: Vec<Command>,
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Submission>) {
    while let Ok(submission) = rx.recv() {
        let lost = lock(&shared.timeline).lost.is_some();
        let result = if lost {
            Ok(0)
        } else {
            let mut sink = HostSink::new(&shared);
            replay(&submission.commands, &mut sink)
        };

        let mut timeline = lock(&shared.timeline);
        match result {
            Ok(count) => {
                log::trace!("submission {} replayed {} commands", submission.seq, count)
            }
            Err(GpuError::DeviceLost(reason)) => {
                log::error!("device lost in submission {}: {}", submission.seq, reason);
                timeline.lost.get_or_insert(reason);
            }
            Err(err) => {
                log::debug!("submission {} failed: {}", submission.seq, err);
                timeline.error.get_or_insert(err);
            }
        }
        timeline.completed = submission.seq;
        drop(timeline);
        shared.progress.notify_all();
    }
    log::debug!("host worker exiting");
}

/// The single queue of a [`super::HostDevice`].
///
/// Submissions are replayed by a dedicated worker thread in submission order.
pub struct HostStream {
    device: DeviceId,
    caps: DeviceCaps,
    shared: Arc<Shared>,
    tx: Option<Sender<Submission>>,
    worker: Option<JoinHandle<()>>,
    submitted: u64,
    /// Last submission referencing each allocation id.
    last_use: HashMap<u32, u64>,
    /// Last submission binding each pipeline index.
    pipeline_use: HashMap<u32, u64>,
}

impl HostStream {
    pub(crate) fn new(device: DeviceId, caps: DeviceCaps, shared: Arc<Shared>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("dashi-host-{}", device.raw()))
            .spawn(move || worker_loop(worker_shared, rx))
            .map_err(|e| GpuError::DeviceLost(format!("failed to start host worker: {e}")))?;

        Ok(Self {
            device,
            caps,
            shared,
            tx: Some(tx),
            worker: Some(worker),
            submitted: 0,
            last_use: HashMap::new(),
            pipeline_use: HashMap::new(),
        })
    }

    /// Whether submitted work that has not finished yet references `alloc_id`.
    pub(crate) fn in_flight(&self, alloc_id: u32) -> bool {
        match self.last_use.get(&alloc_id) {
            Some(seq) => *seq > lock(&self.shared.timeline).completed,
            None => false,
        }
    }

    /// Block until every submission referencing `alloc_id` has run.
    ///
    /// Replay errors stay pending for the next sync point.
    pub(crate) fn wait_for_use(&mut self, alloc_id: u32) -> Result<()> {
        match self.last_use.remove(&alloc_id) {
            Some(seq) => self.settle(seq).map(drop),
            None => Ok(()),
        }
    }

    /// Block until every submission binding pipeline `index` has run.
    pub(crate) fn wait_for_pipeline(&mut self, index: u32) -> Result<()> {
        match self.pipeline_use.remove(&index) {
            Some(seq) => self.settle(seq).map(drop),
            None => Ok(()),
        }
    }

    fn enqueue(&mut self, cmdlist: &mut CommandList) -> Result<u64> {
        self.shared.check_lost()?;
        let commands = cmdlist.take_for_submission()?;
        let seq = self.submitted + 1;
        for cmd in &commands {
            if let Command::BindPipeline(info) = cmd {
                self.pipeline_use.insert(info.id.index, seq);
            }
            for alloc in cmd.allocations() {
                self.last_use.insert(alloc.alloc_id, seq);
            }
        }

        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| GpuError::DeviceLost("host worker has shut down".to_string()))?;
        log::trace!("submit #{} with {} commands", seq, commands.len());
        tx.send(Submission { seq, commands })
            .map_err(|_| GpuError::DeviceLost("host worker exited".to_string()))?;
        self.submitted = seq;
        Ok(seq)
    }

    /// Wait until submission `seq` has completed, leaving any pending
    /// replay error in place.
    fn settle(&self, seq: u64) -> Result<MutexGuard<'_, Timeline>> {
        let mut timeline = lock(&self.shared.timeline);
        while timeline.completed < seq && timeline.lost.is_none() {
            if self.worker.as_ref().map_or(true, |w| w.is_finished()) {
                timeline
                    .lost
                    .get_or_insert_with(|| "host worker exited".to_string());
                break;
            }
            timeline = self
                .shared
                .progress
                .wait(timeline)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        if let Some(reason) = &timeline.lost {
            return Err(GpuError::DeviceLost(reason.clone()));
        }
        Ok(timeline)
    }

    fn wait_for(&self, seq: u64) -> Result<()> {
        let mut timeline = self.settle(seq)?;
        match timeline.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Stream for HostStream {
    fn new_command_list(&mut self) -> CommandList {
        CommandList::new(self.device, self.caps)
    }

    fn submit(&mut self, cmdlist: &mut CommandList) -> Result<()> {
        self.enqueue(cmdlist).map(|_| ())
    }

    fn submit_synced(&mut self, cmdlist: &mut CommandList) -> Result<()> {
        let seq = self.enqueue(cmdlist)?;
        self.wait_for(seq)
    }

    fn command_sync(&mut self) -> Result<()> {
        self.shared.check_lost()?;
        self.wait_for(self.submitted)
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("host worker of {} panicked", self.device);
            }
        }
    }
}
