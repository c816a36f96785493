use ash::vk;
use std::{cell::UnsafeCell, marker::PhantomData, thread::ThreadId};

use crate::gpu::error::Result;

/// Thin wrapper around a Vulkan command pool.
///
/// Recycles primary command buffers and enforces single-threaded ownership.
/// The pool may move to another thread with its stream but must not be
/// shared across threads.
pub(crate) struct CommandPool {
    device: ash::Device,
    raw: vk::CommandPool,
    free: Vec<vk::CommandBuffer>,
    owner: ThreadId,
    // make !Sync
    _not_sync: PhantomData<UnsafeCell<()>>,
}

unsafe impl Send for CommandPool {}

impl CommandPool {
    pub(crate) fn new(device: ash::Device, family: u32) -> Result<Self> {
        let ci = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .build();
        let raw = unsafe { device.create_command_pool(&ci, None)? };
        Ok(Self {
            device,
            raw,
            free: Vec::new(),
            owner: std::thread::current().id(),
            _not_sync: PhantomData,
        })
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            self.owner,
            std::thread::current().id(),
            "CommandPool used from wrong thread"
        );
    }

    /// A reset primary command buffer in the recording state.
    pub(crate) fn begin(&mut self) -> Result<vk::CommandBuffer> {
        self.assert_owner();
        let cmd_buf = match self.free.pop() {
            Some(buf) => {
                unsafe {
                    self.device
                        .reset_command_buffer(buf, vk::CommandBufferResetFlags::empty())?;
                }
                buf
            }
            None => unsafe {
                self.device.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_pool(self.raw)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1)
                        .build(),
                )?[0]
            },
        };
        let begun = unsafe {
            self.device.begin_command_buffer(
                cmd_buf,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )
        };
        if let Err(res) = begun {
            self.free.push(cmd_buf);
            return Err(res.into());
        }
        Ok(cmd_buf)
    }

    /// Return a command buffer whose execution has completed.
    pub(crate) fn recycle(&mut self, cmd_buf: vk::CommandBuffer) {
        self.assert_owner();
        self.free.push(cmd_buf);
    }

    /// Destroy the underlying pool. Command buffers allocated from it
    /// become invalid.
    pub(crate) fn destroy(&mut self) {
        self.assert_owner();
        if self.raw == vk::CommandPool::null() {
            return;
        }
        unsafe {
            self.device.destroy_command_pool(self.raw, None);
        }
        self.raw = vk::CommandPool::null();
        self.free.clear();
    }
}
