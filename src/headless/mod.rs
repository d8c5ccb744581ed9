//! In-memory [`Device`] that records instead of rendering.
//!
//! Used by the demo binary and the integration tests to observe what the
//! executor records and submits.

mod keys;

use std::any::Any;

use ash::vk;
use parking_lot::Mutex;
use slotmap::SlotMap;

pub use keys::{BufferKey, CommandBufferKey, ImageKey, SemaphoreKey};

use crate::{
    device::{
        CommandBuffer, Device, PhysicalAttachment, PipelineBarrier, RenderPassAttachment,
        RenderPassBegin, SemaphoreWait,
    },
    framegraph::{QueueType, ResourceDimensions},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachmentOps {
    pub view: vk::ImageView,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl From<&RenderPassAttachment> for AttachmentOps {
    fn from(attachment: &RenderPassAttachment) -> Self {
        Self {
            view: attachment.attachment.view,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            initial_layout: attachment.initial_layout,
            final_layout: attachment.final_layout,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    BeginRegion(String),
    EndRegion,
    Label(String),
    PipelineBarrier(PipelineBarrier),
    BeginRenderPass {
        name: String,
        extent: vk::Extent2D,
        subpasses: usize,
        color_attachments: Vec<AttachmentOps>,
        depth_stencil: Option<AttachmentOps>,
    },
    NextSubpass,
    EndRenderPass,
    ResampleAttachment {
        target: u32,
        source: vk::ImageView,
    },
    GenerateMipmaps {
        image: vk::Image,
        levels: u32,
    },
}

pub struct HeadlessCommandBuffer {
    key: CommandBufferKey,
    queue: QueueType,
    commands: Vec<Command>,
}

impl HeadlessCommandBuffer {
    pub fn key(&self) -> CommandBufferKey {
        self.key
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

impl CommandBuffer for HeadlessCommandBuffer {
    fn queue(&self) -> QueueType {
        self.queue
    }

    fn begin_region(&mut self, name: &str) {
        self.commands.push(Command::BeginRegion(name.to_string()));
    }

    fn end_region(&mut self) {
        self.commands.push(Command::EndRegion);
    }

    fn insert_label(&mut self, label: &str) {
        self.commands.push(Command::Label(label.to_string()));
    }

    fn pipeline_barrier(&mut self, barrier: &PipelineBarrier) {
        self.commands.push(Command::PipelineBarrier(barrier.clone()));
    }

    fn begin_render_pass(&mut self, info: &RenderPassBegin) {
        self.commands.push(Command::BeginRenderPass {
            name: info.name.clone(),
            extent: info.extent,
            subpasses: info.subpasses.len(),
            color_attachments: info.color_attachments.iter().map(AttachmentOps::from).collect(),
            depth_stencil: info.depth_stencil.as_ref().map(AttachmentOps::from),
        });
    }

    fn next_subpass(&mut self) {
        self.commands.push(Command::NextSubpass);
    }

    fn end_render_pass(&mut self) {
        self.commands.push(Command::EndRenderPass);
    }

    fn resample_attachment(&mut self, target: u32, source: vk::ImageView) {
        self.commands
            .push(Command::ResampleAttachment { target, source });
    }

    fn generate_mipmaps(&mut self, image: vk::Image, dimensions: &ResourceDimensions) {
        self.commands.push(Command::GenerateMipmaps {
            image,
            levels: dimensions.levels,
        });
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A recorded queue submission.
#[derive(Clone, Debug)]
pub struct Submission {
    pub queue: QueueType,
    pub commands: Vec<Command>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<vk::Semaphore>,
}

impl Submission {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|c| match c {
            Command::Label(label) => Some(label.as_str()),
            _ => None,
        })
    }

    pub fn barriers(&self) -> impl Iterator<Item = &PipelineBarrier> {
        self.commands.iter().filter_map(|c| match c {
            Command::PipelineBarrier(barrier) => Some(barrier),
            _ => None,
        })
    }
}

#[derive(Default)]
struct State {
    images: SlotMap<ImageKey, ResourceDimensions>,
    buffers: SlotMap<BufferKey, ResourceDimensions>,
    semaphores: SlotMap<SemaphoreKey, ()>,
    command_buffers: SlotMap<CommandBufferKey, QueueType>,
    transients: Vec<(ResourceDimensions, PhysicalAttachment)>,
    submissions: Vec<Submission>,
    fail_submissions: bool,
}

#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `submit` fail, as a lost device would.
    pub fn set_fail_submissions(&self, fail: bool) {
        self.state.lock().fail_submissions = fail;
    }

    /// An image standing in for the presentable image of this frame.
    pub fn swapchain_image(&self, dimensions: &ResourceDimensions) -> PhysicalAttachment {
        let key = self.state.lock().images.insert(dimensions.clone());
        PhysicalAttachment {
            image: keys::image(key),
            view: keys::image_view(key),
        }
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn take_submissions(&self) -> Vec<Submission> {
        std::mem::take(&mut self.state.lock().submissions)
    }
}

impl Device for HeadlessDevice {
    fn create_image(&self, dimensions: &ResourceDimensions) -> anyhow::Result<PhysicalAttachment> {
        if dimensions.width == 0 || dimensions.height == 0 {
            anyhow::bail!("image {} has an empty extent", dimensions.name);
        }
        let key = self.state.lock().images.insert(dimensions.clone());
        log::trace!("Headless image {:?} for {}", key, dimensions);
        Ok(PhysicalAttachment {
            image: keys::image(key),
            view: keys::image_view(key),
        })
    }

    fn create_buffer(&self, dimensions: &ResourceDimensions) -> anyhow::Result<vk::Buffer> {
        let key = self.state.lock().buffers.insert(dimensions.clone());
        log::trace!("Headless buffer {:?} for {}", key, dimensions);
        Ok(keys::buffer(key))
    }

    fn transient_attachment(
        &self,
        dimensions: &ResourceDimensions,
    ) -> anyhow::Result<PhysicalAttachment> {
        let mut state = self.state.lock();
        if let Some((_, attachment)) = state.transients.iter().find(|(d, _)| d == dimensions) {
            return Ok(*attachment);
        }
        let key = state.images.insert(dimensions.clone());
        let attachment = PhysicalAttachment {
            image: keys::image(key),
            view: keys::image_view(key),
        };
        state.transients.push((dimensions.clone(), attachment));
        Ok(attachment)
    }

    fn request_semaphore(&self) -> anyhow::Result<vk::Semaphore> {
        let key = self.state.lock().semaphores.insert(());
        Ok(keys::semaphore(key))
    }

    fn request_command_buffer(&self, queue: QueueType) -> anyhow::Result<Box<dyn CommandBuffer>> {
        let key = self.state.lock().command_buffers.insert(queue);
        Ok(Box::new(HeadlessCommandBuffer {
            key,
            queue,
            commands: Vec::new(),
        }))
    }

    fn submit(
        &self,
        cmd: Box<dyn CommandBuffer>,
        waits: &[SemaphoreWait],
        signals: &[vk::Semaphore],
    ) -> anyhow::Result<()> {
        let cmd = cmd
            .into_any()
            .downcast::<HeadlessCommandBuffer>()
            .map_err(|_| anyhow::anyhow!("command buffer was not allocated by the headless device"))?;

        let mut state = self.state.lock();
        state.command_buffers.remove(cmd.key);
        if state.fail_submissions {
            anyhow::bail!("device lost while submitting to the {} queue", cmd.queue);
        }
        log::trace!(
            "Headless submit on {}: {} commands, {} waits, {} signals",
            cmd.queue,
            cmd.commands.len(),
            waits.len(),
            signals.len()
        );
        state.submissions.push(Submission {
            queue: cmd.queue,
            commands: cmd.commands,
            waits: waits.to_vec(),
            signals: signals.to_vec(),
        });
        Ok(())
    }
}
