use std::any::Any;

use ash::vk;

use crate::framegraph::{QueueType, ResourceDimensions, SubpassInfo};

/// An image and the view render passes bind it through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysicalAttachment {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stages: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub levels: u32,
    pub layers: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageBarrier {
    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: self.aspect,
                base_mip_level: 0,
                level_count: self.levels,
                base_array_layer: 0,
                layer_count: self.layers,
            })
            .src_stage_mask(self.src_stages)
            .src_access_mask(self.src_access)
            .old_layout(self.old_layout)
            .dst_stage_mask(self.dst_stages)
            .dst_access_mask(self.dst_access)
            .new_layout(self.new_layout)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub src_stages: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BufferBarrier {
    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .src_stage_mask(self.src_stages)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stages)
            .dst_access_mask(self.dst_access)
    }
}

/// One `vkCmdPipelineBarrier2` worth of synchronization.
///
/// `src_stages`/`dst_stages` form an execution-only dependency used for
/// resources without memory, such as proxies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineBarrier {
    pub src_stages: vk::PipelineStageFlags2,
    pub dst_stages: vk::PipelineStageFlags2,
    pub images: Vec<ImageBarrier>,
    pub buffers: Vec<BufferBarrier>,
}

impl PipelineBarrier {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty() && self.src_stages.is_empty()
    }

    pub fn memory_barrier(&self) -> Option<vk::MemoryBarrier2<'static>> {
        (!self.src_stages.is_empty()).then(|| {
            vk::MemoryBarrier2::default()
                .src_stage_mask(self.src_stages)
                .dst_stage_mask(self.dst_stages)
        })
    }
}

#[derive(Clone, Copy)]
pub struct RenderPassAttachment {
    pub attachment: PhysicalAttachment,
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub clear: Option<vk::ClearValue>,
}

#[derive(Clone)]
pub struct RenderPassBegin {
    pub name: String,
    pub extent: vk::Extent2D,
    pub color_attachments: Vec<RenderPassAttachment>,
    pub depth_stencil: Option<RenderPassAttachment>,
    pub subpasses: Vec<SubpassInfo>,
}

/// Command recording seam. Implemented by the GPU backend and by
/// [`crate::headless::HeadlessCommandBuffer`].
pub trait CommandBuffer: Send {
    fn queue(&self) -> QueueType;
    fn begin_region(&mut self, name: &str);
    fn end_region(&mut self);
    /// Single debug label, the way a pass callback marks its work.
    fn insert_label(&mut self, label: &str);
    fn pipeline_barrier(&mut self, barrier: &PipelineBarrier);
    fn begin_render_pass(&mut self, info: &RenderPassBegin);
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);
    /// Fills color attachment `target` of the current subpass by sampling `source`.
    fn resample_attachment(&mut self, target: u32, source: vk::ImageView);
    /// Fills levels 1.. of `image` from level 0, which is in
    /// `TRANSFER_SRC_OPTIMAL`. Leaves every level in `TRANSFER_SRC_OPTIMAL`.
    fn generate_mipmaps(&mut self, image: vk::Image, dimensions: &ResourceDimensions);
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// GPU object layer the render graph allocates and submits through.
pub trait Device: Send + Sync {
    fn create_image(&self, dimensions: &ResourceDimensions) -> anyhow::Result<PhysicalAttachment>;
    fn create_buffer(&self, dimensions: &ResourceDimensions) -> anyhow::Result<vk::Buffer>;
    /// Tile-memory attachment, possibly shared with other transients of the same shape.
    fn transient_attachment(
        &self,
        dimensions: &ResourceDimensions,
    ) -> anyhow::Result<PhysicalAttachment>;
    fn request_semaphore(&self) -> anyhow::Result<vk::Semaphore>;
    fn request_command_buffer(&self, queue: QueueType) -> anyhow::Result<Box<dyn CommandBuffer>>;
    fn submit(
        &self,
        cmd: Box<dyn CommandBuffer>,
        waits: &[SemaphoreWait],
        signals: &[vk::Semaphore],
    ) -> anyhow::Result<()>;
}
