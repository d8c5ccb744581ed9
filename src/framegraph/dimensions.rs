use std::fmt;

use ash::vk;

use crate::framegraph::{
    RenderGraph,
    error::{GraphError, GraphResult},
    flags::{
        AttachmentInfoFlags, QueueType, RenderGraphQueueFlags, format_has_depth_or_stencil,
        surface_transform_swaps_xy,
    },
    resource::{BufferInfo, LogicalResource, ResourceKind, SizeClass},
};

/// Fully resolved shape of one physical resource.
#[derive(Clone, Debug)]
pub struct ResourceDimensions {
    pub format: vk::Format,
    pub buffer_info: BufferInfo,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layers: u32,
    pub levels: u32,
    pub samples: u32,
    pub flags: AttachmentInfoFlags,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub queues: RenderGraphQueueFlags,
    pub image_usage: vk::ImageUsageFlags,
    pub name: String,
}

impl Default for ResourceDimensions {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            buffer_info: BufferInfo::default(),
            width: 0,
            height: 0,
            depth: 1,
            layers: 1,
            levels: 1,
            samples: 1,
            flags: AttachmentInfoFlags::empty(),
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            queues: RenderGraphQueueFlags::empty(),
            image_usage: vk::ImageUsageFlags::empty(),
            name: String::new(),
        }
    }
}

impl ResourceDimensions {
    /// Swapchain-shaped dimensions, as handed to `set_backbuffer_dimensions`.
    /// Swapchain images are persistent.
    pub fn swapchain(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            flags: AttachmentInfoFlags::PERSISTENT,
            ..Default::default()
        }
    }

    pub fn transform(mut self, transform: vk::SurfaceTransformFlagsKHR) -> Self {
        self.transform = transform;
        self
    }

    pub fn is_storage_image(&self) -> bool {
        self.image_usage.contains(vk::ImageUsageFlags::STORAGE)
    }

    pub fn is_buffer(&self) -> bool {
        self.buffer_info.size != 0 || !self.buffer_info.usage.is_empty()
    }

    pub fn is_proxy(&self) -> bool {
        self.flags.contains(AttachmentInfoFlags::INTERNAL_PROXY)
    }

    /// Resources that can never live in tile memory.
    pub fn is_buffer_like(&self) -> bool {
        self.is_storage_image() || self.is_buffer() || self.is_proxy()
    }

    pub fn is_transient(&self) -> bool {
        self.flags.contains(AttachmentInfoFlags::INTERNAL_TRANSIENT)
    }

    /// Color outputs with a mip chain get their lower levels generated after the pass.
    pub fn generates_mips(&self) -> bool {
        self.levels > 1 && self.flags.contains(AttachmentInfoFlags::GENERATE_MIPS)
    }

    pub fn is_depth_stencil(&self) -> bool {
        format_has_depth_or_stencil(self.format)
    }

    /// True when the resource crosses hardware queues and must be synchronized
    /// with semaphores.
    pub fn uses_semaphore(&self) -> bool {
        if self.is_proxy() {
            return true;
        }
        self.physical_queues().count() > 1
    }

    pub fn physical_queues(&self) -> impl Iterator<Item = QueueType> {
        self.queues.physical_queues()
    }

    /// Compares what an in-place read-modify-write must preserve: size for
    /// buffers, format and extent for images. Usage unions are ignored.
    pub fn same_shape(&self, other: &Self) -> bool {
        if self.is_buffer() || other.is_buffer() {
            return self.is_buffer() == other.is_buffer()
                && self.buffer_info.size == other.buffer_info.size
                && self.buffer_info.persistent == other.buffer_info.persistent;
        }
        self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && self.depth == other.depth
            && self.layers == other.layers
            && self.levels == other.levels
            && self.samples == other.samples
    }

    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width,
            height: self.height,
            depth: self.depth,
        }
    }
}

/// Equality covers the shape of the resource only. Usage, queues and the
/// debug name are accumulated state and do not make two resources different.
impl PartialEq for ResourceDimensions {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
            && self.width == other.width
            && self.height == other.height
            && self.depth == other.depth
            && self.layers == other.layers
            && self.levels == other.levels
            && self.samples == other.samples
            && self.buffer_info == other.buffer_info
            && self.flags == other.flags
            && self.transform == other.transform
    }
}

impl fmt::Display for ResourceDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_buffer() {
            write!(
                f,
                "Buffer({}, size={}, usage={:?})",
                self.name, self.buffer_info.size, self.buffer_info.usage
            )
        } else if self.is_proxy() {
            write!(f, "Proxy({})", self.name)
        } else {
            write!(
                f,
                "Image({}, {}x{}x{}, format={:?}, levels={}, layers={}, samples={}, usage={:?})",
                self.name,
                self.width,
                self.height,
                self.depth,
                self.format,
                self.levels,
                self.layers,
                self.samples,
                self.image_usage,
            )
        }
    }
}

fn mip_levels(width: u32, height: u32, depth: u32) -> u32 {
    let max_dim = width.max(height).max(depth);
    u32::BITS - max_dim.leading_zeros()
}

impl RenderGraph {
    /// Resolves the concrete shape of a logical resource.
    pub fn resource_dimensions(&self, resource: &LogicalResource) -> GraphResult<ResourceDimensions> {
        let mut visiting = Vec::new();
        self.resolve_dimensions(resource, &mut visiting)
    }

    fn resolve_dimensions(
        &self,
        resource: &LogicalResource,
        visiting: &mut Vec<usize>,
    ) -> GraphResult<ResourceDimensions> {
        let swapchain = &self.swapchain_dimensions;
        let (info, usage) = match &resource.kind {
            ResourceKind::Buffer { info, usage } => {
                let mut buffer_info = *info;
                buffer_info.usage |= *usage;
                return Ok(ResourceDimensions {
                    buffer_info,
                    queues: resource.used_queues,
                    name: resource.name.clone(),
                    ..Default::default()
                });
            }
            ResourceKind::Proxy => {
                return Ok(ResourceDimensions {
                    flags: AttachmentInfoFlags::INTERNAL_PROXY,
                    queues: resource.used_queues,
                    name: resource.name.clone(),
                    ..Default::default()
                });
            }
            ResourceKind::Texture { info, usage } => (info, *usage),
        };

        let mut dim = ResourceDimensions {
            format: info.format,
            layers: info.layers.max(1),
            samples: info.samples.max(1),
            flags: info.flags
                & !(AttachmentInfoFlags::SUPPORTS_PREROTATE | AttachmentInfoFlags::INTERNAL_TRANSIENT),
            queues: resource.used_queues,
            image_usage: info.aux_usage | usage,
            name: resource.name.clone(),
            ..Default::default()
        };

        match info.size_class {
            SizeClass::SwapchainRelative => {
                dim.width = ((info.size_x * swapchain.width as f32).ceil() as u32).max(1);
                dim.height = ((info.size_y * swapchain.height as f32).ceil() as u32).max(1);
                dim.depth = (info.size_z.ceil() as u32).max(1);
                if info.flags.contains(AttachmentInfoFlags::SUPPORTS_PREROTATE) {
                    dim.transform = swapchain.transform;
                    if surface_transform_swaps_xy(swapchain.transform) {
                        std::mem::swap(&mut dim.width, &mut dim.height);
                    }
                }
            }
            SizeClass::Absolute => {
                dim.width = (info.size_x as u32).max(1);
                dim.height = (info.size_y as u32).max(1);
                dim.depth = (info.size_z as u32).max(1);
            }
            SizeClass::InputRelative => {
                let input = self
                    .find_resource(&info.size_relative_name)
                    .ok_or_else(|| GraphError::UnknownResource(info.size_relative_name.clone()))?;
                if input.index == resource.index || visiting.contains(&input.index) {
                    return Err(GraphError::RelativeSizeCycle(resource.name.clone()));
                }
                visiting.push(resource.index);
                let input_dim = self.resolve_dimensions(input, visiting)?;
                visiting.pop();

                dim.width = ((input_dim.width as f32 * info.size_x).ceil() as u32).max(1);
                dim.height = ((input_dim.height as f32 * info.size_y).ceil() as u32).max(1);
                dim.depth = ((input_dim.depth as f32 * info.size_z).ceil() as u32).max(1);
                dim.transform = input_dim.transform;
            }
        }

        if dim.format == vk::Format::UNDEFINED {
            dim.format = swapchain.format;
        }

        let levels = if info.levels == 0 { u32::MAX } else { info.levels };
        dim.levels = mip_levels(dim.width, dim.height, dim.depth).min(levels);
        Ok(dim)
    }
}
