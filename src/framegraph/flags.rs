use std::fmt;

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Logical queues a pass can be scheduled on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderGraphQueueFlags: u32 {
        const GRAPHICS = 1 << 0;
        /// Compute work recorded on the graphics queue.
        const COMPUTE = 1 << 1;
        const ASYNC_COMPUTE = 1 << 2;
        const ASYNC_GRAPHICS = 1 << 3;
    }
}

impl RenderGraphQueueFlags {
    pub const COMPUTE_QUEUES: Self = Self::COMPUTE.union(Self::ASYNC_COMPUTE);

    pub fn is_compute(self) -> bool {
        self.intersects(Self::COMPUTE_QUEUES)
    }

    pub fn is_graphics(self) -> bool {
        self.intersects(Self::GRAPHICS | Self::ASYNC_GRAPHICS)
    }

    /// The hardware queue this logical queue submits to.
    pub fn physical_queue(self) -> QueueType {
        if self.contains(Self::ASYNC_COMPUTE) {
            QueueType::AsyncCompute
        } else if self.contains(Self::ASYNC_GRAPHICS) {
            QueueType::AsyncGraphics
        } else {
            QueueType::Graphics
        }
    }

    /// Every distinct hardware queue touched by this set of logical queues.
    pub fn physical_queues(self) -> impl Iterator<Item = QueueType> {
        QueueType::ALL.into_iter().filter(move |queue| {
            self.iter()
                .any(|logical| logical.physical_queue() == *queue)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    AsyncCompute,
    AsyncGraphics,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [
        QueueType::Graphics,
        QueueType::AsyncCompute,
        QueueType::AsyncGraphics,
    ];

    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::AsyncCompute => 1,
            QueueType::AsyncGraphics => 2,
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueType::Graphics => "Graphics",
            QueueType::AsyncCompute => "AsyncCompute",
            QueueType::AsyncGraphics => "AsyncGraphics",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Declaration and bake-time flags carried by textures and their physical dimensions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttachmentInfoFlags: u32 {
        const PERSISTENT = 1 << 0;
        const UNORM_SRGB_ALIAS = 1 << 1;
        const SUPPORTS_PREROTATE = 1 << 2;
        const GENERATE_MIPS = 1 << 3;
        const INTERNAL_TRANSIENT = 1 << 16;
        const INTERNAL_PROXY = 1 << 17;
    }
}

impl AttachmentInfoFlags {
    pub const INTERNAL: Self = Self::INTERNAL_TRANSIENT.union(Self::INTERNAL_PROXY);
}

bitflags! {
    /// Depth/stencil load and store decisions of a physical render pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderPassOpFlags: u32 {
        const CLEAR_DEPTH_STENCIL = 1 << 0;
        const LOAD_DEPTH_STENCIL = 1 << 1;
        const STORE_DEPTH_STENCIL = 1 << 2;
        const DEPTH_STENCIL_READ_ONLY = 1 << 3;
    }
}

pub fn format_has_depth_or_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn surface_transform_swaps_xy(transform: vk::SurfaceTransformFlagsKHR) -> bool {
    transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90
            | vk::SurfaceTransformFlagsKHR::ROTATE_270
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_90
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_270,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_maps_to_graphics_queue() {
        assert_eq!(
            RenderGraphQueueFlags::COMPUTE.physical_queue(),
            QueueType::Graphics
        );
        assert_eq!(
            RenderGraphQueueFlags::ASYNC_COMPUTE.physical_queue(),
            QueueType::AsyncCompute
        );
    }

    #[test]
    fn physical_queues_are_deduplicated() {
        let queues = (RenderGraphQueueFlags::GRAPHICS | RenderGraphQueueFlags::COMPUTE)
            .physical_queues()
            .collect::<Vec<_>>();
        assert_eq!(queues, vec![QueueType::Graphics]);

        let queues = (RenderGraphQueueFlags::GRAPHICS | RenderGraphQueueFlags::ASYNC_COMPUTE)
            .physical_queues()
            .count();
        assert_eq!(queues, 2);
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert!(format_has_depth_or_stencil(vk::Format::D32_SFLOAT));
        assert!(!format_has_depth_or_stencil(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
