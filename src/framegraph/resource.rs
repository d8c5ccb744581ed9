use std::fmt;

use ash::vk;
use smallvec::SmallVec;

use crate::framegraph::{
    PassIndex, ResourceIndex,
    flags::{AttachmentInfoFlags, RenderGraphQueueFlags},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SizeClass {
    Absolute,
    #[default]
    SwapchainRelative,
    InputRelative,
}

/// Declared shape of a texture resource.
#[derive(Clone, PartialEq, Debug)]
pub struct AttachmentInfo {
    pub size_class: SizeClass,
    pub size_x: f32,
    pub size_y: f32,
    pub size_z: f32,
    pub format: vk::Format,
    /// Resource the size is relative to when `size_class` is `InputRelative`.
    pub size_relative_name: String,
    pub samples: u32,
    /// Zero requests the full mip chain.
    pub levels: u32,
    pub layers: u32,
    pub aux_usage: vk::ImageUsageFlags,
    pub flags: AttachmentInfoFlags,
}

impl Default for AttachmentInfo {
    fn default() -> Self {
        Self {
            size_class: SizeClass::SwapchainRelative,
            size_x: 1.0,
            size_y: 1.0,
            size_z: 0.0,
            format: vk::Format::UNDEFINED,
            size_relative_name: String::new(),
            samples: 1,
            levels: 1,
            layers: 1,
            aux_usage: vk::ImageUsageFlags::empty(),
            flags: AttachmentInfoFlags::PERSISTENT,
        }
    }
}

impl AttachmentInfo {
    pub fn new(format: vk::Format) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    pub fn absolute(mut self, width: u32, height: u32) -> Self {
        self.size_class = SizeClass::Absolute;
        self.size_x = width as f32;
        self.size_y = height as f32;
        self
    }

    pub fn swapchain_relative(mut self, scale_x: f32, scale_y: f32) -> Self {
        self.size_class = SizeClass::SwapchainRelative;
        self.size_x = scale_x;
        self.size_y = scale_y;
        self
    }

    pub fn relative_to(mut self, name: impl Into<String>, scale_x: f32, scale_y: f32) -> Self {
        self.size_class = SizeClass::InputRelative;
        self.size_relative_name = name.into();
        self.size_x = scale_x;
        self.size_y = scale_y;
        self
    }

    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    pub fn layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn aux_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.aux_usage = usage;
        self
    }

    pub fn flags(mut self, flags: AttachmentInfoFlags) -> Self {
        self.flags = flags;
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub persistent: bool,
}

impl BufferInfo {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            persistent: true,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum ResourceKind {
    Texture {
        info: AttachmentInfo,
        usage: vk::ImageUsageFlags,
    },
    Buffer {
        info: BufferInfo,
        usage: vk::BufferUsageFlags,
    },
    /// Pure synchronization token without backing memory.
    Proxy,
}

impl ResourceKind {
    pub fn texture() -> Self {
        ResourceKind::Texture {
            info: AttachmentInfo::default(),
            usage: vk::ImageUsageFlags::empty(),
        }
    }

    pub fn buffer() -> Self {
        ResourceKind::Buffer {
            info: BufferInfo::default(),
            usage: vk::BufferUsageFlags::empty(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            ResourceKind::Texture { .. } => "texture",
            ResourceKind::Buffer { .. } => "buffer",
            ResourceKind::Proxy => "proxy",
        }
    }
}

pub type PassSet = SmallVec<[PassIndex; 4]>;

/// A named resource as declared by passes, before physical assignment.
#[derive(Clone, Debug)]
pub struct LogicalResource {
    pub index: ResourceIndex,
    pub name: String,
    pub kind: ResourceKind,
    pub physical_index: Option<usize>,
    pub used_queues: RenderGraphQueueFlags,
    written_in_passes: PassSet,
    read_in_passes: PassSet,
}

impl LogicalResource {
    pub fn new(index: ResourceIndex, name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            physical_index: None,
            used_queues: RenderGraphQueueFlags::empty(),
            written_in_passes: PassSet::new(),
            read_in_passes: PassSet::new(),
        }
    }

    pub fn written_in_passes(&self) -> &[PassIndex] {
        &self.written_in_passes
    }

    pub fn read_in_passes(&self) -> &[PassIndex] {
        &self.read_in_passes
    }

    pub fn write_in_pass(&mut self, pass: PassIndex) {
        if !self.written_in_passes.contains(&pass) {
            self.written_in_passes.push(pass);
        }
    }

    pub fn read_in_pass(&mut self, pass: PassIndex) {
        if !self.read_in_passes.contains(&pass) {
            self.read_in_passes.push(pass);
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self.kind, ResourceKind::Texture { .. })
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, ResourceKind::Buffer { .. })
    }

    pub fn attachment_info(&self) -> Option<&AttachmentInfo> {
        match &self.kind {
            ResourceKind::Texture { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn buffer_info(&self) -> Option<&BufferInfo> {
        match &self.kind {
            ResourceKind::Buffer { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        match &self.kind {
            ResourceKind::Texture { usage, .. } => *usage,
            _ => vk::ImageUsageFlags::empty(),
        }
    }

    pub fn buffer_usage(&self) -> vk::BufferUsageFlags {
        match &self.kind {
            ResourceKind::Buffer { usage, .. } => *usage,
            _ => vk::BufferUsageFlags::empty(),
        }
    }

    pub(crate) fn add_image_usage(&mut self, flags: vk::ImageUsageFlags) {
        if let ResourceKind::Texture { usage, .. } = &mut self.kind {
            *usage |= flags;
        }
    }

    pub(crate) fn add_buffer_usage(&mut self, flags: vk::BufferUsageFlags) {
        if let ResourceKind::Buffer { usage, .. } = &mut self.kind {
            *usage |= flags;
        }
    }

    pub(crate) fn set_attachment_info(&mut self, attachment: &AttachmentInfo) {
        if let ResourceKind::Texture { info, .. } = &mut self.kind {
            *info = attachment.clone();
        }
    }

    pub(crate) fn set_buffer_info(&mut self, buffer: &BufferInfo) {
        if let ResourceKind::Buffer { info, .. } = &mut self.kind {
            *info = *buffer;
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SizeClass::Absolute => "Absolute",
            SizeClass::SwapchainRelative => "SwapchainRelative",
            SizeClass::InputRelative => "InputRelative",
        };
        f.write_str(s)
    }
}

impl fmt::Display for AttachmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size_class {
            SizeClass::InputRelative => write!(
                f,
                "AttachmentInfo({} * {:.2}x{:.2}, format={:?}, samples={}, levels={}, layers={})",
                self.size_relative_name,
                self.size_x,
                self.size_y,
                self.format,
                self.samples,
                self.levels,
                self.layers,
            ),
            class => write!(
                f,
                "AttachmentInfo({} {:.2}x{:.2}, format={:?}, samples={}, levels={}, layers={})",
                class, self.size_x, self.size_y, self.format, self.samples, self.levels, self.layers,
            ),
        }
    }
}
