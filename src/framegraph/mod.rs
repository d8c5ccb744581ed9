//! Render graph: declare passes and resources, bake them into physical
//! passes with barriers, and schedule them every frame.

mod allocate;
mod barrier;
mod dimensions;
mod dump;
mod error;
mod event;
mod executor;
mod flags;
mod graph;
mod layouts;
mod merge;
mod pass;
mod physical;
mod render_pass;
mod resolve;
mod resource;
mod transient;
mod validate;

pub type PassIndex = usize;
pub type ResourceIndex = usize;

pub use dimensions::ResourceDimensions;
pub use error::{GraphError, GraphResult};
pub use flags::{
    AttachmentInfoFlags, QueueType, RenderGraphQueueFlags, RenderPassOpFlags,
    aspect_for_format, format_has_depth_or_stencil,
};
pub use graph::{RenderGraph, RenderGraphConfig};
pub use layouts::{ImageState, access_str, layout_str, stage_str};
pub use pass::{AccessedBuffer, AccessedProxy, AccessedTexture, LogicalPass, PassBuilder};
pub use physical::{
    AttachmentLayouts, Barrier, ColorClearRequest, DepthClearRequest, MipmapRequest,
    PassBarriers, PhysicalPass, ScaledClearRequest,
};
pub use render_pass::{DEPTH_STENCIL_ATTACHMENT, DepthStencilMode, RenderPassInfo, SubpassInfo};
pub use resource::{AttachmentInfo, BufferInfo, LogicalResource, ResourceKind, SizeClass};
