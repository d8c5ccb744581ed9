use ash::vk;

use crate::{
    device::CommandBuffer,
    framegraph::{
        PassIndex, RenderGraph, ResourceIndex,
        flags::RenderGraphQueueFlags,
        resource::{AttachmentInfo, BufferInfo},
    },
};

pub type BuildRenderPassFn = Box<dyn Fn(&mut dyn CommandBuffer) -> anyhow::Result<()> + Send + Sync>;
pub type ClearColorFn = Box<dyn Fn(usize) -> Option<vk::ClearColorValue> + Send + Sync>;
pub type ClearDepthStencilFn = Box<dyn Fn() -> Option<vk::ClearDepthStencilValue> + Send + Sync>;
pub type NeedRenderPassFn = Box<dyn Fn() -> bool + Send + Sync>;
pub type SetupDependenciesFn = Box<dyn FnMut(&mut PassBuilder<'_>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessedTexture {
    pub texture: ResourceIndex,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub stages: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessedBuffer {
    pub buffer: ResourceIndex,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
    pub stages: vk::PipelineStageFlags2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessedProxy {
    pub proxy: ResourceIndex,
    pub layout: vk::ImageLayout,
    pub stages: vk::PipelineStageFlags2,
}

/// One declared unit of GPU work and every resource role it plays.
///
/// Input lists that pair with an output list (color, storage, blit and
/// storage texture) hold `None` where the output has no read-modify-write input.
pub struct LogicalPass {
    pub(crate) index: PassIndex,
    pub(crate) name: String,
    pub(crate) queue: RenderGraphQueueFlags,
    pub(crate) physical_pass: Option<usize>,

    pub(crate) color_outputs: Vec<ResourceIndex>,
    pub(crate) resolve_outputs: Vec<ResourceIndex>,
    pub(crate) color_inputs: Vec<Option<ResourceIndex>>,
    pub(crate) color_scale_inputs: Vec<Option<ResourceIndex>>,
    pub(crate) storage_outputs: Vec<ResourceIndex>,
    pub(crate) storage_inputs: Vec<Option<ResourceIndex>>,
    pub(crate) storage_texture_outputs: Vec<ResourceIndex>,
    pub(crate) storage_texture_inputs: Vec<Option<ResourceIndex>>,
    pub(crate) blit_texture_outputs: Vec<ResourceIndex>,
    pub(crate) blit_texture_inputs: Vec<Option<ResourceIndex>>,
    pub(crate) attachment_inputs: Vec<ResourceIndex>,
    pub(crate) history_inputs: Vec<ResourceIndex>,
    pub(crate) generic_textures: Vec<AccessedTexture>,
    pub(crate) generic_buffers: Vec<AccessedBuffer>,
    pub(crate) proxy_inputs: Vec<AccessedProxy>,
    pub(crate) proxy_outputs: Vec<AccessedProxy>,
    pub(crate) depth_stencil_input: Option<ResourceIndex>,
    pub(crate) depth_stencil_output: Option<ResourceIndex>,
    pub(crate) fake_resource_aliases: Vec<(ResourceIndex, ResourceIndex)>,

    pub(crate) build_render_pass: Option<BuildRenderPassFn>,
    pub(crate) clear_color: Option<ClearColorFn>,
    pub(crate) clear_depth_stencil: Option<ClearDepthStencilFn>,
    pub(crate) need_render_pass: Option<NeedRenderPassFn>,
    pub(crate) setup_dependencies: Option<SetupDependenciesFn>,
}

impl LogicalPass {
    pub(crate) fn new(index: PassIndex, name: impl Into<String>, queue: RenderGraphQueueFlags) -> Self {
        Self {
            index,
            name: name.into(),
            queue,
            physical_pass: None,
            color_outputs: Vec::new(),
            resolve_outputs: Vec::new(),
            color_inputs: Vec::new(),
            color_scale_inputs: Vec::new(),
            storage_outputs: Vec::new(),
            storage_inputs: Vec::new(),
            storage_texture_outputs: Vec::new(),
            storage_texture_inputs: Vec::new(),
            blit_texture_outputs: Vec::new(),
            blit_texture_inputs: Vec::new(),
            attachment_inputs: Vec::new(),
            history_inputs: Vec::new(),
            generic_textures: Vec::new(),
            generic_buffers: Vec::new(),
            proxy_inputs: Vec::new(),
            proxy_outputs: Vec::new(),
            depth_stencil_input: None,
            depth_stencil_output: None,
            fake_resource_aliases: Vec::new(),
            build_render_pass: None,
            clear_color: None,
            clear_depth_stencil: None,
            need_render_pass: None,
            setup_dependencies: None,
        }
    }

    pub fn index(&self) -> PassIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> RenderGraphQueueFlags {
        self.queue
    }

    /// Physical pass this pass was merged into by the last successful bake.
    pub fn physical_pass_index(&self) -> Option<usize> {
        self.physical_pass
    }

    pub fn color_outputs(&self) -> &[ResourceIndex] {
        &self.color_outputs
    }

    pub fn color_inputs(&self) -> &[Option<ResourceIndex>] {
        &self.color_inputs
    }

    pub fn color_scale_inputs(&self) -> &[Option<ResourceIndex>] {
        &self.color_scale_inputs
    }

    pub fn resolve_outputs(&self) -> &[ResourceIndex] {
        &self.resolve_outputs
    }

    pub fn storage_outputs(&self) -> &[ResourceIndex] {
        &self.storage_outputs
    }

    pub fn storage_inputs(&self) -> &[Option<ResourceIndex>] {
        &self.storage_inputs
    }

    pub fn storage_texture_outputs(&self) -> &[ResourceIndex] {
        &self.storage_texture_outputs
    }

    pub fn storage_texture_inputs(&self) -> &[Option<ResourceIndex>] {
        &self.storage_texture_inputs
    }

    pub fn blit_texture_outputs(&self) -> &[ResourceIndex] {
        &self.blit_texture_outputs
    }

    pub fn blit_texture_inputs(&self) -> &[Option<ResourceIndex>] {
        &self.blit_texture_inputs
    }

    pub fn attachment_inputs(&self) -> &[ResourceIndex] {
        &self.attachment_inputs
    }

    pub fn history_inputs(&self) -> &[ResourceIndex] {
        &self.history_inputs
    }

    pub fn generic_texture_inputs(&self) -> &[AccessedTexture] {
        &self.generic_textures
    }

    pub fn generic_buffer_inputs(&self) -> &[AccessedBuffer] {
        &self.generic_buffers
    }

    pub fn proxy_inputs(&self) -> &[AccessedProxy] {
        &self.proxy_inputs
    }

    pub fn proxy_outputs(&self) -> &[AccessedProxy] {
        &self.proxy_outputs
    }

    pub fn depth_stencil_input(&self) -> Option<ResourceIndex> {
        self.depth_stencil_input
    }

    pub fn depth_stencil_output(&self) -> Option<ResourceIndex> {
        self.depth_stencil_output
    }

    pub fn fake_resource_aliases(&self) -> &[(ResourceIndex, ResourceIndex)] {
        &self.fake_resource_aliases
    }

    pub fn has_attachments(&self) -> bool {
        !self.color_outputs.is_empty()
            || !self.resolve_outputs.is_empty()
            || !self.attachment_inputs.is_empty()
            || self.depth_stencil_input.is_some()
            || self.depth_stencil_output.is_some()
    }

    pub fn need_render_pass(&self) -> bool {
        self.need_render_pass.as_ref().is_none_or(|need| need())
    }

    pub fn clear_color_value(&self, index: usize) -> Option<vk::ClearColorValue> {
        self.clear_color.as_ref().and_then(|clear| clear(index))
    }

    pub fn clear_depth_stencil_value(&self) -> Option<vk::ClearDepthStencilValue> {
        self.clear_depth_stencil.as_ref().and_then(|clear| clear())
    }

    pub fn build_render_pass(&self, cmd: &mut dyn CommandBuffer) -> anyhow::Result<()> {
        match &self.build_render_pass {
            Some(build) => build(cmd),
            None => Ok(()),
        }
    }

    /// Stages a shader access of this pass runs in.
    pub(crate) fn shader_stages(&self) -> vk::PipelineStageFlags2 {
        if self.queue.is_compute() {
            vk::PipelineStageFlags2::COMPUTE_SHADER
        } else {
            vk::PipelineStageFlags2::FRAGMENT_SHADER
        }
    }
}

/// Declares resource roles on one pass of a [`RenderGraph`].
///
/// Misuse that can only be detected once the whole graph is known, such as a
/// name used both as a buffer and a texture, is recorded and reported by
/// [`RenderGraph::bake`].
pub struct PassBuilder<'g> {
    pub(crate) graph: &'g mut RenderGraph,
    pub(crate) pass: PassIndex,
}

impl<'g> PassBuilder<'g> {
    pub fn index(&self) -> PassIndex {
        self.pass
    }

    pub fn graph(&mut self) -> &mut RenderGraph {
        &mut *self.graph
    }

    fn pass_mut(&mut self) -> &mut LogicalPass {
        &mut self.graph.passes[self.pass]
    }

    fn queue(&self) -> RenderGraphQueueFlags {
        self.graph.passes[self.pass].queue
    }

    fn shader_stages(&self) -> vk::PipelineStageFlags2 {
        self.graph.passes[self.pass].shader_stages()
    }

    fn read_texture(&mut self, name: &str, usage: vk::ImageUsageFlags) -> ResourceIndex {
        let pass = self.pass;
        let queue = self.queue();
        let index = self.graph.get_texture_resource(name);
        let resource = &mut self.graph.resources[index];
        resource.read_in_pass(pass);
        resource.add_image_usage(usage);
        resource.used_queues |= queue;
        index
    }

    fn write_texture(&mut self, name: &str, info: &AttachmentInfo, usage: vk::ImageUsageFlags) -> ResourceIndex {
        let pass = self.pass;
        let queue = self.queue();
        let index = self.graph.get_texture_resource(name);
        let resource = &mut self.graph.resources[index];
        resource.write_in_pass(pass);
        resource.set_attachment_info(info);
        resource.add_image_usage(usage);
        resource.used_queues |= queue;
        index
    }

    fn read_buffer(&mut self, name: &str, usage: vk::BufferUsageFlags) -> ResourceIndex {
        let pass = self.pass;
        let queue = self.queue();
        let index = self.graph.get_buffer_resource(name);
        let resource = &mut self.graph.resources[index];
        resource.read_in_pass(pass);
        resource.add_buffer_usage(usage);
        resource.used_queues |= queue;
        index
    }

    fn optional_input(
        &mut self,
        input: Option<&str>,
        usage: vk::ImageUsageFlags,
    ) -> Option<ResourceIndex> {
        input.map(|name| self.read_texture(name, usage))
    }

    pub fn add_color_output(
        &mut self,
        name: &str,
        info: &AttachmentInfo,
        input: Option<&str>,
    ) -> &mut Self {
        let output = self.write_texture(name, info, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let input = self.optional_input(input, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        let pass = self.pass_mut();
        pass.color_outputs.push(output);
        pass.color_inputs.push(input);
        pass.color_scale_inputs.push(None);
        self
    }

    pub fn add_resolve_output(&mut self, name: &str, info: &AttachmentInfo) -> &mut Self {
        let output = self.write_texture(name, info, vk::ImageUsageFlags::COLOR_ATTACHMENT);
        self.pass_mut().resolve_outputs.push(output);
        self
    }

    pub fn add_depth_stencil_output(&mut self, name: &str, info: &AttachmentInfo) -> &mut Self {
        let output = self.write_texture(name, info, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        self.pass_mut().depth_stencil_output = Some(output);
        self
    }

    pub fn add_depth_stencil_input(&mut self, name: &str) -> &mut Self {
        let input = self.read_texture(name, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        self.pass_mut().depth_stencil_input = Some(input);
        self
    }

    pub fn add_attachment_input(&mut self, name: &str) -> &mut Self {
        let input = self.read_texture(name, vk::ImageUsageFlags::INPUT_ATTACHMENT);
        self.pass_mut().attachment_inputs.push(input);
        self
    }

    /// Reads the previous frame's contents of `name`.
    pub fn add_history_input(&mut self, name: &str) -> &mut Self {
        let queue = self.queue();
        let index = self.graph.get_texture_resource(name);
        let resource = &mut self.graph.resources[index];
        // History reads do not count as reads of the current frame.
        resource.add_image_usage(vk::ImageUsageFlags::SAMPLED);
        resource.used_queues |= queue;
        self.pass_mut().history_inputs.push(index);
        self
    }

    /// Sampled read in the pass's shader stages, or `stages` when given.
    pub fn add_texture_input(&mut self, name: &str, stages: Option<vk::PipelineStageFlags2>) -> &mut Self {
        let stages = stages.unwrap_or_else(|| self.shader_stages());
        self.add_generic_texture_input(
            name,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            stages,
            vk::ImageUsageFlags::SAMPLED,
        )
    }

    pub fn add_blit_texture_read_only_input(&mut self, name: &str) -> &mut Self {
        self.add_generic_texture_input(
            name,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags2::TRANSFER_READ,
            vk::PipelineStageFlags2::TRANSFER,
            vk::ImageUsageFlags::TRANSFER_SRC,
        )
    }

    pub fn add_generic_texture_input(
        &mut self,
        name: &str,
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        stages: vk::PipelineStageFlags2,
        usage: vk::ImageUsageFlags,
    ) -> &mut Self {
        let texture = self.read_texture(name, usage);
        let pass = self.pass_mut();
        match pass.generic_textures.iter_mut().find(|t| t.texture == texture) {
            Some(existing) => {
                existing.access |= access;
                existing.stages |= stages;
                if existing.layout != layout {
                    existing.layout = vk::ImageLayout::GENERAL;
                }
            }
            None => pass.generic_textures.push(AccessedTexture {
                texture,
                layout,
                access,
                stages,
            }),
        }
        self
    }

    pub fn add_blit_texture_output(
        &mut self,
        name: &str,
        info: &AttachmentInfo,
        input: Option<&str>,
    ) -> &mut Self {
        let output = self.write_texture(name, info, vk::ImageUsageFlags::TRANSFER_DST);
        let input = self.optional_input(input, vk::ImageUsageFlags::TRANSFER_DST);
        let pass = self.pass_mut();
        pass.blit_texture_outputs.push(output);
        pass.blit_texture_inputs.push(input);
        self
    }

    pub fn add_storage_texture_output(
        &mut self,
        name: &str,
        info: &AttachmentInfo,
        input: Option<&str>,
    ) -> &mut Self {
        let output = self.write_texture(name, info, vk::ImageUsageFlags::STORAGE);
        let input = self.optional_input(input, vk::ImageUsageFlags::STORAGE);
        let pass = self.pass_mut();
        pass.storage_texture_outputs.push(output);
        pass.storage_texture_inputs.push(input);
        self
    }

    pub fn add_storage_output(
        &mut self,
        name: &str,
        info: &BufferInfo,
        input: Option<&str>,
    ) -> &mut Self {
        let pass = self.pass;
        let queue = self.queue();
        let output = self.graph.get_buffer_resource(name);
        let resource = &mut self.graph.resources[output];
        resource.write_in_pass(pass);
        resource.set_buffer_info(info);
        resource.add_buffer_usage(vk::BufferUsageFlags::STORAGE_BUFFER);
        resource.used_queues |= queue;

        let input = input.map(|name| self.read_buffer(name, vk::BufferUsageFlags::STORAGE_BUFFER));
        let pass = self.pass_mut();
        pass.storage_outputs.push(output);
        pass.storage_inputs.push(input);
        self
    }

    pub fn add_storage_read_only_input(&mut self, name: &str, stages: Option<vk::PipelineStageFlags2>) -> &mut Self {
        let stages = stages.unwrap_or_else(|| self.shader_stages());
        self.add_generic_buffer_input(
            name,
            vk::AccessFlags2::SHADER_STORAGE_READ,
            stages,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )
    }

    pub fn add_uniform_input(&mut self, name: &str, stages: Option<vk::PipelineStageFlags2>) -> &mut Self {
        let stages = stages.unwrap_or_else(|| self.shader_stages());
        self.add_generic_buffer_input(
            name,
            vk::AccessFlags2::UNIFORM_READ,
            stages,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )
    }

    pub fn add_vertex_buffer_input(&mut self, name: &str) -> &mut Self {
        self.add_generic_buffer_input(
            name,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
    }

    pub fn add_index_buffer_input(&mut self, name: &str) -> &mut Self {
        self.add_generic_buffer_input(
            name,
            vk::AccessFlags2::INDEX_READ,
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
    }

    pub fn add_indirect_buffer_input(&mut self, name: &str) -> &mut Self {
        self.add_generic_buffer_input(
            name,
            vk::AccessFlags2::INDIRECT_COMMAND_READ,
            vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
        )
    }

    pub fn add_generic_buffer_input(
        &mut self,
        name: &str,
        access: vk::AccessFlags2,
        stages: vk::PipelineStageFlags2,
        usage: vk::BufferUsageFlags,
    ) -> &mut Self {
        let buffer = self.read_buffer(name, usage);
        let pass = self.pass_mut();
        match pass.generic_buffers.iter_mut().find(|b| b.buffer == buffer) {
            Some(existing) => {
                existing.access |= access;
                existing.stages |= stages;
            }
            None => pass.generic_buffers.push(AccessedBuffer {
                buffer,
                layout: vk::ImageLayout::GENERAL,
                access,
                stages,
            }),
        }
        self
    }

    pub fn add_proxy_output(&mut self, name: &str, stages: vk::PipelineStageFlags2) -> &mut Self {
        let pass = self.pass;
        let queue = self.queue();
        let proxy = self.graph.get_proxy_resource(name);
        let resource = &mut self.graph.resources[proxy];
        resource.write_in_pass(pass);
        resource.used_queues |= queue;
        self.pass_mut().proxy_outputs.push(AccessedProxy {
            proxy,
            layout: vk::ImageLayout::GENERAL,
            stages,
        });
        self
    }

    pub fn add_proxy_input(&mut self, name: &str, stages: vk::PipelineStageFlags2) -> &mut Self {
        let pass = self.pass;
        let queue = self.queue();
        let proxy = self.graph.get_proxy_resource(name);
        let resource = &mut self.graph.resources[proxy];
        resource.read_in_pass(pass);
        resource.used_queues |= queue;
        self.pass_mut().proxy_inputs.push(AccessedProxy {
            proxy,
            layout: vk::ImageLayout::GENERAL,
            stages,
        });
        self
    }

    /// Declares `to` as a new name for the contents of `from` after this pass,
    /// sharing the same physical resource.
    pub fn add_fake_resource_write_alias(&mut self, from: &str, to: &str) -> &mut Self {
        let pass = self.pass;
        let queue = self.queue();
        let from = self.graph.get_texture_resource(from);
        let to = self.graph.get_texture_resource(to);

        let source = &mut self.graph.resources[from];
        source.read_in_pass(pass);
        source.used_queues |= queue;
        let kind = source.kind.clone();

        let alias = &mut self.graph.resources[to];
        if alias.is_texture() {
            alias.kind = kind;
        }
        alias.write_in_pass(pass);
        alias.used_queues |= queue;

        self.pass_mut().fake_resource_aliases.push((from, to));
        self
    }

    pub fn set_build_render_pass(
        &mut self,
        build: impl Fn(&mut dyn CommandBuffer) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> &mut Self {
        self.pass_mut().build_render_pass = Some(Box::new(build));
        self
    }

    pub fn set_get_clear_color(
        &mut self,
        clear: impl Fn(usize) -> Option<vk::ClearColorValue> + Send + Sync + 'static,
    ) -> &mut Self {
        self.pass_mut().clear_color = Some(Box::new(clear));
        self
    }

    pub fn set_get_clear_depth_stencil(
        &mut self,
        clear: impl Fn() -> Option<vk::ClearDepthStencilValue> + Send + Sync + 'static,
    ) -> &mut Self {
        self.pass_mut().clear_depth_stencil = Some(Box::new(clear));
        self
    }

    pub fn set_need_render_pass(&mut self, need: impl Fn() -> bool + Send + Sync + 'static) -> &mut Self {
        self.pass_mut().need_render_pass = Some(Box::new(need));
        self
    }

    /// Runs once, at the start of the first bake after it is set, so a pass
    /// can add roles that depend on the rest of the graph.
    pub fn set_setup_dependencies(
        &mut self,
        setup: impl FnMut(&mut PassBuilder<'_>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.graph.dependencies_set_up[self.pass] = false;
        self.pass_mut().setup_dependencies = Some(Box::new(setup));
        self
    }
}
