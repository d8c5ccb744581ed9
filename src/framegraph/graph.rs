use std::collections::HashMap;

use ash::vk;

use crate::framegraph::{
    PassIndex, ResourceIndex,
    allocate::PhysicalResourceAllocator,
    barrier::BarrierBuilder,
    dimensions::ResourceDimensions,
    error::{GraphError, GraphResult},
    executor::RuntimeState,
    flags::{AttachmentInfoFlags, RenderGraphQueueFlags},
    merge::PassMerger,
    pass::{LogicalPass, PassBuilder},
    physical::{PassBarriers, PhysicalPass},
    render_pass::RenderPassInfoBuilder,
    resolve::DependencyResolver,
    resource::{LogicalResource, ResourceKind},
    transient::TransientAnalyzer,
    validate::validate_passes,
};

/// Tunables for bake-time decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderGraphConfig {
    pub merge_subpasses: bool,
    pub transient_color: bool,
    pub transient_depth_stencil: bool,
    /// Keep storing transient attachments instead of discarding them.
    pub transient_store: bool,
}

impl Default for RenderGraphConfig {
    fn default() -> Self {
        Self {
            merge_subpasses: true,
            transient_color: true,
            transient_depth_stencil: true,
            transient_store: false,
        }
    }
}

impl RenderGraphConfig {
    pub fn merge_subpasses(mut self, enabled: bool) -> Self {
        self.merge_subpasses = enabled;
        self
    }

    pub fn transient_color(mut self, enabled: bool) -> Self {
        self.transient_color = enabled;
        self
    }

    pub fn transient_depth_stencil(mut self, enabled: bool) -> Self {
        self.transient_depth_stencil = enabled;
        self
    }

    pub fn transient_store(mut self, enabled: bool) -> Self {
        self.transient_store = enabled;
        self
    }
}

/// Everything a successful bake produces.
#[derive(Debug, Default)]
pub(crate) struct BakedPlan {
    pub pass_stack: Vec<PassIndex>,
    pub physical_passes: Vec<PhysicalPass>,
    pub physical_dimensions: Vec<ResourceDimensions>,
    pub physical_image_has_history: Vec<bool>,
    pub pass_barriers: Vec<PassBarriers>,
    pub swapchain_physical_index: Option<usize>,
    pub backbuffer_physical_index: usize,
}

/// Declarative set of passes and resources, and the plan baked from them.
///
/// Owned by the renderer. Passes and resources are declared through
/// [`RenderGraph::add_pass`], compiled by [`RenderGraph::bake`] and recorded
/// every frame by [`RenderGraph::enqueue_render_passes`]. Swapchain resizes
/// require a [`RenderGraph::reset`] and a fresh declaration.
pub struct RenderGraph {
    pub(crate) config: RenderGraphConfig,
    pub(crate) passes: Vec<LogicalPass>,
    pub(crate) resources: Vec<LogicalResource>,
    pass_to_index: HashMap<String, PassIndex>,
    resource_to_index: HashMap<String, ResourceIndex>,
    pending_errors: Vec<GraphError>,
    pub(crate) dependencies_set_up: Vec<bool>,
    backbuffer_source: Option<String>,
    pub(crate) swapchain_dimensions: ResourceDimensions,
    pub(crate) plan: Option<BakedPlan>,
    pub(crate) runtime: RuntimeState,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::with_config(RenderGraphConfig::default())
    }

    pub fn with_config(config: RenderGraphConfig) -> Self {
        Self {
            config,
            passes: Vec::new(),
            resources: Vec::new(),
            pass_to_index: HashMap::new(),
            resource_to_index: HashMap::new(),
            pending_errors: Vec::new(),
            dependencies_set_up: Vec::new(),
            backbuffer_source: None,
            swapchain_dimensions: ResourceDimensions::swapchain(vk::Format::B8G8R8A8_SRGB, 1, 1),
            plan: None,
            runtime: RuntimeState::default(),
        }
    }

    pub fn config(&self) -> &RenderGraphConfig {
        &self.config
    }

    /// Adds a pass, or returns the existing pass of the same name.
    pub fn add_pass(&mut self, name: &str, queue: RenderGraphQueueFlags) -> PassBuilder<'_> {
        let pass = match self.pass_to_index.get(name) {
            Some(&index) => index,
            None => {
                let index = self.passes.len();
                self.passes.push(LogicalPass::new(index, name, queue));
                self.dependencies_set_up.push(false);
                self.pass_to_index.insert(name.to_string(), index);
                log::trace!("Added pass {} ({:?}) as #{}", name, queue, index);
                index
            }
        };
        PassBuilder { graph: self, pass }
    }

    pub fn pass_builder(&mut self, pass: PassIndex) -> Option<PassBuilder<'_>> {
        (pass < self.passes.len()).then(|| PassBuilder { graph: self, pass })
    }

    pub fn find_pass(&self, name: &str) -> Option<&LogicalPass> {
        self.pass_to_index.get(name).map(|&index| &self.passes[index])
    }

    pub fn pass(&self, index: PassIndex) -> &LogicalPass {
        &self.passes[index]
    }

    pub fn passes(&self) -> &[LogicalPass] {
        &self.passes
    }

    pub fn resource(&self, index: ResourceIndex) -> &LogicalResource {
        &self.resources[index]
    }

    pub fn resources(&self) -> &[LogicalResource] {
        &self.resources
    }

    pub fn find_resource(&self, name: &str) -> Option<&LogicalResource> {
        self.resource_to_index
            .get(name)
            .map(|&index| &self.resources[index])
    }

    fn resource_of_kind(&mut self, name: &str, kind: ResourceKind) -> ResourceIndex {
        if let Some(&index) = self.resource_to_index.get(name) {
            let existing = &self.resources[index].kind;
            if std::mem::discriminant(existing) != std::mem::discriminant(&kind) {
                log::error!(
                    "Resource {} is a {}, requested as a {}",
                    name,
                    existing.kind_str(),
                    kind.kind_str()
                );
                self.pending_errors
                    .push(GraphError::ResourceKindMismatch(name.to_string()));
            }
            return index;
        }

        let index = self.resources.len();
        self.resources.push(LogicalResource::new(index, name, kind));
        self.resource_to_index.insert(name.to_string(), index);
        index
    }

    /// Looks up or declares the texture `name`.
    pub fn get_texture_resource(&mut self, name: &str) -> ResourceIndex {
        self.resource_of_kind(name, ResourceKind::texture())
    }

    /// Looks up or declares the buffer `name`.
    pub fn get_buffer_resource(&mut self, name: &str) -> ResourceIndex {
        self.resource_of_kind(name, ResourceKind::buffer())
    }

    pub(crate) fn get_proxy_resource(&mut self, name: &str) -> ResourceIndex {
        self.resource_of_kind(name, ResourceKind::Proxy)
    }

    pub fn set_backbuffer_source(&mut self, name: &str) {
        self.backbuffer_source = Some(name.to_string());
    }

    pub fn backbuffer_source(&self) -> Option<&str> {
        self.backbuffer_source.as_deref()
    }

    pub fn set_backbuffer_dimensions(&mut self, dimensions: ResourceDimensions) {
        self.swapchain_dimensions = dimensions;
    }

    pub fn backbuffer_dimensions(&self) -> &ResourceDimensions {
        &self.swapchain_dimensions
    }

    /// Drops every pass, resource, baked plan and runtime resource.
    pub fn reset(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.pass_to_index.clear();
        self.resource_to_index.clear();
        self.pending_errors.clear();
        self.dependencies_set_up.clear();
        self.backbuffer_source = None;
        self.plan = None;
        self.runtime = RuntimeState::default();
    }

    pub fn is_baked(&self) -> bool {
        self.plan.is_some()
    }

    pub(crate) fn plan(&self) -> GraphResult<&BakedPlan> {
        self.plan.as_ref().ok_or(GraphError::NotBaked)
    }

    pub fn pass_stack(&self) -> GraphResult<&[PassIndex]> {
        Ok(&self.plan()?.pass_stack)
    }

    pub fn physical_passes(&self) -> GraphResult<&[PhysicalPass]> {
        Ok(&self.plan()?.physical_passes)
    }

    pub fn physical_dimensions(&self) -> GraphResult<&[ResourceDimensions]> {
        Ok(&self.plan()?.physical_dimensions)
    }

    pub fn pass_barriers(&self, pass: PassIndex) -> GraphResult<&PassBarriers> {
        self.plan()?
            .pass_barriers
            .get(pass)
            .ok_or(GraphError::NotBaked)
    }

    pub fn swapchain_physical_index(&self) -> GraphResult<Option<usize>> {
        Ok(self.plan()?.swapchain_physical_index)
    }

    pub fn physical_index(&self, name: &str) -> GraphResult<Option<usize>> {
        self.plan()?;
        self.find_resource(name)
            .map(|resource| resource.physical_index)
            .ok_or_else(|| GraphError::UnknownResource(name.to_string()))
    }

    pub fn is_transient(&self, name: &str) -> GraphResult<bool> {
        let plan = self.plan()?;
        let index = self
            .physical_index(name)?
            .ok_or_else(|| GraphError::UnknownResource(name.to_string()))?;
        Ok(plan.physical_dimensions[index].is_transient())
    }

    /// Compiles the declared passes into physical passes and barriers.
    ///
    /// On failure the previous plan is discarded and the graph cannot be
    /// enqueued until it bakes successfully.
    pub fn bake(&mut self) -> GraphResult<()> {
        let span = tracing::info_span!("render_graph_bake", passes = self.passes.len());
        let _enter = span.enter();

        self.plan = None;
        match self.bake_plan() {
            Ok(plan) => {
                log::debug!(
                    "Baked render graph: {} passes, {} physical passes, {} physical resources",
                    plan.pass_stack.len(),
                    plan.physical_passes.len(),
                    plan.physical_dimensions.len()
                );
                self.plan = Some(plan);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to bake render graph: {}", e);
                self.clear_assignments();
                Err(e)
            }
        }
    }

    fn clear_assignments(&mut self) {
        for pass in &mut self.passes {
            pass.physical_pass = None;
        }
        for resource in &mut self.resources {
            resource.physical_index = None;
        }
    }

    fn setup_pass_dependencies(&mut self) {
        for pass in 0..self.passes.len() {
            if self.dependencies_set_up[pass] {
                continue;
            }
            self.dependencies_set_up[pass] = true;
            if let Some(mut setup) = self.passes[pass].setup_dependencies.take() {
                setup(&mut PassBuilder {
                    graph: &mut *self,
                    pass,
                });
                self.passes[pass].setup_dependencies = Some(setup);
            }
        }
    }

    fn bake_plan(&mut self) -> GraphResult<BakedPlan> {
        self.setup_pass_dependencies();
        if let Some(e) = self.pending_errors.first() {
            return Err(e.clone());
        }
        self.clear_assignments();

        validate_passes(self)?;

        let backbuffer_name = self
            .backbuffer_source
            .clone()
            .ok_or(GraphError::MissingBackbuffer)?;
        let backbuffer = self
            .resource_to_index
            .get(&backbuffer_name)
            .copied()
            .ok_or(GraphError::MissingBackbuffer)?;

        let pass_stack = {
            let _span = tracing::debug_span!("resolve_dependencies").entered();
            DependencyResolver::new(self).resolve(backbuffer)?
        };
        log::debug!(
            "Pass stack: [{}]",
            pass_stack
                .iter()
                .map(|&p| self.passes[p].name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let allocation = PhysicalResourceAllocator::new(self).allocate(&pass_stack)?;
        let mut physical_dimensions = allocation.dimensions;
        let physical_image_has_history = allocation.has_history;

        let physical_passes = PassMerger::new(self, &physical_dimensions).merge(&pass_stack);
        for (physical_index, physical) in physical_passes.iter().enumerate() {
            for &pass in &physical.passes {
                self.passes[pass].physical_pass = Some(physical_index);
            }
        }
        let mut physical_passes = physical_passes;

        TransientAnalyzer::new(self).analyze(
            &mut physical_dimensions,
            &physical_image_has_history,
        );

        let backbuffer_physical_index = self.resources[backbuffer]
            .physical_index
            .ok_or_else(|| GraphError::BackbufferNotWritten(backbuffer_name.clone()))?;
        let swapchain_physical_index =
            self.alias_backbuffer(&mut physical_dimensions, backbuffer_physical_index);

        RenderPassInfoBuilder::new(self, &physical_dimensions, swapchain_physical_index)
            .build(&mut physical_passes)?;

        let barriers = BarrierBuilder::new(self, &physical_dimensions);
        let pass_barriers = barriers.build_pass_barriers(&pass_stack)?;
        barriers.build_physical_barriers(
            &mut physical_passes,
            &pass_barriers,
            swapchain_physical_index,
        );

        Ok(BakedPlan {
            pass_stack,
            physical_passes,
            physical_dimensions,
            physical_image_has_history,
            pass_barriers,
            swapchain_physical_index,
            backbuffer_physical_index,
        })
    }

    /// Decides whether the backbuffer can be rendered straight into the
    /// swapchain image. Otherwise it stays a regular persistent image that is
    /// resampled into the swapchain at the end of the frame.
    fn alias_backbuffer(
        &self,
        physical_dimensions: &mut [ResourceDimensions],
        backbuffer: usize,
    ) -> Option<usize> {
        let swapchain = &self.swapchain_dimensions;
        let dims = &mut physical_dimensions[backbuffer];

        let can_alias = !dims.queues.is_compute() && dims.is_transient() && {
            let mut shape = dims.clone();
            shape.flags.remove(
                AttachmentInfoFlags::INTERNAL_TRANSIENT | AttachmentInfoFlags::SUPPORTS_PREROTATE,
            );
            shape.flags |= swapchain.flags & AttachmentInfoFlags::PERSISTENT;
            shape == *swapchain
        };

        dims.flags.remove(
            AttachmentInfoFlags::INTERNAL_TRANSIENT | AttachmentInfoFlags::SUPPORTS_PREROTATE,
        );
        dims.flags |= swapchain.flags & AttachmentInfoFlags::PERSISTENT;

        if can_alias {
            dims.flags |= AttachmentInfoFlags::INTERNAL_TRANSIENT;
            return Some(backbuffer);
        }

        log::warn!(
            "Backbuffer {} cannot alias the swapchain, an extra resample pass will be recorded",
            dims.name
        );
        // The resample pass runs on the graphics queue.
        dims.queues |= RenderGraphQueueFlags::GRAPHICS;
        dims.image_usage |= vk::ImageUsageFlags::SAMPLED;

        // Without direct aliasing nothing can be prerotated.
        for dims in physical_dimensions.iter_mut() {
            dims.transform = vk::SurfaceTransformFlagsKHR::IDENTITY;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::*;
    use crate::framegraph::AttachmentInfo;

    fn graph() -> RenderGraph {
        let mut graph = RenderGraph::new();
        graph.set_backbuffer_dimensions(ResourceDimensions::swapchain(
            vk::Format::B8G8R8A8_UNORM,
            640,
            480,
        ));
        graph
    }

    #[test]
    fn reset_forgets_declarations_and_plan() {
        let mut graph = graph();
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("backbuffer", &AttachmentInfo::default(), None);
        graph.set_backbuffer_source("backbuffer");
        graph.bake().unwrap();

        graph.reset();
        assert!(!graph.is_baked());
        assert!(graph.passes().is_empty());
        assert!(graph.find_resource("backbuffer").is_none());
        assert_eq!(graph.backbuffer_source(), None);
        assert_eq!(graph.backbuffer_dimensions().width, 640);
    }

    #[test]
    fn pass_names_are_unique() {
        let mut graph = graph();
        let first = graph.add_pass("main", RenderGraphQueueFlags::GRAPHICS).index();
        let again = graph.add_pass("main", RenderGraphQueueFlags::GRAPHICS).index();
        assert_eq!(first, again);
        assert_eq!(graph.passes().len(), 1);
    }

    #[test]
    fn compute_written_backbuffer_is_not_aliased() {
        let mut graph = graph();
        graph
            .add_pass("raytrace", RenderGraphQueueFlags::COMPUTE)
            .add_storage_texture_output("backbuffer", &AttachmentInfo::default(), None);
        graph.set_backbuffer_source("backbuffer");
        graph.bake().unwrap();

        assert_eq!(graph.swapchain_physical_index().unwrap(), None);
        let backbuffer = graph.physical_index("backbuffer").unwrap().unwrap();
        let dims = &graph.physical_dimensions().unwrap()[backbuffer];
        assert!(dims.queues.contains(RenderGraphQueueFlags::GRAPHICS));
        assert!(dims.image_usage.contains(vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn config_is_kept() {
        let config = RenderGraphConfig::default().merge_subpasses(false).transient_store(true);
        let graph = RenderGraph::with_config(config);
        assert_eq!(*graph.config(), config);
        assert!(!graph.config().merge_subpasses);
    }
}
