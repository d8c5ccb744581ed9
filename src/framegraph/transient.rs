use crate::framegraph::{
    RenderGraph, dimensions::ResourceDimensions, flags::AttachmentInfoFlags,
};

/// Marks images whose whole lifetime fits inside one physical pass.
pub(crate) struct TransientAnalyzer<'g> {
    graph: &'g RenderGraph,
}

impl<'g> TransientAnalyzer<'g> {
    pub fn new(graph: &'g RenderGraph) -> Self {
        Self { graph }
    }

    pub fn analyze(&self, dimensions: &mut [ResourceDimensions], has_history: &[bool]) {
        let config = &self.graph.config;

        let mut transient = dimensions
            .iter()
            .zip(has_history)
            .map(|(dims, &history)| {
                if dims.is_buffer_like() || history {
                    return false;
                }
                if dims.is_depth_stencil() {
                    config.transient_depth_stencil
                } else {
                    config.transient_color
                }
            })
            .collect::<Vec<_>>();

        let mut owners = vec![None; dimensions.len()];
        for resource in &self.graph.resources {
            if !resource.is_texture() {
                continue;
            }
            let Some(physical) = resource.physical_index else {
                continue;
            };

            let touching = resource
                .written_in_passes()
                .iter()
                .chain(resource.read_in_passes());
            for &pass in touching {
                // Passes culled from the stack never run.
                let Some(physical_pass) = self.graph.passes[pass].physical_pass else {
                    continue;
                };
                match owners[physical] {
                    None => owners[physical] = Some(physical_pass),
                    Some(owner) if owner != physical_pass => transient[physical] = false,
                    Some(_) => {}
                }
            }
        }

        for (dims, transient) in dimensions.iter_mut().zip(transient) {
            dims.flags.set(AttachmentInfoFlags::INTERNAL_TRANSIENT, transient);
            if transient {
                log::trace!("{} is transient", dims.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::framegraph::{AttachmentInfo, RenderGraph, RenderGraphConfig, RenderGraphQueueFlags};

    fn depth_prepass(config: RenderGraphConfig) -> RenderGraph {
        let mut graph = RenderGraph::with_config(config);
        let depth = AttachmentInfo::new(vk::Format::D32_SFLOAT);
        graph
            .add_pass("prepass", RenderGraphQueueFlags::GRAPHICS)
            .add_depth_stencil_output("depth", &depth);
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_depth_stencil_input("depth")
            .add_color_output("backbuffer", &AttachmentInfo::default(), None);
        graph.set_backbuffer_source("backbuffer");
        graph
    }

    #[test]
    fn depth_shared_by_merged_passes_is_transient() {
        let mut graph = depth_prepass(RenderGraphConfig::default());
        graph.bake().unwrap();
        assert_eq!(graph.physical_passes().unwrap().len(), 1);
        assert!(graph.is_transient("depth").unwrap());
    }

    #[test]
    fn config_can_keep_depth_persistent() {
        let mut graph = depth_prepass(RenderGraphConfig::default().transient_depth_stencil(false));
        graph.bake().unwrap();
        assert!(!graph.is_transient("depth").unwrap());
    }

    #[test]
    fn images_crossing_physical_passes_are_persistent() {
        let mut graph = depth_prepass(RenderGraphConfig::default().merge_subpasses(false));
        graph.bake().unwrap();
        assert_eq!(graph.physical_passes().unwrap().len(), 2);
        assert!(!graph.is_transient("depth").unwrap());
    }
}
