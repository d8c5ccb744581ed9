use ash::vk;

use crate::framegraph::{
    RenderGraph, ResourceIndex,
    error::{GraphError, GraphResult},
};

fn check_counts(
    pass: &str,
    role: &'static str,
    inputs: usize,
    outputs: usize,
) -> GraphResult<()> {
    if inputs != outputs {
        return Err(GraphError::MismatchedInputCount {
            pass: pass.to_string(),
            role,
            inputs,
            outputs,
        });
    }
    Ok(())
}

fn check_rmw(
    graph: &RenderGraph,
    pass: &str,
    input: ResourceIndex,
    output: ResourceIndex,
) -> GraphResult<()> {
    let input = graph.resource(input);
    let output = graph.resource(output);
    let input_dim = graph.resource_dimensions(input)?;
    let output_dim = graph.resource_dimensions(output)?;
    if !input_dim.same_shape(&output_dim) {
        return Err(GraphError::RmwDimensionMismatch {
            pass: pass.to_string(),
            input: input.name.clone(),
            output: output.name.clone(),
        });
    }
    Ok(())
}

/// Structural checks run before any scheduling decision.
///
/// Color inputs whose dimensions differ from their output are turned into
/// scaled inputs, which are resampled instead of loaded.
pub(crate) fn validate_passes(graph: &mut RenderGraph) -> GraphResult<()> {
    let mut scaled = Vec::new();

    for pass in &graph.passes {
        let name = pass.name.as_str();

        if pass.queue.is_compute() && pass.has_attachments() {
            return Err(GraphError::AttachmentOnComputeQueue(name.to_string()));
        }

        check_counts(name, "color", pass.color_inputs.len(), pass.color_outputs.len())?;
        check_counts(name, "storage", pass.storage_inputs.len(), pass.storage_outputs.len())?;
        check_counts(
            name,
            "blit",
            pass.blit_texture_inputs.len(),
            pass.blit_texture_outputs.len(),
        )?;
        check_counts(
            name,
            "storage texture",
            pass.storage_texture_inputs.len(),
            pass.storage_texture_outputs.len(),
        )?;
        if !pass.resolve_outputs.is_empty() {
            check_counts(name, "resolve", pass.resolve_outputs.len(), pass.color_outputs.len())?;
        }

        for (i, (input, &output)) in pass.color_inputs.iter().zip(&pass.color_outputs).enumerate() {
            if let Some(input) = *input {
                let input_dim = graph.resource_dimensions(graph.resource(input))?;
                let output_dim = graph.resource_dimensions(graph.resource(output))?;
                if !input_dim.same_shape(&output_dim) {
                    scaled.push((pass.index, i));
                }
            }
        }

        for (input, &output) in pass.storage_inputs.iter().zip(&pass.storage_outputs) {
            if let Some(input) = *input {
                check_rmw(graph, name, input, output)?;
            }
        }
        for (input, &output) in pass.blit_texture_inputs.iter().zip(&pass.blit_texture_outputs) {
            if let Some(input) = *input {
                check_rmw(graph, name, input, output)?;
            }
        }
        for (input, &output) in pass
            .storage_texture_inputs
            .iter()
            .zip(&pass.storage_texture_outputs)
        {
            if let Some(input) = *input {
                check_rmw(graph, name, input, output)?;
            }
        }
        if let (Some(input), Some(output)) = (pass.depth_stencil_input, pass.depth_stencil_output) {
            check_rmw(graph, name, input, output)?;
        }
    }

    for (pass, i) in scaled {
        let pass = &mut graph.passes[pass];
        if let Some(input) = pass.color_inputs[i].take() {
            log::debug!(
                "Color input {} of pass {} differs in size from its output, resampling",
                i,
                pass.name
            );
            pass.color_scale_inputs[i] = Some(input);
            graph.resources[input].add_image_usage(vk::ImageUsageFlags::SAMPLED);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use crate::framegraph::{
        AttachmentInfo, BufferInfo, GraphError, RenderGraph, RenderGraphQueueFlags,
        ResourceDimensions,
    };

    use super::validate_passes;

    #[test]
    fn mismatched_color_input_becomes_scaled() {
        let mut graph = RenderGraph::new();
        graph.set_backbuffer_dimensions(ResourceDimensions::swapchain(
            vk::Format::B8G8R8A8_SRGB,
            1280,
            720,
        ));
        let full = AttachmentInfo::default();
        let half = AttachmentInfo::default().swapchain_relative(0.5, 0.5);
        graph
            .add_pass("low", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("low", &half, None);
        graph
            .add_pass("up", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("full", &full, Some("low"));

        validate_passes(&mut graph).unwrap();

        let up = graph.find_pass("up").unwrap();
        assert_eq!(up.color_inputs(), &[None]);
        let low = graph.find_resource("low").unwrap().index;
        assert_eq!(up.color_scale_inputs(), &[Some(low)]);
        assert!(graph
            .resource(low)
            .image_usage()
            .contains(vk::ImageUsageFlags::SAMPLED));
    }

    #[test]
    fn storage_rmw_requires_equal_sizes() {
        let mut graph = RenderGraph::new();
        let small = BufferInfo::new(64, vk::BufferUsageFlags::empty());
        let large = BufferInfo::new(128, vk::BufferUsageFlags::empty());
        graph
            .add_pass("init", RenderGraphQueueFlags::COMPUTE)
            .add_storage_output("a", &small, None);
        graph
            .add_pass("grow", RenderGraphQueueFlags::COMPUTE)
            .add_storage_output("b", &large, Some("a"));

        assert!(matches!(
            validate_passes(&mut graph),
            Err(GraphError::RmwDimensionMismatch { .. })
        ));
    }

    #[test]
    fn equal_color_input_is_loaded() {
        let mut graph = RenderGraph::new();
        let info = AttachmentInfo::default();
        graph
            .add_pass("base", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("base", &info, None);
        graph
            .add_pass("blend", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("blended", &info, Some("base"));

        validate_passes(&mut graph).unwrap();

        let base = graph.find_resource("base").unwrap().index;
        let blend = graph.find_pass("blend").unwrap();
        assert_eq!(blend.color_inputs(), &[Some(base)]);
        assert_eq!(blend.color_scale_inputs(), &[None]);
    }

    #[test]
    fn storage_rmw_ignores_downstream_usage() {
        let mut graph = RenderGraph::new();
        let info = BufferInfo::new(256, vk::BufferUsageFlags::empty());
        graph
            .add_pass("emit", RenderGraphQueueFlags::COMPUTE)
            .add_storage_output("p", &info, None);
        graph
            .add_pass("sim", RenderGraphQueueFlags::COMPUTE)
            .add_storage_output("p2", &info, Some("p"));
        graph
            .add_pass("draw", RenderGraphQueueFlags::GRAPHICS)
            .add_vertex_buffer_input("p2");

        validate_passes(&mut graph).unwrap();
    }

    #[test]
    fn compute_pass_cannot_use_depth() {
        let mut graph = RenderGraph::new();
        graph
            .add_pass("cull", RenderGraphQueueFlags::COMPUTE)
            .add_depth_stencil_input("depth");

        assert_eq!(
            validate_passes(&mut graph),
            Err(GraphError::AttachmentOnComputeQueue("cull".into()))
        );
    }
}
