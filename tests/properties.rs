use std::collections::HashSet;

use ash::vk;
use rstest::rstest;

use rendergraph::framegraph::{
    AttachmentInfo, BufferInfo, LogicalPass, RenderGraph, RenderGraphQueueFlags,
    ResourceDimensions, ResourceIndex,
};

fn graph() -> RenderGraph {
    let mut graph = RenderGraph::new();
    graph.set_backbuffer_dimensions(ResourceDimensions::swapchain(
        vk::Format::B8G8R8A8_SRGB,
        1280,
        720,
    ));
    graph
}

fn deferred() -> RenderGraph {
    let mut graph = graph();
    let color = AttachmentInfo::new(vk::Format::R8G8B8A8_UNORM);
    graph
        .add_pass("gbuffer", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("albedo", &color, None)
        .add_color_output("normal", &color, None)
        .add_depth_stencil_output("depth", &AttachmentInfo::new(vk::Format::D32_SFLOAT))
        .set_get_clear_color(|_| Some(vk::ClearColorValue { float32: [0.0; 4] }));
    graph
        .add_pass("ssao", RenderGraphQueueFlags::ASYNC_COMPUTE)
        .add_texture_input("depth", None)
        .add_storage_texture_output(
            "ao",
            &AttachmentInfo::new(vk::Format::R8_UNORM).swapchain_relative(0.5, 0.5),
            None,
        );
    graph
        .add_pass("lighting", RenderGraphQueueFlags::GRAPHICS)
        .add_attachment_input("albedo")
        .add_attachment_input("normal")
        .add_depth_stencil_input("depth")
        .add_texture_input("ao", None)
        .add_color_output("hdr", &AttachmentInfo::new(vk::Format::R16G16B16A16_SFLOAT), None);
    graph
        .add_pass("tonemap", RenderGraphQueueFlags::GRAPHICS)
        .add_texture_input("hdr", None)
        .add_color_output("backbuffer", &AttachmentInfo::default(), None);
    graph.set_backbuffer_source("backbuffer");
    graph
}

fn color_chain() -> RenderGraph {
    let mut graph = graph();
    let info = AttachmentInfo::default();
    graph
        .add_pass("base", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("c0", &info, None);
    for i in 1..5 {
        graph
            .add_pass(&format!("layer{}", i), RenderGraphQueueFlags::GRAPHICS)
            .add_color_output(&format!("c{}", i), &info, Some(&format!("c{}", i - 1)));
    }
    graph
        .add_pass("post", RenderGraphQueueFlags::GRAPHICS)
        .add_texture_input("c4", None)
        .add_color_output("backbuffer", &info, None);
    graph.set_backbuffer_source("backbuffer");
    graph
}

fn particles() -> RenderGraph {
    let mut graph = graph();
    graph
        .add_pass("emit", RenderGraphQueueFlags::COMPUTE)
        .add_storage_output("particles", &BufferInfo::new(4096, vk::BufferUsageFlags::empty()), None);
    graph
        .add_pass("simulate", RenderGraphQueueFlags::ASYNC_COMPUTE)
        .add_storage_output(
            "particles_next",
            &BufferInfo::new(4096, vk::BufferUsageFlags::empty()),
            Some("particles"),
        );
    graph
        .add_pass("draw", RenderGraphQueueFlags::GRAPHICS)
        .add_vertex_buffer_input("particles_next")
        .add_depth_stencil_output("scene_depth", &AttachmentInfo::new(vk::Format::D32_SFLOAT))
        .add_color_output("scene", &AttachmentInfo::default(), None);
    graph
        .add_pass("overlay", RenderGraphQueueFlags::GRAPHICS)
        .add_depth_stencil_input("scene_depth")
        .add_color_output("backbuffer", &AttachmentInfo::default(), Some("scene"));
    graph.set_backbuffer_source("backbuffer");
    graph
}

/// Current-frame texture reads whose producers must run first.
fn texture_reads(pass: &LogicalPass) -> Vec<ResourceIndex> {
    pass.color_inputs()
        .iter()
        .chain(pass.color_scale_inputs())
        .chain(pass.storage_texture_inputs())
        .chain(pass.blit_texture_inputs())
        .flatten()
        .copied()
        .chain(pass.attachment_inputs().iter().copied())
        .chain(pass.depth_stencil_input())
        .chain(pass.generic_texture_inputs().iter().map(|t| t.texture))
        .collect()
}

fn image_outputs(pass: &LogicalPass) -> Vec<ResourceIndex> {
    pass.color_outputs()
        .iter()
        .chain(pass.resolve_outputs())
        .chain(pass.storage_texture_outputs())
        .chain(pass.blit_texture_outputs())
        .copied()
        .chain(pass.depth_stencil_output())
        .collect()
}

#[rstest]
#[case::deferred(deferred())]
#[case::color_chain(color_chain())]
#[case::particles(particles())]
fn producers_run_before_consumers(#[case] mut graph: RenderGraph) {
    graph.bake().expect("graph bakes");
    let stack = graph.pass_stack().unwrap();
    let position = |pass| stack.iter().position(|&p| p == pass);

    for (consumer_position, &consumer) in stack.iter().enumerate() {
        for resource in texture_reads(graph.pass(consumer)) {
            for &writer in graph.resource(resource).written_in_passes() {
                if writer == consumer {
                    continue;
                }
                let writer_position = position(writer).expect("producer is scheduled");
                assert!(
                    writer_position < consumer_position,
                    "{} runs after its consumer {}",
                    graph.pass(writer).name(),
                    graph.pass(consumer).name()
                );
            }
        }
    }
}

#[rstest]
#[case::deferred(deferred())]
#[case::color_chain(color_chain())]
#[case::particles(particles())]
fn transient_resources_stay_in_one_physical_pass(#[case] mut graph: RenderGraph) {
    graph.bake().expect("graph bakes");
    let dimensions = graph.physical_dimensions().unwrap();
    let swapchain = graph.swapchain_physical_index().unwrap();

    for (index, dims) in dimensions.iter().enumerate() {
        if !dims.is_transient() || Some(index) == swapchain {
            continue;
        }
        let physical_passes = graph
            .resources()
            .iter()
            .filter(|r| r.physical_index == Some(index))
            .flat_map(|r| r.written_in_passes().iter().chain(r.read_in_passes()))
            .filter_map(|&pass| graph.pass(pass).physical_pass_index())
            .collect::<HashSet<_>>();
        assert!(
            physical_passes.len() <= 1,
            "transient {} is used by physical passes {:?}",
            dims.name,
            physical_passes
        );
    }
}

#[rstest]
#[case::deferred(deferred())]
#[case::color_chain(color_chain())]
#[case::particles(particles())]
fn merged_passes_never_sample_each_other(#[case] mut graph: RenderGraph) {
    graph.bake().expect("graph bakes");
    let physical = |resource: ResourceIndex| graph.resource(resource).physical_index;

    for physical_pass in graph.physical_passes().unwrap() {
        let members = physical_pass
            .passes
            .iter()
            .map(|&p| graph.pass(p))
            .collect::<Vec<_>>();
        assert!(members.iter().all(|p| p.queue() == members[0].queue()));
        if members.len() > 1 {
            assert!(members.iter().all(|p| !p.queue().is_compute()));
        }

        for (i, next) in members.iter().enumerate().skip(1) {
            let earlier_outputs = members[..i]
                .iter()
                .flat_map(|p| image_outputs(p))
                .filter_map(physical)
                .collect::<HashSet<_>>();
            for texture in next.generic_texture_inputs() {
                assert!(
                    !physical(texture.texture).is_some_and(|slot| earlier_outputs.contains(&slot)),
                    "{} samples an image produced inside its own render pass",
                    next.name()
                );
            }
        }
    }
}

#[rstest]
#[case::deferred(deferred())]
#[case::color_chain(color_chain())]
#[case::particles(particles())]
fn physical_barriers_are_deduplicated(#[case] mut graph: RenderGraph) {
    graph.bake().expect("graph bakes");
    for physical_pass in graph.physical_passes().unwrap() {
        for barriers in [&physical_pass.invalidate, &physical_pass.flush] {
            let mut seen = HashSet::new();
            for barrier in barriers {
                assert!(
                    seen.insert((barrier.resource_index, barrier.history)),
                    "duplicate barrier for physical resource {}",
                    barrier.resource_index
                );
            }
        }
    }
}

#[test]
fn color_chain_collapses_into_one_render_pass() {
    let mut graph = color_chain();
    graph.bake().expect("graph bakes");

    let physical_passes = graph.physical_passes().unwrap();
    assert_eq!(physical_passes.len(), 2);
    assert_eq!(physical_passes[0].passes.len(), 5);
    // Sampled by the post pass, so the shared slot outlives the render pass.
    assert!(!graph.is_transient("c4").unwrap());
    assert_eq!(
        graph.physical_index("c0").unwrap(),
        graph.physical_index("c4").unwrap()
    );
}

#[test]
fn async_compute_passes_stay_alone() {
    let mut graph = deferred();
    graph.bake().expect("graph bakes");

    let ssao = graph.find_pass("ssao").unwrap();
    let physical = &graph.physical_passes().unwrap()[ssao.physical_pass_index().unwrap()];
    assert_eq!(physical.passes, vec![ssao.index()]);
    assert!(!graph.is_transient("depth").unwrap());
}

fn independent_writers(order: &[usize]) -> RenderGraph {
    const WRITERS: usize = 3;
    let info = AttachmentInfo::new(vk::Format::R8G8B8A8_UNORM);
    let mut graph = graph();
    for &i in order {
        if i == WRITERS {
            let mut composite = graph.add_pass("composite", RenderGraphQueueFlags::GRAPHICS);
            for t in 0..WRITERS {
                composite.add_texture_input(&format!("t{}", t), None);
            }
            composite.add_color_output("backbuffer", &AttachmentInfo::default(), None);
        } else {
            graph
                .add_pass(&format!("w{}", i), RenderGraphQueueFlags::GRAPHICS)
                .add_color_output(&format!("t{}", i), &info, None);
        }
    }
    graph.set_backbuffer_source("backbuffer");
    graph
}

#[rstest]
#[case(&[0, 1, 2, 3])]
#[case(&[3, 2, 1, 0])]
#[case(&[1, 3, 0, 2])]
#[case(&[2, 0, 3, 1])]
fn schedule_ignores_declaration_order(#[case] order: &[usize]) {
    let mut graph = independent_writers(order);
    graph.bake().expect("graph bakes");

    let names = graph
        .pass_stack()
        .unwrap()
        .iter()
        .map(|&p| graph.pass(p).name())
        .collect::<Vec<_>>();
    assert_eq!(names, ["w2", "w1", "w0", "composite"]);
    assert_eq!(graph.physical_passes().unwrap().len(), 4);
}
