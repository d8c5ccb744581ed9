use ash::vk;
use rstest::rstest;

use rendergraph::{
    device::{CommandBuffer, PhysicalAttachment, SemaphoreWait},
    framegraph::{
        AttachmentInfo, BufferInfo, PassBuilder, QueueType, RenderGraph, RenderGraphQueueFlags,
        ResourceDimensions,
    },
    headless::{AttachmentOps, Command, HeadlessDevice, Submission},
    task::TaskComposer,
};

struct Frame {
    swapchain: PhysicalAttachment,
    failures: usize,
    submissions: Vec<Submission>,
}

fn graph() -> RenderGraph {
    let mut graph = RenderGraph::new();
    graph.set_backbuffer_dimensions(ResourceDimensions::swapchain(
        vk::Format::B8G8R8A8_SRGB,
        1280,
        720,
    ));
    graph
}

fn label(builder: &mut PassBuilder<'_>, label: &'static str) {
    builder.set_build_render_pass(move |cmd: &mut dyn CommandBuffer| {
        cmd.insert_label(label);
        Ok(())
    });
}

fn run_frame(graph: &mut RenderGraph, device: &HeadlessDevice, threaded: bool) -> Frame {
    let swapchain = device.swapchain_image(graph.backbuffer_dimensions());
    graph
        .setup_attachments(device, swapchain)
        .expect("attachments are set up");
    let mut composer = if threaded {
        TaskComposer::new()
    } else {
        TaskComposer::inline()
    };
    graph
        .enqueue_render_passes(device, &mut composer)
        .expect("passes are enqueued");
    let failures = composer.run();
    Frame {
        swapchain,
        failures,
        submissions: device.take_submissions(),
    }
}

fn image_barriers(submission: &Submission) -> Vec<rendergraph::device::ImageBarrier> {
    submission
        .barriers()
        .flat_map(|barrier| barrier.images.iter().copied())
        .collect()
}

#[rstest]
fn merged_passes_render_straight_into_the_swapchain(#[values(false, true)] threaded: bool) {
    let info = AttachmentInfo::default();
    let device = HeadlessDevice::new();
    let mut graph = graph();
    label(
        graph
            .add_pass("a", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("Color", &info, None),
        "a",
    );
    label(
        graph
            .add_pass("b", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("Color2", &info, Some("Color")),
        "b",
    );
    graph.set_backbuffer_source("Color2");
    graph.bake().expect("graph bakes");

    let frame = run_frame(&mut graph, &device, threaded);

    assert_eq!(frame.failures, 0);
    assert_eq!(frame.submissions.len(), 1);
    let submission = &frame.submissions[0];
    assert_eq!(submission.queue, QueueType::Graphics);
    assert!(submission.waits.is_empty());
    assert!(submission.signals.is_empty());
    assert_eq!(
        submission.commands,
        vec![
            Command::BeginRegion("a+b".to_string()),
            Command::BeginRenderPass {
                name: "a+b".to_string(),
                extent: vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                subpasses: 2,
                color_attachments: vec![AttachmentOps {
                    view: frame.swapchain.view,
                    load_op: vk::AttachmentLoadOp::DONT_CARE,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                }],
                depth_stencil: None,
            },
            Command::Label("a".to_string()),
            Command::NextSubpass,
            Command::Label("b".to_string()),
            Command::EndRenderPass,
            Command::EndRegion,
        ]
    );
    // Only the stand-in swapchain image exists.
    assert_eq!(device.image_count(), 1);
}

#[test]
fn async_compute_hands_buffers_over_with_semaphores() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    label(
        graph
            .add_pass("simulate", RenderGraphQueueFlags::ASYNC_COMPUTE)
            .add_storage_output("particles", &BufferInfo::new(1024, vk::BufferUsageFlags::empty()), None),
        "simulate",
    );
    label(
        graph
            .add_pass("draw", RenderGraphQueueFlags::GRAPHICS)
            .add_vertex_buffer_input("particles")
            .add_color_output("backbuffer", &AttachmentInfo::default(), None),
        "draw",
    );
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");

    let first = run_frame(&mut graph, &device, false);
    assert_eq!(first.failures, 0);
    assert_eq!(device.buffer_count(), 1);

    let [simulate, draw] = first.submissions.as_slice() else {
        panic!("expected two submissions, got {}", first.submissions.len());
    };
    assert_eq!(simulate.queue, QueueType::AsyncCompute);
    assert_eq!(draw.queue, QueueType::Graphics);
    assert_eq!(simulate.labels().collect::<Vec<_>>(), ["simulate"]);
    assert_eq!(draw.labels().collect::<Vec<_>>(), ["draw"]);

    assert!(simulate.waits.is_empty());
    assert_eq!(simulate.signals.len(), 1);
    assert_eq!(
        draw.waits,
        vec![SemaphoreWait {
            semaphore: simulate.signals[0],
            stages: vk::PipelineStageFlags2::VERTEX_INPUT,
        }]
    );
    assert_eq!(draw.signals.len(), 1);

    // The next frame's writer waits for this frame's reader.
    let second = run_frame(&mut graph, &device, false);
    assert_eq!(second.submissions.len(), 2);
    assert_eq!(
        second.submissions[0].waits.iter().map(|w| w.semaphore).collect::<Vec<_>>(),
        vec![draw.signals[0]]
    );
    assert_eq!(device.buffer_count(), 1);
}

#[test]
fn unaliased_backbuffer_is_resampled_into_the_swapchain() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    label(
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("hdr", &AttachmentInfo::new(vk::Format::R16G16B16A16_SFLOAT), None),
        "main",
    );
    graph.set_backbuffer_source("hdr");
    graph.bake().expect("graph bakes");

    let frame = run_frame(&mut graph, &device, false);
    assert_eq!(frame.failures, 0);
    assert_eq!(device.image_count(), 2);

    let [main, resample] = frame.submissions.as_slice() else {
        panic!("expected two submissions, got {}", frame.submissions.len());
    };

    let main_barriers = image_barriers(main);
    assert_eq!(main_barriers.len(), 1);
    assert_eq!(main_barriers[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(main_barriers[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let hdr = main_barriers[0].image;

    let resample_barriers = image_barriers(resample);
    assert_eq!(resample_barriers.len(), 1);
    assert_eq!(resample_barriers[0].image, hdr);
    assert_eq!(resample_barriers[0].old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(resample_barriers[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(
        resample_barriers[0].src_access,
        vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
    );

    assert_eq!(resample.commands.first(), Some(&Command::BeginRegion("swapchain_resample".to_string())));
    let target = resample.commands.iter().find_map(|c| match c {
        Command::BeginRenderPass {
            color_attachments, ..
        } => Some(color_attachments[0]),
        _ => None,
    });
    assert_eq!(target.map(|t| t.view), Some(frame.swapchain.view));
    assert_eq!(target.map(|t| t.final_layout), Some(vk::ImageLayout::PRESENT_SRC_KHR));
    assert!(resample
        .commands
        .iter()
        .any(|c| matches!(c, Command::ResampleAttachment { target: 0, .. })));

    // The resample read is a hazard for next frame's write.
    let next = run_frame(&mut graph, &device, false);
    let barriers = image_barriers(&next.submissions[0]);
    assert_eq!(barriers.len(), 1);
    assert_eq!(barriers[0].image, hdr);
    assert!(barriers[0]
        .src_stages
        .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
    assert_eq!(device.image_count(), 3);
}

#[test]
fn history_images_swap_every_frame() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    graph
        .add_pass("taa", RenderGraphQueueFlags::GRAPHICS)
        .add_history_input("taa_out")
        .add_color_output("taa_out", &AttachmentInfo::new(vk::Format::R16G16B16A16_SFLOAT), None);
    graph
        .add_pass("tonemap", RenderGraphQueueFlags::GRAPHICS)
        .add_texture_input("taa_out", None)
        .add_color_output("backbuffer", &AttachmentInfo::default(), None);
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");
    assert!(!graph.is_transient("taa_out").unwrap());

    let first = run_frame(&mut graph, &device, false);
    assert_eq!(device.image_count(), 3);
    let barriers = image_barriers(&first.submissions[0]);
    assert_eq!(barriers.len(), 2);
    assert_eq!(barriers[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(barriers[1].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    let (current, history) = (barriers[0].image, barriers[1].image);
    assert_ne!(current, history);

    let second = run_frame(&mut graph, &device, false);
    assert_eq!(device.image_count(), 4);
    let barriers = image_barriers(&second.submissions[0]);
    let target = barriers
        .iter()
        .find(|b| b.new_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .expect("render target transition");
    assert_eq!(target.image, history);
}

#[test]
fn failed_submissions_do_not_stop_the_frame() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    label(
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("backbuffer", &AttachmentInfo::default(), None),
        "main",
    );
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");

    device.set_fail_submissions(true);
    let lost = run_frame(&mut graph, &device, false);
    assert_eq!(lost.failures, 0);
    assert!(lost.submissions.is_empty());

    device.set_fail_submissions(false);
    let recovered = run_frame(&mut graph, &device, false);
    assert_eq!(recovered.submissions.len(), 1);
}

#[test]
fn recording_errors_are_counted_and_still_submitted() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    graph
        .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("backbuffer", &AttachmentInfo::default(), None)
        .set_build_render_pass(|_| anyhow::bail!("pipeline is not ready"));
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");

    let frame = run_frame(&mut graph, &device, true);
    assert_eq!(frame.failures, 1);
    assert_eq!(frame.submissions.len(), 1);
    assert_eq!(frame.submissions[0].commands.last(), Some(&Command::EndRegion));
}

#[test]
fn idle_passes_are_not_submitted() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    graph
        .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("backbuffer", &AttachmentInfo::default(), None)
        .set_need_render_pass(|| false);
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");

    let frame = run_frame(&mut graph, &device, false);
    assert_eq!(frame.failures, 0);
    assert!(frame.submissions.is_empty());
}

#[test]
fn enqueue_requires_a_baked_and_set_up_graph() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    graph
        .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("backbuffer", &AttachmentInfo::default(), None);
    graph.set_backbuffer_source("backbuffer");

    {
        let mut composer = TaskComposer::inline();
        assert!(graph.enqueue_render_passes(&device, &mut composer).is_err());
    }
    let swapchain = device.swapchain_image(graph.backbuffer_dimensions());
    assert!(graph.setup_attachments(&device, swapchain).is_err());

    graph.bake().expect("graph bakes");
    {
        let mut composer = TaskComposer::inline();
        let err = graph
            .enqueue_render_passes(&device, &mut composer)
            .expect_err("attachments are missing");
        assert!(err.to_string().contains("setup_attachments"));
    }
}

#[test]
fn proxies_become_execution_only_barriers() {
    let device = HeadlessDevice::new();
    let mut graph = graph();
    label(
        graph
            .add_pass("upload", RenderGraphQueueFlags::GRAPHICS)
            .add_proxy_output("meshes_ready", vk::PipelineStageFlags2::TRANSFER),
        "upload",
    );
    label(
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_proxy_input("meshes_ready", vk::PipelineStageFlags2::VERTEX_INPUT)
            .add_color_output("backbuffer", &AttachmentInfo::default(), None),
        "main",
    );
    graph.set_backbuffer_source("backbuffer");
    graph.bake().expect("graph bakes");

    let frame = run_frame(&mut graph, &device, false);
    assert_eq!(frame.failures, 0);
    let [upload, main] = frame.submissions.as_slice() else {
        panic!("expected two submissions, got {}", frame.submissions.len());
    };
    assert_eq!(upload.barriers().count(), 0);

    let barriers = main.barriers().collect::<Vec<_>>();
    assert_eq!(barriers.len(), 1);
    assert!(barriers[0].images.is_empty());
    assert!(barriers[0].buffers.is_empty());
    let memory = barriers[0].memory_barrier().expect("execution dependency");
    assert_eq!(memory.src_stage_mask, vk::PipelineStageFlags2::TRANSFER);
    assert_eq!(memory.dst_stage_mask, vk::PipelineStageFlags2::VERTEX_INPUT);
    // Only the swapchain image exists.
    assert_eq!(device.image_count(), 1);
}
