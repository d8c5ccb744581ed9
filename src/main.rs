use anyhow::Context;
use ash::vk;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
};

use rendergraph::{
    framegraph::{
        AttachmentInfo, AttachmentInfoFlags, RenderGraph, RenderGraphQueueFlags, ResourceDimensions,
    },
    headless::HeadlessDevice,
    task::TaskComposer,
};

const FRAMES: usize = 3;

fn init_logging() -> anyhow::Result<()> {
    if log4rs::init_file("log4rs.yml", Default::default()).is_ok() {
        return Ok(());
    }

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{h({l})} {t} - {m}{n}")))
        .build();
    let config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .context("failed to build fallback logging config")?;
    log4rs::init_config(config).context("failed to initialize logging")?;
    Ok(())
}

#[cfg(feature = "profiling")]
fn init_profiling() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracy subscriber")?;
    Ok(())
}

/// A small deferred renderer: g-buffer, async SSAO, lighting, tonemap.
fn declare(graph: &mut RenderGraph) {
    let gbuffer_color = AttachmentInfo::new(vk::Format::R8G8B8A8_UNORM);
    let gbuffer_depth = AttachmentInfo::new(vk::Format::D32_SFLOAT);
    let hdr = AttachmentInfo::new(vk::Format::R16G16B16A16_SFLOAT);
    let ao = AttachmentInfo::new(vk::Format::R8_UNORM).swapchain_relative(0.5, 0.5);
    let backbuffer = AttachmentInfo::default().flags(AttachmentInfoFlags::PERSISTENT);

    graph
        .add_pass("gbuffer", RenderGraphQueueFlags::GRAPHICS)
        .add_color_output("albedo", &gbuffer_color, None)
        .add_color_output("normal", &gbuffer_color, None)
        .add_depth_stencil_output("depth", &gbuffer_depth)
        .set_get_clear_color(|_| Some(vk::ClearColorValue { float32: [0.0; 4] }))
        .set_get_clear_depth_stencil(|| {
            Some(vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            })
        })
        .set_build_render_pass(|cmd| {
            cmd.insert_label("draw scene");
            Ok(())
        });

    graph
        .add_pass("ssao", RenderGraphQueueFlags::ASYNC_COMPUTE)
        .add_texture_input("depth", None)
        .add_storage_texture_output("ao", &ao, None)
        .set_build_render_pass(|cmd| {
            cmd.insert_label("dispatch ssao");
            Ok(())
        });

    graph
        .add_pass("lighting", RenderGraphQueueFlags::GRAPHICS)
        .add_attachment_input("albedo")
        .add_attachment_input("normal")
        .add_depth_stencil_input("depth")
        .add_texture_input("ao", None)
        .add_color_output("hdr", &hdr, None)
        .set_build_render_pass(|cmd| {
            cmd.insert_label("shade");
            Ok(())
        });

    graph
        .add_pass("tonemap", RenderGraphQueueFlags::GRAPHICS)
        .add_texture_input("hdr", None)
        .add_color_output("backbuffer", &backbuffer, None)
        .set_build_render_pass(|cmd| {
            cmd.insert_label("tonemap");
            Ok(())
        });

    graph.set_backbuffer_source("backbuffer");
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    #[cfg(feature = "profiling")]
    init_profiling()?;

    let swapchain = ResourceDimensions::swapchain(vk::Format::B8G8R8A8_SRGB, 1280, 720);
    let device = HeadlessDevice::new();

    let mut graph = RenderGraph::new();
    graph.set_backbuffer_dimensions(swapchain.clone());
    declare(&mut graph);
    graph.bake().context("failed to bake render graph")?;
    graph.log();

    for frame in 0..FRAMES {
        graph
            .setup_attachments(&device, device.swapchain_image(&swapchain))
            .context("failed to set up attachments")?;

        let mut composer = TaskComposer::new();
        graph
            .enqueue_render_passes(&device, &mut composer)
            .context("failed to enqueue render passes")?;
        let failures = composer.run();

        let submissions = device.take_submissions();
        log::info!(
            "Frame {}: {} submissions, {} failed tasks",
            frame,
            submissions.len(),
            failures
        );
        for submission in &submissions {
            log::debug!(
                "  {} queue: {} commands, {} waits, {} signals",
                submission.queue,
                submission.commands.len(),
                submission.waits.len(),
                submission.signals.len()
            );
        }

        #[cfg(feature = "profiling")]
        tracy_client::frame_mark();
    }

    log::info!(
        "Device objects: {} images, {} buffers, {} semaphores",
        device.image_count(),
        device.buffer_count(),
        device.semaphore_count()
    );
    Ok(())
}
