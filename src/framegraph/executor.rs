use anyhow::Context;
use ash::vk;
use crossbeam_channel::unbounded;

use crate::{
    device::{
        BufferBarrier, CommandBuffer, Device, ImageBarrier, PhysicalAttachment, PipelineBarrier,
        RenderPassAttachment, RenderPassBegin, SemaphoreWait,
    },
    framegraph::{
        RenderGraph,
        dimensions::ResourceDimensions,
        error::GraphError,
        event::{PipelineEvent, SyncSource},
        flags::{QueueType, aspect_for_format},
        graph::BakedPlan,
        layouts::{ImageState, log_image_transition},
        pass::LogicalPass,
        physical::{Barrier, PhysicalPass},
        render_pass::SubpassInfo,
    },
    task::TaskComposer,
};

/// Per-frame GPU objects and synchronization state backing a baked plan.
#[derive(Default)]
pub(crate) struct RuntimeState {
    attachments: Vec<Option<PhysicalAttachment>>,
    history_attachments: Vec<Option<PhysicalAttachment>>,
    buffers: Vec<Option<vk::Buffer>>,
    created: Vec<Option<ResourceDimensions>>,
    events: Vec<PipelineEvent>,
    history_events: Vec<PipelineEvent>,
    swapchain: Option<PhysicalAttachment>,
    frame: u64,
}

impl RuntimeState {
    fn resize(&mut self, count: usize) {
        self.attachments.resize(count, None);
        self.history_attachments.resize(count, None);
        self.buffers.resize(count, None);
        self.created.resize(count, None);
        self.events.resize_with(count, PipelineEvent::default);
        self.history_events.resize_with(count, PipelineEvent::default);
    }

    fn attachment(&self, index: usize, history: bool) -> anyhow::Result<PhysicalAttachment> {
        let slot = if history {
            self.history_attachments.get(index)
        } else {
            self.attachments.get(index)
        };
        slot.copied()
            .flatten()
            .with_context(|| format!("physical resource #{} has no image, call setup_attachments first", index))
    }

    fn buffer(&self, index: usize) -> anyhow::Result<vk::Buffer> {
        self.buffers
            .get(index)
            .copied()
            .flatten()
            .with_context(|| format!("physical resource #{} has no buffer, call setup_attachments first", index))
    }

    fn event_mut(&mut self, index: usize, history: bool) -> &mut PipelineEvent {
        if history {
            &mut self.history_events[index]
        } else {
            &mut self.events[index]
        }
    }
}

/// One queue submission worth of recorded work.
struct Submission {
    name: String,
    queue: QueueType,
    /// `None` for the final resample into the swapchain.
    physical_pass: Option<usize>,
    barrier: PipelineBarrier,
    waits: Vec<SemaphoreWait>,
    signals: Vec<vk::Semaphore>,
    render_pass: Option<RenderPassBegin>,
    /// Per subpass, color attachment and the view it is resampled from.
    scaled_clears: Vec<Vec<(u32, vk::ImageView)>>,
    mipmaps: Vec<(vk::Image, ResourceDimensions)>,
    resample_source: Option<vk::ImageView>,
}

impl Submission {
    fn new(name: String, queue: QueueType, physical_pass: Option<usize>) -> Self {
        Self {
            name,
            queue,
            physical_pass,
            barrier: PipelineBarrier::default(),
            waits: Vec::new(),
            signals: Vec::new(),
            render_pass: None,
            scaled_clears: Vec::new(),
            mipmaps: Vec::new(),
            resample_source: None,
        }
    }
}

type Recorded = (usize, Box<dyn CommandBuffer>, Vec<SemaphoreWait>, Vec<vk::Semaphore>);

/// Walks the baked plan in order, turning barriers into concrete
/// synchronization against the running [`PipelineEvent`] state.
struct Scheduler<'s, D: Device + ?Sized> {
    plan: &'s BakedPlan,
    passes: &'s [LogicalPass],
    swapchain_dimensions: &'s ResourceDimensions,
    runtime: &'s mut RuntimeState,
    device: &'s D,
}

impl<D: Device + ?Sized> Scheduler<'_, D> {
    fn skips_sync(&self, index: usize) -> bool {
        self.plan.physical_dimensions[index].is_transient()
            || Some(index) == self.plan.swapchain_physical_index
    }

    fn physical_attachment(&self, index: usize) -> anyhow::Result<PhysicalAttachment> {
        if Some(index) == self.plan.swapchain_physical_index {
            return self
                .runtime
                .swapchain
                .context("swapchain image was not set up");
        }
        self.runtime.attachment(index, false)
    }

    fn invalidate(&mut self, submission: &mut Submission, barrier: &Barrier) -> anyhow::Result<()> {
        let index = barrier.resource_index;
        if self.skips_sync(index) {
            return Ok(());
        }
        let plan = self.plan;
        let dims = &plan.physical_dimensions[index];
        let queue = submission.queue;
        let event = self.runtime.event_mut(index, barrier.history);

        let is_image = !dims.is_buffer() && !dims.is_proxy();
        let layout_change = is_image && event.layout != barrier.layout;
        let needs_sync = event.needs_invalidate(barrier.access, barrier.stages)
            || (dims.is_proxy() && event.producer.is_some());
        if !needs_sync && !layout_change {
            return Ok(());
        }

        let old_layout = event.layout;
        let (src_stages, src_access) = match event.sync_source(queue) {
            SyncSource::Barrier { stages, access } => (stages, access),
            SyncSource::Semaphore(semaphore) => {
                submission.waits.push(SemaphoreWait {
                    semaphore,
                    stages: barrier.stages,
                });
                event.waited(queue, barrier.stages);
                // A layout transition still has to wait for the semaphore's stages.
                let stages = if is_image { barrier.stages } else { vk::PipelineStageFlags2::NONE };
                (stages, vk::AccessFlags2::NONE)
            }
            SyncSource::None => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
        };
        event.mark_invalidated(barrier.access, barrier.stages);
        if is_image {
            event.layout = barrier.layout;
        }

        if dims.is_proxy() {
            if !src_stages.is_empty() {
                submission.barrier.src_stages |= src_stages;
                submission.barrier.dst_stages |= barrier.stages;
            }
        } else if dims.is_buffer() {
            if !src_stages.is_empty() && !src_access.is_empty() {
                submission.barrier.buffers.push(BufferBarrier {
                    buffer: self.runtime.buffer(index)?,
                    src_stages,
                    src_access,
                    dst_stages: barrier.stages,
                    dst_access: barrier.access,
                });
            }
        } else if layout_change || !src_stages.is_empty() {
            let image = self.runtime.attachment(index, barrier.history)?.image;
            log_image_transition(
                ImageState::new(old_layout, src_stages, src_access),
                ImageState::new(barrier.layout, barrier.stages, barrier.access),
                &dims.name,
            );
            submission.barrier.images.push(ImageBarrier {
                image,
                aspect: aspect_for_format(dims.format),
                levels: dims.levels,
                layers: dims.layers,
                old_layout,
                new_layout: barrier.layout,
                src_stages,
                src_access,
                dst_stages: barrier.stages,
                dst_access: barrier.access,
            });
        }
        Ok(())
    }

    fn flush(&mut self, submission: &mut Submission, barrier: &Barrier) -> anyhow::Result<()> {
        let index = barrier.resource_index;
        if self.skips_sync(index) {
            return Ok(());
        }
        let plan = self.plan;
        let dims = &plan.physical_dimensions[index];
        let queue = submission.queue;
        let event = self.runtime.event_mut(index, barrier.history);
        event.flush(queue, barrier.layout, barrier.access, barrier.stages);

        if dims.uses_semaphore() {
            for target in dims.physical_queues().filter(|&q| q != queue) {
                let semaphore = self
                    .device
                    .request_semaphore()
                    .context("failed to request semaphore")?;
                submission.signals.push(semaphore);
                self.runtime
                    .event_mut(index, barrier.history)
                    .set_wait_semaphore(target, semaphore);
            }
        }
        Ok(())
    }

    fn attachment_info(
        &self,
        physical_pass: &PhysicalPass,
        index: usize,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear: Option<vk::ClearValue>,
    ) -> anyhow::Result<RenderPassAttachment> {
        let dims = &self.plan.physical_dimensions[index];
        let layouts = physical_pass.attachment_layouts(index);
        let mut initial_layout = layouts.map_or(vk::ImageLayout::UNDEFINED, |l| l.initial);
        let mut final_layout = layouts.map_or(vk::ImageLayout::UNDEFINED, |l| l.r#final);
        if dims.is_transient() {
            initial_layout = vk::ImageLayout::UNDEFINED;
        }
        if Some(index) == self.plan.swapchain_physical_index {
            initial_layout = vk::ImageLayout::UNDEFINED;
            final_layout = vk::ImageLayout::PRESENT_SRC_KHR;
        }
        Ok(RenderPassAttachment {
            attachment: self.physical_attachment(index)?,
            format: dims.format,
            load_op,
            store_op,
            initial_layout,
            final_layout,
            clear,
        })
    }

    fn render_pass(&self, physical_pass: &PhysicalPass, name: &str) -> anyhow::Result<RenderPassBegin> {
        let info = &physical_pass.render_pass_info;

        let mut color_attachments = Vec::with_capacity(physical_pass.physical_color_attachments.len());
        for (i, &index) in physical_pass.physical_color_attachments.iter().enumerate() {
            let attachment = i as u32;
            let load_op = info.load_op(attachment);
            let clear = (load_op == vk::AttachmentLoadOp::CLEAR).then(|| {
                let color = physical_pass
                    .color_clear_requests
                    .iter()
                    .find(|r| r.attachment == attachment)
                    .and_then(|r| self.passes[r.pass].clear_color_value(r.color_index))
                    .unwrap_or(vk::ClearColorValue { float32: [0.0; 4] });
                vk::ClearValue { color }
            });
            color_attachments.push(self.attachment_info(
                physical_pass,
                index,
                load_op,
                info.store_op(attachment),
                clear,
            )?);
        }

        let depth_stencil = physical_pass
            .physical_depth_stencil_attachment
            .map(|index| {
                let load_op = info.depth_stencil_load_op();
                let clear = (load_op == vk::AttachmentLoadOp::CLEAR).then(|| {
                    let depth_stencil = physical_pass
                        .depth_clear_request
                        .and_then(|r| self.passes[r.pass].clear_depth_stencil_value())
                        .unwrap_or(vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        });
                    vk::ClearValue { depth_stencil }
                });
                self.attachment_info(
                    physical_pass,
                    index,
                    load_op,
                    info.depth_stencil_store_op(),
                    clear,
                )
            })
            .transpose()?;

        let extent_source = physical_pass
            .physical_color_attachments
            .first()
            .copied()
            .or(physical_pass.physical_depth_stencil_attachment)
            .context("render pass without attachments")?;
        let dims = &self.plan.physical_dimensions[extent_source];

        Ok(RenderPassBegin {
            name: name.to_string(),
            extent: vk::Extent2D {
                width: dims.width,
                height: dims.height,
            },
            color_attachments,
            depth_stencil,
            subpasses: info.subpasses.clone(),
        })
    }

    fn schedule_physical_pass(&mut self, index: usize) -> anyhow::Result<Option<Submission>> {
        let plan = self.plan;
        let passes = self.passes;
        let physical_pass = &plan.physical_passes[index];
        let members = || physical_pass.passes.iter().map(|&p| &passes[p]);

        if !members().any(|pass| pass.need_render_pass()) {
            log::trace!("Skipping physical pass #{}, no member needs to render", index);
            return Ok(None);
        }

        let queue = passes[physical_pass.passes[0]].queue;
        let name = members().map(|p| p.name.as_str()).collect::<Vec<_>>().join("+");
        let mut submission = Submission::new(name, queue.physical_queue(), Some(index));

        for &discard in &physical_pass.discards {
            let dims = &plan.physical_dimensions[discard];
            if !dims.is_buffer() && !dims.is_proxy() {
                self.runtime.events[discard].layout = vk::ImageLayout::UNDEFINED;
            }
        }
        for barrier in &physical_pass.invalidate {
            self.invalidate(&mut submission, barrier)?;
        }

        let has_attachments = !physical_pass.physical_color_attachments.is_empty()
            || physical_pass.physical_depth_stencil_attachment.is_some();
        if !queue.is_compute() && has_attachments {
            submission.render_pass = Some(self.render_pass(physical_pass, &submission.name)?);
            submission.scaled_clears = physical_pass
                .scaled_clear_requests
                .iter()
                .map(|requests| {
                    requests
                        .iter()
                        .map(|r| Ok((r.target, self.runtime.attachment(r.physical_resource, false)?.view)))
                        .collect::<anyhow::Result<Vec<_>>>()
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
        }
        for request in &physical_pass.mipmap_requests {
            let image = self.runtime.attachment(request.physical_resource, false)?.image;
            submission
                .mipmaps
                .push((image, plan.physical_dimensions[request.physical_resource].clone()));
        }

        for barrier in &physical_pass.flush {
            self.flush(&mut submission, barrier)?;
        }
        Ok(Some(submission))
    }

    /// Resamples a backbuffer that could not alias the swapchain into it.
    fn schedule_swapchain_resample(&mut self) -> anyhow::Result<Submission> {
        let index = self.plan.backbuffer_physical_index;
        let mut submission = Submission::new("swapchain_resample".to_string(), QueueType::Graphics, None);

        let read = Barrier {
            resource_index: index,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            access: vk::AccessFlags2::SHADER_SAMPLED_READ,
            stages: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            history: false,
        };
        self.invalidate(&mut submission, &read)?;

        let swapchain = self.runtime.swapchain.context("swapchain image was not set up")?;
        submission.render_pass = Some(RenderPassBegin {
            name: submission.name.clone(),
            extent: vk::Extent2D {
                width: self.swapchain_dimensions.width,
                height: self.swapchain_dimensions.height,
            },
            color_attachments: vec![RenderPassAttachment {
                attachment: swapchain,
                format: self.swapchain_dimensions.format,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                clear: None,
            }],
            depth_stencil: None,
            subpasses: vec![SubpassInfo {
                color_attachments: [0].into_iter().collect(),
                ..Default::default()
            }],
        });
        submission.resample_source = Some(self.runtime.attachment(index, false)?.view);

        self.flush(
            &mut submission,
            &Barrier {
                access: vk::AccessFlags2::NONE,
                ..read
            },
        )?;
        Ok(submission)
    }
}

fn record(graph: &RenderGraph, plan: &BakedPlan, cmd: &mut dyn CommandBuffer, submission: &Submission) -> anyhow::Result<()> {
    let mut failure = None;
    cmd.begin_region(&submission.name);
    if !submission.barrier.is_empty() {
        cmd.pipeline_barrier(&submission.barrier);
    }

    match submission.physical_pass {
        None => {
            if let (Some(render_pass), Some(source)) = (&submission.render_pass, submission.resample_source) {
                cmd.begin_render_pass(render_pass);
                cmd.resample_attachment(0, source);
                cmd.end_render_pass();
            }
        }
        Some(index) => {
            let physical_pass = &plan.physical_passes[index];
            let mut run = |cmd: &mut dyn CommandBuffer, pass: &LogicalPass| {
                if !pass.need_render_pass() {
                    return;
                }
                if let Err(e) = pass.build_render_pass(cmd) {
                    failure.get_or_insert(e.context(format!("pass {} failed to record", pass.name)));
                }
            };

            if let Some(render_pass) = &submission.render_pass {
                cmd.begin_render_pass(render_pass);
                for (subpass, &pass) in physical_pass.passes.iter().enumerate() {
                    if subpass > 0 {
                        cmd.next_subpass();
                    }
                    for &(target, view) in submission.scaled_clears.get(subpass).into_iter().flatten() {
                        cmd.resample_attachment(target, view);
                    }
                    run(&mut *cmd, &graph.passes[pass]);
                }
                cmd.end_render_pass();
            } else {
                for &pass in &physical_pass.passes {
                    run(&mut *cmd, &graph.passes[pass]);
                }
            }

            for (image, dims) in &submission.mipmaps {
                cmd.generate_mipmaps(*image, dims);
            }
        }
    }

    cmd.end_region();
    failure.map_or(Ok(()), Err)
}

impl RenderGraph {
    /// Creates or refreshes the images and buffers backing every physical
    /// resource, and binds this frame's swapchain image.
    ///
    /// Call once per frame before [`RenderGraph::enqueue_render_passes`].
    pub fn setup_attachments<D: Device + ?Sized>(
        &mut self,
        device: &D,
        swapchain: PhysicalAttachment,
    ) -> anyhow::Result<()> {
        let plan = self.plan.as_ref().ok_or(GraphError::NotBaked)?;
        let runtime = &mut self.runtime;
        runtime.resize(plan.physical_dimensions.len());
        runtime.swapchain = Some(swapchain);

        for (index, dims) in plan.physical_dimensions.iter().enumerate() {
            if dims.is_proxy() {
                continue;
            }

            let unchanged = runtime.created[index]
                .as_ref()
                .is_some_and(|created| created == dims && created.image_usage == dims.image_usage);

            if dims.is_buffer() {
                if !unchanged || runtime.buffers[index].is_none() {
                    runtime.buffers[index] = Some(
                        device
                            .create_buffer(dims)
                            .with_context(|| format!("failed to create buffer {}", dims.name))?,
                    );
                    runtime.created[index] = Some(dims.clone());
                    runtime.events[index].reset();
                    log::debug!("Created {}", dims);
                }
                continue;
            }

            if Some(index) == plan.swapchain_physical_index {
                runtime.attachments[index] = Some(swapchain);
                runtime.events[index].reset();
                continue;
            }

            if dims.is_transient() {
                runtime.attachments[index] = Some(
                    device
                        .transient_attachment(dims)
                        .with_context(|| format!("failed to get transient attachment {}", dims.name))?,
                );
                runtime.events[index].reset();
                continue;
            }

            let has_history = plan.physical_image_has_history[index];
            if !unchanged || runtime.attachments[index].is_none() {
                runtime.attachments[index] = Some(
                    device
                        .create_image(dims)
                        .with_context(|| format!("failed to create image {}", dims.name))?,
                );
                runtime.events[index].reset();
                if has_history {
                    runtime.history_attachments[index] = Some(
                        device
                            .create_image(dims)
                            .with_context(|| format!("failed to create history image {}", dims.name))?,
                    );
                    runtime.history_events[index].reset();
                }
                runtime.created[index] = Some(dims.clone());
                log::debug!("Created {}", dims);
            } else if has_history {
                std::mem::swap(
                    &mut runtime.attachments[index],
                    &mut runtime.history_attachments[index],
                );
                std::mem::swap(&mut runtime.events[index], &mut runtime.history_events[index]);
            }
        }

        runtime.frame += 1;
        Ok(())
    }

    /// Schedules every physical pass of the baked plan onto `composer`.
    ///
    /// Synchronization is resolved here, in plan order. Recording runs in one
    /// composer stage with a task per submission; submission follows in a
    /// second stage, in plan order. Recording and submission failures are
    /// logged by the composer and do not stop the remaining work.
    pub fn enqueue_render_passes<'a, D: Device + ?Sized>(
        &'a mut self,
        device: &'a D,
        composer: &mut TaskComposer<'a>,
    ) -> anyhow::Result<()> {
        let _span = tracing::debug_span!("enqueue_render_passes").entered();

        let plan = self.plan.as_ref().ok_or(GraphError::NotBaked)?;
        if self.runtime.events.len() != plan.physical_dimensions.len() || self.runtime.swapchain.is_none() {
            anyhow::bail!("setup_attachments must run before enqueue_render_passes");
        }

        let mut scheduler = Scheduler {
            plan,
            passes: &self.passes,
            swapchain_dimensions: &self.swapchain_dimensions,
            runtime: &mut self.runtime,
            device,
        };
        let mut submissions = Vec::with_capacity(plan.physical_passes.len() + 1);
        for index in 0..plan.physical_passes.len() {
            if let Some(submission) = scheduler.schedule_physical_pass(index)? {
                submissions.push(submission);
            }
        }
        if plan.swapchain_physical_index.is_none() {
            submissions.push(scheduler.schedule_swapchain_resample()?);
        }
        log::trace!("Frame {}: {} submissions", scheduler.runtime.frame, submissions.len());

        let this: &'a RenderGraph = self;
        let Some(plan) = this.plan.as_ref() else {
            return Err(GraphError::NotBaked.into());
        };
        let (recorded_tx, recorded_rx) = unbounded::<Recorded>();

        let stage = composer.begin_pipeline_stage("record");
        for (order, submission) in submissions.into_iter().enumerate() {
            let recorded_tx = recorded_tx.clone();
            stage.enqueue_task(submission.name.clone(), move || {
                let mut cmd = device
                    .request_command_buffer(submission.queue)
                    .with_context(|| format!("failed to get command buffer for {}", submission.name))?;
                let result = record(this, plan, cmd.as_mut(), &submission);
                // Submitted even on failure so the semaphores it signals do not stall other queues.
                let _ = recorded_tx.send((order, cmd, submission.waits, submission.signals));
                result
            });
        }

        composer.begin_pipeline_stage("submit").enqueue_task("submit", move || {
            let mut recorded = recorded_rx.try_iter().collect::<Vec<_>>();
            recorded.sort_by_key(|(order, ..)| *order);
            for (order, cmd, waits, signals) in recorded {
                let queue = cmd.queue();
                if let Err(e) = device.submit(cmd, &waits, &signals) {
                    log::error!("Submission {} on {} queue failed: {:?}", order, queue, e);
                }
            }
            Ok(())
        });

        Ok(())
    }
}
