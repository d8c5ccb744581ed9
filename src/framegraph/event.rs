use ash::vk;

use crate::framegraph::flags::QueueType;

/// How a pending write reaches a new use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncSource {
    /// Same-queue pipeline barrier from the recorded producer stages.
    Barrier {
        stages: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    },
    /// Cross-queue wait. The semaphore is consumed by the first waiter.
    Semaphore(vk::Semaphore),
    /// No producer this frame; only a transition out of the current layout.
    None,
}

/// Synchronization state of one physical resource across passes and frames.
#[derive(Clone, Debug)]
pub(crate) struct PipelineEvent {
    pub layout: vk::ImageLayout,
    pub to_flush_access: vk::AccessFlags2,
    pub src_stages: vk::PipelineStageFlags2,
    pub producer: Option<QueueType>,
    /// Access already made visible, per destination stage bit.
    invalidated_in_stage: [vk::AccessFlags2; 64],
    wait_semaphores: [Option<vk::Semaphore>; QueueType::ALL.len()],
}

impl Default for PipelineEvent {
    fn default() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            to_flush_access: vk::AccessFlags2::NONE,
            src_stages: vk::PipelineStageFlags2::NONE,
            producer: None,
            invalidated_in_stage: [vk::AccessFlags2::NONE; 64],
            wait_semaphores: [None; QueueType::ALL.len()],
        }
    }
}

fn stage_bits(stages: vk::PipelineStageFlags2) -> impl Iterator<Item = usize> {
    let raw = stages.as_raw();
    (0..64).filter(move |bit| raw & (1u64 << bit) != 0)
}

impl PipelineEvent {
    /// Forgets everything, as after a discard or a reallocation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn needs_invalidate(&self, access: vk::AccessFlags2, stages: vk::PipelineStageFlags2) -> bool {
        stage_bits(stages).any(|bit| !self.invalidated_in_stage[bit].contains(access))
    }

    pub fn mark_invalidated(&mut self, access: vk::AccessFlags2, stages: vk::PipelineStageFlags2) {
        for bit in stage_bits(stages) {
            self.invalidated_in_stage[bit] |= access;
        }
    }

    pub fn clear_invalidated(&mut self) {
        self.invalidated_in_stage = [vk::AccessFlags2::NONE; 64];
    }

    /// Records the last use of the resource on `queue`. An empty `access`
    /// means the use was read-only.
    pub fn flush(
        &mut self,
        queue: QueueType,
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        stages: vk::PipelineStageFlags2,
    ) {
        self.layout = layout;
        self.producer = Some(queue);
        if access.is_empty() {
            // Readers extend the chain; a pending write stays pending.
            self.src_stages |= stages;
        } else {
            self.to_flush_access = access;
            self.src_stages = stages;
            self.clear_invalidated();
        }
    }

    /// After a semaphore wait the write is visible to `queue` from `stages` on.
    pub fn waited(&mut self, queue: QueueType, stages: vk::PipelineStageFlags2) {
        self.producer = Some(queue);
        self.src_stages = stages;
        self.to_flush_access = vk::AccessFlags2::NONE;
    }

    pub fn set_wait_semaphore(&mut self, queue: QueueType, semaphore: vk::Semaphore) {
        self.wait_semaphores[queue.index()] = Some(semaphore);
    }

    pub fn sync_source(&mut self, queue: QueueType) -> SyncSource {
        match self.producer {
            None => SyncSource::None,
            Some(producer) if producer == queue => SyncSource::Barrier {
                stages: self.src_stages,
                access: self.to_flush_access,
            },
            Some(_) => match self.wait_semaphores[queue.index()].take() {
                Some(semaphore) => SyncSource::Semaphore(semaphore),
                None => {
                    log::warn!(
                        "No semaphore signalled towards {} queue, falling back to a barrier",
                        queue
                    );
                    SyncSource::Barrier {
                        stages: self.src_stages,
                        access: self.to_flush_access,
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    #[test]
    fn invalidation_is_tracked_per_stage() {
        let mut event = PipelineEvent::default();
        let access = vk::AccessFlags2::SHADER_SAMPLED_READ;
        let fragment = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        let compute = vk::PipelineStageFlags2::COMPUTE_SHADER;

        assert!(event.needs_invalidate(access, fragment));
        event.mark_invalidated(access, fragment);
        assert!(!event.needs_invalidate(access, fragment));
        assert!(event.needs_invalidate(access, fragment | compute));
    }

    #[test]
    fn writes_clear_invalidation() {
        let mut event = PipelineEvent::default();
        let stages = vk::PipelineStageFlags2::FRAGMENT_SHADER;
        event.mark_invalidated(vk::AccessFlags2::SHADER_SAMPLED_READ, stages);
        event.flush(
            QueueType::Graphics,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        );
        assert!(event.needs_invalidate(vk::AccessFlags2::SHADER_SAMPLED_READ, stages));
    }

    #[test]
    fn cross_queue_waits_consume_the_semaphore() {
        let mut event = PipelineEvent::default();
        assert_eq!(event.sync_source(QueueType::Graphics), SyncSource::None);

        event.flush(
            QueueType::AsyncCompute,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
        );
        let semaphore = vk::Semaphore::from_raw(7);
        event.set_wait_semaphore(QueueType::Graphics, semaphore);

        assert_eq!(
            event.sync_source(QueueType::Graphics),
            SyncSource::Semaphore(semaphore)
        );
        assert!(matches!(
            event.sync_source(QueueType::AsyncCompute),
            SyncSource::Barrier { .. }
        ));
    }
}
