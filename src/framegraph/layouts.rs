use std::fmt;

use ash::vk;

/// Layout, stages and access of an image at one side of a transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageState {
    pub layout: vk::ImageLayout,
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl ImageState {
    pub const fn new(
        layout: vk::ImageLayout,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        Self {
            layout,
            stage,
            access,
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ layout: {}, stage: {}, access: {} }}",
            layout_str(self.layout),
            stage_str(self.stage),
            access_str(self.access)
        )
    }
}

pub fn layout_str(layout: vk::ImageLayout) -> &'static str {
    match layout {
        vk::ImageLayout::UNDEFINED => "UNDEFINED",
        vk::ImageLayout::GENERAL => "GENERAL",
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => "COLOR_ATTACHMENT_OPTIMAL",
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => "DEPTH_STENCIL_ATTACHMENT_OPTIMAL",
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => "DEPTH_STENCIL_READ_ONLY_OPTIMAL",
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => "SHADER_READ_ONLY_OPTIMAL",
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => "TRANSFER_SRC_OPTIMAL",
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => "TRANSFER_DST_OPTIMAL",
        vk::ImageLayout::PRESENT_SRC_KHR => "PRESENT_SRC_KHR",
        _ => "OTHER",
    }
}

const STAGE_NAMES: &[(vk::PipelineStageFlags2, &str)] = &[
    (vk::PipelineStageFlags2::TOP_OF_PIPE, "TOP_OF_PIPE"),
    (vk::PipelineStageFlags2::DRAW_INDIRECT, "DRAW_INDIRECT"),
    (vk::PipelineStageFlags2::VERTEX_INPUT, "VERTEX_INPUT"),
    (vk::PipelineStageFlags2::VERTEX_SHADER, "VERTEX_SHADER"),
    (vk::PipelineStageFlags2::FRAGMENT_SHADER, "FRAGMENT_SHADER"),
    (vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS, "EARLY_FRAGMENT_TESTS"),
    (vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS, "LATE_FRAGMENT_TESTS"),
    (vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, "COLOR_ATTACHMENT_OUTPUT"),
    (vk::PipelineStageFlags2::COMPUTE_SHADER, "COMPUTE_SHADER"),
    (vk::PipelineStageFlags2::TRANSFER, "TRANSFER"),
    (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, "BOTTOM_OF_PIPE"),
    (vk::PipelineStageFlags2::ALL_COMMANDS, "ALL_COMMANDS"),
];

const ACCESS_NAMES: &[(vk::AccessFlags2, &str)] = &[
    (vk::AccessFlags2::INDIRECT_COMMAND_READ, "INDIRECT_COMMAND_READ"),
    (vk::AccessFlags2::INDEX_READ, "INDEX_READ"),
    (vk::AccessFlags2::VERTEX_ATTRIBUTE_READ, "VERTEX_ATTRIBUTE_READ"),
    (vk::AccessFlags2::UNIFORM_READ, "UNIFORM_READ"),
    (vk::AccessFlags2::INPUT_ATTACHMENT_READ, "INPUT_ATTACHMENT_READ"),
    (vk::AccessFlags2::SHADER_READ, "SHADER_READ"),
    (vk::AccessFlags2::SHADER_WRITE, "SHADER_WRITE"),
    (vk::AccessFlags2::SHADER_SAMPLED_READ, "SHADER_SAMPLED_READ"),
    (vk::AccessFlags2::SHADER_STORAGE_READ, "SHADER_STORAGE_READ"),
    (vk::AccessFlags2::SHADER_STORAGE_WRITE, "SHADER_STORAGE_WRITE"),
    (vk::AccessFlags2::COLOR_ATTACHMENT_READ, "COLOR_ATTACHMENT_READ"),
    (vk::AccessFlags2::COLOR_ATTACHMENT_WRITE, "COLOR_ATTACHMENT_WRITE"),
    (vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ, "DEPTH_STENCIL_ATTACHMENT_READ"),
    (vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE, "DEPTH_STENCIL_ATTACHMENT_WRITE"),
    (vk::AccessFlags2::TRANSFER_READ, "TRANSFER_READ"),
    (vk::AccessFlags2::TRANSFER_WRITE, "TRANSFER_WRITE"),
];

fn join_names<F: Copy>(names: &[(F, &str)], contains: impl Fn(F) -> bool) -> String {
    let matched = names
        .iter()
        .filter(|(flag, _)| contains(*flag))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>();
    if matched.is_empty() {
        "NONE".to_string()
    } else {
        matched.join(" | ")
    }
}

pub fn stage_str(stage: vk::PipelineStageFlags2) -> String {
    join_names(STAGE_NAMES, |flag| stage.contains(flag))
}

pub fn access_str(access: vk::AccessFlags2) -> String {
    join_names(ACCESS_NAMES, |flag| access.contains(flag))
}

pub fn log_image_transition(old: ImageState, new: ImageState, debug_name: &str) {
    log::trace!(
        "{}\n     layout: {} -> {}\n     stage:  {} -> {}\n     access: {} -> {}",
        debug_name,
        layout_str(old.layout),
        layout_str(new.layout),
        stage_str(old.stage),
        stage_str(new.stage),
        access_str(old.access),
        access_str(new.access)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_joined() {
        assert_eq!(
            stage_str(
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            ),
            "EARLY_FRAGMENT_TESTS | LATE_FRAGMENT_TESTS"
        );
        assert_eq!(access_str(vk::AccessFlags2::NONE), "NONE");
        assert_eq!(layout_str(vk::ImageLayout::GENERAL), "GENERAL");
    }
}
