use crate::framegraph::{RenderGraph, layouts::layout_str};

impl RenderGraph {
    /// Dumps the baked plan at info level. Not a stable format.
    pub fn log(&self) {
        let Some(plan) = self.plan.as_ref() else {
            log::info!("Render graph is not baked");
            return;
        };

        for (index, dims) in plan.physical_dimensions.iter().enumerate() {
            log::info!(
                "Resource #{}{}{}: {}",
                index,
                if dims.is_transient() { " (transient)" } else { "" },
                if plan.physical_image_has_history[index] { " (history)" } else { "" },
                dims
            );
        }
        if plan.swapchain_physical_index.is_none() {
            log::info!(
                "Backbuffer #{} is resampled into the swapchain",
                plan.backbuffer_physical_index
            );
        }

        for (index, physical_pass) in plan.physical_passes.iter().enumerate() {
            log::info!("Physical pass #{}:", index);

            for barrier in &physical_pass.invalidate {
                log::info!("  Invalidate: {}", barrier);
            }

            for (subpass, &pass) in physical_pass.passes.iter().enumerate() {
                let pass = &self.passes[pass];
                log::info!("  Subpass #{} ({}, {:?}):", subpass, pass.name, pass.queue);

                let barriers = &plan.pass_barriers[pass.index];
                for barrier in &barriers.invalidate {
                    log::info!("    Invalidate: {}", barrier);
                }
                for &output in &pass.color_outputs {
                    log::info!("    ColorOutput: {}", self.resources[output].name);
                }
                if let Some(depth) = pass.depth_stencil_output {
                    log::info!("    DepthStencilOutput: {}", self.resources[depth].name);
                }
                for barrier in &barriers.flush {
                    log::info!("    Flush: {}", barrier);
                }
            }

            for barrier in &physical_pass.flush {
                log::info!("  Flush: {}", barrier);
            }
            for &discard in &physical_pass.discards {
                log::info!("  Discard: #{}", discard);
            }
            for layouts in &physical_pass.layouts {
                log::info!(
                    "  Layout #{}: {} -> {}",
                    layouts.physical_resource,
                    layout_str(layouts.initial),
                    layout_str(layouts.r#final)
                );
            }
        }
    }
}
