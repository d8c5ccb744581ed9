use crate::framegraph::{
    PassIndex, RenderGraph, ResourceIndex,
    error::{GraphError, GraphResult},
    pass::LogicalPass,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Edge {
    /// Producer must run first and must exist.
    Hard,
    /// Like `Hard`, but the consuming pass may also be a producer.
    AllowSelf,
    /// Buffer reads: producers are optional and read-after-write loops are tolerated.
    Feedback,
}

#[derive(Clone, Copy, Debug)]
struct Dependency {
    pass: PassIndex,
    feedback: bool,
}

struct Frame {
    pass: PassIndex,
    dependencies: Vec<Dependency>,
    next: usize,
}

/// Orders the passes reachable from the backbuffer so that every producer
/// precedes its consumers.
///
/// Dependencies are walked depth first without recursion. Higher priority
/// producers (depth, attachment and color inputs) are finished last, which
/// places them right before their consumer and gives the merger adjacent
/// candidates.
pub(crate) struct DependencyResolver<'g> {
    graph: &'g RenderGraph,
    marks: Vec<Mark>,
    order: Vec<PassIndex>,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g RenderGraph) -> Self {
        Self {
            graph,
            marks: vec![Mark::Unvisited; graph.passes.len()],
            order: Vec::with_capacity(graph.passes.len()),
        }
    }

    pub fn resolve(mut self, backbuffer: ResourceIndex) -> GraphResult<Vec<PassIndex>> {
        let resource = self.graph.resource(backbuffer);
        let writers = resource.written_in_passes();
        if writers.is_empty() {
            return Err(GraphError::BackbufferNotWritten(resource.name.clone()));
        }

        for &writer in writers.iter().rev() {
            self.visit(writer)?;
        }
        Ok(self.order)
    }

    fn visit(&mut self, root: PassIndex) -> GraphResult<()> {
        if self.marks[root] != Mark::Unvisited {
            return Ok(());
        }

        let mut stack = vec![self.enter(root)?];
        while let Some(frame) = stack.last_mut() {
            if frame.next == frame.dependencies.len() {
                let pass = frame.pass;
                stack.pop();
                self.marks[pass] = Mark::Done;
                self.order.push(pass);
                continue;
            }

            let consumer = frame.pass;
            let dependency = frame.dependencies[frame.next];
            frame.next += 1;

            match self.marks[dependency.pass] {
                Mark::Unvisited => {
                    let frame = self.enter(dependency.pass)?;
                    stack.push(frame);
                }
                Mark::InProgress if dependency.feedback => {
                    log::trace!(
                        "Ignoring buffer feedback from {} into {}",
                        self.graph.passes[dependency.pass].name,
                        self.graph.passes[consumer].name
                    );
                }
                Mark::InProgress => {
                    return Err(GraphError::CyclicDependency(
                        self.graph.passes[consumer].name.clone(),
                    ));
                }
                Mark::Done => {}
            }
        }
        Ok(())
    }

    fn enter(&mut self, pass: PassIndex) -> GraphResult<Frame> {
        self.marks[pass] = Mark::InProgress;
        let mut dependencies = self.dependencies(&self.graph.passes[pass])?;
        // Finish order is the reverse of visit order.
        dependencies.reverse();
        Ok(Frame {
            pass,
            dependencies,
            next: 0,
        })
    }

    fn writers(
        &self,
        pass: &LogicalPass,
        resource: ResourceIndex,
        edge: Edge,
        out: &mut Vec<Dependency>,
    ) -> GraphResult<()> {
        let resource = self.graph.resource(resource);
        let writers = resource.written_in_passes();

        if writers.is_empty() && edge != Edge::Feedback {
            return Err(GraphError::ResourceNotWritten {
                pass: pass.name.clone(),
                resource: resource.name.clone(),
            });
        }

        for &writer in writers {
            if writer == pass.index {
                match edge {
                    Edge::Hard => return Err(GraphError::SelfDependency(pass.name.clone())),
                    Edge::AllowSelf | Edge::Feedback => continue,
                }
            }
            out.push(Dependency {
                pass: writer,
                feedback: edge == Edge::Feedback,
            });
        }
        Ok(())
    }

    /// Producers of everything `pass` reads, highest merge priority first.
    fn dependencies(&self, pass: &LogicalPass) -> GraphResult<Vec<Dependency>> {
        let mut out = Vec::new();

        if let Some(depth) = pass.depth_stencil_input {
            let edge = if pass.depth_stencil_output == Some(depth) {
                Edge::AllowSelf
            } else {
                Edge::Hard
            };
            self.writers(pass, depth, edge, &mut out)?;
        }

        for &input in &pass.attachment_inputs {
            self.writers(pass, input, Edge::AllowSelf, &mut out)?;
        }

        for &input in pass.color_inputs.iter().flatten() {
            self.writers(pass, input, Edge::Hard, &mut out)?;
        }

        let textures = pass
            .color_scale_inputs
            .iter()
            .chain(&pass.blit_texture_inputs)
            .chain(&pass.storage_texture_inputs)
            .flatten()
            .copied()
            .chain(pass.generic_textures.iter().map(|t| t.texture))
            .chain(pass.proxy_inputs.iter().map(|p| p.proxy))
            .chain(pass.fake_resource_aliases.iter().map(|&(from, _)| from));
        for input in textures {
            self.writers(pass, input, Edge::Hard, &mut out)?;
        }

        for &input in pass.storage_inputs.iter().flatten() {
            self.writers(pass, input, Edge::Feedback, &mut out)?;
        }

        for buffer in &pass.generic_buffers {
            self.writers(pass, buffer.buffer, Edge::Feedback, &mut out)?;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::framegraph::{AttachmentInfo, GraphError, RenderGraph, RenderGraphQueueFlags};

    use super::DependencyResolver;

    fn resolve(graph: &RenderGraph, backbuffer: &str) -> Result<Vec<String>, GraphError> {
        let backbuffer = graph.find_resource(backbuffer).unwrap().index;
        DependencyResolver::new(graph).resolve(backbuffer).map(|stack| {
            stack
                .into_iter()
                .map(|p| graph.pass(p).name().to_string())
                .collect()
        })
    }

    #[test]
    fn merge_candidates_finish_next_to_consumer() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("a", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("a", &info, None);
        graph
            .add_pass("c", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("c", &info, None);
        graph
            .add_pass("b", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("b", &info, Some("a"))
            .add_texture_input("c", None);

        assert_eq!(resolve(&graph, "b").unwrap(), ["c", "a", "b"]);
    }

    #[test]
    fn unreachable_passes_are_culled() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("unused", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("unused", &info, None);
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("main", &info, None);

        assert_eq!(resolve(&graph, "main").unwrap(), ["main"]);
    }

    #[test]
    fn texture_cycle_is_an_error() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("x", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("x", &info, None)
            .add_texture_input("y", None);
        graph
            .add_pass("y", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("y", &info, None)
            .add_texture_input("x", None);

        assert!(matches!(
            resolve(&graph, "x"),
            Err(GraphError::CyclicDependency(_))
        ));
    }

    #[test]
    fn reading_own_output_is_a_self_dependency() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("loop", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("loop", &info, None)
            .add_texture_input("loop", None);

        assert_eq!(
            resolve(&graph, "loop"),
            Err(GraphError::SelfDependency("loop".into()))
        );
    }

    #[test]
    fn missing_producer_is_reported() {
        let info = AttachmentInfo::default();
        let mut graph = RenderGraph::new();
        graph
            .add_pass("main", RenderGraphQueueFlags::GRAPHICS)
            .add_color_output("main", &info, None)
            .add_texture_input("nowhere", None);

        assert_eq!(
            resolve(&graph, "main"),
            Err(GraphError::ResourceNotWritten {
                pass: "main".into(),
                resource: "nowhere".into(),
            })
        );
    }
}
