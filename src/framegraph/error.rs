use ash::vk;
use thiserror::Error;

/// Errors raised while declaring or baking a render graph.
///
/// A failed bake leaves the graph without a plan; the graph must be reset
/// or fixed and baked again before it can be enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("no backbuffer source has been set")]
    MissingBackbuffer,

    #[error("backbuffer source `{0}` is never written by any pass")]
    BackbufferNotWritten(String),

    #[error("resource `{resource}` is read by pass `{pass}` but never written")]
    ResourceNotWritten { pass: String, resource: String },

    #[error("cycle detected while resolving dependencies of pass `{0}`")]
    CyclicDependency(String),

    #[error("pass `{0}` depends on itself")]
    SelfDependency(String),

    #[error("pass `{pass}` declares {inputs} {role} inputs for {outputs} outputs")]
    MismatchedInputCount {
        pass: String,
        role: &'static str,
        inputs: usize,
        outputs: usize,
    },

    #[error("pass `{pass}` reads and writes `{input}` -> `{output}` with different dimensions")]
    RmwDimensionMismatch {
        pass: String,
        input: String,
        output: String,
    },

    #[error("resource `{resource}` already aliases physical resource {existing}, cannot alias {requested}")]
    AliasConflict {
        resource: String,
        existing: usize,
        requested: usize,
    },

    #[error("physical pass {physical_pass} needs more than {max} color attachments")]
    TooManyAttachments { physical_pass: usize, max: usize },

    #[error("compute pass `{0}` declares render target attachments")]
    AttachmentOnComputeQueue(String),

    #[error("pass `{pass}` uses `{resource}` as {existing:?} and {requested:?} at once")]
    LayoutMismatch {
        pass: String,
        resource: String,
        existing: vk::ImageLayout,
        requested: vk::ImageLayout,
    },

    #[error("unknown resource `{0}`")]
    UnknownResource(String),

    #[error("resource `{0}` is declared both as a texture and as a buffer")]
    ResourceKindMismatch(String),

    #[error("relative size of `{0}` refers back to itself")]
    RelativeSizeCycle(String),

    #[error("history of `{0}` is read but the resource is never written")]
    HistoryNeverWritten(String),

    #[error("the render graph has not been baked")]
    NotBaked,
}

pub type GraphResult<T> = Result<T, GraphError>;
