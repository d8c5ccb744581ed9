pub mod device;
pub mod framegraph;
pub mod headless;
pub mod task;
