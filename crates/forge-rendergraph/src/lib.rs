//! A frame-scoped DAG of render passes over virtual GPU resources.
//!
//! Passes declare the resources they read and write through a
//! [`PassBuilder`]; [`RenderGraph::compile`] culls passes and resources with
//! no path to a side-effect, then computes each surviving resource's
//! realize/destroy points. [`RenderGraph::execute`] walks the compiled graph
//! in declaration order, realizing (and aliasing) physical resources through
//! a [`forge_backend::BackendDriver`] just before they are first used.

mod error;
mod graph;
mod resources;

pub use error::{RenderGraphError, Result};
pub use graph::{ColorAttachmentDesc, DepthAttachmentDesc, PassBuilder, PassHandle, RenderGraph, RenderTargetBuilder};
pub use resources::{GraphResources, ResourceHandle, ResourceInfo, ResourceKind};
