use forge_backend::{
    BackendDriver, BufferDescriptor, ClearValue, LoadOp, RenderTargetDescriptor as BackendRenderTarget, StoreOp,
    TextureDescriptor, Usage,
};

use crate::error::{RenderGraphError, Result};
use crate::resources::{GraphResources, PhysicalHandle, ResourceHandle, ResourceKind, ResourcePool, VirtualResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassHandle(u32);

/// A color attachment referencing a graph-virtual resource, resolved to a
/// physical [`forge_backend::TextureHandle`] only at execute time.
#[derive(Clone, Copy)]
pub struct ColorAttachmentDesc {
    pub resource: ResourceHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

#[derive(Clone, Copy)]
pub struct DepthAttachmentDesc {
    pub resource: ResourceHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

/// A render target built against [`ResourceHandle`]s, attached to a pass via
/// [`PassBuilder::set_render_target`]. The physical descriptor handed to the
/// driver is assembled from this at execute time, once every resource it
/// names has been realized.
#[derive(Clone, Default)]
pub struct RenderTargetBuilder {
    pub color: Vec<ColorAttachmentDesc>,
    pub depth: Option<DepthAttachmentDesc>,
}

impl RenderTargetBuilder {
    pub fn new() -> RenderTargetBuilder {
        RenderTargetBuilder::default()
    }

    pub fn color(mut self, attachment: ColorAttachmentDesc) -> RenderTargetBuilder {
        self.color.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: DepthAttachmentDesc) -> RenderTargetBuilder {
        self.depth = Some(attachment);
        self
    }
}

type ExecuteFn = Box<dyn FnOnce(&mut dyn BackendDriver, &GraphResources<'_>) + 'static>;

pub(crate) struct PassNode {
    name: String,
    ref_count: u32,
    side_effect: bool,
    culled: bool,
    reads: Vec<ResourceHandle>,
    writes: Vec<ResourceHandle>,
    render_target: Option<RenderTargetBuilder>,
    execute: Option<ExecuteFn>,
    realize: Vec<u32>,
    destroy: Vec<u32>,
}

const SIDE_EFFECT_REF_COUNT: u32 = 0x7FFF;

/// The per-pass handle a setup closure uses to declare a pass's resource
/// dependencies. Dropped once the closure returns its execute callback.
pub struct PassBuilder<'g> {
    graph: &'g mut RenderGraph,
    pass: u32,
}

impl<'g> PassBuilder<'g> {
    pub fn create_texture(&mut self, name: &str, desc: TextureDescriptor) -> ResourceHandle {
        self.graph.push_resource(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Texture(desc),
            usage: Usage::NONE,
            version: 0,
            ref_count: 0,
            writer_pass: None,
            reader_passes: Vec::new(),
            physical: None,
        })
    }

    pub fn create_buffer(&mut self, name: &str, desc: BufferDescriptor) -> ResourceHandle {
        self.graph.push_resource(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::Buffer(desc),
            usage: Usage::NONE,
            version: 0,
            ref_count: 0,
            writer_pass: None,
            reader_passes: Vec::new(),
            physical: None,
        })
    }

    /// Registers this pass as reading `handle`, returning the same handle
    /// back for chaining.
    pub fn read(&mut self, handle: ResourceHandle, usage: Usage) -> ResourceHandle {
        let resource = &mut self.graph.resources[handle.index as usize];
        resource.usage |= usage;
        resource.reader_passes.push(self.pass);
        self.graph.passes[self.pass as usize].reads.push(handle);
        handle
    }

    /// Registers this pass as writing `handle`, returning a new handle at
    /// the next version. Later reads must use the returned handle, not the
    /// one passed in.
    pub fn write(&mut self, handle: ResourceHandle, usage: Usage) -> ResourceHandle {
        let resource = &mut self.graph.resources[handle.index as usize];
        resource.usage |= usage;
        resource.version += 1;
        resource.writer_pass = Some(self.pass);
        let written = ResourceHandle {
            index: handle.index,
            version: resource.version,
        };
        self.graph.passes[self.pass as usize].writes.push(written);
        written
    }

    /// Marks this pass as having an effect observable outside the graph
    /// (presenting a swapchain image, a readback), exempting it from
    /// culling regardless of whether anything reads its output.
    pub fn declare_side_effect(&mut self) {
        self.graph.passes[self.pass as usize].side_effect = true;
    }

    pub fn set_render_target(&mut self, render_target: RenderTargetBuilder) {
        self.graph.passes[self.pass as usize].render_target = Some(render_target);
    }
}

/// A frame-scoped DAG of passes over virtual resources. Passes are declared
/// via [`RenderGraph::add_pass`]; [`RenderGraph::compile`] culls unreachable
/// work and computes resource lifetimes; [`RenderGraph::execute`] realizes
/// resources through a [`BackendDriver`] and runs each surviving pass's
/// execute callback in declaration order.
#[derive(Default)]
pub struct RenderGraph {
    passes: Vec<PassNode>,
    resources: Vec<VirtualResource>,
    pool: ResourcePool,
    compiled: bool,
}

impl RenderGraph {
    pub fn new() -> RenderGraph {
        RenderGraph::default()
    }

    fn push_resource(&mut self, resource: VirtualResource) -> ResourceHandle {
        let index = self.resources.len() as u32;
        self.resources.push(resource);
        ResourceHandle { index, version: 0 }
    }

    /// Imports a texture the graph does not own (a swapchain image, a
    /// resource supplied by the application). Skips realize/destroy but
    /// still accumulates usage from reads and writes.
    pub fn import_texture(
        &mut self,
        name: &str,
        handle: forge_backend::TextureHandle,
        desc: TextureDescriptor,
    ) -> ResourceHandle {
        self.push_resource(VirtualResource {
            name: name.to_string(),
            kind: ResourceKind::ImportedTexture(handle, desc),
            usage: desc.usage,
            version: 0,
            ref_count: 0,
            writer_pass: None,
            reader_passes: Vec::new(),
            physical: Some(PhysicalHandle::Texture(handle)),
        })
    }

    /// Declares a pass. `setup` builds the pass's resource dependencies
    /// against the given [`PassBuilder`] and returns the closure that runs
    /// the pass's commands once its resources are realized.
    pub fn add_pass<F, E>(&mut self, name: &str, setup: F) -> PassHandle
    where
        F: FnOnce(&mut PassBuilder) -> E,
        E: FnOnce(&mut dyn BackendDriver, &GraphResources<'_>) + 'static,
    {
        let index = self.passes.len() as u32;
        self.passes.push(PassNode {
            name: name.to_string(),
            ref_count: 0,
            side_effect: false,
            culled: false,
            reads: Vec::new(),
            writes: Vec::new(),
            render_target: None,
            execute: None,
            realize: Vec::new(),
            destroy: Vec::new(),
        });

        let mut builder = PassBuilder {
            graph: self,
            pass: index,
        };
        let execute = setup(&mut builder);
        self.passes[index as usize].execute = Some(Box::new(execute));
        PassHandle(index)
    }

    /// Culls unreferenced work and computes realize/destroy points for
    /// every surviving resource. Must be called before [`execute`](Self::execute).
    pub fn compile(&mut self) -> Result<()> {
        self.detect_cycles()?;

        for resource in &mut self.resources {
            resource.ref_count = resource.reader_passes.len() as u32;
        }
        for pass in &mut self.passes {
            pass.ref_count = pass.writes.len() as u32;
            if pass.side_effect {
                pass.ref_count = SIDE_EFFECT_REF_COUNT;
            }
        }

        loop {
            let mut changed = false;

            for r in 0..self.resources.len() {
                if self.resources[r].ref_count == 0 && !self.resources[r].is_imported() {
                    if let Some(writer) = self.resources[r].writer_pass.take() {
                        let pass = &mut self.passes[writer as usize];
                        if pass.ref_count > 0 && pass.ref_count != SIDE_EFFECT_REF_COUNT {
                            pass.ref_count -= 1;
                            changed = true;
                        }
                    }
                }
            }

            for p in 0..self.passes.len() {
                if self.passes[p].culled || self.passes[p].side_effect {
                    continue;
                }
                if self.passes[p].ref_count == 0 {
                    self.passes[p].culled = true;
                    changed = true;
                    let reads = std::mem::take(&mut self.passes[p].reads);
                    for read in &reads {
                        let resource = &mut self.resources[read.index as usize];
                        if resource.ref_count > 0 {
                            resource.ref_count -= 1;
                        }
                    }
                    self.passes[p].reads = reads;
                }
            }

            if !changed {
                break;
            }
        }

        self.compute_lifetimes();
        self.compiled = true;
        Ok(())
    }

    fn detect_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.passes.len()];

        fn visit(graph: &RenderGraph, p: usize, marks: &mut [Mark]) -> Result<()> {
            match marks[p] {
                Mark::Done => return Ok(()),
                Mark::Visiting => {
                    let pass = graph.passes[p].name.clone();
                    log::error!("render graph compile failed: cyclic dependency through pass \"{pass}\"");
                    return Err(RenderGraphError::CyclicDependency { pass });
                }
                Mark::Unvisited => {}
            }
            marks[p] = Mark::Visiting;
            for read in &graph.passes[p].reads {
                if let Some(writer) = graph.resources[read.index as usize].writer_pass {
                    visit(graph, writer as usize, marks)?;
                }
            }
            marks[p] = Mark::Done;
            Ok(())
        }

        for p in 0..self.passes.len() {
            visit(self, p, &mut marks)?;
        }
        Ok(())
    }

    fn compute_lifetimes(&mut self) {
        for r in 0..self.resources.len() {
            if self.resources[r].is_imported() {
                continue;
            }

            let mut first = None;
            let mut last = None;
            if let Some(writer) = self.resources[r].writer_pass {
                if !self.passes[writer as usize].culled {
                    first = Some(writer);
                    last = Some(writer);
                }
            }
            for &reader in &self.resources[r].reader_passes {
                if self.passes[reader as usize].culled {
                    continue;
                }
                first = Some(first.map_or(reader, |f| f.min(reader)));
                last = Some(last.map_or(reader, |l| l.max(reader)));
            }

            if let (Some(first), Some(last)) = (first, last) {
                self.passes[first as usize].realize.push(r as u32);
                self.passes[last as usize].destroy.push(r as u32);
            }
        }
    }

    /// Realizes resources and runs every surviving pass's execute callback,
    /// in declaration order. Releases pooled resources back to the driver
    /// once the last pass to use them has run.
    pub fn execute(&mut self, driver: &mut dyn BackendDriver) -> Result<()> {
        debug_assert!(self.compiled, "compile() must run before execute()");

        for p in 0..self.passes.len() {
            if self.passes[p].culled {
                continue;
            }

            let realize = std::mem::take(&mut self.passes[p].realize);
            for r in &realize {
                self.realize_resource(*r as usize, driver)?;
            }
            self.passes[p].realize = realize;

            let render_target = self.passes[p].render_target.clone();
            if let Some(rt) = &render_target {
                let backend_rt = self.resolve_render_target(rt);
                driver.begin_render_pass(&backend_rt).map_err(|source| {
                    let resource = self.passes[p].name.clone();
                    log::error!("pass \"{resource}\" failed to begin render pass: {source}");
                    RenderGraphError::Backend { resource, source }
                })?;
            }

            if let Some(execute) = self.passes[p].execute.take() {
                let view = GraphResources {
                    resources: &self.resources,
                };
                execute(driver, &view);
            }

            if render_target.is_some() {
                driver.end_render_pass();
            }

            let destroy = std::mem::take(&mut self.passes[p].destroy);
            for r in &destroy {
                self.release_resource(*r as usize, driver);
            }
            self.passes[p].destroy = destroy;
        }

        self.pool.drain(driver);
        Ok(())
    }

    fn realize_resource(&mut self, index: usize, driver: &mut dyn BackendDriver) -> Result<()> {
        let resource = &mut self.resources[index];
        match resource.kind {
            ResourceKind::Texture(desc) => {
                let handle = self.pool.acquire_texture(driver, &desc).map_err(|source| {
                    let resource = resource.name.clone();
                    log::error!("failed to realize texture resource \"{resource}\": {source}");
                    RenderGraphError::Backend { resource, source }
                })?;
                resource.physical = Some(PhysicalHandle::Texture(handle));
            }
            ResourceKind::Buffer(desc) => {
                let handle = self.pool.acquire_buffer(driver, &desc).map_err(|source| {
                    let resource = resource.name.clone();
                    log::error!("failed to realize buffer resource \"{resource}\": {source}");
                    RenderGraphError::Backend { resource, source }
                })?;
                resource.physical = Some(PhysicalHandle::Buffer(handle));
            }
            ResourceKind::ImportedTexture(..) => {}
        }
        Ok(())
    }

    fn release_resource(&mut self, index: usize, _driver: &mut dyn BackendDriver) {
        let resource = &mut self.resources[index];
        match (resource.kind, resource.physical.take()) {
            (ResourceKind::Texture(desc), Some(PhysicalHandle::Texture(handle))) => {
                self.pool.release_texture(desc, handle);
            }
            (ResourceKind::Buffer(desc), Some(PhysicalHandle::Buffer(handle))) => {
                self.pool.release_buffer(desc, handle);
            }
            _ => {}
        }
    }

    fn resolve_render_target(&self, builder: &RenderTargetBuilder) -> BackendRenderTarget {
        let mut width = 0;
        let mut height = 0;

        let color_attachments = builder
            .color
            .iter()
            .map(|attachment| {
                if let ResourceKind::Texture(desc) | ResourceKind::ImportedTexture(_, desc) =
                    self.resources[attachment.resource.index as usize].kind
                {
                    width = desc.width;
                    height = desc.height;
                }
                forge_backend::ColorAttachment {
                    texture: self.physical_texture(attachment.resource),
                    load_op: attachment.load_op,
                    store_op: attachment.store_op,
                    clear_value: attachment.clear_value,
                }
            })
            .collect();

        let depth_attachment = builder.depth.as_ref().map(|attachment| {
            if let ResourceKind::Texture(desc) | ResourceKind::ImportedTexture(_, desc) =
                self.resources[attachment.resource.index as usize].kind
            {
                width = desc.width;
                height = desc.height;
            }
            forge_backend::DepthAttachment {
                texture: self.physical_texture(attachment.resource),
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                clear_value: attachment.clear_value,
            }
        });

        BackendRenderTarget {
            width,
            height,
            color_attachments,
            depth_attachment,
        }
    }

    fn physical_texture(&self, handle: ResourceHandle) -> forge_backend::TextureHandle {
        let resource = &self.resources[handle.index as usize];
        match resource.physical {
            Some(PhysicalHandle::Texture(t)) => t,
            _ => panic!("resource \"{}\" was never realized as a texture", resource.name),
        }
    }

    pub fn is_culled(&self, pass: PassHandle) -> bool {
        self.passes[pass.0 as usize].culled
    }

    pub fn ref_count(&self, pass: PassHandle) -> u32 {
        self.passes[pass.0 as usize].ref_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_backend::{Format, NullDriver};

    #[test]
    fn pass_with_no_external_reader_is_culled() {
        let mut rg = RenderGraph::new();
        rg.add_pass("Pass1", |builder| {
            let desc = TextureDescriptor::new_2d(100, 100, Format::Bgra8Unorm, Usage::RENDER_TARGET);
            let tex = builder.create_texture("InputTex", desc);
            let tex = builder.write(tex, Usage::RENDER_TARGET);
            builder.read(tex, Usage::RENDER_TARGET);
            |_driver: &mut dyn BackendDriver, _res: &GraphResources<'_>| {}
        });

        rg.compile().unwrap();
        assert!(rg.is_culled(PassHandle(0)));
    }

    #[test]
    fn depth_attachment_pass_reports_its_dimensions() {
        let mut rg = RenderGraph::new();
        rg.add_pass("DepthPass", |builder| {
            let desc = TextureDescriptor::new_2d(100, 100, Format::Depth32Float, Usage::DEPTH_STENCIL);
            let depth = builder.create_texture("DepthImage", desc);
            let depth = builder.write(depth, Usage::DEPTH_STENCIL);
            builder.declare_side_effect();
            builder.set_render_target(RenderTargetBuilder::new().depth(DepthAttachmentDesc {
                resource: depth,
                load_op: LoadOp::Clear,
                store_op: StoreOp::Store,
                clear_value: ClearValue::DepthStencil(1.0, 0),
            }));

            move |_driver: &mut dyn BackendDriver, res: &GraphResources<'_>| {
                let info = res.get_render_pass_info(depth);
                match info {
                    crate::resources::ResourceInfo::Texture(desc) => {
                        assert_eq!(desc.width, 100);
                        assert_eq!(desc.height, 100);
                    }
                    _ => panic!("expected a texture"),
                }
            }
        });

        rg.compile().unwrap();
        assert!(!rg.is_culled(PassHandle(0)));

        let mut driver = NullDriver::new();
        rg.execute(&mut driver).unwrap();
        assert!(driver.calls.iter().any(|c| c.starts_with("create_texture(100x100")));
    }

    #[test]
    fn unread_write_only_pass_is_culled_unless_side_effect() {
        let mut rg = RenderGraph::new();
        rg.add_pass("Shadow", |builder| {
            let desc = TextureDescriptor::new_2d(512, 512, Format::Depth32Float, Usage::DEPTH_STENCIL);
            let shadow = builder.create_texture("ShadowMap", desc);
            builder.write(shadow, Usage::DEPTH_STENCIL);
            |_driver: &mut dyn BackendDriver, _res: &GraphResources<'_>| {}
        });

        rg.compile().unwrap();
        assert!(rg.is_culled(PassHandle(0)));
    }

    proptest::proptest! {
        /// Builds a chain of `len` passes, each writing its own texture and
        /// reading the previous pass's, with only the final pass declared a
        /// side effect when `keep` is set. A straight-line dependency chain
        /// has no partial outcome: either every pass survives (the sink
        /// keeps the whole chain alive) or every pass is culled (nothing
        /// outside the graph observes any of it).
        #[test]
        fn linear_chain_culls_or_survives_as_a_whole(len in 1usize..12, keep in proptest::bool::ANY) {
            let mut rg = RenderGraph::new();
            let desc = TextureDescriptor::new_2d(64, 64, Format::Rgba8Unorm, Usage::RENDER_TARGET);
            let mut prev: Option<ResourceHandle> = None;
            for i in 0..len {
                let name = format!("Pass{i}");
                let is_last = i == len - 1;
                rg.add_pass(&name, |builder| {
                    if let Some(prev) = prev {
                        builder.read(prev, Usage::RENDER_TARGET);
                    }
                    let created = builder.create_texture("ChainTex", desc);
                    builder.write(created, Usage::RENDER_TARGET);
                    if is_last && keep {
                        builder.declare_side_effect();
                    }
                    |_driver: &mut dyn BackendDriver, _res: &GraphResources<'_>| {}
                });
                let index = rg.resources.len() as u32 - 1;
                prev = Some(ResourceHandle { index, version: 0 });
            }

            rg.compile().unwrap();
            for i in 0..len {
                let culled = rg.is_culled(PassHandle(i as u32));
                proptest::prop_assert_eq!(culled, !keep);
            }
        }
    }
}
