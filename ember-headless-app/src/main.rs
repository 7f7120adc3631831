//! 在 HeadlessDevice 上跑一个延迟渲染形状的 Pipeline
//!
//! ```text
//! cargo run -p ember-headless-app -- [frames]
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use ash::vk;
use raw_window_handle::{RawWindowHandle, WebWindowHandle};

use ember_gfx::commands::command_list::GfxCommandListType;
use ember_gfx::headless::{HeadlessDevice, HeadlessDeviceDesc, HeadlessDeviceManager};
use ember_gfx::resources::resource_desc::GfxResourceDesc;
use ember_gfx::resources::resource_state::GfxResourceState;
use ember_render_graph::{Pipeline, PipelineBuilder, RgPass, RgPassBuilder, RgPassContext};
use ember_render_interface::handles::ResourceHandle;
use ember_render_interface::memory_manager::PlacementPolicy;
use ember_renderer::{GraphicsEngine, GraphicsEngineDesc, PipelineEventListener};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 180;

struct GBufferPass {
    vertices: ResourceHandle,
    albedo: ResourceHandle,
    depth: ResourceHandle,
}

impl RgPass for GBufferPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.read(self.vertices, GfxResourceState::VERTEX_BUFFER);
        builder.write(self.albedo, GfxResourceState::COLOR_ATTACHMENT_WRITE);
        builder.write(self.depth, GfxResourceState::DEPTH_ATTACHMENT_WRITE);
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        // 每帧的常量写进 scratch
        if let Err(e) = ctx.scratch.allocate(256, 256) {
            log::warn!("gbuffer: no scratch for frame {}: {e}", ctx.frame_id);
        }
        if let Some(albedo) = ctx.native(self.albedo) {
            ctx.cmd.clear_render_target(albedo, [0.0, 0.0, 0.0, 1.0]);
        }
        ctx.cmd.draw(36, 16, 0);
    }
}

struct LightingPass {
    albedo: ResourceHandle,
    depth: ResourceHandle,
    hdr: ResourceHandle,
}

impl RgPass for LightingPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.read(self.albedo, GfxResourceState::SHADER_READ_COMPUTE);
        builder.read(self.depth, GfxResourceState::SHADER_READ_COMPUTE);
        builder.write(self.hdr, GfxResourceState::STORAGE_WRITE_COMPUTE);
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        ctx.cmd.dispatch(WIDTH.div_ceil(8), HEIGHT.div_ceil(8), 1);
    }

    fn list_type(&self) -> GfxCommandListType {
        GfxCommandListType::Compute
    }
}

struct TonemapPass {
    hdr: ResourceHandle,
    ldr: ResourceHandle,
}

impl RgPass for TonemapPass {
    fn setup(&mut self, builder: &mut RgPassBuilder) {
        builder.read(self.hdr, GfxResourceState::SHADER_READ_FRAGMENT);
        builder.write(self.ldr, GfxResourceState::COLOR_ATTACHMENT_WRITE);
    }

    fn execute(&self, ctx: &mut RgPassContext<'_>) {
        ctx.cmd.draw(3, 1, 0);
    }
}

/// 每隔一段时间打印一次帧率
#[derive(Default)]
struct FrameStats {
    completed: AtomicU64,
}

impl PipelineEventListener for FrameStats {
    fn on_frame_complete_device(&self, frame_id: u64) -> anyhow::Result<()> {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if completed % 60 == 0 {
            log::info!("frame {frame_id} completed on device ({completed} total)");
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    ember_crate_tools::init_log::init_log();

    let frames: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse().with_context(|| format!("invalid frame count: {arg}"))?,
        None => 240,
    };

    let device = Arc::new(HeadlessDevice::new(HeadlessDeviceDesc::default()));
    let mut engine = GraphicsEngine::new(GraphicsEngineDesc {
        device_manager: Some(Arc::new(HeadlessDeviceManager)),
        device: device.clone(),
        target_window: Some(RawWindowHandle::Web(WebWindowHandle::new(1))),
        full_screen: false,
        width: WIDTH,
        height: HEIGHT,
        logger: None,
    })?;

    let extent = |format| GfxResourceDesc::texture_2d(WIDTH as u64, HEIGHT as u64, format);
    let vertices =
        engine.create_resource(&GfxResourceDesc::buffer(36 * 32), PlacementPolicy::Placed, "cube-vertices")?;
    let albedo = engine.create_resource(&extent(vk::Format::R8G8B8A8_UNORM), PlacementPolicy::Placed, "albedo")?;
    let depth = engine.create_resource(&extent(vk::Format::D32_SFLOAT), PlacementPolicy::Placed, "depth")?;
    let hdr = engine.create_resource(&extent(vk::Format::R16G16B16A16_SFLOAT), PlacementPolicy::Placed, "hdr")?;
    let ldr = engine.create_resource(&extent(vk::Format::B8G8R8A8_UNORM), PlacementPolicy::Committed, "ldr")?;

    let mut builder = PipelineBuilder::new();
    builder
        .add_pass("tonemap", TonemapPass { hdr, ldr })
        .add_pass("lighting", LightingPass { albedo, depth, hdr })
        .add_pass(
            "gbuffer",
            GBufferPass {
                vertices,
                albedo,
                depth,
            },
        );
    engine.set_pipeline(builder.build()?);
    engine.set_present_source(Some(ldr));
    engine.add_listener(Arc::new(FrameStats::default()));

    let start = Instant::now();
    let mut last = start;
    for _ in 0..frames {
        let now = Instant::now();
        engine.update(now - last)?;
        last = now;
    }
    engine.wait_idle()?;

    let stats = device.stats();
    log::info!(
        "{} frames in {:?}: {} command lists, {} barriers, {} make-resident, {} evict",
        frames,
        start.elapsed(),
        stats.executed_lists,
        stats.executed_barriers,
        stats.make_resident_calls,
        stats.evict_calls
    );
    log::info!(
        "memory: {} resources, {} bytes committed",
        engine.context().memory().resource_count(),
        engine.context().memory().committed_bytes()
    );

    // 资源由 app 持有，退出前交还
    engine.set_pipeline(Pipeline::empty());
    engine.set_present_source(None);
    for handle in [vertices, albedo, depth, hdr, ldr] {
        engine.release_resource(handle)?;
    }
    engine.wait_idle()?;
    log::info!("exit after {:?} of engine time", engine.absolute_time());
    Ok(())
}
