//! Pipeline graph lifecycle.
//!
//! One `PipelineGraph` owns the camera, scaler and encoder components, the two
//! zero-copy tunnels between them and the encoder output pool.
//!
//! States: `Uninitialized -> Built -> Running -> Stopped -> Uninitialized`.
//!
//! - `build` creates and connects everything, applies every parameter, enables the
//!   encoder output and submits the whole pool. A failure releases whatever was
//!   already created and leaves the graph `Uninitialized`.
//! - `apply_settings` re-issues parameter-class hardware calls only.
//! - `stop` disables the encoder output; every flushed buffer goes back to the pool.
//! - `teardown` stops if needed, then destroys tunnels, pool and components in order.
//!
//! A resolution change is `teardown` followed by `build`.

use anyhow::{anyhow, Context, Result};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::assembler::{FrameAssembler, MAX_FRAME_BYTES};
use crate::control::ApplyContext;
use crate::hal::{
    CameraConfig, CameraHal, CameraParameter, ComponentId, ComponentPorts, Encoding, FrameRate,
    ParamTarget, PortFormat, PortHandle, PortId, StageKind, TunnelId,
};
use crate::output::FrameSink;
use crate::pool::{Buffer, BufferPool, PoolId, PoolStats};
use crate::relay::{self, RelayReceiver};
use crate::settings::{ParamKey, Settings};

/// Scaler and encoder frame rate.
const STREAM_FPS: u32 = 30;
const PREVIEW_FRAMES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphState {
    Uninitialized,
    Built,
    Running,
    Stopped,
}

/// How filled encoder buffers reach the frame consumers.
pub enum Delivery {
    /// Through the relay channel, processed by the control loop.
    Deferred,
    /// Assembled and emitted on the hardware thread.
    Immediate(Box<dyn FrameSink>),
}

struct Tunnel {
    id: TunnelId,
    from: PortId,
    to: PortId,
}

struct GraphInstance {
    camera: ComponentPorts,
    scaler: ComponentPorts,
    encoder: ComponentPorts,
    tunnels: Vec<Tunnel>,
    pool: BufferPool,
    output: Option<PortHandle>,
    relay: Option<RelayReceiver>,
    stream: (u32, u32),
}

/// Resources created so far by a build in progress.
#[derive(Default)]
struct Partial {
    components: Vec<(ComponentId, bool)>,
    tunnels: Vec<TunnelId>,
}

impl Partial {
    fn created(&mut self, ports: ComponentPorts) -> ComponentPorts {
        self.components.push((ports.id, false));
        ports
    }

    fn enabled(&mut self, id: ComponentId) {
        if let Some(entry) = self.components.iter_mut().find(|(c, _)| *c == id) {
            entry.1 = true;
        }
    }

    fn unwind<H: CameraHal>(self, hal: &mut H) {
        for id in self.tunnels.into_iter().rev() {
            if let Err(e) = hal.destroy_tunnel(id) {
                log::warn!("PipelineGraph: cleanup of tunnel {:?} failed: {:#}", id, e);
            }
        }
        for (id, enabled) in self.components.into_iter().rev() {
            if enabled {
                if let Err(e) = hal.disable_component(id) {
                    log::warn!("PipelineGraph: cleanup disable of {:?} failed: {:#}", id, e);
                }
            }
            if let Err(e) = hal.destroy_component(id) {
                log::warn!("PipelineGraph: cleanup destroy of {:?} failed: {:#}", id, e);
            }
        }
    }
}

pub struct PipelineGraph<H: CameraHal> {
    hal: H,
    state: GraphState,
    generation: u64,
    max_frame: usize,
    instance: Option<GraphInstance>,
}

impl<H: CameraHal> PipelineGraph<H> {
    pub fn new(hal: H) -> Self {
        Self::with_max_frame(hal, MAX_FRAME_BYTES)
    }

    /// `max_frame` bounds frames assembled on the hardware thread (immediate delivery).
    pub fn with_max_frame(hal: H, max_frame: usize) -> Self {
        Self {
            hal,
            state: GraphState::Uninitialized,
            generation: 0,
            max_frame,
            instance: None,
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Number of successful builds so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool_id(&self) -> Option<PoolId> {
        self.instance.as_ref().map(|i| i.pool.id())
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.instance.as_ref().map(|i| i.pool.stats())
    }

    pub fn stream_size(&self) -> Option<(u32, u32)> {
        self.instance.as_ref().map(|i| i.stream)
    }

    pub fn output_port(&self) -> Option<PortId> {
        self.instance.as_ref().map(|i| i.encoder.output)
    }

    /// Descriptor that turns readable when the relay has buffers (deferred delivery).
    pub fn relay_fd(&self) -> Option<RawFd> {
        self.instance
            .as_ref()
            .and_then(|i| i.relay.as_ref())
            .map(|r| r.as_raw_fd())
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn build(&mut self, settings: &Settings, delivery: Delivery) -> Result<()> {
        if self.state != GraphState::Uninitialized {
            return Err(anyhow!(
                "cannot build: pipeline is {:?}, tear it down first",
                self.state
            ));
        }
        for key in [ParamKey::VideoWidth, ParamKey::VideoHeight, ParamKey::Width] {
            key.validate(settings)
                .map_err(|e| anyhow!("cannot build pipeline: {}", e))?;
        }

        let mut partial = Partial::default();
        let instance = match Self::construct(&mut self.hal, settings, &mut partial) {
            Ok(instance) => instance,
            Err(e) => {
                partial.unwind(&mut self.hal);
                return Err(e);
            }
        };
        self.instance = Some(instance);
        self.state = GraphState::Built;

        let started = self
            .apply_settings(settings, ApplyContext::Startup)
            .and_then(|()| self.start_output(delivery));
        if let Err(e) = started {
            if let Err(cleanup) = self.teardown() {
                log::warn!("PipelineGraph: cleanup after failed build: {:#}", cleanup);
            }
            self.state = GraphState::Uninitialized;
            return Err(e);
        }

        self.generation += 1;
        self.state = GraphState::Running;
        if let Some(instance) = &self.instance {
            let pool = instance.pool.stats();
            log::info!(
                "PipelineGraph: generation {} running ({}x{} -> {}x{}, {} x {} byte buffers)",
                self.generation,
                settings.video_width,
                settings.video_height,
                instance.stream.0,
                instance.stream.1,
                pool.capacity,
                instance.pool.buffer_size()
            );
        }
        Ok(())
    }

    fn construct(hal: &mut H, settings: &Settings, partial: &mut Partial) -> Result<GraphInstance> {
        let (stream_width, stream_height) = settings.stream_size();

        // ---- Camera ----
        let camera = partial.created(
            hal.create_component(StageKind::Camera)
                .context("failed to create camera component")?,
        );
        let config = CameraConfig {
            max_stills_width: settings.video_width,
            max_stills_height: settings.video_height,
            max_preview_width: settings.video_width,
            max_preview_height: settings.video_height,
            num_preview_frames: PREVIEW_FRAMES,
        };
        hal.set_parameter(camera.control, &CameraParameter::CameraConfig(config))
            .context("failed to configure camera")?;
        hal.commit_format(
            camera.output,
            &PortFormat {
                encoding: Encoding::Opaque,
                width: settings.video_width,
                height: settings.video_height,
                frame_rate: FrameRate::VARIABLE,
            },
        )
        .context("failed to set camera output format")?;
        hal.enable_component(camera.id)
            .context("failed to enable camera")?;
        partial.enabled(camera.id);

        // ---- Encoder ----
        let encoder = partial.created(
            hal.create_component(StageKind::Encoder)
                .context("failed to create encoder component")?,
        );
        let requirements = hal
            .buffer_requirements(encoder.output)
            .context("failed to query encoder buffer requirements")?;
        let (count, size) = requirements.resolve();
        hal.configure_buffers(encoder.output, count, size)
            .context("failed to configure encoder buffers")?;
        hal.commit_format(
            encoder.output,
            &PortFormat {
                encoding: Encoding::Jpeg,
                width: stream_width,
                height: stream_height,
                frame_rate: FrameRate {
                    num: STREAM_FPS,
                    den: 1,
                },
            },
        )
        .context("failed to set encoder output format")?;
        hal.enable_component(encoder.id)
            .context("failed to enable encoder")?;
        partial.enabled(encoder.id);
        let pool = BufferPool::new(count as usize, size as usize)
            .context("failed to create encoder buffer pool")?;

        // ---- Scaler ----
        let scaler = partial.created(
            hal.create_component(StageKind::Scaler)
                .context("failed to create scaler component")?,
        );
        hal.commit_format(
            scaler.output,
            &PortFormat {
                encoding: Encoding::I420,
                width: stream_width,
                height: stream_height,
                frame_rate: FrameRate {
                    num: STREAM_FPS,
                    den: 1,
                },
            },
        )
        .context("failed to set scaler output format")?;
        hal.enable_component(scaler.id)
            .context("failed to enable scaler")?;
        partial.enabled(scaler.id);

        // ---- Tunnels ----
        let mut tunnels = Vec::with_capacity(2);
        for (from, to, what) in [
            (camera.output, scaler.input, "camera -> scaler"),
            (scaler.output, encoder.input, "scaler -> encoder"),
        ] {
            let to = to.ok_or_else(|| anyhow!("{} target has no input port", what))?;
            let id = hal
                .create_tunnel(from, to)
                .with_context(|| format!("failed to create {} tunnel", what))?;
            partial.tunnels.push(id);
            hal.enable_tunnel(id)
                .with_context(|| format!("failed to enable {} tunnel", what))?;
            tunnels.push(Tunnel { id, from, to });
        }

        Ok(GraphInstance {
            camera,
            scaler,
            encoder,
            tunnels,
            pool,
            output: None,
            relay: None,
            stream: (stream_width, stream_height),
        })
    }

    fn start_output(&mut self, delivery: Delivery) -> Result<()> {
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| anyhow!("no pipeline built"))?;
        let callback = match delivery {
            Delivery::Deferred => {
                let (tx, rx) = relay::channel(instance.pool.capacity())?;
                instance.relay = Some(rx);
                tx.into_callback()
            }
            Delivery::Immediate(sink) => immediate_callback(
                instance.pool.clone(),
                FrameAssembler::new(self.max_frame),
                sink,
            ),
        };

        let handle = self
            .hal
            .enable_output(instance.encoder.output, callback)
            .context("failed to enable encoder output")?;
        instance.output = Some(handle.clone());

        while let Some(buffer) = instance.pool.take() {
            if let Err(refused) = handle.send_buffer(buffer) {
                instance.pool.release(refused)?;
                return Err(anyhow!(
                    "failed to submit buffer to {}",
                    instance.encoder.output
                ));
            }
        }
        Ok(())
    }

    /// Re-issues every parameter-class setting on the live graph.
    pub fn apply_settings(&mut self, settings: &Settings, context: ApplyContext) -> Result<()> {
        for key in ParamKey::hardware_parameters() {
            self.apply_key(key, settings, context)?;
        }
        Ok(())
    }

    /// Re-issues the hardware call behind one key.
    ///
    /// An invalid value aborts in `Startup` context and is skipped with a warning in
    /// `Runtime` context. A hardware rejection is always an error.
    pub fn apply_key(&mut self, key: ParamKey, settings: &Settings, context: ApplyContext) -> Result<()> {
        let instance = match (&self.instance, self.state) {
            (Some(instance), GraphState::Built | GraphState::Running) => instance,
            _ => {
                return Err(anyhow!(
                    "cannot apply {}: pipeline is {:?}",
                    key,
                    self.state
                ))
            }
        };
        if let Err(e) = key.validate(settings) {
            match context {
                ApplyContext::Startup => return Err(anyhow!("invalid startup setting: {}", e)),
                ApplyContext::Runtime => {
                    log::warn!("PipelineGraph: skipping {}", e);
                    return Ok(());
                }
            }
        }
        let Some((target, param)) = key.camera_parameter(settings) else {
            return Ok(());
        };
        let port = match target {
            ParamTarget::CameraControl => instance.camera.control,
            ParamTarget::CameraOutput => instance.camera.output,
            ParamTarget::EncoderOutput => instance.encoder.output,
        };
        self.hal
            .set_parameter(port, &param)
            .with_context(|| format!("hardware rejected {} ({})", param.name(), key.value(settings)))
    }

    /// Drains the relay and runs every buffer through `assembler`, handing complete
    /// frames to `emit`. Returns the number of buffers handled.
    pub fn process_relay<F>(&mut self, assembler: &mut FrameAssembler, mut emit: F) -> Result<usize>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(0);
        };
        let Some(relay) = instance.relay.as_mut() else {
            return Ok(0);
        };
        let messages = relay.drain()?;
        let handled = messages.len();
        let output = instance
            .output
            .as_ref()
            .ok_or_else(|| anyhow!("relay delivered buffers but the output was never enabled"))?;
        for message in messages {
            if message.port != output.id() {
                return Err(anyhow!(
                    "relay delivered a buffer from {}, expected {}",
                    message.port,
                    output.id()
                ));
            }
            relay::consume_buffer(&instance.pool, assembler, output, message.buffer, &mut emit)?;
        }
        Ok(handled)
    }

    /// Running -> Stopped. All buffers are back in the pool when this returns.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != GraphState::Running {
            return Ok(());
        }
        self.quiesce()?;
        self.state = GraphState::Stopped;
        log::info!("PipelineGraph: generation {} stopped", self.generation);
        Ok(())
    }

    fn quiesce(&mut self) -> Result<()> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(());
        };
        if let Some(output) = &instance.output {
            if output.is_enabled() {
                self.hal
                    .disable_output(output.id())
                    .context("failed to disable encoder output")?;
            }
        }
        if let Some(relay) = instance.relay.as_mut() {
            for mut message in relay.drain()? {
                instance.pool.claim(&mut message.buffer)?;
                instance.pool.release(message.buffer)?;
            }
        }
        let stats = instance.pool.stats();
        if stats.outstanding > 0 {
            return Err(anyhow!(
                "{} of {} buffers still outstanding after disabling the encoder output",
                stats.outstanding,
                stats.capacity
            ));
        }
        Ok(())
    }

    /// Destroys the whole graph. No-op when nothing is built.
    pub fn teardown(&mut self) -> Result<()> {
        if self.instance.is_none() {
            self.state = GraphState::Uninitialized;
            return Ok(());
        }
        self.quiesce()?;
        let Some(instance) = self.instance.take() else {
            return Ok(());
        };
        self.state = GraphState::Uninitialized;

        for tunnel in &instance.tunnels {
            self.hal.destroy_tunnel(tunnel.id).with_context(|| {
                format!("failed to destroy tunnel {} -> {}", tunnel.from, tunnel.to)
            })?;
        }
        instance.pool.destroy()?;
        drop(instance.relay);

        self.hal
            .disable_component(instance.encoder.id)
            .context("failed to disable encoder")?;
        self.hal
            .disable_component(instance.camera.id)
            .context("failed to disable camera")?;
        self.hal
            .destroy_component(instance.encoder.id)
            .context("failed to destroy encoder")?;
        self.hal
            .destroy_component(instance.camera.id)
            .context("failed to destroy camera")?;
        self.hal
            .destroy_component(instance.scaler.id)
            .context("failed to destroy scaler")?;

        log::info!("PipelineGraph: generation {} torn down", self.generation);
        Ok(())
    }
}

impl<H: CameraHal> Drop for PipelineGraph<H> {
    fn drop(&mut self) {
        if self.instance.is_some() {
            if let Err(e) = self.teardown() {
                log::warn!("PipelineGraph: teardown on drop failed: {:#}", e);
            }
        }
    }
}

fn immediate_callback(
    pool: BufferPool,
    mut assembler: FrameAssembler,
    mut sink: Box<dyn FrameSink>,
) -> crate::hal::BufferCallback {
    Box::new(move |port: &PortHandle, buffer: Buffer| {
        let result = relay::consume_buffer(&pool, &mut assembler, port, buffer, |frame| {
            sink.emit(frame)
        });
        if let Err(e) = result {
            log::error!("fatal error on {}: {:#}", port.id(), e);
            std::process::exit(1);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimConfig, SimFault, SimulatedCamera};
    use std::time::{Duration, Instant};

    fn fast_sim() -> SimulatedCamera {
        SimulatedCamera::new(SimConfig {
            frame_interval: Duration::from_millis(2),
            ..SimConfig::default()
        })
    }

    #[test]
    fn build_then_teardown_releases_everything() -> Result<()> {
        let mut graph = PipelineGraph::new(fast_sim());
        graph.build(&Settings::default(), Delivery::Deferred)?;
        assert_eq!(graph.state(), GraphState::Running);
        assert_eq!(graph.generation(), 1);
        assert_eq!(graph.stream_size(), Some((320, 176)));
        assert_eq!(graph.pool_stats().map(|s| s.capacity), Some(3));

        graph.teardown()?;
        assert_eq!(graph.state(), GraphState::Uninitialized);
        let stats = graph.hal().stats();
        assert_eq!(stats.live_components, 0);
        assert_eq!(stats.live_tunnels, 0);
        assert_eq!(stats.components_created, 3);
        Ok(())
    }

    #[test]
    fn build_twice_is_refused() -> Result<()> {
        let mut graph = PipelineGraph::new(fast_sim());
        graph.build(&Settings::default(), Delivery::Deferred)?;
        assert!(graph
            .build(&Settings::default(), Delivery::Deferred)
            .is_err());
        graph.teardown()?;
        Ok(())
    }

    #[test]
    fn failed_build_releases_partial_graph() {
        for fault in [
            SimFault::CreateComponent(StageKind::Scaler),
            SimFault::CreateTunnel,
            SimFault::EnableOutput,
            SimFault::SetParameter("sharpness"),
        ] {
            let mut graph = PipelineGraph::new(SimulatedCamera::new(SimConfig {
                fail_on: Some(fault),
                ..SimConfig::default()
            }));
            assert!(graph
                .build(&Settings::default(), Delivery::Deferred)
                .is_err());
            assert_eq!(graph.state(), GraphState::Uninitialized);
            assert_eq!(graph.generation(), 0);
            let stats = graph.hal().stats();
            assert_eq!(stats.live_components, 0, "{:?} leaked components", fault);
            assert_eq!(stats.live_tunnels, 0, "{:?} leaked tunnels", fault);
        }
    }

    #[test]
    fn invalid_startup_value_aborts_build() {
        let mut graph = PipelineGraph::new(fast_sim());
        let settings = Settings {
            sharpness: 500,
            ..Settings::default()
        };
        let err = graph
            .build(&settings, Delivery::Deferred)
            .expect_err("invalid sharpness");
        assert!(err.to_string().contains("sharpness"));
        assert_eq!(graph.hal().stats().live_components, 0);
    }

    #[test]
    fn invalid_runtime_value_is_skipped() -> Result<()> {
        let mut graph = PipelineGraph::new(fast_sim());
        graph.build(&Settings::default(), Delivery::Deferred)?;
        let writes = graph.hal().stats().parameter_writes;
        let settings = Settings {
            contrast: -400,
            ..Settings::default()
        };
        graph.apply_key(ParamKey::Contrast, &settings, ApplyContext::Runtime)?;
        assert_eq!(graph.hal().stats().parameter_writes, writes);
        graph.teardown()?;
        Ok(())
    }

    #[test]
    fn deferred_frames_flow_and_stop_returns_buffers() -> Result<()> {
        let mut graph = PipelineGraph::new(fast_sim());
        graph.build(&Settings::default(), Delivery::Deferred)?;
        let mut assembler = FrameAssembler::default();
        let mut frames = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while frames.len() < 3 && Instant::now() < deadline {
            graph.process_relay(&mut assembler, |frame| {
                frames.push(frame.to_vec());
                Ok(())
            })?;
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(frames.len() >= 3);
        let info = SimulatedCamera::parse_frame(&frames[0]).expect("sim frame");
        assert_eq!((info.width, info.height, info.quality), (320, 176, 75));

        graph.stop()?;
        assert_eq!(graph.state(), GraphState::Stopped);
        assert_eq!(graph.pool_stats().map(|s| s.outstanding), Some(0));
        graph.teardown()?;
        Ok(())
    }

    #[test]
    fn quality_is_applied_in_place() -> Result<()> {
        let mut graph = PipelineGraph::new(fast_sim());
        graph.build(&Settings::default(), Delivery::Deferred)?;
        let pool = graph.pool_id();
        let settings = Settings {
            quality: 50,
            ..Settings::default()
        };
        graph.apply_key(ParamKey::Quality, &settings, ApplyContext::Runtime)?;
        assert_eq!(
            graph.hal().parameter(StageKind::Encoder, "jpeg_quality"),
            Some(&CameraParameter::JpegQuality(50))
        );
        assert_eq!(graph.pool_id(), pool);
        assert_eq!(graph.generation(), 1);
        graph.teardown()?;
        Ok(())
    }
}
