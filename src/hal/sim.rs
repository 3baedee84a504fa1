//! Simulated accelerator.
//!
//! `SimulatedCamera` implements `CameraHal` without hardware. It keeps the same
//! bookkeeping a real accelerator would (components, committed port formats, tunnels,
//! parameters) and refuses the same mistakes: destroying a component that is still
//! tunnelled, disabling a component whose output is producing, enabling an output
//! without an upstream chain.
//!
//! Each enabled encoder output gets a hardware-owned producer thread that:
//! - waits for submitted buffers
//! - fills them with a synthetic JPEG (SOI, COM segment, padding, EOI) carrying the
//!   negotiated width, height and quality
//! - fragments frames that do not fit in one buffer and flags the last fragment
//! - on disable, hands every buffer it still holds back with zero length

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{
    BufferCallback, BufferRequirements, CameraHal, CameraParameter, ComponentId,
    ComponentPorts, Encoding, PortFormat, PortHandle, PortId, StageKind, TunnelId,
};
use crate::assembler::MAX_FRAME_BYTES;
use crate::pool::FLAG_FRAME_END;
use crate::settings::{SENSOR_MAX_HEIGHT, SENSOR_MAX_WIDTH};

const WAIT_SLICE: Duration = Duration::from_millis(5);
const COMMENT_TAG: &str = "jpgstream-sim";

/// Configuration for the simulated accelerator.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Pause between produced frames.
    pub frame_interval: Duration,
    pub buffer_num_min: u32,
    pub buffer_num_recommended: u32,
    pub buffer_size_min: u32,
    pub buffer_size_recommended: u32,
    /// Every n-th frame is padded past the assembler ceiling.
    pub oversize_every: Option<u64>,
    /// Operation that fails on purpose.
    pub fail_on: Option<SimFault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(33),
            buffer_num_min: 1,
            buffer_num_recommended: 3,
            buffer_size_min: 2048,
            buffer_size_recommended: 81920,
            oversize_every: None,
            fail_on: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimFault {
    CreateComponent(StageKind),
    CommitFormat(StageKind),
    CreateTunnel,
    EnableOutput,
    SetParameter(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub components_created: u64,
    pub components_destroyed: u64,
    pub live_components: usize,
    pub tunnels_created: u64,
    pub tunnels_destroyed: u64,
    pub live_tunnels: usize,
    pub outputs_enabled: u64,
    pub frames_produced: u64,
    pub parameter_writes: u64,
}

/// Values recovered from a frame produced by the simulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimFrameInfo {
    pub width: u32,
    pub height: u32,
    pub quality: u32,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PortRole {
    Control,
    Input,
    Output,
}

struct SimComponent {
    ports: ComponentPorts,
    enabled: bool,
    encoder: Option<Arc<Mutex<EncoderState>>>,
}

struct SimPort {
    component: ComponentId,
    kind: StageKind,
    role: PortRole,
    format: Option<PortFormat>,
    buffers: Option<(u32, u32)>,
}

struct SimTunnel {
    from: PortId,
    to: PortId,
    enabled: bool,
}

struct Producer {
    handle: PortHandle,
    thread: JoinHandle<()>,
}

struct EncoderState {
    width: u32,
    height: u32,
    quality: u32,
    sequence: u64,
}

impl EncoderState {
    fn next_frame(&mut self, oversize_every: Option<u64>) -> Vec<u8> {
        self.sequence += 1;
        let comment = format!(
            "{} w={} h={} q={} seq={}",
            COMMENT_TAG, self.width, self.height, self.quality, self.sequence
        );
        let mut body = (u64::from(self.width) * u64::from(self.height) / 32
            * u64::from(self.quality)
            / 100)
            .max(16) as usize;
        if let Some(every) = oversize_every {
            if every > 0 && self.sequence % every == 0 {
                body += MAX_FRAME_BYTES;
            }
        }

        let mut frame = Vec::with_capacity(comment.len() + body + 8);
        frame.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xFE]);
        frame.extend_from_slice(&((comment.len() + 2) as u16).to_be_bytes());
        frame.extend_from_slice(comment.as_bytes());
        // Padding stays clear of 0xFF so it never looks like a marker.
        frame.extend((0..body).map(|i| 0x20 + ((i as u64 + self.sequence) % 64) as u8));
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }
}

/// Simulated capture -> scale -> encode accelerator.
pub struct SimulatedCamera {
    config: SimConfig,
    next_id: u32,
    components: HashMap<ComponentId, SimComponent>,
    ports: HashMap<PortId, SimPort>,
    tunnels: HashMap<TunnelId, SimTunnel>,
    producers: HashMap<PortId, Producer>,
    parameters: HashMap<(StageKind, &'static str), CameraParameter>,
    frames_produced: Arc<AtomicU64>,
    stats: SimStats,
}

impl SimulatedCamera {
    pub fn new(config: SimConfig) -> Self {
        log::info!(
            "SimulatedCamera: ready (frame interval {:?}, {} x {} byte buffers recommended)",
            config.frame_interval,
            config.buffer_num_recommended,
            config.buffer_size_recommended
        );
        Self {
            config,
            next_id: 1,
            components: HashMap::new(),
            ports: HashMap::new(),
            tunnels: HashMap::new(),
            producers: HashMap::new(),
            parameters: HashMap::new(),
            frames_produced: Arc::new(AtomicU64::new(0)),
            stats: SimStats::default(),
        }
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            live_components: self.components.len(),
            live_tunnels: self.tunnels.len(),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            ..self.stats
        }
    }

    /// Last value written for a parameter on a stage, by `CameraParameter::name`.
    pub fn parameter(&self, kind: StageKind, name: &str) -> Option<&CameraParameter> {
        self.parameters
            .iter()
            .find(|((stage, param), _)| *stage == kind && *param == name)
            .map(|(_, value)| value)
    }

    pub fn is_producing(&self) -> bool {
        !self.producers.is_empty()
    }

    /// Clears an injected fault.
    pub fn clear_fault(&mut self) {
        self.config.fail_on = None;
    }

    /// Parses the comment segment written into every simulated frame.
    pub fn parse_frame(frame: &[u8]) -> Option<SimFrameInfo> {
        if frame.len() < 6 || frame[..4] != [0xFF, 0xD8, 0xFF, 0xFE] {
            return None;
        }
        let len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        let comment = frame.get(6..4 + len)?;
        let text = std::str::from_utf8(comment).ok()?;
        let mut fields = text.split_whitespace();
        if fields.next()? != COMMENT_TAG {
            return None;
        }
        let mut info = SimFrameInfo {
            width: 0,
            height: 0,
            quality: 0,
            sequence: 0,
        };
        for field in fields {
            let (name, value) = field.split_once('=')?;
            match name {
                "w" => info.width = value.parse().ok()?,
                "h" => info.height = value.parse().ok()?,
                "q" => info.quality = value.parse().ok()?,
                "seq" => info.sequence = value.parse().ok()?,
                _ => {}
            }
        }
        Some(info)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_fault(&self, fault: SimFault) -> Result<()> {
        if self.config.fail_on == Some(fault) {
            return Err(anyhow!("simulated hardware fault: {:?}", fault));
        }
        Ok(())
    }

    fn port(&self, port: PortId) -> Result<&SimPort> {
        self.ports
            .get(&port)
            .ok_or_else(|| anyhow!("unknown {}", port))
    }

    fn component(&self, id: ComponentId) -> Result<&SimComponent> {
        self.components
            .get(&id)
            .ok_or_else(|| anyhow!("unknown component {:?}", id))
    }

    fn component_enabled(&self, id: ComponentId) -> bool {
        self.components.get(&id).map(|c| c.enabled).unwrap_or(false)
    }

    fn tunnel_into(&self, port: Option<PortId>) -> Option<&SimTunnel> {
        let port = port?;
        self.tunnels.values().find(|t| t.to == port && t.enabled)
    }

    fn port_in_tunnel(&self, port: PortId) -> bool {
        self.tunnels.values().any(|t| t.from == port || t.to == port)
    }

    fn stop_producer(&mut self, port: PortId) -> Result<()> {
        let producer = self
            .producers
            .remove(&port)
            .ok_or_else(|| anyhow!("{} is not enabled", port))?;
        producer.handle.shut();
        producer
            .thread
            .join()
            .map_err(|_| anyhow!("producer thread for {} panicked", port))
    }
}

impl CameraHal for SimulatedCamera {
    fn create_component(&mut self, kind: StageKind) -> Result<ComponentPorts> {
        self.check_fault(SimFault::CreateComponent(kind))?;
        let id = ComponentId(self.allocate_id());
        let control = PortId(self.allocate_id());
        let input = match kind {
            StageKind::Camera => None,
            StageKind::Scaler | StageKind::Encoder => Some(PortId(self.allocate_id())),
        };
        let output = PortId(self.allocate_id());
        let ports = ComponentPorts {
            id,
            kind,
            control,
            input,
            output,
        };

        let mut register = |port: PortId, role: PortRole| {
            self.ports.insert(
                port,
                SimPort {
                    component: id,
                    kind,
                    role,
                    format: None,
                    buffers: None,
                },
            );
        };
        register(control, PortRole::Control);
        if let Some(input) = input {
            register(input, PortRole::Input);
        }
        register(output, PortRole::Output);

        let encoder = (kind == StageKind::Encoder).then(|| {
            Arc::new(Mutex::new(EncoderState {
                width: 0,
                height: 0,
                quality: 0,
                sequence: 0,
            }))
        });
        self.components.insert(
            id,
            SimComponent {
                ports,
                enabled: false,
                encoder,
            },
        );
        self.stats.components_created += 1;
        log::debug!("SimulatedCamera: created {} {:?}", kind, id);
        Ok(ports)
    }

    fn enable_component(&mut self, id: ComponentId) -> Result<()> {
        let component = self
            .components
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown component {:?}", id))?;
        component.enabled = true;
        Ok(())
    }

    fn disable_component(&mut self, id: ComponentId) -> Result<()> {
        let output = self.component(id)?.ports.output;
        if self.producers.contains_key(&output) {
            return Err(anyhow!(
                "cannot disable component {:?} while {} is enabled",
                id,
                output
            ));
        }
        if let Some(component) = self.components.get_mut(&id) {
            component.enabled = false;
        }
        Ok(())
    }

    fn destroy_component(&mut self, id: ComponentId) -> Result<()> {
        let ports = self.component(id)?.ports;
        let mut owned = vec![ports.control, ports.output];
        owned.extend(ports.input);
        if let Some(port) = owned.iter().find(|p| self.port_in_tunnel(**p)) {
            return Err(anyhow!(
                "cannot destroy {} {:?}: {} is still tunnelled",
                ports.kind,
                id,
                port
            ));
        }
        if self.producers.contains_key(&ports.output) {
            return Err(anyhow!(
                "cannot destroy {} {:?}: output still enabled",
                ports.kind,
                id
            ));
        }
        for port in owned {
            self.ports.remove(&port);
        }
        self.parameters.retain(|(stage, _), _| *stage != ports.kind);
        self.components.remove(&id);
        self.stats.components_destroyed += 1;
        log::debug!("SimulatedCamera: destroyed {} {:?}", ports.kind, id);
        Ok(())
    }

    fn commit_format(&mut self, port: PortId, format: &PortFormat) -> Result<()> {
        let (kind, role, component) = {
            let p = self.port(port)?;
            (p.kind, p.role, p.component)
        };
        self.check_fault(SimFault::CommitFormat(kind))?;
        if format.width == 0 || format.height == 0 {
            return Err(anyhow!("{} format {}x{} is empty", kind, format.width, format.height));
        }
        if kind == StageKind::Camera
            && (format.width > SENSOR_MAX_WIDTH || format.height > SENSOR_MAX_HEIGHT)
        {
            return Err(anyhow!(
                "camera format {}x{} exceeds sensor {}x{}",
                format.width,
                format.height,
                SENSOR_MAX_WIDTH,
                SENSOR_MAX_HEIGHT
            ));
        }
        if kind == StageKind::Encoder && role == PortRole::Output {
            if format.encoding != Encoding::Jpeg {
                return Err(anyhow!("encoder output only supports JPEG"));
            }
            if let Some(encoder) = self.component(component)?.encoder.as_ref() {
                let mut state = encoder
                    .lock()
                    .map_err(|_| anyhow!("encoder state poisoned"))?;
                state.width = format.width;
                state.height = format.height;
            }
        }
        if let Some(p) = self.ports.get_mut(&port) {
            p.format = Some(*format);
        }
        Ok(())
    }

    fn buffer_requirements(&self, port: PortId) -> Result<BufferRequirements> {
        let p = self.port(port)?;
        if p.role != PortRole::Output {
            return Err(anyhow!("{} is not an output port", port));
        }
        Ok(BufferRequirements {
            num_min: self.config.buffer_num_min,
            num_recommended: self.config.buffer_num_recommended,
            size_min: self.config.buffer_size_min,
            size_recommended: self.config.buffer_size_recommended,
        })
    }

    fn configure_buffers(&mut self, port: PortId, count: u32, size: u32) -> Result<()> {
        if count < self.config.buffer_num_min || size < self.config.buffer_size_min {
            return Err(anyhow!(
                "{} buffers {} x {} below minimum {} x {}",
                port,
                count,
                size,
                self.config.buffer_num_min,
                self.config.buffer_size_min
            ));
        }
        let p = self
            .ports
            .get_mut(&port)
            .ok_or_else(|| anyhow!("unknown {}", port))?;
        p.buffers = Some((count, size));
        Ok(())
    }

    fn set_parameter(&mut self, port: PortId, param: &CameraParameter) -> Result<()> {
        self.check_fault(SimFault::SetParameter(param.name()))?;
        let (kind, component) = {
            let p = self.port(port)?;
            (p.kind, p.component)
        };
        if let CameraParameter::JpegQuality(quality) = param {
            let encoder = self
                .component(component)?
                .encoder
                .clone()
                .ok_or_else(|| anyhow!("jpeg quality set on {} port", kind))?;
            let mut state = encoder
                .lock()
                .map_err(|_| anyhow!("encoder state poisoned"))?;
            state.quality = *quality;
        }
        self.parameters.insert((kind, param.name()), param.clone());
        self.stats.parameter_writes += 1;
        Ok(())
    }

    fn create_tunnel(&mut self, from: PortId, to: PortId) -> Result<TunnelId> {
        self.check_fault(SimFault::CreateTunnel)?;
        if self.port(from)?.role != PortRole::Output || self.port(to)?.role != PortRole::Input {
            return Err(anyhow!("tunnel must link an output to an input ({} -> {})", from, to));
        }
        if self.port_in_tunnel(from) || self.port_in_tunnel(to) {
            return Err(anyhow!("{} or {} is already tunnelled", from, to));
        }
        let id = TunnelId(self.allocate_id());
        self.tunnels.insert(
            id,
            SimTunnel {
                from,
                to,
                enabled: false,
            },
        );
        self.stats.tunnels_created += 1;
        Ok(id)
    }

    fn enable_tunnel(&mut self, id: TunnelId) -> Result<()> {
        let (from, to) = {
            let tunnel = self
                .tunnels
                .get(&id)
                .ok_or_else(|| anyhow!("unknown tunnel {:?}", id))?;
            (tunnel.from, tunnel.to)
        };
        let from_port = self.port(from)?;
        if from_port.format.is_none() {
            return Err(anyhow!("{} has no committed format", from));
        }
        let from_component = from_port.component;
        let to_component = self.port(to)?.component;
        if !self.component_enabled(from_component) || !self.component_enabled(to_component) {
            return Err(anyhow!("tunnel {:?} endpoints are not both enabled", id));
        }
        if let Some(tunnel) = self.tunnels.get_mut(&id) {
            tunnel.enabled = true;
        }
        Ok(())
    }

    fn destroy_tunnel(&mut self, id: TunnelId) -> Result<()> {
        let tunnel = self
            .tunnels
            .remove(&id)
            .ok_or_else(|| anyhow!("unknown tunnel {:?}", id))?;
        self.stats.tunnels_destroyed += 1;
        log::debug!(
            "SimulatedCamera: destroyed tunnel {} -> {}",
            tunnel.from,
            tunnel.to
        );
        Ok(())
    }

    fn enable_output(&mut self, port: PortId, callback: BufferCallback) -> Result<PortHandle> {
        self.check_fault(SimFault::EnableOutput)?;
        let (component_id, role, configured) = {
            let p = self.port(port)?;
            (p.component, p.role, p.format.is_some() && p.buffers.is_some())
        };
        if role != PortRole::Output {
            return Err(anyhow!("{} is not an output port", port));
        }
        if self.producers.contains_key(&port) {
            return Err(anyhow!("{} is already enabled", port));
        }
        if !configured {
            return Err(anyhow!("{} has no committed format or buffers", port));
        }
        let component = self.component(component_id)?;
        if !component.enabled {
            return Err(anyhow!("{} belongs to a disabled component", port));
        }
        let encoder = component
            .encoder
            .clone()
            .ok_or_else(|| anyhow!("only the encoder output produces buffers"))?;

        // Encoder input must be fed by the scaler, which must be fed by the camera.
        let feed = self
            .tunnel_into(component.ports.input)
            .ok_or_else(|| anyhow!("encoder input is not connected"))?;
        let scaler = self.port(feed.from)?.component;
        let scaler_input = self.component(scaler)?.ports.input;
        if self.tunnel_into(scaler_input).is_none() {
            return Err(anyhow!("scaler input is not connected"));
        }

        let handle = PortHandle::new(port);
        let worker = handle.clone();
        let interval = self.config.frame_interval;
        let oversize_every = self.config.oversize_every;
        let frames = Arc::clone(&self.frames_produced);
        let thread = std::thread::Builder::new()
            .name(format!("sim-output-{}", port.0))
            .spawn(move || run_producer(worker, callback, encoder, interval, oversize_every, frames))
            .map_err(|e| anyhow!("failed to spawn producer thread: {}", e))?;

        self.producers.insert(
            port,
            Producer {
                handle: handle.clone(),
                thread,
            },
        );
        self.stats.outputs_enabled += 1;
        log::debug!("SimulatedCamera: {} enabled", port);
        Ok(handle)
    }

    fn disable_output(&mut self, port: PortId) -> Result<()> {
        self.stop_producer(port)?;
        log::debug!("SimulatedCamera: {} disabled", port);
        Ok(())
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        let ports: Vec<PortId> = self.producers.keys().copied().collect();
        for port in ports {
            if let Err(e) = self.stop_producer(port) {
                log::warn!("SimulatedCamera: {}", e);
            }
        }
    }
}

fn run_producer(
    handle: PortHandle,
    mut callback: BufferCallback,
    encoder: Arc<Mutex<EncoderState>>,
    interval: Duration,
    oversize_every: Option<u64>,
    frames: Arc<AtomicU64>,
) {
    'frames: while handle.is_enabled() {
        let frame = match encoder.lock() {
            Ok(mut state) => state.next_frame(oversize_every),
            Err(_) => break,
        };
        let mut offset = 0;
        while offset < frame.len() {
            let mut buffer = match handle.wait_buffer(WAIT_SLICE) {
                Some(buffer) => buffer,
                None if handle.is_enabled() => continue,
                None => break 'frames,
            };
            if !handle.is_enabled() {
                buffer.clear();
                callback(&handle, buffer);
                break 'frames;
            }
            let remaining = frame.len() - offset;
            let flags = if remaining <= buffer.capacity() {
                FLAG_FRAME_END
            } else {
                0
            };
            offset += buffer.fill(&frame[offset..], flags);
            callback(&handle, buffer);
        }
        frames.fetch_add(1, Ordering::Relaxed);
        pause(&handle, interval);
    }

    for mut buffer in handle.drain() {
        buffer.clear();
        callback(&handle, buffer);
    }
}

fn pause(handle: &PortHandle, interval: Duration) {
    let deadline = Instant::now() + interval;
    while handle.is_enabled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::FrameRate;
    use crate::pool::{Buffer, BufferPool};
    use std::sync::mpsc;

    fn jpeg_format(width: u32, height: u32) -> PortFormat {
        PortFormat {
            encoding: Encoding::Jpeg,
            width,
            height,
            frame_rate: FrameRate { num: 30, den: 1 },
        }
    }

    #[test]
    fn frames_carry_negotiated_values() {
        let mut state = EncoderState {
            width: 640,
            height: 352,
            quality: 50,
            sequence: 0,
        };
        let frame = state.next_frame(None);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0xD9]);
        let info = SimulatedCamera::parse_frame(&frame).expect("sim frame");
        assert_eq!(
            info,
            SimFrameInfo {
                width: 640,
                height: 352,
                quality: 50,
                sequence: 1
            }
        );
    }

    #[test]
    fn destroy_refuses_tunnelled_component() -> Result<()> {
        let mut sim = SimulatedCamera::new(SimConfig::default());
        let camera = sim.create_component(StageKind::Camera)?;
        let scaler = sim.create_component(StageKind::Scaler)?;
        let scaler_input = scaler.input.expect("scaler input");
        let tunnel = sim.create_tunnel(camera.output, scaler_input)?;
        assert!(sim.destroy_component(camera.id).is_err());
        sim.destroy_tunnel(tunnel)?;
        sim.destroy_component(camera.id)?;
        sim.destroy_component(scaler.id)?;
        assert_eq!(sim.stats().live_components, 0);
        Ok(())
    }

    #[test]
    fn injected_fault_fails_the_named_operation() {
        let mut sim = SimulatedCamera::new(SimConfig {
            fail_on: Some(SimFault::CreateComponent(StageKind::Encoder)),
            ..SimConfig::default()
        });
        assert!(sim.create_component(StageKind::Camera).is_ok());
        assert!(sim.create_component(StageKind::Encoder).is_err());
    }

    #[test]
    fn producer_fragments_and_flushes_on_disable() -> Result<()> {
        let mut sim = SimulatedCamera::new(SimConfig {
            frame_interval: Duration::from_millis(1),
            buffer_size_min: 256,
            buffer_size_recommended: 256,
            ..SimConfig::default()
        });
        let camera = sim.create_component(StageKind::Camera)?;
        let scaler = sim.create_component(StageKind::Scaler)?;
        let encoder = sim.create_component(StageKind::Encoder)?;
        sim.commit_format(camera.output, &jpeg_format(1920, 1080))?;
        sim.commit_format(scaler.output, &jpeg_format(320, 176))?;
        sim.commit_format(encoder.output, &jpeg_format(320, 176))?;
        sim.configure_buffers(encoder.output, 2, 256)?;
        sim.set_parameter(encoder.output, &CameraParameter::JpegQuality(75))?;
        for id in [camera.id, scaler.id, encoder.id] {
            sim.enable_component(id)?;
        }
        let a = sim.create_tunnel(camera.output, scaler.input.expect("input"))?;
        let b = sim.create_tunnel(scaler.output, encoder.input.expect("input"))?;
        sim.enable_tunnel(a)?;
        sim.enable_tunnel(b)?;

        let pool = BufferPool::new(2, 256)?;
        let (tx, rx) = mpsc::channel();
        let recycle = pool.clone();
        let handle = sim.enable_output(
            encoder.output,
            Box::new(move |port: &PortHandle, mut buffer: Buffer| {
                let _ = tx.send((buffer.len(), buffer.is_frame_end()));
                recycle.claim(&mut buffer).expect("claim");
                recycle.release(buffer).expect("release");
                if port.is_enabled() {
                    if let Some(next) = recycle.take() {
                        if let Err(refused) = port.send_buffer(next) {
                            recycle.release(refused).expect("release refused");
                        }
                    }
                }
            }),
        )?;
        while let Some(buffer) = pool.take() {
            handle.send_buffer(buffer).expect("port enabled");
        }

        let mut saw_end = false;
        let mut fragments = 0;
        while !saw_end {
            let (len, end) = rx.recv_timeout(Duration::from_secs(5))?;
            assert!(len <= 256);
            fragments += 1;
            saw_end = end;
        }
        assert!(fragments > 1);

        assert!(sim.disable_component(encoder.id).is_err());
        sim.disable_output(encoder.output)?;
        assert_eq!(pool.stats().outstanding, 0);
        assert!(!handle.is_enabled());
        Ok(())
    }
}
