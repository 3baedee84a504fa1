//! Hardware abstraction for the capture -> scale -> encode accelerator.
//!
//! `CameraHal` is the seam between the pipeline lifecycle code and whatever drives
//! the actual hardware. Components and tunnels are identified by opaque ids; the only
//! object that crosses into hardware-owned threads is a `PortHandle`, through which
//! buffers are submitted back to an enabled output port.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::pool::{Buffer, Owner};
use crate::settings::{AwbMode, ColourEffect, ExposureMode, ImageEffect, MeteringMode, Mirror, Roi};

pub mod sim;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ComponentId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TunnelId(pub u32);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Camera,
    Scaler,
    Encoder,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Camera => "camera",
            StageKind::Scaler => "scaler",
            StageKind::Encoder => "encoder",
        };
        write!(f, "{}", s)
    }
}

/// Ports exposed by a freshly created component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentPorts {
    pub id: ComponentId,
    pub kind: StageKind,
    pub control: PortId,
    pub input: Option<PortId>,
    pub output: PortId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Opaque,
    I420,
    Jpeg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    /// 0/1: the sensor picks its own rate.
    pub const VARIABLE: FrameRate = FrameRate { num: 0, den: 1 };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortFormat {
    pub encoding: Encoding,
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

/// Driver recommendation for the buffers of an output port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRequirements {
    pub num_min: u32,
    pub num_recommended: u32,
    pub size_min: u32,
    pub size_recommended: u32,
}

impl BufferRequirements {
    /// Recommended values, clamped up to the minimums.
    pub fn resolve(&self) -> (u32, u32) {
        (
            self.num_recommended.max(self.num_min),
            self.size_recommended.max(self.size_min),
        )
    }
}

/// Sensor-level configuration committed once per camera instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    pub max_stills_width: u32,
    pub max_stills_height: u32,
    pub max_preview_width: u32,
    pub max_preview_height: u32,
    pub num_preview_frames: u32,
}

/// Where a parameter is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamTarget {
    CameraControl,
    CameraOutput,
    EncoderOutput,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CameraParameter {
    CameraConfig(CameraConfig),
    Sharpness(i32),
    Contrast(i32),
    Brightness(i32),
    Saturation(i32),
    Iso(u32),
    VideoStabilisation(bool),
    ExposureCompensation(i32),
    ExposureMode(ExposureMode),
    AwbMode(AwbMode),
    MeteringMode(MeteringMode),
    ImageEffect(ImageEffect),
    ColourEffect(Option<ColourEffect>),
    Rotation(i32),
    Mirror(Mirror),
    InputCrop(Roi),
    ShutterSpeed(u32),
    Annotation { text: String, background: bool },
    JpegQuality(u32),
}

impl CameraParameter {
    pub fn name(&self) -> &'static str {
        match self {
            CameraParameter::CameraConfig(_) => "camera_config",
            CameraParameter::Sharpness(_) => "sharpness",
            CameraParameter::Contrast(_) => "contrast",
            CameraParameter::Brightness(_) => "brightness",
            CameraParameter::Saturation(_) => "saturation",
            CameraParameter::Iso(_) => "iso",
            CameraParameter::VideoStabilisation(_) => "video_stabilisation",
            CameraParameter::ExposureCompensation(_) => "exposure_compensation",
            CameraParameter::ExposureMode(_) => "exposure_mode",
            CameraParameter::AwbMode(_) => "awb_mode",
            CameraParameter::MeteringMode(_) => "metering_mode",
            CameraParameter::ImageEffect(_) => "image_effect",
            CameraParameter::ColourEffect(_) => "colour_effect",
            CameraParameter::Rotation(_) => "rotation",
            CameraParameter::Mirror(_) => "mirror",
            CameraParameter::InputCrop(_) => "input_crop",
            CameraParameter::ShutterSpeed(_) => "shutter_speed",
            CameraParameter::Annotation { .. } => "annotation",
            CameraParameter::JpegQuality(_) => "jpeg_quality",
        }
    }
}

/// Invoked on a hardware-owned thread for every buffer the port hands back.
pub type BufferCallback = Box<dyn FnMut(&PortHandle, Buffer) + Send>;

/// Operations the pipeline needs from the accelerator.
///
/// Implementations own their worker threads. After `disable_output` returns, the
/// callback registered for that port has been called for every buffer the port was
/// holding and will not be called again.
pub trait CameraHal {
    fn create_component(&mut self, kind: StageKind) -> Result<ComponentPorts>;
    fn enable_component(&mut self, id: ComponentId) -> Result<()>;
    fn disable_component(&mut self, id: ComponentId) -> Result<()>;
    fn destroy_component(&mut self, id: ComponentId) -> Result<()>;

    fn commit_format(&mut self, port: PortId, format: &PortFormat) -> Result<()>;
    fn buffer_requirements(&self, port: PortId) -> Result<BufferRequirements>;
    fn configure_buffers(&mut self, port: PortId, count: u32, size: u32) -> Result<()>;
    fn set_parameter(&mut self, port: PortId, param: &CameraParameter) -> Result<()>;

    fn create_tunnel(&mut self, from: PortId, to: PortId) -> Result<TunnelId>;
    fn enable_tunnel(&mut self, id: TunnelId) -> Result<()>;
    fn destroy_tunnel(&mut self, id: TunnelId) -> Result<()>;

    fn enable_output(&mut self, port: PortId, callback: BufferCallback) -> Result<PortHandle>;
    fn disable_output(&mut self, port: PortId) -> Result<()>;
}

// ---- Port handle ----

struct PortQueue {
    enabled: AtomicBool,
    queue: Mutex<VecDeque<Buffer>>,
    ready: Condvar,
}

/// Submission side of an enabled output port. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct PortHandle {
    port: PortId,
    shared: Arc<PortQueue>,
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle")
            .field("port", &self.port)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl PortHandle {
    /// New handle for an enabled port. Backends create these in `enable_output`.
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            shared: Arc::new(PortQueue {
                enabled: AtomicBool::new(true),
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> PortId {
        self.port
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Queues an application-owned buffer for the hardware to fill.
    ///
    /// A disabled port refuses the buffer and hands it back unchanged.
    pub fn send_buffer(&self, mut buffer: Buffer) -> std::result::Result<(), Buffer> {
        let mut queue = match self.shared.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return Err(buffer),
        };
        if !self.is_enabled() {
            return Err(buffer);
        }
        buffer.set_owner(Owner::Hardware);
        queue.push_back(buffer);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Backend side: waits up to `timeout` for a submitted buffer.
    pub fn wait_buffer(&self, timeout: Duration) -> Option<Buffer> {
        let queue = self.shared.queue.lock().ok()?;
        let (mut queue, _) = self
            .shared
            .ready
            .wait_timeout_while(queue, timeout, |q| q.is_empty() && self.is_enabled())
            .ok()?;
        queue.pop_front()
    }

    /// Backend side: marks the port disabled. Later submissions are refused.
    pub fn shut(&self) {
        let guard = self.shared.queue.lock();
        self.shared.enabled.store(false, Ordering::Release);
        drop(guard);
        self.shared.ready.notify_all();
    }

    /// Backend side: removes every buffer still queued on the port.
    pub fn drain(&self) -> Vec<Buffer> {
        match self.shared.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn send_buffer_marks_hardware_ownership() -> Result<()> {
        let pool = BufferPool::new(2, 8)?;
        let port = PortHandle::new(PortId(7));
        port.send_buffer(pool.take().expect("buffer"))
            .map_err(|_| anyhow::anyhow!("refused"))?;
        let buffer = port
            .wait_buffer(Duration::from_millis(10))
            .expect("queued buffer");
        assert_eq!(buffer.owner(), Owner::Hardware);
        Ok(())
    }

    #[test]
    fn shut_port_refuses_buffers_unchanged() -> Result<()> {
        let pool = BufferPool::new(1, 8)?;
        let port = PortHandle::new(PortId(1));
        port.shut();
        let refused = port
            .send_buffer(pool.take().expect("buffer"))
            .expect_err("port is shut");
        assert_eq!(refused.owner(), Owner::Application);
        pool.release(refused)?;
        assert!(port.wait_buffer(Duration::from_millis(1)).is_none());
        Ok(())
    }

    #[test]
    fn requirements_clamp_up_to_minimum() {
        let req = BufferRequirements {
            num_min: 2,
            num_recommended: 1,
            size_min: 4096,
            size_recommended: 81920,
        };
        assert_eq!(req.resolve(), (2, 81920));
    }
}
