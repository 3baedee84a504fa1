//! jpgstream
//!
//! Drives a camera through a fixed hardware pipeline (capture -> scale -> JPEG encode)
//! and streams the compressed frames to a file or to local subscribers, while
//! capture parameters and output resolution can be changed live.
//!
//! # Architecture
//!
//! The crate is organised around a few hard rules:
//!
//! 1. **One graph**: at most one `PipelineGraph` instance exists; a resolution change
//!    tears the old graph down completely before the new one is built.
//! 2. **One owner per buffer**: every pool buffer is either pooled, held by the
//!    hardware, in transit to the control loop, or owned by the application.
//! 3. **One control thread**: settings, pool bookkeeping, frame assembly and the
//!    subscriber registry are only touched by the control loop. Hardware callback
//!    threads only see the buffer they were handed and the relay channel.
//! 4. **Fail closed on hardware errors**: allocation, negotiation and resubmission
//!    failures are fatal. Bad live commands are not.
//!
//! # Module Structure
//!
//! - `settings`: `Settings`, closed parameter enums, `ParamKey` validator/applier table
//! - `control`: command grammar and application of commands to `Settings`
//! - `hal`: `CameraHal` trait, port handles, and the simulated backend
//! - `pool`: `BufferPool` and the buffer ownership tag
//! - `graph`: `PipelineGraph` lifecycle (build, apply settings, stop, teardown)
//! - `relay`: hardware callback -> control loop handoff and buffer recycling
//! - `assembler`: fragment reassembly into complete frames
//! - `distributor`: subscriber registry over a local datagram socket
//! - `output`: frame writers and framing
//! - `server` / `client`: the two roles of the multi-client variant
//! - `config` / `cli`: layered settings sources

pub mod assembler;
pub mod cli;
pub mod client;
pub mod config;
pub mod control;
pub mod distributor;
pub mod error;
pub mod fifo;
pub mod graph;
pub mod hal;
pub mod lock;
pub mod output;
pub mod pool;
pub mod relay;
pub mod server;
pub mod settings;
pub(crate) mod sys;

pub use assembler::{Assembly, FrameAssembler, MAX_FRAME_BYTES};
pub use config::RuntimeConfig;
pub use control::{ApplyContext, Command};
pub use distributor::{Distributor, MAX_CLIENTS};
pub use error::ControlError;
pub use graph::{Delivery, GraphState, PipelineGraph};
pub use hal::sim::{SimConfig, SimFault, SimulatedCamera};
pub use hal::{CameraHal, PortHandle, StageKind};
pub use lock::ServerLock;
pub use output::{FrameBudget, FrameSink, FrameWriter, Framing, OutputTarget};
pub use pool::{Buffer, BufferPool, Owner, PoolStats};
pub use server::{Server, ServerOptions};
pub use settings::{ParamKey, Settings};
