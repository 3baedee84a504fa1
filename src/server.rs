//! The control loop.
//!
//! `Server` owns the pipeline graph, the live `Settings`, the frame assembler and
//! the frame consumers, and is the only code that touches them. Each iteration
//! blocks in `poll(2)` on the relay wake socket and the control transports, with a
//! bounded timeout so the stop flag and frame budget are checked regularly.
//!
//! Per iteration:
//! 1. drain the relay: assemble, emit, recycle
//! 2. read subscriber datagrams: register, apply, acknowledge
//! 3. read the control pipe: apply, log
//!
//! Parameter changes are applied to the running graph in place. Resolution changes
//! and `run 0`/`run 1` tear the graph down and build a new one.

use anyhow::Result;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::assembler::{AssemblerStats, FrameAssembler, MAX_FRAME_BYTES};
use crate::control::{self, Action, ApplyContext};
use crate::distributor::Distributor;
use crate::fifo::FifoControl;
use crate::graph::{Delivery, GraphState, PipelineGraph};
use crate::hal::CameraHal;
use crate::output::{FrameBudget, FrameSink, FrameWriter};
use crate::settings::Settings;
use crate::sys;

/// Builds the sink handed to the hardware thread for each graph generation.
pub type SinkFactory = Box<dyn FnMut() -> Result<Box<dyn FrameSink>>>;

#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Upper bound on one poll wait.
    pub poll_interval: Duration,
    /// Frame ceiling for the assembler.
    pub max_frame: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_frame: MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Relay,
    Socket,
    Fifo,
}

pub struct Server<H: CameraHal> {
    graph: PipelineGraph<H>,
    settings: Settings,
    options: ServerOptions,
    assembler: FrameAssembler,
    writer: Option<FrameWriter>,
    distributor: Option<Distributor>,
    fifo: Option<FifoControl>,
    immediate: Option<SinkFactory>,
    budget: FrameBudget,
    stop: Arc<AtomicBool>,
    paused: bool,
    quit: bool,
}

impl<H: CameraHal> Server<H> {
    pub fn new(hal: H, settings: Settings, options: ServerOptions) -> Self {
        Self {
            graph: PipelineGraph::with_max_frame(hal, options.max_frame),
            settings,
            assembler: FrameAssembler::new(options.max_frame),
            options,
            writer: None,
            distributor: None,
            fifo: None,
            immediate: None,
            budget: FrameBudget::unlimited(),
            stop: Arc::new(AtomicBool::new(false)),
            paused: false,
            quit: false,
        }
    }

    /// Writes assembled frames from the control loop.
    pub fn with_writer(mut self, writer: FrameWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_distributor(mut self, distributor: Distributor) -> Self {
        self.distributor = Some(distributor);
        self
    }

    pub fn with_fifo(mut self, fifo: FifoControl) -> Self {
        self.fifo = Some(fifo);
        self
    }

    /// Switches to immediate delivery: frames are emitted on the hardware thread into
    /// a sink produced by `factory` for every build.
    pub fn with_immediate_sink(mut self, factory: SinkFactory) -> Self {
        self.immediate = Some(factory);
        self
    }

    pub fn with_budget(mut self, budget: FrameBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn graph(&self) -> &PipelineGraph<H> {
        &self.graph
    }

    pub fn distributor(&self) -> Option<&Distributor> {
        self.distributor.as_ref()
    }

    pub fn writer(&self) -> Option<&FrameWriter> {
        self.writer.as_ref()
    }

    pub fn assembler_stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    pub fn budget(&self) -> &FrameBudget {
        &self.budget
    }

    /// True while `run 0` is in effect.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn should_continue(&self) -> bool {
        !self.quit && !self.stop.load(Ordering::SeqCst) && !self.budget.exhausted()
    }

    /// Builds the first graph. Startup settings errors are fatal here.
    pub fn start(&mut self) -> Result<()> {
        self.build_graph()
    }

    /// Starts, serves until stopped, then tears down.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        let served = self.serve();
        let shutdown = self.shutdown();
        served.and(shutdown)
    }

    fn serve(&mut self) -> Result<()> {
        while self.should_continue() {
            self.run_once()?;
        }
        log::info!("Server: leaving control loop");
        Ok(())
    }

    /// One poll wait and whatever work it turned up.
    pub fn run_once(&mut self) -> Result<()> {
        let mut sources: Vec<(Source, RawFd)> = Vec::with_capacity(3);
        if let Some(fd) = self.graph.relay_fd() {
            sources.push((Source::Relay, fd));
        }
        if let Some(distributor) = &self.distributor {
            sources.push((Source::Socket, distributor.as_raw_fd()));
        }
        if let Some(fifo) = &self.fifo {
            sources.push((Source::Fifo, fifo.as_raw_fd()));
        }
        let fds: Vec<RawFd> = sources.iter().map(|(_, fd)| *fd).collect();
        let ready = sys::poll_readable(&fds, self.options.poll_interval)?;

        for ((source, _), ready) in sources.iter().zip(ready) {
            if !ready {
                continue;
            }
            match source {
                Source::Relay => self.service_relay()?,
                Source::Socket => self.service_socket()?,
                Source::Fifo => self.service_fifo()?,
            }
            if !self.should_continue() {
                break;
            }
        }
        Ok(())
    }

    fn service_relay(&mut self) -> Result<()> {
        let Self {
            graph,
            assembler,
            writer,
            distributor,
            budget,
            ..
        } = self;
        graph.process_relay(assembler, |frame| {
            if !budget.consume() {
                return Ok(());
            }
            if let Some(writer) = writer.as_mut() {
                writer.write_frame(frame)?;
            }
            if let Some(distributor) = distributor.as_mut() {
                distributor.broadcast(frame);
            }
            Ok(())
        })?;
        Ok(())
    }

    fn service_socket(&mut self) -> Result<()> {
        loop {
            let datagram = match self.distributor.as_mut() {
                Some(distributor) => distributor.receive()?,
                None => return Ok(()),
            };
            let Some(datagram) = datagram else {
                return Ok(());
            };
            let acks = self.handle_commands(&datagram.text)?;
            if let (Some(sender), Some(distributor)) = (&datagram.sender, self.distributor.as_mut()) {
                for ack in acks {
                    distributor.reply(sender, &ack);
                }
            }
        }
    }

    fn service_fifo(&mut self) -> Result<()> {
        let text = match self.fifo.as_mut() {
            Some(fifo) => fifo.read_available()?,
            None => return Ok(()),
        };
        for ack in self.handle_commands(&text)? {
            log::info!("control: {}", ack);
        }
        Ok(())
    }

    /// Applies a batch of control lines and returns one status line per command.
    ///
    /// Bad commands produce an `error:` status; only hardware failures while acting
    /// on a command are returned as errors.
    pub fn handle_commands(&mut self, text: &str) -> Result<Vec<String>> {
        let mut acks = Vec::new();
        for parsed in control::parse_text(text) {
            let command = match parsed {
                Ok(command) => command,
                Err(e) => {
                    log::warn!("control: {}", e);
                    acks.push(format!("error: {}", e));
                    continue;
                }
            };
            let result = control::apply(&mut self.settings, &command);
            match &result {
                Ok(action) => self.perform(*action)?,
                Err(e) => log::warn!("control: {}", e),
            }
            acks.push(control::acknowledgement(command.label(), &result));
        }
        Ok(acks)
    }

    fn perform(&mut self, action: Action) -> Result<()> {
        match action {
            Action::None => {}
            Action::Reconfigure(key) => {
                if matches!(self.graph.state(), GraphState::Built | GraphState::Running) {
                    self.graph.apply_key(key, &self.settings, ApplyContext::Runtime)?;
                }
            }
            Action::Rebuild => {
                if !self.paused {
                    log::info!(
                        "Server: rebuilding for {}x{} capture, {}x{} stream",
                        self.settings.video_width,
                        self.settings.video_height,
                        self.settings.width,
                        self.settings.stream_height()
                    );
                    self.graph.teardown()?;
                    self.build_graph()?;
                }
            }
            Action::Stop => {
                if !self.paused {
                    self.graph.teardown()?;
                    self.paused = true;
                    log::info!("Server: capture stopped");
                }
            }
            Action::Resume => {
                if self.paused {
                    self.build_graph()?;
                    self.paused = false;
                    log::info!("Server: capture resumed");
                }
            }
            Action::Quit => {
                log::info!("Server: quit requested");
                self.quit = true;
            }
        }
        Ok(())
    }

    fn build_graph(&mut self) -> Result<()> {
        let delivery = match self.immediate.as_mut() {
            Some(factory) => Delivery::Immediate(factory()?),
            None => Delivery::Deferred,
        };
        self.assembler.reset();
        self.graph.build(&self.settings, delivery)
    }

    /// Tears the graph down; every in-flight buffer is returned first.
    pub fn shutdown(&mut self) -> Result<()> {
        self.graph.teardown()
    }
}
