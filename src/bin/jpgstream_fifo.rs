//! jpgstream_fifo - single-writer camera capture controlled through a named pipe
//!
//! Frames are written straight from the hardware callback into the output file
//! (by default each frame replaces the previous one atomically). Control lines
//! written to the pipe change settings live; `quit` or SIGINT/SIGTERM stop it.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use jpgstream::cli::FifoArgs;
use jpgstream::fifo::FifoControl;
use jpgstream::output::{BudgetedSink, FrameSink, Framing, OutputTarget};
use jpgstream::{
    FrameBudget, FrameWriter, RuntimeConfig, Server, ServerOptions, SimConfig, SimulatedCamera,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = FifoArgs::parse();
    let config = RuntimeConfig::load(&args.overrides()?)?;
    let target = config
        .output
        .clone()
        .ok_or_else(|| anyhow!("an output is required (--output or `output` in the config file)"))?;
    let framing = config.framing.unwrap_or(match target {
        OutputTarget::Stdout => Framing::Cat,
        OutputTarget::File(_) => Framing::Replace,
    });

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;
    }

    let fifo = FifoControl::open(&config.control_pipe)?;
    let budget = FrameBudget::new(config.count);
    let writer = FrameWriter::open(&target, framing)?;
    let sink = Arc::new(Mutex::new(BudgetedSink::new(writer, budget.clone())));
    log::info!("writing frames to {} ({} framing)", target, framing);

    let options = ServerOptions {
        max_frame: config.max_frame_bytes,
        ..ServerOptions::default()
    };
    let hal = SimulatedCamera::new(SimConfig::default());
    let mut server = Server::new(hal, config.settings.clone(), options)
        .with_fifo(fifo)
        .with_budget(budget)
        .with_stop_flag(stop)
        .with_immediate_sink(Box::new(move || {
            let sink: Box<dyn FrameSink> = Box::new(Arc::clone(&sink));
            Ok(sink)
        }));

    let result = server.run();
    if let Err(e) = &result {
        log::error!("capture stopped: {:#}", e);
    }
    result
}
