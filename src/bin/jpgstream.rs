//! jpgstream - camera JPEG streamer
//!
//! The first instance takes the lock file and becomes the server:
//! 1. Builds the capture -> scale -> encode pipeline
//! 2. Serves subscriber datagrams on the control socket
//! 3. Writes frames to `--output` if one is given
//!
//! Later instances find a live pid in the lock file and become clients: they forward
//! their `--set` list to the server and, with `--output`, write the frames it sends.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jpgstream::cli::Args;
use jpgstream::client::{self, ClientOptions};
use jpgstream::lock::LockState;
use jpgstream::output::Framing;
use jpgstream::{
    Distributor, FrameBudget, FrameWriter, RuntimeConfig, Server, ServerLock, ServerOptions,
    SimConfig, SimulatedCamera,
};

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = RuntimeConfig::load(&args.overrides()?)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;
    }

    if args.client {
        return run_client(&args, &config, &stop);
    }
    match ServerLock::acquire(&config.lockfile)? {
        LockState::Acquired(lock) => {
            log::info!(
                "holding {} as pid {}; serving on {}",
                lock.path().display(),
                lock.pid(),
                config.socket.display()
            );
            let result = run_server(&args, &config, stop);
            drop(lock);
            result
        }
        LockState::HeldBy(pid) if args.server => Err(anyhow!(
            "cannot run as server: pid {} holds {}",
            pid,
            config.lockfile.display()
        )),
        LockState::HeldBy(pid) => {
            log::info!("server running as pid {}; connecting as client", pid);
            run_client(&args, &config, &stop)
        }
    }
}

fn run_server(args: &Args, config: &RuntimeConfig, stop: Arc<AtomicBool>) -> Result<()> {
    if args.quit {
        return Err(anyhow!("--quit given but no server is running"));
    }
    let options = ServerOptions {
        max_frame: config.max_frame_bytes,
        ..ServerOptions::default()
    };
    let hal = SimulatedCamera::new(SimConfig::default());
    let mut server = Server::new(hal, config.settings.clone(), options)
        .with_distributor(Distributor::bind(&config.socket)?)
        .with_budget(FrameBudget::new(config.count))
        .with_stop_flag(stop);
    if let Some(target) = &config.output {
        let framing = config.framing.unwrap_or(Framing::Cat);
        log::info!("writing frames to {} ({} framing)", target, framing);
        server = server.with_writer(FrameWriter::open(target, framing)?);
    }

    let result = server.run();
    if let Some(writer) = server.writer() {
        log::info!("wrote {} frames", writer.frames_written());
    }
    if let Err(e) = &result {
        log::error!("server stopped: {:#}", e);
    }
    result
}

fn run_client(args: &Args, config: &RuntimeConfig, stop: &AtomicBool) -> Result<()> {
    let mut commands = args.camera.command_lines()?;
    if args.quit {
        commands.push("quit".to_string());
    }
    let options = ClientOptions {
        socket: config.socket.clone(),
        commands,
        output: config.output.clone(),
        framing: config.framing.unwrap_or(Framing::Cat),
        count: config.count,
        ack_timeout: ACK_TIMEOUT,
    };
    client::run(&options, stop)
}
