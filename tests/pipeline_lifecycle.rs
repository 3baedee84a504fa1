use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use jpgstream::hal::sim::SimFrameInfo;
use jpgstream::{
    FrameBudget, FrameWriter, Framing, GraphState, OutputTarget, Server, ServerOptions,
    Settings, SimConfig, SimulatedCamera, MAX_FRAME_BYTES,
};

fn fast_sim() -> SimulatedCamera {
    SimulatedCamera::new(SimConfig {
        frame_interval: Duration::from_millis(2),
        ..SimConfig::default()
    })
}

fn options() -> ServerOptions {
    ServerOptions {
        poll_interval: Duration::from_millis(10),
        ..ServerOptions::default()
    }
}

fn header_server(hal: SimulatedCamera, dir: &TempDir) -> Result<Server<SimulatedCamera>> {
    let target = OutputTarget::File(dir.path().join("frames.bin"));
    let writer = FrameWriter::open(&target, Framing::Header)?;
    Ok(Server::new(hal, Settings::default(), options()).with_writer(writer))
}

fn read_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)?;
    let mut frames = Vec::new();
    let mut rest = &data[..];
    while rest.len() >= 4 {
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        frames.push(rest[4..4 + len].to_vec());
        rest = &rest[4 + len..];
    }
    Ok(frames)
}

fn frame_infos(dir: &TempDir) -> Result<Vec<SimFrameInfo>> {
    Ok(read_frames(&dir.path().join("frames.bin"))?
        .iter()
        .filter_map(|frame| SimulatedCamera::parse_frame(frame))
        .collect())
}

/// Runs the loop until `done` holds for the frames written so far.
fn serve_until<F>(server: &mut Server<SimulatedCamera>, dir: &TempDir, done: F) -> Result<Vec<SimFrameInfo>>
where
    F: Fn(&[SimFrameInfo]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        server.run_once()?;
        if let Some(stats) = server.graph().pool_stats() {
            assert!(stats.outstanding <= stats.capacity);
        }
        let infos = frame_infos(dir)?;
        if done(&infos) {
            return Ok(infos);
        }
        assert!(Instant::now() < deadline, "timed out after {} frames", infos.len());
    }
}

#[test]
fn default_stream_is_320_wide_at_quality_75() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    let infos = serve_until(&mut server, &dir, |infos| infos.len() >= 3)?;
    for info in &infos {
        assert_eq!((info.width, info.height, info.quality), (320, 176, 75));
    }
    server.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_returns_every_buffer_and_releases_hardware() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    serve_until(&mut server, &dir, |infos| infos.len() >= 2)?;

    server.shutdown()?;
    assert_eq!(server.graph().state(), GraphState::Uninitialized);
    assert_eq!(server.graph().pool_stats(), None);
    let stats = server.graph().hal().stats();
    assert_eq!(stats.live_components, 0);
    assert_eq!(stats.live_tunnels, 0);
    assert!(!server.graph().hal().is_producing());
    Ok(())
}

#[test]
fn quality_change_keeps_the_running_graph() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    serve_until(&mut server, &dir, |infos| !infos.is_empty())?;
    let generation = server.graph().generation();
    let pool = server.graph().pool_id();
    let port = server.graph().output_port();

    let acks = server.handle_commands("quality 50")?;
    assert_eq!(acks, vec!["ok quality".to_string()]);
    serve_until(&mut server, &dir, |infos| {
        infos.last().map(|info| info.quality) == Some(50)
    })?;

    assert_eq!(server.graph().generation(), generation);
    assert_eq!(server.graph().pool_id(), pool);
    assert_eq!(server.graph().output_port(), port);
    assert_eq!(server.graph().hal().stats().components_created, 3);
    server.shutdown()?;
    Ok(())
}

#[test]
fn width_change_rebuilds_the_graph() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    serve_until(&mut server, &dir, |infos| !infos.is_empty())?;
    let pool = server.graph().pool_id();

    assert_eq!(server.handle_commands("width=640")?, vec!["ok width".to_string()]);
    assert_eq!(server.graph().generation(), 2);
    assert_ne!(server.graph().pool_id(), pool);
    assert_eq!(server.graph().stream_size(), Some((640, 352)));
    let stats = server.graph().hal().stats();
    assert_eq!(stats.components_created, 6);
    assert_eq!(stats.live_components, 3);

    let infos = serve_until(&mut server, &dir, |infos| {
        infos.last().map(|info| info.width) == Some(640)
    })?;
    assert_eq!(infos.last().map(|info| info.height), Some(352));

    // Same value again: nothing to rebuild.
    server.handle_commands("width 640")?;
    assert_eq!(server.graph().generation(), 2);
    server.shutdown()?;
    Ok(())
}

#[test]
fn unknown_key_changes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;

    let acks = server.handle_commands("zoom 3\nquality 500\n")?;
    assert_eq!(acks.len(), 2);
    assert!(acks.iter().all(|ack| ack.starts_with("error:")));
    assert!(acks[0].contains("zoom"));
    assert_eq!(server.settings(), &Settings::default());
    assert!(server.should_continue());
    assert_eq!(server.graph().state(), GraphState::Running);
    server.shutdown()?;
    Ok(())
}

#[test]
fn run_zero_pauses_and_run_one_resumes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    serve_until(&mut server, &dir, |infos| !infos.is_empty())?;

    assert_eq!(server.handle_commands("run 0")?, vec!["ok run".to_string()]);
    assert!(server.is_paused());
    assert_eq!(server.graph().state(), GraphState::Uninitialized);
    assert_eq!(server.graph().hal().stats().live_components, 0);

    // The loop keeps serving while paused; settings still change.
    for _ in 0..3 {
        server.run_once()?;
    }
    assert_eq!(server.handle_commands("quality 30")?, vec!["ok quality".to_string()]);
    assert_eq!(server.handle_commands("width 480")?, vec!["ok width".to_string()]);
    assert_eq!(server.graph().generation(), 1);

    server.handle_commands("run 1")?;
    assert!(!server.is_paused());
    assert_eq!(server.graph().state(), GraphState::Running);
    assert_eq!(server.graph().generation(), 2);
    serve_until(&mut server, &dir, |infos| {
        infos
            .last()
            .map(|info| (info.width, info.quality))
            == Some((480, 30))
    })?;

    // A second run 1 is a no-op.
    server.handle_commands("run 1")?;
    assert_eq!(server.graph().generation(), 2);
    server.shutdown()?;
    Ok(())
}

#[test]
fn oversized_frames_are_dropped_and_streaming_resumes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let hal = SimulatedCamera::new(SimConfig {
        frame_interval: Duration::from_millis(2),
        oversize_every: Some(3),
        ..SimConfig::default()
    });
    let mut server = header_server(hal, &dir)?;
    server.start()?;
    let infos = serve_until(&mut server, &dir, |infos| {
        infos.iter().any(|info| info.sequence > 4)
    })?;
    server.shutdown()?;

    let frames = read_frames(&dir.path().join("frames.bin"))?;
    assert!(frames.iter().all(|frame| frame.len() <= MAX_FRAME_BYTES));
    assert!(infos.iter().all(|info| info.sequence % 3 != 0));
    assert!(infos.iter().any(|info| info.sequence == 4));
    assert!(server.assembler_stats().frames_dropped >= 1);
    Ok(())
}

#[test]
fn frame_budget_ends_the_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?.with_budget(FrameBudget::new(Some(5)));
    server.run()?;
    assert_eq!(server.writer().map(|w| w.frames_written()), Some(5));
    assert_eq!(frame_infos(&dir)?.len(), 5);
    assert_eq!(server.graph().state(), GraphState::Uninitialized);
    Ok(())
}

#[test]
fn quit_command_leaves_the_loop() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut server = header_server(fast_sim(), &dir)?;
    server.start()?;
    assert_eq!(server.handle_commands("quit")?, vec!["ok quit".to_string()]);
    assert!(!server.should_continue());
    server.shutdown()?;
    Ok(())
}
