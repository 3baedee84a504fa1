use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use jpgstream::fifo::FifoControl;
use jpgstream::lock::LockState;
use jpgstream::output::{BudgetedSink, FrameSink};
use jpgstream::{
    FrameBudget, FrameWriter, Framing, OutputTarget, Server, ServerLock, ServerOptions, Settings,
    SimConfig, SimulatedCamera,
};

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: `c_path` is a valid NUL-terminated string.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[test]
fn live_lock_holder_makes_us_a_client() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lock");
    let mut child = Command::new("sleep").arg("30").spawn()?;
    std::fs::write(&path, format!("{}\n", child.id()))?;

    let state = ServerLock::acquire(&path);
    let holder = ServerLock::holder(&path);
    child.kill()?;
    child.wait()?;

    match state? {
        LockState::HeldBy(pid) => assert_eq!(pid, child.id()),
        LockState::Acquired(_) => panic!("lock held by a live process was taken"),
    }
    assert_eq!(holder?, Some(child.id()));
    Ok(())
}

#[test]
fn lock_of_an_exited_process_is_reclaimed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lock");
    let mut child = Command::new("true").spawn()?;
    child.wait()?;
    std::fs::write(&path, format!("{}\n", child.id()))?;

    assert_eq!(ServerLock::holder(&path)?, None);
    match ServerLock::acquire(&path)? {
        LockState::Acquired(lock) => {
            assert_eq!(lock.pid(), std::process::id());
            let text = std::fs::read_to_string(&path)?;
            assert_eq!(text.trim(), std::process::id().to_string());
            drop(lock);
            assert!(!path.exists());
        }
        LockState::HeldBy(pid) => panic!("stale lock reported as held by {}", pid),
    }
    Ok(())
}

fn assert_complete_jpeg(frame: &[u8]) {
    assert!(frame.starts_with(&[0xFF, 0xD8]), "output starts mid-frame");
    assert!(frame.ends_with(&[0xFF, 0xD9]), "output is a partial frame");
}

#[test]
fn pipe_controlled_capture_replaces_the_output_atomically() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pipe = dir.path().join("control");
    let output = dir.path().join("cam.jpg");
    mkfifo(&pipe)?;

    let writer = FrameWriter::open(&OutputTarget::File(output.clone()), Framing::Replace)?;
    let budget = FrameBudget::unlimited();
    let sink = Arc::new(Mutex::new(BudgetedSink::new(writer, budget.clone())));
    let hal = SimulatedCamera::new(SimConfig {
        frame_interval: Duration::from_millis(2),
        ..SimConfig::default()
    });
    let options = ServerOptions {
        poll_interval: Duration::from_millis(5),
        ..ServerOptions::default()
    };
    let mut server = Server::new(hal, Settings::default(), options)
        .with_fifo(FifoControl::open(&pipe)?)
        .with_budget(budget)
        .with_immediate_sink(Box::new(move || {
            let sink: Box<dyn FrameSink> = Box::new(Arc::clone(&sink));
            Ok(sink)
        }));
    server.start()?;

    let mut operator = OpenOptions::new().write(true).open(&pipe)?;
    operator.write_all(b"# lower the quality\nquality 20\n")?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen = 0;
    loop {
        server.run_once()?;
        if output.exists() {
            let frame = std::fs::read(&output)?;
            assert_complete_jpeg(&frame);
            seen += 1;
            if SimulatedCamera::parse_frame(&frame).map(|info| info.quality) == Some(20) {
                break;
            }
        }
        assert!(Instant::now() < deadline, "quality change never reached the output");
    }
    assert!(seen > 0);
    assert_eq!(server.settings().quality, 20);

    operator.write_all(b"width 640\n")?;
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        server.run_once()?;
        let frame = std::fs::read(&output)?;
        assert_complete_jpeg(&frame);
        if SimulatedCamera::parse_frame(&frame).map(|info| info.width) == Some(640) {
            break;
        }
        assert!(Instant::now() < deadline, "rebuild never reached the output");
    }
    assert_eq!(server.graph().generation(), 2);

    operator.write_all(b"quit\n")?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.should_continue() {
        assert!(Instant::now() < deadline, "quit was not honoured");
        server.run_once()?;
    }
    server.shutdown()?;
    Ok(())
}
