use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use jpgstream::client::{self, Client, ClientOptions, Message};
use jpgstream::{
    Distributor, Framing, OutputTarget, Server, ServerOptions, Settings, SimConfig,
    SimulatedCamera,
};

fn server_at(socket: &std::path::Path) -> Result<Server<SimulatedCamera>> {
    let hal = SimulatedCamera::new(SimConfig {
        frame_interval: Duration::from_millis(5),
        ..SimConfig::default()
    });
    let options = ServerOptions {
        poll_interval: Duration::from_millis(10),
        ..ServerOptions::default()
    };
    Ok(Server::new(hal, Settings::default(), options).with_distributor(Distributor::bind(socket)?))
}

/// Pumps the server and drains `client` until `want` matches a message.
fn pump_until<F>(server: &mut Server<SimulatedCamera>, client: &mut Client, want: F) -> Result<Message>
where
    F: Fn(&Message) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        server.run_once()?;
        while let Some(message) = client.recv(Duration::from_millis(1))? {
            if want(&message) {
                return Ok(message);
            }
        }
    }
    anyhow::bail!("no matching message before the deadline")
}

#[test]
fn unreachable_subscriber_is_evicted_and_the_other_keeps_receiving() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("server");
    let mut server = server_at(&socket)?;
    server.start()?;

    let mut alive = Client::connect_as(&socket, dir.path().join("alive"))?;
    let gone = Client::connect_as(&socket, dir.path().join("gone"))?;
    alive.send("")?;
    gone.send("")?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.distributor().map(|d| d.clients().len()) != Some(2) {
        assert!(Instant::now() < deadline, "clients never registered");
        server.run_once()?;
    }

    drop(gone);
    pump_until(&mut server, &mut alive, |m| matches!(m, Message::Frame(_)))?;
    let clients = server.distributor().map(|d| d.clients().to_vec());
    assert_eq!(clients, Some(vec![dir.path().join("alive")]));
    server.shutdown()?;
    Ok(())
}

#[test]
fn commands_from_a_client_are_acknowledged_and_applied() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("server");
    let mut server = server_at(&socket)?;
    server.start()?;

    let mut client = Client::connect_as(&socket, dir.path().join("client"))?;
    client.send("quality=40\nsharpness 900")?;
    let first = pump_until(&mut server, &mut client, |m| matches!(m, Message::Status(_)))?;
    assert_eq!(first, Message::Status("ok quality".to_string()));
    let second = pump_until(&mut server, &mut client, |m| matches!(m, Message::Status(_)))?;
    match second {
        Message::Status(text) => assert!(text.starts_with("error:") && text.contains("sharpness")),
        other => panic!("expected a status line, got {:?}", other),
    }
    assert_eq!(server.settings().quality, 40);
    assert_eq!(server.settings().sharpness, 0);

    let frame = pump_until(&mut server, &mut client, |m| match m {
        Message::Frame(frame) => {
            SimulatedCamera::parse_frame(frame).map(|info| info.quality) == Some(40)
        }
        Message::Status(_) => false,
    })?;
    assert!(matches!(frame, Message::Frame(_)));
    server.shutdown()?;
    Ok(())
}

#[test]
fn client_session_writes_the_requested_number_of_frames() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("server");
    let output = dir.path().join("client.mjpeg");
    let stop = Arc::new(AtomicBool::new(false));

    let server_stop = Arc::clone(&stop);
    let server_socket = socket.clone();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let server_thread = std::thread::spawn(move || -> Result<()> {
        let mut server = server_at(&server_socket)?.with_stop_flag(server_stop);
        ready_tx.send(())?;
        server.run()
    });
    ready_rx.recv_timeout(Duration::from_secs(5))?;

    let options = ClientOptions {
        socket: socket.clone(),
        commands: vec!["quality 60".to_string()],
        output: Some(OutputTarget::File(output.clone())),
        framing: Framing::Cat,
        count: Some(4),
        ack_timeout: Duration::from_secs(2),
    };
    let client_stop = AtomicBool::new(false);
    let result = client::run(&options, &client_stop);
    stop.store(true, Ordering::SeqCst);
    let served = server_thread
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?;
    result?;
    served?;

    let data = std::fs::read(&output)?;
    let frames = data
        .windows(2)
        .filter(|pair| pair == &[0xFF, 0xD9])
        .count();
    assert_eq!(frames, 4);
    assert!(!PathBuf::from(format!("{}.client.{}", socket.display(), std::process::id())).exists());
    Ok(())
}
