mod common;

use common::{Fixture, Stubs, PASSWORD};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tor_fleet::control::{ControlChannel, ControlConnector, Secret, Signal, TcpControlConnector};
use tor_fleet::registry::Selector;
use tor_fleet::Error;

/// Minimal control-port server: accepts `PASSWORD`, answers NEWNYM once
/// authenticated, and records every line it receives.
async fn spawn_fake_daemon() -> (u16, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                let mut authenticated = false;
                while let Ok(Some(line)) = lines.next_line().await {
                    log.lock().push(line.clone());
                    let reply = if line == format!("AUTHENTICATE \"{}\"", PASSWORD) {
                        authenticated = true;
                        "250 OK\r\n"
                    } else if line.starts_with("AUTHENTICATE") {
                        "515 Authentication failed: Password did not match\r\n"
                    } else if line == "SIGNAL NEWNYM" && authenticated {
                        "250 OK\r\n"
                    } else if line.starts_with("SIGNAL") {
                        "514 Authentication required.\r\n"
                    } else {
                        "510 Unrecognized command\r\n"
                    };
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    (port, received)
}

fn connector() -> TcpControlConnector {
    TcpControlConnector::new(Duration::from_secs(5))
}

#[tokio::test]
async fn authenticate_and_rotate() {
    let (control_port, received) = spawn_fake_daemon().await;

    let mut channel = connector().connect(9060, control_port).await.unwrap();
    channel.authenticate(&Secret::new(PASSWORD)).await.unwrap();
    channel.signal(Signal::Rotate).await.unwrap();

    assert_eq!(
        received.lock().clone(),
        vec![
            format!("AUTHENTICATE \"{}\"", PASSWORD),
            "SIGNAL NEWNYM".to_string()
        ]
    );
}

#[tokio::test]
async fn wrong_password_is_auth_error() {
    let (control_port, _) = spawn_fake_daemon().await;

    let mut channel = connector().connect(9060, control_port).await.unwrap();
    let err = channel
        .authenticate(&Secret::new("not-it"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Auth { port: 9060, .. }), "{:?}", err);
}

#[tokio::test]
async fn signal_before_authenticate_is_rejected() {
    let (control_port, _) = spawn_fake_daemon().await;

    let mut channel = connector().connect(9060, control_port).await.unwrap();
    let err = channel.signal(Signal::Rotate).await.unwrap_err();
    assert!(err.is_auth_failure() || matches!(err, Error::Channel { .. }));
}

#[tokio::test]
async fn password_is_quoted_on_the_wire() {
    let (control_port, received) = spawn_fake_daemon().await;

    let mut channel = connector().connect(9060, control_port).await.unwrap();
    let _ = channel.authenticate(&Secret::new("a \"b\" \\c")).await;

    assert_eq!(
        received.lock().first().cloned(),
        Some("AUTHENTICATE \"a \\\"b\\\" \\\\c\"".to_string())
    );
}

#[tokio::test]
async fn registry_rotates_through_real_control_port() {
    let (control_port, received) = spawn_fake_daemon().await;
    let fixture = Fixture::new();
    fixture.write(
        "torrc.1",
        &format!("SocksPort 9060\nControlPort {}\nExitNodes {{nl}}\n", control_port),
    );
    let stubs = Stubs::new();
    let registry = fixture
        .builder(&stubs)
        .control_connector(Arc::new(connector()))
        .build()
        .await
        .unwrap();

    let view = registry.rotate(&Selector::label("nl")).await.unwrap();
    assert!(view.is_running());
    assert_eq!(received.lock().last().map(String::as_str), Some("SIGNAL NEWNYM"));

    // Selecting by control port reaches the same client
    registry.rotate(&Selector::Port(control_port)).await.unwrap();
    assert_eq!(stubs.secrets.call_count(), 1);
}
