#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use axum::http::StatusCode;
use color_eyre::Result;
use futures::{SinkExt, StreamExt};
use labport::{
    actions::{Handshake, ServerMessage},
    auth::{Authenticator, BookingStore, Identity, Slot},
    broadcast::BroadcastGateway,
    config::Config,
    mock::FixedRegistry,
    serial::SessionManager,
    server::{self, AppContext},
    upload::{UploadOutcome, UploadTool},
};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// The one token the test authenticator accepts.
pub const GOOD_TOKEN: &str = "good-token";

/// The one credential pair the test authenticator accepts.
pub const GOOD_EMAIL: &str = "tester@lab.example";
pub const GOOD_PASSWORD: &str = "correct horse";

struct TestAuth;

impl Authenticator for TestAuth {
    fn verify(&self, handshake: &Handshake) -> Option<Identity> {
        let known = match handshake {
            Handshake::Token { token } => token == GOOD_TOKEN,
            Handshake::Credentials { email, password } => {
                email == GOOD_EMAIL && password == GOOD_PASSWORD
            }
        };

        known.then(|| Identity::new(GOOD_EMAIL))
    }
}

struct TestBookings {
    booked: bool,
}

impl BookingStore for TestBookings {
    fn is_booked_at(&self, _identity: &Identity, _slot: Slot) -> bool {
        self.booked
    }
}

/// Succeeds without touching anything.
pub struct RecordingUploader {
    pub calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl UploadTool for RecordingUploader {
    fn upload(&self, _code: &str, _port: &str, _fqbn: &str, _project_id: &str) -> UploadOutcome {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        UploadOutcome {
            success: true,
            compile_output: "compiled".into(),
            upload_output: "uploaded".into(),
            error: None,
        }
    }
}

pub struct TestServer {
    pub port: u16,
    pub ctx: AppContext,
    pub upload_calls: Arc<std::sync::atomic::AtomicUsize>,
}

/// An app context over mock devices and stub collaborators.
pub fn test_context(device_names: &[&str], booked: bool) -> (AppContext, Arc<std::sync::atomic::AtomicUsize>) {
    let upload_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let ctx = AppContext {
        config: Arc::new(Config::default()),
        registry: Arc::new(FixedRegistry::mock(device_names)),
        sessions: SessionManager::new(),
        gateway: BroadcastGateway::new(),
        authenticator: Arc::new(TestAuth),
        bookings: Arc::new(TestBookings { booked }),
        uploader: Arc::new(RecordingUploader {
            calls: upload_calls.clone(),
        }),
    };

    (ctx, upload_calls)
}

/// Spin up a server over mock devices; `booked` controls whether the
/// test identity holds the current slot.
pub async fn start_server(device_names: &[&str], booked: bool) -> Result<TestServer> {
    let (ctx, upload_calls) = test_context(device_names, booked);

    let (port_tx, port_rx) = oneshot::channel();
    let server_ctx = ctx.clone();
    tokio::spawn(async move { server::run_any_port(server_ctx, port_tx).await });

    let port = port_rx
        .await
        .expect("Server should reply with allocated port");

    Ok(TestServer {
        port,
        ctx,
        upload_calls,
    })
}

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a websocket against the device-read route.
pub async fn connect(server: &TestServer, device_index: usize) -> Result<Client> {
    let (stream, http_response) = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{}/devices/read/{device_index}",
        server.port
    ))
    .await?;

    assert_eq!(http_response.status(), StatusCode::SWITCHING_PROTOCOLS);

    Ok(stream)
}

pub async fn send_text(client: &mut Client, to_send: String) -> Result<()> {
    client.send(tungstenite::Message::Text(to_send)).await?;

    Ok(())
}

/// The next server message, with a timeout so a silent server fails
/// the test instead of hanging it.
pub async fn receive(client: &mut Client) -> Result<ServerMessage> {
    loop {
        let message = timeout(Duration::from_secs(5), client.next())
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("Stream closed"))??;

        match message {
            tungstenite::Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => color_eyre::eyre::bail!("Unexpected frame: {other:?}"),
        }
    }
}

/// Send the token handshake.
pub async fn handshake(client: &mut Client, token: &str) -> Result<()> {
    send_text(
        client,
        Handshake::Token {
            token: token.into(),
        }
        .serialize(),
    )
    .await
}

/// Handshake and consume the snapshot + confirmation pair.
pub async fn subscribe(client: &mut Client, token: &str) -> Result<String> {
    handshake(client, token).await?;

    let snapshot = match receive(client).await? {
        ServerMessage::SerialOutput { output, .. } => output,
        other => color_eyre::eyre::bail!("Expected snapshot first, got {other:?}"),
    };

    match receive(client).await? {
        ServerMessage::ConnectionEstablished { .. } => {}
        other => color_eyre::eyre::bail!("Expected confirmation second, got {other:?}"),
    }

    Ok(snapshot)
}

/// The error text of the next message, which must be an error.
pub async fn receive_error(client: &mut Client) -> Result<String> {
    match receive(client).await? {
        ServerMessage::Error { message } => Ok(message),
        other => color_eyre::eyre::bail!("Expected an error, got {other:?}"),
    }
}
