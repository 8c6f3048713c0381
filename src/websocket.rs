use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, WebSocketUpgrade,
    },
    response::IntoResponse,
    Extension, TypedHeader,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    actions::{Handshake, ServerMessage},
    auth::Slot,
    error::Error,
    registry::DeviceDescriptor,
    server::AppContext,
};

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(device_index): Path<usize>,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(ctx): Extension<AppContext>,
) -> impl IntoResponse {
    if let Some(TypedHeader(user_agent)) = user_agent {
        info!("`{}`@`{addr}` connected", user_agent.as_str());
    }

    ws.on_upgrade(move |socket| {
        let span = info_span!("Device", index = device_index, %addr);

        handle_device_socket(socket, device_index, ctx).instrument(span)
    })
}

/// One subscriber connection, from accept to cleanup.
///
/// Connecting → authenticating → authorized → closed; any failure on
/// the way sends a single typed error and closes. Once authorized the
/// connection is a pure push sink until the client goes away.
async fn handle_device_socket(socket: WebSocket, device_index: usize, ctx: AppContext) {
    let (mut sink, mut stream) = socket.split();

    let device = match authorize(device_index, &mut stream, &ctx).await {
        Ok(device) => device,
        Err(e) => {
            info!("Closing connection: {e}");
            send_error(&mut sink, &e).await;
            let _ = sink.close().await;
            return;
        }
    };

    // Everything the client sees from now on goes through this channel;
    // the gateway worker feeds it, the write task drains it.
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    // The snapshot goes first, then the confirmation. Both are queued
    // before the subscription exists, so no live update can slip in
    // ahead of them.
    let snapshot = ctx.sessions.output(device_index);
    let _ = message_tx.send(ServerMessage::serial_output(device_index, snapshot));
    let _ = message_tx.send(ServerMessage::connection_established(
        device_index,
        device,
    ));

    let subscriber = ctx.gateway.subscribe(device_index, message_tx);

    let write_handle = tokio::spawn(write(sink, message_rx).instrument(info_span!("Write")));

    read_until_closed(&mut stream).await;

    // Cleanup runs on every exit path; the session itself stays up for
    // whoever subscribes next.
    ctx.gateway.unsubscribe(device_index, subscriber);
    write_handle.abort();
    debug!("Connection closed");
}

/// The gate in front of a subscription.
///
/// Order matters: an invalid device index is rejected before any
/// authentication is even attempted, and the session is only started
/// once the caller has proven it may see the device.
async fn authorize(
    device_index: usize,
    stream: &mut SplitStream<WebSocket>,
    ctx: &AppContext,
) -> Result<DeviceDescriptor, Error> {
    let device = ctx
        .registry
        .descriptor(device_index)
        .ok_or(Error::NoSuchDevice(device_index))?;

    let handshake = receive_handshake(stream).await?;

    let identity = ctx
        .authenticator
        .verify(&handshake)
        .ok_or(Error::AuthenticationFailed)?;

    let slot = Slot::current();
    if !ctx.bookings.is_booked_at(&identity, slot) {
        return Err(Error::NotBooked {
            slot,
            device: device_index,
        });
    }

    info!(%identity, %slot, "Authorized");

    ensure_session(ctx, device_index, &device).await?;

    Ok(device)
}

/// Exactly one structured handshake message.
async fn receive_handshake(stream: &mut SplitStream<WebSocket>) -> Result<Handshake, Error> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).map_err(|_| Error::BadHandshake);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => return Err(Error::BadHandshake),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(Error::BadHandshake),
        }
    }
}

/// Make sure the device is being read, starting a session if needed.
///
/// A fresh session gets exactly one gateway bridge observer: every
/// completed line is republished to whatever subscribers exist at
/// that moment. Stopped sessions lose the observer with the session,
/// so restarting re-registers it here.
async fn ensure_session(
    ctx: &AppContext,
    index: usize,
    device: &DeviceDescriptor,
) -> Result<(), Error> {
    if ctx.sessions.is_connected(index) {
        return Ok(());
    }

    info!(
        port = %device.port_path,
        model = %device.board_model,
        "Device not connected, starting session"
    );

    // Starting may retire a previous session, which waits out its
    // reader thread; keep that off the event loop.
    let sessions = ctx.sessions.clone();
    let port = device.port_path.clone();
    let baud = ctx.config.default_baud;

    tokio::task::spawn_blocking(move || sessions.start(index, &port, baud))
        .await
        .map_err(|_| Error::SessionStart(index))?
        .map_err(|e| {
            warn!("Session start failed: {e}");
            Error::SessionStart(index)
        })?;

    let gateway = ctx.gateway.clone();
    ctx.sessions.observe(index, move |snapshot| {
        gateway.publish(index, ServerMessage::serial_output(index, snapshot.to_string()));
    });

    Ok(())
}

async fn send_error(sink: &mut SplitSink<WebSocket, Message>, error: &Error) {
    let text = ServerMessage::error(error).serialize();

    if sink.send(Message::Text(text)).await.is_err() {
        debug!("Could not deliver error before close");
    }
}

async fn write(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = receiver.recv().await {
        if sink.send(Message::Text(message.serialize())).await.is_err() {
            debug!("client disconnected");
            return;
        }
    }
}

/// The client has nothing left to say; watch for it leaving.
async fn read_until_closed(stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                debug!("Ignoring client payload after handshake");
            }
            Message::Ping(_) => debug!("socket ping"),
            Message::Pong(_) => debug!("socket pong"),
            Message::Close(_) => {
                debug!("client disconnected");
                break;
            }
        }
    }
}
