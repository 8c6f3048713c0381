use std::{net::SocketAddr, sync::Arc};

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    auth::{AccessTable, Authenticator, BookingStore},
    broadcast::BroadcastGateway,
    config::Config,
    registry::{BoardModel, DeviceDescriptor, DeviceRegistry, UsbRegistry},
    serial::SessionManager,
    upload::{self, UploadTool},
    websocket,
};

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 8000;

/// Everything a request handler needs, in one owned object.
///
/// Construction wires the collaborators together explicitly; tests
/// build one from stubs instead of reaching for globals.
#[derive(Clone)]
pub struct AppContext {
    /// The validated configuration the server was started with.
    pub config: Arc<Config>,

    /// Discovers and classifies attached devices.
    pub registry: Arc<dyn DeviceRegistry>,

    /// Owns the serial sessions.
    pub sessions: Arc<SessionManager>,

    /// Fans output out to subscribers.
    pub gateway: Arc<BroadcastGateway>,

    /// Resolves handshakes to identities.
    pub authenticator: Arc<dyn Authenticator>,

    /// Knows who booked which slot.
    pub bookings: Arc<dyn BookingStore>,

    /// The external firmware upload tool.
    pub uploader: Arc<dyn UploadTool>,
}

impl AppContext {
    /// Production wiring: USB discovery, the config file's access
    /// table for both authentication and bookings, and the real
    /// upload tool.
    pub fn new(config: Config) -> Self {
        let access = Arc::new(AccessTable::new(config.access.clone()));

        Self {
            registry: Arc::new(UsbRegistry::new(&config.known_boards)),
            sessions: SessionManager::new(),
            gateway: BroadcastGateway::new(),
            authenticator: access.clone(),
            bookings: access,
            uploader: Arc::new(upload::ArduinoCli::default()),
            config: Arc::new(config),
        }
    }
}

/// The server's routes over the given context.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/devices/read/:device_index", get(websocket::ws_handler))
        .route("/devices", get(list_devices))
        .route("/devices/:device_index/upload", post(upload::upload_handler))
        .route("/config", get(show_config))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each handler needs to reach the shared services.
                .layer(Extension(ctx)),
        )
}

async fn run(ctx: AppContext, port: Option<u16>, allocated_port: Option<oneshot::Sender<u16>>) {
    ctx.config.validate().expect("Configuration must be valid");

    let app = router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));
    let server =
        axum::Server::bind(&addr).serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    info!("listening on {}", addr);

    server.await.unwrap();
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(ctx: AppContext, allocated_port: oneshot::Sender<u16>) {
    run(ctx, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(ctx: AppContext, port: u16) {
    run(ctx, Some(port), None).await
}

#[derive(Serialize)]
struct DeviceListing {
    success: bool,
    devices: Vec<DeviceDescriptor>,
    count: usize,
    supported_models: Vec<BoardModel>,
}

async fn list_devices(Extension(ctx): Extension<AppContext>) -> impl IntoResponse {
    let devices = ctx.registry.discover();

    Json(DeviceListing {
        success: true,
        count: devices.len(),
        devices,
        supported_models: BoardModel::supported().to_vec(),
    })
}

async fn show_config(Extension(ctx): Extension<AppContext>) -> impl IntoResponse {
    ctx.config.serialize_pretty()
}

async fn show_version() -> impl IntoResponse {
    format!("Labport v{}\n", env!("CARGO_PKG_VERSION"))
}
