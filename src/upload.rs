use std::{process::Command, sync::Arc};

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    actions::Handshake,
    auth::Slot,
    registry::BoardModel,
    server::AppContext,
};

/// A firmware upload request: the sketch plus the legacy credential pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    /// The sketch source to compile and flash.
    pub code: String,

    /// Who is asking.
    pub email: String,

    /// The secret proving it.
    pub password: String,
}

/// What the client gets back, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Whether the flash went through.
    pub success: bool,

    /// Human-readable outcome.
    pub message: String,

    /// Compiler output.
    pub compile_output: String,

    /// Upload tool output.
    pub upload_output: String,

    /// Correlates the request with the tool's working directory.
    pub project_id: String,
}

/// What the external tool reported.
#[derive(Debug, Default)]
pub struct UploadOutcome {
    /// Whether compile and upload both succeeded.
    pub success: bool,

    /// Compiler output.
    pub compile_output: String,

    /// Upload tool output.
    pub upload_output: String,

    /// What went wrong, if anything.
    pub error: Option<String>,
}

/// The external compile-and-flash tool.
///
/// Opaque by design: this subsystem only guarantees the serial port is
/// released before the tool runs. Implementations may block; they are
/// driven from a blocking task.
pub trait UploadTool: Send + Sync {
    /// Compile `code` for `fqbn` and flash it onto `port`.
    fn upload(&self, code: &str, port: &str, fqbn: &str, project_id: &str) -> UploadOutcome;
}

/// The fully qualified board name the tool wants, per model.
fn fqbn(model: BoardModel) -> Option<&'static str> {
    match model {
        BoardModel::Uno => Some("arduino:avr:uno"),
        BoardModel::Mega => Some("arduino:avr:mega"),
        BoardModel::Esp32 => Some("esp32:esp32:esp32"),
        BoardModel::Unknown => None,
    }
}

/// `arduino-cli` invocations in a throwaway project directory.
#[derive(Debug, Default)]
pub struct ArduinoCli;

impl UploadTool for ArduinoCli {
    fn upload(&self, code: &str, port: &str, fqbn: &str, project_id: &str) -> UploadOutcome {
        let project_dir = std::env::temp_dir().join("labport").join(project_id);

        if let Err(e) = std::fs::create_dir_all(&project_dir) {
            return UploadOutcome {
                error: Some(format!("Could not create project directory: {e}")),
                ..Default::default()
            };
        }

        let sketch = project_dir.join(format!("{project_id}.ino"));
        let outcome = match std::fs::write(&sketch, code) {
            Ok(()) => compile_and_flash(&sketch.to_string_lossy(), port, fqbn),
            Err(e) => UploadOutcome {
                error: Some(format!("Could not write sketch: {e}")),
                ..Default::default()
            },
        };

        if let Err(e) = std::fs::remove_dir_all(&project_dir) {
            warn!("Could not clean up {project_dir:?}: {e}");
        }

        outcome
    }
}

fn compile_and_flash(sketch: &str, port: &str, fqbn: &str) -> UploadOutcome {
    let compile = match Command::new("arduino-cli")
        .args(["compile", "--fqbn", fqbn, sketch])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            return UploadOutcome {
                error: Some(format!("Could not run arduino-cli: {e}")),
                ..Default::default()
            }
        }
    };

    let compile_output = String::from_utf8_lossy(&compile.stdout).to_string();

    if !compile.status.success() {
        return UploadOutcome {
            success: false,
            compile_output,
            upload_output: String::new(),
            error: Some("Compilation failed".into()),
        };
    }

    let upload = match Command::new("arduino-cli")
        .args(["upload", "-p", port, "--fqbn", fqbn, sketch])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            return UploadOutcome {
                compile_output,
                error: Some(format!("Could not run arduino-cli: {e}")),
                ..Default::default()
            }
        }
    };

    if upload.status.success() {
        UploadOutcome {
            success: true,
            compile_output,
            upload_output: String::from_utf8_lossy(&upload.stdout).to_string(),
            error: None,
        }
    } else {
        UploadOutcome {
            success: false,
            compile_output,
            upload_output: String::from_utf8_lossy(&upload.stderr).to_string(),
            error: Some("Upload failed".into()),
        }
    }
}

/// `POST /devices/:device_index/upload`
///
/// Same gate as a subscription (identity + current slot), then the
/// device's reader is stopped and its buffer cleared before the tool
/// touches the port. Reading is not resumed here; the next
/// subscription restarts it.
pub(crate) async fn upload_handler(
    Path(device_index): Path<usize>,
    Extension(ctx): Extension<AppContext>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    let handshake = Handshake::Credentials {
        email: request.email.clone(),
        password: request.password.clone(),
    };

    let identity = ctx
        .authenticator
        .verify(&handshake)
        .ok_or((StatusCode::UNAUTHORIZED, "Invalid credentials".to_string()))?;

    let slot = Slot::current();
    if !ctx.bookings.is_booked_at(&identity, slot) {
        return Err((
            StatusCode::FORBIDDEN,
            format!("You must have booked the current time slot ({slot}) to upload code"),
        ));
    }

    let devices = ctx.registry.discover();
    let Some(device) = devices.get(device_index).cloned() else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Invalid device index {device_index}. Available devices: 0-{}",
                devices.len().saturating_sub(1)
            ),
        ));
    };

    let Some(fqbn) = fqbn(device.board_model) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "Unsupported device model '{}'. Supported models: uno, mega, esp32",
                device.board_model
            ),
        ));
    };

    info!(%identity, port = %device.port_path, "Uploading firmware");

    let project_id = Uuid::new_v4().to_string();
    let uploader = Arc::clone(&ctx.uploader);
    let sessions = Arc::clone(&ctx.sessions);
    let code = request.code;
    let port = device.port_path.clone();
    let task_project_id = project_id.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        // Only one process can hold the port: retire the reader before
        // the tool runs. Reading is not resumed afterwards.
        sessions.stop(device_index);
        sessions.reset_output(device_index);

        uploader.upload(&code, &port, fqbn, &task_project_id)
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Upload task failed: {e}"),
        )
    })?;

    let message = if outcome.success {
        format!(
            "Code uploaded successfully to {} on {}",
            device.board_model, device.port_path
        )
    } else {
        outcome.error.unwrap_or_else(|| "Upload failed".into())
    };

    Ok(Json(UploadResponse {
        success: outcome.success,
        message,
        compile_output: outcome.compile_output,
        upload_output: outcome.upload_output,
        project_id,
    }))
}
