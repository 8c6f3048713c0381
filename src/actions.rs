use serde::{Deserialize, Serialize};

use crate::{error::Error, registry::DeviceDescriptor};

/// The one message a client sends: who it claims to be.
///
/// Everything after the handshake flows server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Handshake {
    /// A bearer credential, verified externally.
    Token {
        /// The bearer token.
        token: String,
    },

    /// The legacy identity + secret pair.
    Credentials {
        /// Who the client claims to be.
        email: String,

        /// The secret proving it.
        password: String,
    },
}

impl Handshake {
    /// An example token handshake.
    pub fn example_token() -> Self {
        Self::Token {
            token: "<bearer>".into(),
        }
    }

    /// An example legacy credential handshake.
    pub fn example_credentials() -> Self {
        Self::Credentials {
            email: "user@lab.example".into(),
            password: "<secret>".into(),
        }
    }

    /// Turn the handshake into serialized json.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("Should serialize well")
    }
}

/// Messages the server pushes to connected clients.
///
/// Tagged with a `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Something went wrong; the connection closes after this.
    Error {
        /// What went wrong.
        message: String,
    },

    /// The device's current trailing output window.
    ///
    /// Sent once as a snapshot when a subscription starts, then again
    /// for every completed line.
    SerialOutput {
        /// Which device produced the output.
        device_number: usize,

        /// The trailing output window.
        output: String,

        /// When this update was published.
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The subscription is live.
    ConnectionEstablished {
        /// Which device the client is now tailing.
        device_number: usize,

        /// The device's descriptor from the latest scan.
        device_info: DeviceDescriptor,

        /// Human-readable confirmation.
        message: String,
    },
}

impl ServerMessage {
    /// An error message carrying the error's display text.
    pub fn error(error: &Error) -> Self {
        Self::Error {
            message: error.to_string(),
        }
    }

    /// An output update, stamped now.
    pub fn serial_output(device_number: usize, output: String) -> Self {
        Self::SerialOutput {
            device_number,
            output,
            timestamp: chrono::Utc::now(),
        }
    }

    /// The confirmation sent once a subscription is wired up.
    pub fn connection_established(device_number: usize, device_info: DeviceDescriptor) -> Self {
        let message = format!(
            "Connected to device {device_number} ({} on {})",
            device_info.board_model, device_info.port_path
        );

        Self::ConnectionEstablished {
            device_number,
            device_info,
            message,
        }
    }

    /// An example error message.
    pub fn example_error() -> Self {
        Self::error(&Error::NoSuchDevice(5))
    }

    /// An example output update.
    pub fn example_serial_output() -> Self {
        Self::serial_output(0, "Hello World!\n".into())
    }

    /// An example subscription confirmation.
    pub fn example_connection_established() -> Self {
        Self::connection_established(0, DeviceDescriptor::example())
    }

    /// Turn the message into serialized json.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("Should serialize well")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn token_handshake_parses() {
        let handshake: Handshake = serde_json::from_str(r#"{ "token": "abc" }"#).unwrap();

        assert!(matches!(handshake, Handshake::Token { token } if token == "abc"));
    }

    #[test]
    fn credential_handshake_parses() {
        let handshake: Handshake =
            serde_json::from_str(r#"{ "email": "a@b.c", "password": "pw" }"#).unwrap();

        assert!(matches!(handshake, Handshake::Credentials { .. }));
    }

    #[test]
    fn incomplete_handshake_is_rejected() {
        assert!(serde_json::from_str::<Handshake>(r#"{ "email": "a@b.c" }"#).is_err());
        assert!(serde_json::from_str::<Handshake>(r#"{ "who": "am i" }"#).is_err());
    }

    #[test]
    fn error_message_wire_shape() {
        let message = ServerMessage::Error {
            message: "Authentication failed".into(),
        };

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "error", "message": "Authentication failed" })
        );
    }

    #[test]
    fn serial_output_wire_shape() {
        let value = serde_json::to_value(ServerMessage::serial_output(3, "hi\n".into())).unwrap();

        assert_eq!(value["type"], "serial_output");
        assert_eq!(value["device_number"], 3);
        assert_eq!(value["output"], "hi\n");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn connection_established_names_the_device() {
        let value =
            serde_json::to_value(ServerMessage::example_connection_established()).unwrap();

        assert_eq!(value["type"], "connection_established");
        assert_eq!(value["device_info"]["model"], "uno");
        assert!(value["message"]
            .as_str()
            .unwrap()
            .starts_with("Connected to device 0"));
    }
}
