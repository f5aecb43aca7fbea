//! # Sync Protocol Messages
//!
//! Envelope types exchanged between the sync server and reader devices.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  DEVICE ───► auth { token, device_name, device_type }                  │
//! │  SERVER ───► auth_resp { success, user_id, display_name, message }     │
//! │           or error { code, message } then close                        │
//! │                                                                         │
//! │  FAN-OUT                                                               │
//! │  ───────                                                               │
//! │  SERVER ───► progress { user_id, work_id, chapter, chapter_id?,        │
//! │                         timestamp }  (to every device of the user)     │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  SERVER ───► heartbeat   (every 30s once authenticated)                │
//! │  DEVICE ───► heartbeat   (optional acknowledgement)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON, one envelope per line:
//! ```json
//! {"type":"progress","payload":{"user_id":7,"work_id":3,"chapter":12,"timestamp":"..."}}
//! {"type":"heartbeat"}
//! ```

use serde::{Deserialize, Serialize};

use folio_core::{ProgressEvent, UserId};

// =============================================================================
// Envelope (Tagged Union)
// =============================================================================

/// Every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// Bearer credential presented by a device. Must be the first message.
    Auth(AuthRequest),

    /// Handshake outcome sent by the server.
    AuthResp(AuthResponse),

    /// Keepalive. Carries no payload.
    Heartbeat,

    /// Reading-progress change fanned out to a user's devices.
    Progress(ProgressEvent),

    /// Error report; the server usually closes right after sending one.
    Error(ErrorPayload),
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload of an `auth` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// HS256 bearer token.
    pub token: String,

    #[serde(default)]
    pub device_name: String,

    #[serde(default)]
    pub device_type: String,
}

/// Payload of an `auth_resp` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub message: String,
}

/// Payload of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Machine-readable error codes sent to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No auth message arrived before the handshake deadline.
    AuthTimeout,
    /// A non-auth message arrived before authentication.
    AuthRequired,
    /// Bad signature or undecodable token.
    InvalidToken,
    /// Token past its `exp`.
    TokenExpired,
    /// Token decoded but its claims are unusable.
    InvalidClaims,
    /// Any other authentication failure.
    AuthFailed,
    /// Malformed or oversized frame.
    ProtocolError,
    /// Server-side failure.
    InternalError,
}

impl ErrorCode {
    /// Returns the wire name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthTimeout => "auth_timeout",
            ErrorCode::AuthRequired => "auth_required",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::TokenExpired => "token_expired",
            ErrorCode::InvalidClaims => "invalid_claims",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::ProtocolError => "protocol_error",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Helper Constructors
// =============================================================================

impl Envelope {
    /// Returns the wire tag of this envelope (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Auth(_) => "auth",
            Envelope::AuthResp(_) => "auth_resp",
            Envelope::Heartbeat => "heartbeat",
            Envelope::Progress(_) => "progress",
            Envelope::Error(_) => "error",
        }
    }

    /// Creates an `auth` envelope (used by clients and tests).
    pub fn auth(token: &str, device_name: &str, device_type: &str) -> Self {
        Envelope::Auth(AuthRequest {
            token: token.to_string(),
            device_name: device_name.to_string(),
            device_type: device_type.to_string(),
        })
    }

    /// Creates a successful `auth_resp`.
    pub fn auth_success(user_id: UserId, display_name: &str) -> Self {
        Envelope::AuthResp(AuthResponse {
            success: true,
            user_id: Some(user_id),
            display_name: Some(display_name.to_string()),
            message: "authenticated".to_string(),
        })
    }

    /// Creates an `error` envelope.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Returns the error code if this is an `error` envelope.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Envelope::Error(payload) => Some(payload.code),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_auth_wire_shape() {
        let env = Envelope::auth("tok", "Kobo Libra", "ereader");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "auth",
                "payload": { "token": "tok", "device_name": "Kobo Libra", "device_type": "ereader" }
            })
        );
    }

    #[test]
    fn test_heartbeat_has_no_payload() {
        let value = serde_json::to_value(&Envelope::Heartbeat).unwrap();
        assert_eq!(value, json!({ "type": "heartbeat" }));

        let parsed: Envelope = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(parsed, Envelope::Heartbeat);
    }

    #[test]
    fn test_auth_resp_tag() {
        let value = serde_json::to_value(Envelope::auth_success(7, "ada")).unwrap();
        assert_eq!(value["type"], "auth_resp");
        assert_eq!(value["payload"]["success"], true);
        assert_eq!(value["payload"]["user_id"], 7);
    }

    #[test]
    fn test_error_codes_are_snake_case() {
        let value = serde_json::to_value(Envelope::error(ErrorCode::TokenExpired, "expired")).unwrap();
        assert_eq!(value["payload"]["code"], "token_expired");
        assert_eq!(ErrorCode::AuthTimeout.to_string(), "auth_timeout");
    }

    #[test]
    fn test_progress_omits_missing_chapter_id() {
        let event = ProgressEvent::new(7, 3, 12, None);
        let value = serde_json::to_value(Envelope::Progress(event)).unwrap();

        assert_eq!(value["type"], "progress");
        assert_eq!(value["payload"]["chapter"], 12);
        assert!(value["payload"].get("chapter_id").is_none());
    }

    #[test]
    fn test_auth_device_fields_default() {
        let parsed: Envelope =
            serde_json::from_str(r#"{"type":"auth","payload":{"token":"abc"}}"#).unwrap();
        match parsed {
            Envelope::Auth(req) => {
                assert_eq!(req.token, "abc");
                assert!(req.device_name.is_empty());
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
    }
}
