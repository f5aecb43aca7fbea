//! # Authentication Gate
//!
//! Bearer-token handshake every connection passes before it is registered.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │                ┌──────────────┐  non-auth message                      │
//! │   accept ────► │ AwaitingAuth │ ◄──────────────┐ reply auth_required   │
//! │  (deadline     └──────┬───────┘ ───────────────┘ deadline unchanged    │
//! │   armed once)         │                                                 │
//! │          ┌────────────┼──────────────────────────┐                      │
//! │          │ valid auth │ bad token / deadline /   │                      │
//! │          ▼            │ protocol / transport     ▼                      │
//! │  ┌───────────────┐    │                  ┌──────────────┐               │
//! │  │ Authenticated │    │                  │   Rejected   │ (terminal)    │
//! │  └───────┬───────┘    │                  └──────┬───────┘               │
//! │          │                                      │                       │
//! │  registry.add → auth_resp → session row   error{code} → close          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Codes
//! | Cause                          | Code             |
//! |--------------------------------|------------------|
//! | No auth before deadline        | `auth_timeout`   |
//! | Bad signature / not a JWT      | `invalid_token`  |
//! | Past `exp`                     | `token_expired`  |
//! | Claims missing or unusable     | `invalid_claims` |
//! | Anything else                  | `auth_failed`    |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use folio_core::validation::normalize_device_field;
use folio_core::{SessionRecord, UserId};

use crate::connection::{Connection, DeviceIdentity};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{AuthRequest, Envelope, ErrorCode};
use crate::registry::ConnectionRegistry;

// =============================================================================
// Claims & Errors
// =============================================================================

/// JWT claims carried by a device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Database identity of the user.
    pub user_id: UserId,

    /// Shown back to the device in `auth_resp`.
    pub username: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Why a token was refused. Each variant has its own wire code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token has expired")]
    Expired,

    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    #[error("Authentication failed: {0}")]
    Failed(String),
}

impl AuthError {
    /// Wire code reported to the device.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::InvalidToken(_) => ErrorCode::InvalidToken,
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::InvalidClaims(_) => ErrorCode::InvalidClaims,
            AuthError::Failed(_) => ErrorCode::AuthFailed,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,

            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::Base64(_)
            | ErrorKind::Utf8(_) => AuthError::InvalidToken(err.to_string()),

            ErrorKind::Json(_)
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::ImmatureSignature
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject => AuthError::InvalidClaims(err.to_string()),

            _ => AuthError::Failed(err.to_string()),
        }
    }
}

// =============================================================================
// Collaborator Contracts
// =============================================================================

/// Validates bearer credentials.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Persists the audit row written after a successful handshake.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn record_session(&self, session: SessionRecord) -> SyncResult<()>;
}

#[async_trait]
impl SessionRecorder for folio_db::Database {
    async fn record_session(&self, session: SessionRecord) -> SyncResult<()> {
        self.sessions().record(&session).await?;
        Ok(())
    }
}

// =============================================================================
// JWT Manager
// =============================================================================

/// HS256 token issuer and validator.
pub struct JwtManager {
    secret: String,
    token_lifetime_secs: i64,
    leeway_secs: u64,
}

impl JwtManager {
    pub fn new(secret: impl Into<String>, token_lifetime_secs: i64) -> Self {
        JwtManager {
            secret: secret.into(),
            token_lifetime_secs,
            leeway_secs: 0,
        }
    }

    /// Tolerates `leeway_secs` of clock skew on `exp`. Defaults to none.
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    /// Issues a token with the configured lifetime.
    pub fn generate_token(&self, user_id: UserId, username: &str) -> SyncResult<String> {
        self.generate_token_with_lifetime(user_id, username, self.token_lifetime_secs)
    }

    /// Issues a token expiring `lifetime_secs` from now (negative = already expired).
    pub fn generate_token_with_lifetime(
        &self,
        user_id: UserId,
        username: &str,
        lifetime_secs: i64,
    ) -> SyncResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id,
            username: username.to_string(),
            iat: now,
            exp: now + lifetime_secs,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| SyncError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Validates signature and expiry, then the claims themselves.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )?;

        if data.claims.user_id <= 0 {
            return Err(AuthError::InvalidClaims(format!(
                "user_id must be positive, got {}",
                data.claims.user_id
            )));
        }

        Ok(data.claims)
    }
}

impl TokenValidator for JwtManager {
    fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_token(token)
    }
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("token_lifetime_secs", &self.token_lifetime_secs)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Gate State Machine
// =============================================================================

/// Why a connection never made it into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No auth message before the deadline.
    Timeout,
    /// Token refused.
    Credentials(AuthError),
    /// Malformed frame while awaiting auth.
    Protocol(String),
    /// The connection died or the server is shutting down.
    Transport(String),
}

impl Rejection {
    /// Code sent to the device before closing, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Rejection::Timeout => Some(ErrorCode::AuthTimeout),
            Rejection::Credentials(err) => Some(err.code()),
            Rejection::Protocol(_) => Some(ErrorCode::ProtocolError),
            Rejection::Transport(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    AwaitingAuth,
    Authenticated(DeviceIdentity),
    Rejected(Rejection),
}

/// Inputs the gate reacts to.
#[derive(Debug)]
pub enum GateEvent {
    Message(Envelope),
    DeadlineElapsed,
    ProtocolViolation(String),
    TransportFailed(String),
}

/// Result of one transition: the next state and an optional reply.
#[derive(Debug)]
pub struct Transition {
    pub state: GateState,
    pub reply: Option<Envelope>,
}

/// How a handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Registered and acknowledged.
    Admitted(DeviceIdentity),
    /// Closed without registration.
    Rejected(Rejection),
}

/// Drives one connection through the handshake.
pub struct AuthGate {
    validator: Arc<dyn TokenValidator>,
    sessions: Arc<dyn SessionRecorder>,
    registry: Arc<ConnectionRegistry>,
    auth_timeout: Duration,
}

impl AuthGate {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        sessions: Arc<dyn SessionRecorder>,
        registry: Arc<ConnectionRegistry>,
        auth_timeout: Duration,
    ) -> Self {
        AuthGate {
            validator,
            sessions,
            registry,
            auth_timeout,
        }
    }

    /// The single transition function.
    ///
    /// Terminal states absorb every event without a reply.
    pub fn transition(&self, state: GateState, event: GateEvent) -> Transition {
        if state != GateState::AwaitingAuth {
            return Transition { state, reply: None };
        }

        match event {
            GateEvent::Message(Envelope::Auth(request)) => match self.verify(request) {
                Ok(identity) => Transition {
                    state: GateState::Authenticated(identity),
                    reply: None,
                },
                Err(err) => Transition {
                    reply: Some(Envelope::error(err.code(), err.to_string())),
                    state: GateState::Rejected(Rejection::Credentials(err)),
                },
            },

            GateEvent::Message(_) => Transition {
                state: GateState::AwaitingAuth,
                reply: Some(Envelope::error(
                    ErrorCode::AuthRequired,
                    "authenticate before sending other messages",
                )),
            },

            GateEvent::DeadlineElapsed => Transition {
                state: GateState::Rejected(Rejection::Timeout),
                reply: Some(Envelope::error(
                    ErrorCode::AuthTimeout,
                    format!("no auth message within {}s", self.auth_timeout.as_secs()),
                )),
            },

            GateEvent::ProtocolViolation(reason) => Transition {
                reply: Some(Envelope::error(ErrorCode::ProtocolError, reason.clone())),
                state: GateState::Rejected(Rejection::Protocol(reason)),
            },

            GateEvent::TransportFailed(reason) => Transition {
                state: GateState::Rejected(Rejection::Transport(reason)),
                reply: None,
            },
        }
    }

    /// Runs the handshake to completion.
    ///
    /// The deadline is armed once, on entry. On `Admitted` the connection is
    /// authenticated and registered; on `Rejected` it is closed.
    pub async fn run(&self, conn: &Arc<Connection>) -> GateOutcome {
        let deadline = Instant::now() + self.auth_timeout;
        let mut state = GateState::AwaitingAuth;

        loop {
            let event = match tokio::time::timeout_at(deadline, conn.read_message()).await {
                Err(_) => GateEvent::DeadlineElapsed,
                Ok(Ok(envelope)) => GateEvent::Message(envelope),
                Ok(Err(SyncError::Timeout { .. })) => GateEvent::DeadlineElapsed,
                Ok(Err(e)) if e.is_protocol_error() => GateEvent::ProtocolViolation(e.to_string()),
                Ok(Err(e)) => GateEvent::TransportFailed(e.to_string()),
            };

            let Transition { state: next, reply } = self.transition(state, event);

            if let Some(reply) = reply {
                if let Err(e) = conn.send_message(reply).await {
                    debug!(conn_id = %conn.id(), error = %e, "Failed to send handshake reply");
                    if next == GateState::AwaitingAuth {
                        conn.close().await;
                        return GateOutcome::Rejected(Rejection::Transport(e.to_string()));
                    }
                }
            }

            state = next;

            match state {
                GateState::AwaitingAuth => continue,
                GateState::Authenticated(identity) => return self.admit(conn, identity).await,
                GateState::Rejected(rejection) => {
                    info!(
                        conn_id = %conn.id(),
                        addr = %conn.remote_addr(),
                        reason = ?rejection,
                        "Handshake rejected"
                    );
                    conn.close().await;
                    return GateOutcome::Rejected(rejection);
                }
            }
        }
    }

    fn verify(&self, request: AuthRequest) -> Result<DeviceIdentity, AuthError> {
        let claims = self.validator.validate(&request.token)?;

        let device_name = normalize_device_field("device_name", &request.device_name)
            .map_err(|e| AuthError::Failed(e.to_string()))?;
        let device_type = normalize_device_field("device_type", &request.device_type)
            .map_err(|e| AuthError::Failed(e.to_string()))?;

        Ok(DeviceIdentity {
            user_id: claims.user_id,
            display_name: claims.username,
            device_name,
            device_type,
            authenticated_at: Utc::now(),
        })
    }

    /// Authenticated: register, acknowledge, then audit.
    async fn admit(&self, conn: &Arc<Connection>, identity: DeviceIdentity) -> GateOutcome {
        conn.authenticate(identity.clone());

        if let Err(e) = self.registry.add(conn.clone()).await {
            warn!(conn_id = %conn.id(), error = %e, "Failed to register connection");
            conn.close().await;
            return GateOutcome::Rejected(Rejection::Transport(e.to_string()));
        }

        let ack = Envelope::auth_success(identity.user_id, &identity.display_name);
        if let Err(e) = conn.send_message(ack).await {
            debug!(conn_id = %conn.id(), error = %e, "Failed to send auth_resp");
            self.registry.remove(conn.id()).await;
            conn.close().await;
            return GateOutcome::Rejected(Rejection::Transport(e.to_string()));
        }

        info!(
            conn_id = %conn.id(),
            user_id = identity.user_id,
            device = %identity.device_name,
            addr = %conn.remote_addr(),
            "Device authenticated"
        );

        let session = SessionRecord {
            user_id: identity.user_id,
            device_name: identity.device_name.clone(),
            device_type: identity.device_type.clone(),
            remote_addr: conn.remote_addr().to_string(),
            connected_at: conn.connected_at(),
            authenticated_at: identity.authenticated_at,
        };
        if let Err(e) = self.sessions.record_session(session).await {
            warn!(user_id = identity.user_id, error = %e, "Failed to record sync session");
        }

        GateOutcome::Admitted(identity)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::pair;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const SECRET: &str = "test-secret";

    #[derive(Default)]
    struct MemorySessions {
        recorded: Mutex<Vec<SessionRecord>>,
    }

    #[async_trait]
    impl SessionRecorder for MemorySessions {
        async fn record_session(&self, session: SessionRecord) -> SyncResult<()> {
            self.recorded.lock().unwrap().push(session);
            Ok(())
        }
    }

    struct FailingSessions;

    #[async_trait]
    impl SessionRecorder for FailingSessions {
        async fn record_session(&self, _session: SessionRecord) -> SyncResult<()> {
            Err(SyncError::DatabaseError("disk full".into()))
        }
    }

    fn gate_with(sessions: Arc<dyn SessionRecorder>) -> (AuthGate, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let gate = AuthGate::new(
            Arc::new(JwtManager::new(SECRET, 3600)),
            sessions,
            registry.clone(),
            Duration::from_secs(30),
        );
        (gate, registry)
    }

    async fn send(client: &mut DuplexStream, envelope: &Envelope) {
        let line = crate::codec::encode_line(envelope).unwrap();
        client.write_all(&line).await.unwrap();
    }

    async fn recv(reader: &mut BufReader<DuplexStream>) -> Envelope {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim_end()).unwrap()
    }

    #[test]
    fn test_jwt_roundtrip() {
        let manager = JwtManager::new(SECRET, 3600);
        let token = manager.generate_token(42, "ada").unwrap();

        let claims = manager.validate_token(&token).unwrap();
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.username, "ada");
    }

    #[test]
    fn test_auth_error_classification() {
        let manager = JwtManager::new(SECRET, 3600);

        let expired = manager.generate_token_with_lifetime(42, "ada", -3600).unwrap();
        assert_eq!(manager.validate_token(&expired), Err(AuthError::Expired));

        let foreign = JwtManager::new("other-secret", 3600)
            .generate_token(42, "ada")
            .unwrap();
        assert_eq!(
            manager.validate_token(&foreign).unwrap_err().code(),
            ErrorCode::InvalidToken
        );

        assert_eq!(
            manager.validate_token("not-a-jwt").unwrap_err().code(),
            ErrorCode::InvalidToken
        );

        let no_user = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "username": "ada", "exp": Utc::now().timestamp() + 3600 }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(
            manager.validate_token(&no_user).unwrap_err().code(),
            ErrorCode::InvalidClaims
        );

        let zero_user = manager.generate_token(0, "nobody").unwrap();
        assert_eq!(
            manager.validate_token(&zero_user).unwrap_err().code(),
            ErrorCode::InvalidClaims
        );
    }

    #[test]
    fn test_recently_expired_token_has_no_grace_period() {
        let strict = JwtManager::new(SECRET, 3600);
        let token = strict.generate_token_with_lifetime(42, "ada", -5).unwrap();
        assert_eq!(strict.validate_token(&token), Err(AuthError::Expired));

        let lenient = JwtManager::new(SECRET, 3600).with_leeway(60);
        assert_eq!(lenient.validate_token(&token).unwrap().user_id, 42);
    }

    #[test]
    fn test_transition_table() {
        let (gate, _registry) = gate_with(Arc::new(MemorySessions::default()));

        let t = gate.transition(GateState::AwaitingAuth, GateEvent::Message(Envelope::Heartbeat));
        assert_eq!(t.state, GateState::AwaitingAuth);
        assert_eq!(t.reply.unwrap().error_code(), Some(ErrorCode::AuthRequired));

        let t = gate.transition(GateState::AwaitingAuth, GateEvent::DeadlineElapsed);
        assert_eq!(t.state, GateState::Rejected(Rejection::Timeout));
        assert_eq!(t.reply.unwrap().error_code(), Some(ErrorCode::AuthTimeout));

        let t = gate.transition(
            GateState::AwaitingAuth,
            GateEvent::Message(Envelope::auth("garbage", "kobo", "ereader")),
        );
        assert!(matches!(t.state, GateState::Rejected(Rejection::Credentials(_))));
        assert_eq!(t.reply.unwrap().error_code(), Some(ErrorCode::InvalidToken));

        let t = gate.transition(GateState::AwaitingAuth, GateEvent::TransportFailed("eof".into()));
        assert!(matches!(t.state, GateState::Rejected(Rejection::Transport(_))));
        assert!(t.reply.is_none());

        let token = JwtManager::new(SECRET, 3600).generate_token(9, "bo").unwrap();
        let t = gate.transition(
            GateState::AwaitingAuth,
            GateEvent::Message(Envelope::auth(&token, "", "")),
        );
        match t.state {
            GateState::Authenticated(identity) => {
                assert_eq!(identity.user_id, 9);
                assert_eq!(identity.device_name, "unknown");
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(t.reply.is_none());
    }

    #[test]
    fn test_terminal_states_absorb_events() {
        let (gate, _registry) = gate_with(Arc::new(MemorySessions::default()));

        let rejected = GateState::Rejected(Rejection::Timeout);
        let t = gate.transition(rejected.clone(), GateEvent::Message(Envelope::Heartbeat));
        assert_eq!(t.state, rejected);
        assert!(t.reply.is_none());
    }

    #[tokio::test]
    async fn test_successful_handshake_registers_and_records() {
        let sessions = Arc::new(MemorySessions::default());
        let (gate, registry) = gate_with(sessions.clone());
        let (conn, mut client) = pair();

        let token = JwtManager::new(SECRET, 3600).generate_token(7, "ada").unwrap();
        send(&mut client, &Envelope::auth(&token, "Kobo Libra", "ereader")).await;

        let outcome = gate.run(&conn).await;
        assert!(matches!(outcome, GateOutcome::Admitted(ref id) if id.user_id == 7));
        assert!(conn.is_authenticated());
        assert!(registry.contains(conn.id()).await);

        let mut reader = BufReader::new(client);
        match recv(&mut reader).await {
            Envelope::AuthResp(resp) => {
                assert!(resp.success);
                assert_eq!(resp.user_id, Some(7));
                assert_eq!(resp.display_name.as_deref(), Some("ada"));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        let recorded = sessions.recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].device_name, "Kobo Libra");
    }

    #[tokio::test]
    async fn test_non_auth_message_gets_auth_required_then_auth_succeeds() {
        let (gate, registry) = gate_with(Arc::new(MemorySessions::default()));
        let (conn, mut client) = pair();

        let token = JwtManager::new(SECRET, 3600).generate_token(7, "ada").unwrap();
        send(&mut client, &Envelope::Heartbeat).await;
        send(&mut client, &Envelope::auth(&token, "phone", "mobile")).await;

        assert!(matches!(gate.run(&conn).await, GateOutcome::Admitted(_)));
        assert_eq!(registry.device_count(7).await, 1);

        let mut reader = BufReader::new(client);
        assert_eq!(recv(&mut reader).await.error_code(), Some(ErrorCode::AuthRequired));
        assert_eq!(recv(&mut reader).await.type_name(), "auth_resp");
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_closed() {
        let (gate, registry) = gate_with(Arc::new(MemorySessions::default()));
        let (conn, mut client) = pair();

        let token = JwtManager::new(SECRET, 3600)
            .generate_token_with_lifetime(7, "ada", -3600)
            .unwrap();
        send(&mut client, &Envelope::auth(&token, "kobo", "ereader")).await;

        let outcome = gate.run(&conn).await;
        assert_eq!(
            outcome,
            GateOutcome::Rejected(Rejection::Credentials(AuthError::Expired))
        );
        assert!(conn.is_closed());
        assert!(registry.is_empty().await);

        let mut reader = BufReader::new(client);
        assert_eq!(recv(&mut reader).await.error_code(), Some(ErrorCode::TokenExpired));
    }

    #[tokio::test]
    async fn test_overlong_device_name_is_auth_failed() {
        let sessions = Arc::new(MemorySessions::default());
        let (gate, registry) = gate_with(sessions.clone());
        let (conn, mut client) = pair();

        let token = JwtManager::new(SECRET, 3600).generate_token(7, "ada").unwrap();
        let device_name = "k".repeat(101);
        send(&mut client, &Envelope::auth(&token, &device_name, "ereader")).await;

        let outcome = gate.run(&conn).await;
        assert!(matches!(
            outcome,
            GateOutcome::Rejected(Rejection::Credentials(AuthError::Failed(_)))
        ));
        assert!(conn.is_closed());
        assert!(registry.is_empty().await);
        assert!(sessions.recorded.lock().unwrap().is_empty());

        let mut reader = BufReader::new(client);
        assert_eq!(recv(&mut reader).await.error_code(), Some(ErrorCode::AuthFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_not_extended_by_chatter() {
        let (gate, registry) = gate_with(Arc::new(MemorySessions::default()));
        let (conn, client) = pair();
        let (read_half, mut write_half) = tokio::io::split(client);

        let chatter = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                let line = crate::codec::encode_line(&Envelope::Heartbeat).unwrap();
                if write_half.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let outcome = gate.run(&conn).await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, GateOutcome::Rejected(Rejection::Timeout));
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed < Duration::from_secs(40));
        assert!(conn.is_closed());
        assert!(registry.is_empty().await);

        let mut reader = BufReader::new(read_half);
        let mut codes = Vec::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap_or(0) > 0 {
            let env: Envelope = serde_json::from_str(line.trim_end()).unwrap();
            codes.push(env.error_code());
            line.clear();
        }
        assert_eq!(codes.last().copied().flatten(), Some(ErrorCode::AuthTimeout));
        assert!(codes.contains(&Some(ErrorCode::AuthRequired)));

        chatter.abort();
    }

    #[tokio::test]
    async fn test_session_failure_does_not_reject() {
        let (gate, registry) = gate_with(Arc::new(FailingSessions));
        let (conn, mut client) = pair();

        let token = JwtManager::new(SECRET, 3600).generate_token(7, "ada").unwrap();
        send(&mut client, &Envelope::auth(&token, "kobo", "ereader")).await;

        assert!(matches!(gate.run(&conn).await, GateOutcome::Admitted(_)));
        assert!(registry.contains(conn.id()).await);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_protocol_rejection() {
        let (gate, registry) = gate_with(Arc::new(MemorySessions::default()));
        let (conn, mut client) = pair();

        client.write_all(b"{this is not json}\n").await.unwrap();

        let outcome = gate.run(&conn).await;
        assert!(matches!(outcome, GateOutcome::Rejected(Rejection::Protocol(_))));
        assert!(registry.is_empty().await);

        let mut reader = BufReader::new(client);
        assert_eq!(recv(&mut reader).await.error_code(), Some(ErrorCode::ProtocolError));
    }
}
