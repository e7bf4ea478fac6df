//! mychat-core: Client session layer for the mychat service
//!
//! This crate provides:
//! - Authenticated REST client with single-flight token refresh
//! - WebSocket session with heartbeat and inbound message delivery
//! - Credential store contract shared by both
//! - Client configuration

pub mod client;
pub mod config;
pub mod credentials;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod refresh;
pub mod socket;

pub use client::{ApiClient, LoginResponse};
pub use config::{ClientConfig, Config};
pub use credentials::{CredentialStore, MemoryCredentialStore, TokenPair};
pub use envelope::ApiResponse;
pub use error::{ClientError, RefreshError};
pub use protocol::{ChatContent, InboundPayload, MessageKind, OutboundMessage};
pub use socket::{CloseReason, ConnectionState, SessionSocket, SocketEvent};

/// Default port of the mychat server
pub const DEFAULT_SERVER_PORT: u16 = 8080;
