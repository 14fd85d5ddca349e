//! # cloudide-relay — Real-time collaboration relay for CloudIDE+
//!
//! Relays document edits and cursor presence between participants editing
//! the same file over WebSocket. The relay never interprets payloads: it
//! assigns each change a per-session sequence number and fans it out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌───────────────────┐
//! │ Browser tab │ ◄─────────────────► │ ConnectionGateway │
//! │ (per user)  │     JSON frames     │ (per connection)  │
//! └─────────────┘                     └─────────┬─────────┘
//!                                               │
//!                        ┌──────────────────────┼──────────────────────┐
//!                        ▼                      ▼                      ▼
//!                ┌───────────────┐      ┌───────────────┐      ┌───────────────┐
//!                │ ChangeRelay   │      │SessionRegistry│ ───► │PresenceTracker│
//!                │ (sequencing)  │ ───► │ (membership)  │      │ (cursors)     │
//!                └───────┬───────┘      └───────────────┘      └───────┬───────┘
//!                        │                                             │
//!                        └──────────────► Outboxes ◄───────────────────┘
//!                                      (one per participant)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`ClientMessage` / `ServerMessage`)
//! - [`error`] — Errors reported back to clients
//! - [`outbox`] — Per-participant ordered delivery queues
//! - [`registry`] — Sessions, membership and sequence counters
//! - [`presence`] — Ephemeral cursor broadcast
//! - [`relay`] — Total ordering and fan-out of changes
//! - [`gateway`] — Connection lifecycle and message routing
//! - [`server`] — WebSocket server

pub mod protocol;
pub mod error;
pub mod outbox;
pub mod registry;
pub mod presence;
pub mod relay;
pub mod gateway;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    Change, ClientMessage, ErrorReason, ParticipantId, ProtocolError, ServerMessage, SessionId,
};
pub use error::RelayError;
pub use outbox::{DeliveryStats, Inbox, Outboxes};
pub use registry::{MembershipListener, Participant, SessionInfo, SessionRegistry};
pub use presence::PresenceTracker;
pub use relay::ChangeRelay;
pub use gateway::{Connection, ConnectionGateway};
pub use server::{RelayServer, ServerConfig, ServerStats};
