//! Courier - one-shot message dispatch over a persistent messaging session
//!
//! Delivers a single payload to a single target, tolerating a session that
//! drops, stalls during the handshake or never acknowledges delivery, and
//! leaves exactly one authoritative status record behind.
//!
//! ## Architecture
//!
//! ```text
//! SessionStore ──▶ Connection ──▶ DispatchController ──▶ ConfirmationWaiter
//!   (creds.json)    (state machine)   (attempts, backoff)     (best effort)
//!                                             │
//!                                             ▼
//!                                      StatusReporter
//!                                    (send_status.json)
//! ```
//!
//! The messaging protocol itself lives behind the [`transport::Transport`]
//! trait. The binary talks to it through a WebSocket bridge; tests use the
//! scripted transport in [`transport::mock`].
//!
//! ## Files
//!
//! | File | Writer | Contents |
//! |------|--------|----------|
//! | `auth/creds.json` | session store | opaque credential blob |
//! | `send_status.json` | status reporter | last delivery outcome |
//! | `outbox.txt` | operator | message payload |

pub mod atomic;
pub mod config;
pub mod confirm;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod pairing;
pub mod session;
pub mod status;
pub mod transport;

// Re-exports
pub use config::Config;
pub use confirm::{AckSource, Confirmation, ConfirmationWaiter};
pub use connection::{CloseReason, Connection, ConnectionState};
pub use dispatch::{DeliveryOutcome, DispatchBudget, DispatchController};
pub use error::{DispatchError, TransportError};
pub use keepalive::{KeepAlive, KeepAliveSettings};
pub use pairing::{PairingDisplay, PairingFlow, PairingSettings, StdoutDisplay};
pub use session::{Credentials, SessionStore};
pub use status::{DeliveryStatus, StatusReporter};
pub use transport::BridgeTransport;
