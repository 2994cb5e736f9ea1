//! Real-time event client for the surveillance console
//!
//! Keeps one resilient connection to the console's event source, fans
//! inbound event frames out to subscribers by event type, and follows the
//! login session: connect on login, disconnect on logout.

pub mod channel;
pub mod config;
pub mod session;
pub mod transport;

pub use channel::{ChannelState, ChannelStatus, EventChannel, EventFrame, Subscription, SubscriptionHandle};
pub use config::{ChannelConfig, Config, ConfigError, ReconnectConfig};
pub use session::{Role, Session, SessionBinding, SessionGate, SessionStore, User};
pub use transport::{Connection, Transport, TransportError, WebSocketTransport};
