//! Session state consumed by the event channel, and the glue that keeps the
//! channel's connection in step with login/logout.

pub mod binding;
pub mod gate;

pub use binding::SessionBinding;
pub use gate::{Role, Session, SessionGate, SessionStore, User};
