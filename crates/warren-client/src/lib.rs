//! Reverse HTTP tunnel client.
//!
//! Dials a warren server over SSH, authenticates with a user key, and either
//! manages hostname reservations or activates HTTP forwarding: the server
//! opens one channel back per public request, and each is proxied to the
//! configured local backend (optionally TLS-wrapped) with the `Host` header
//! rewritten.

mod backend;
mod client;
mod error;
mod proxy;

pub use backend::Backend;
pub use client::TunnelClient;
pub use error::ClientError;
