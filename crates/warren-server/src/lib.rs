//! Reverse HTTP tunnel server.
//!
//! Clients connect over SSH, authenticate with a public key, and ask for a
//! hostname; public HTTP requests to that hostname are multiplexed back over
//! the client's connection as per-request channels. The pieces:
//!
//! - [`registry`]: the live `hostname → tunnel` map
//! - [`store`]: persistent hostname reservations with owners
//! - [`names`]: random name generation and host validation policy
//! - [`control`]: the SSH control plane handling forward/register requests
//! - [`ingress`]: the public HTTP side, bridging requests onto channels
//! - [`server`]: listener bootstrap tying it all together

pub mod auth;
pub mod control;
pub mod error;
pub mod ingress;
pub mod keys;
pub mod names;
pub mod registry;
pub mod server;
pub mod store;

pub use auth::{AuthorizedKeys, KeyIdentity};
pub use control::ServerContext;
pub use error::{RegistryError, ServerError};
pub use keys::load_or_generate_key;
pub use names::{deny_all, deny_prefix_in, suffix_in, validate_all, HostValidator, NameProvider};
pub use registry::{ActiveTunnel, ClaimOutcome, HostnameRegistry, RemoveOutcome, TunnelRegistry};
pub use server::{Server, ServerConfig};
pub use store::{DbHostStore, HostRecord, HostStore, MemoryHostStore, StoreError};
