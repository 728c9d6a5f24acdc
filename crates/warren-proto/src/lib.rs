//! Wire protocol shared by the warren server and client.
//!
//! Control-plane operations travel over a dedicated SSH subsystem channel as
//! length-prefixed frames. Each frame body reuses the SSH global-request
//! shape: a request carries `string request-type, bool want-reply, payload`,
//! a reply carries `bool accepted, payload`. Payloads are the message structs
//! in [`messages`], encoded with the canonical primitives in [`wire`].

pub mod messages;
pub mod wire;

pub use messages::{
    ControlReply, ControlRequest, ForwardCancel, ForwardRequest, ForwardSuccess,
    ForwardedChannelData, HostRegisterRequest, HostRegisterSuccess,
};
pub use wire::{FrameBuffer, WireError, MAX_FRAME_LEN};

/// Subsystem name the client requests on its control channel.
pub const CONTROL_SUBSYSTEM: &str = "warren-control";

/// Request an HTTP forward (activate a tunnel).
pub const HTTP_FORWARD: &str = "http-forward";
/// Release an active HTTP forward.
pub const CANCEL_HTTP_FORWARD: &str = "cancel-http-forward";
/// Persist a hostname reservation without activating forwarding.
pub const REGISTER_HOST: &str = "register-host";
/// Drop a persisted hostname reservation.
pub const UNREGISTER_HOST: &str = "unregister-host";

/// Port carried in the channel-open message for forwarded HTTP exchanges.
/// The hostname in the same message is what actually demultiplexes.
pub const FORWARDED_HTTP_PORT: u32 = 80;
