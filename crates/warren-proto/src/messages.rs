//! Control-plane message structs and their encodings.

use bytes::{Buf, Bytes, BytesMut};

use crate::wire::{self, WireError};

/// `http-forward` payload: activate a tunnel for `requested_host`, or for a
/// server-assigned name when empty. `force` evicts a live tunnel for the
/// same host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub requested_host: String,
    pub force: bool,
}

impl ForwardRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.requested_host);
        wire::put_bool(&mut buf, self.force);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        Ok(Self {
            requested_host: wire::get_string(&mut payload)?,
            force: wire::get_bool(&mut payload)?,
        })
    }
}

/// Successful `http-forward` reply carrying the assigned host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSuccess {
    pub host: String,
}

impl ForwardSuccess {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.host);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        Ok(Self {
            host: wire::get_string(&mut payload)?,
        })
    }
}

/// `cancel-http-forward` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCancel {
    pub host: String,
}

impl ForwardCancel {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.host);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        Ok(Self {
            host: wire::get_string(&mut payload)?,
        })
    }
}

/// `register-host` / `unregister-host` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRegisterRequest {
    pub host: String,
}

impl HostRegisterRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.host);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        Ok(Self {
            host: wire::get_string(&mut payload)?,
        })
    }
}

/// Reply to a successful registration (or unregistration).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRegisterSuccess {
    pub host: String,
}

impl HostRegisterSuccess {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.host);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, WireError> {
        Ok(Self {
            host: wire::get_string(&mut payload)?,
        })
    }
}

/// Typed view of the channel-open parameters for a forwarded HTTP exchange:
/// which hostname was hit and by whom. The server places the host in the
/// connected-address field and the public client address in the originator
/// fields of the channel-open message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedChannelData {
    pub host: String,
    pub client_ip: String,
}

/// A control request as it appears on the wire: the type string, whether the
/// sender expects a reply, and the type-specific payload.
///
/// The payload stays opaque here; the handling side parses it according to
/// `request_type` so unknown types can be rejected without losing the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

impl ControlRequest {
    pub fn new(request_type: &str, want_reply: bool, payload: Bytes) -> Self {
        Self {
            request_type: request_type.to_string(),
            want_reply,
            payload,
        }
    }

    /// Encode as a complete frame, length prefix included.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.request_type);
        wire::put_bool(&mut buf, self.want_reply);
        buf.extend_from_slice(&self.payload);
        wire::encode_frame(&buf)
    }

    pub fn decode(mut body: Bytes) -> Result<Self, WireError> {
        let request_type = wire::get_string(&mut body)?;
        let want_reply = wire::get_bool(&mut body)?;
        Ok(Self {
            request_type,
            want_reply,
            payload: body.copy_to_bytes(body.remaining()),
        })
    }
}

/// A control reply: accepted flag plus a payload that is either a success
/// struct or a human-readable rejection reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub accepted: bool,
    pub payload: Bytes,
}

impl ControlReply {
    pub fn accept(payload: Bytes) -> Self {
        Self {
            accepted: true,
            payload,
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            accepted: false,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Rejection with no reason, used for unparseable or unknown requests.
    pub fn reject_silent() -> Self {
        Self {
            accepted: false,
            payload: Bytes::new(),
        }
    }

    /// The payload as text, for surfacing rejection reasons.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode as a complete frame, length prefix included.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::put_bool(&mut buf, self.accepted);
        buf.extend_from_slice(&self.payload);
        wire::encode_frame(&buf)
    }

    pub fn decode(mut body: Bytes) -> Result<Self, WireError> {
        let accepted = wire::get_bool(&mut body)?;
        Ok(Self {
            accepted,
            payload: body.copy_to_bytes(body.remaining()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FrameBuffer;
    use crate::HTTP_FORWARD;

    #[test]
    fn forward_request_roundtrip() {
        let req = ForwardRequest {
            requested_host: "myapp.example.com".into(),
            force: true,
        };
        assert_eq!(ForwardRequest::decode(req.encode()).unwrap(), req);
    }

    #[test]
    fn forward_request_empty_host() {
        let req = ForwardRequest {
            requested_host: String::new(),
            force: false,
        };
        assert_eq!(ForwardRequest::decode(req.encode()).unwrap(), req);
    }

    #[test]
    fn forward_request_truncated() {
        let req = ForwardRequest {
            requested_host: "a.example.com".into(),
            force: false,
        };
        let encoded = req.encode();
        // Drop the trailing force byte.
        let truncated = encoded.slice(..encoded.len() - 1);
        assert_eq!(ForwardRequest::decode(truncated), Err(WireError::Truncated));
    }

    #[test]
    fn control_request_roundtrip_through_frame_buffer() {
        let inner = ForwardRequest {
            requested_host: "otter.example.com".into(),
            force: false,
        };
        let req = ControlRequest::new(HTTP_FORWARD, true, inner.encode());

        let mut fb = FrameBuffer::new();
        fb.extend(&req.to_frame());

        let body = fb.next_frame().unwrap().unwrap();
        let decoded = ControlRequest::decode(body).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(ForwardRequest::decode(decoded.payload).unwrap(), inner);
    }

    #[test]
    fn unknown_request_type_survives_decode() {
        let req = ControlRequest::new("keepalive@warren", false, Bytes::new());
        let mut fb = FrameBuffer::new();
        fb.extend(&req.to_frame());
        let decoded = ControlRequest::decode(fb.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(decoded.request_type, "keepalive@warren");
        assert!(!decoded.want_reply);
    }

    #[test]
    fn reply_roundtrip() {
        let ok = ControlReply::accept(ForwardSuccess { host: "h.example".into() }.encode());
        let mut fb = FrameBuffer::new();
        fb.extend(&ok.to_frame());
        let decoded = ControlReply::decode(fb.next_frame().unwrap().unwrap()).unwrap();
        assert!(decoded.accepted);
        assert_eq!(
            ForwardSuccess::decode(decoded.payload).unwrap().host,
            "h.example"
        );

        let no = ControlReply::reject("host not found");
        let decoded = ControlReply::decode(no.to_frame()[4..].to_vec().into()).unwrap();
        assert!(!decoded.accepted);
        assert_eq!(decoded.reason(), "host not found");
    }
}
