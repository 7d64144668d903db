//! Status and error events surfaced on an endpoint's status channel.

use crate::Value;

/// Non-error lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// A handshake completed and the peer is live.
    PeerAdded,
    /// This side removed a peer deliberately.
    PeerRemoved,
    /// A peer went away without saying goodbye.
    PeerLost,
    /// A previously unknown endpoint was observed.
    EndpointDiscovered,
}

impl StatusCode {
    /// The stable symbolic name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::PeerAdded => "peer_added",
            StatusCode::PeerRemoved => "peer_removed",
            StatusCode::PeerLost => "peer_lost",
            StatusCode::EndpointDiscovered => "endpoint_discovered",
        }
    }
}

/// Error classes reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// An operation referenced a peer that does not exist.
    PeerInvalid,
    /// A dial attempt failed; retry may follow.
    PeerUnavailable,
    /// The connection dropped before the handshake finished.
    PeerDisconnectDuringHandshake,
    /// The remote speaks an incompatible protocol version.
    PeerIncompatible,
    /// A store mutation hit a value of the wrong type.
    TypeClash,
    /// A store read referenced a missing key.
    NoSuchKey,
    /// A store request went unanswered.
    RequestTimeout,
    /// A persistence backend failed or a master is unreachable.
    BackendFailure,
    /// The endpoint is shutting down.
    ShutdownInProgress,
    /// A subscriber queue overflowed and a message was dropped.
    WriteOverflow,
    /// Anything else.
    Unspecified,
}

impl ErrorCode {
    /// The stable symbolic name of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PeerInvalid => "peer_invalid",
            ErrorCode::PeerUnavailable => "peer_unavailable",
            ErrorCode::PeerDisconnectDuringHandshake => {
                "peer_disconnect_during_handshake"
            }
            ErrorCode::PeerIncompatible => "peer_incompatible",
            ErrorCode::TypeClash => "type_clash",
            ErrorCode::NoSuchKey => "no_such_key",
            ErrorCode::RequestTimeout => "request_timeout",
            ErrorCode::BackendFailure => "backend_failure",
            ErrorCode::ShutdownInProgress => "shutdown_in_progress",
            ErrorCode::WriteOverflow => "write_overflow",
            ErrorCode::Unspecified => "unspecified",
        }
    }

    /// The wire byte for this code, used in store responses.
    pub fn tag(&self) -> u8 {
        match self {
            ErrorCode::PeerInvalid => 1,
            ErrorCode::PeerUnavailable => 2,
            ErrorCode::PeerDisconnectDuringHandshake => 3,
            ErrorCode::PeerIncompatible => 4,
            ErrorCode::TypeClash => 5,
            ErrorCode::NoSuchKey => 6,
            ErrorCode::RequestTimeout => 7,
            ErrorCode::BackendFailure => 8,
            ErrorCode::ShutdownInProgress => 9,
            ErrorCode::WriteOverflow => 10,
            ErrorCode::Unspecified => 0,
        }
    }

    /// Parse a wire byte into a code. Unknown bytes degrade to
    /// [ErrorCode::Unspecified] rather than failing: error codes must
    /// survive version skew.
    pub fn from_tag(tag: u8) -> Self {
        match tag {
            1 => ErrorCode::PeerInvalid,
            2 => ErrorCode::PeerUnavailable,
            3 => ErrorCode::PeerDisconnectDuringHandshake,
            4 => ErrorCode::PeerIncompatible,
            5 => ErrorCode::TypeClash,
            6 => ErrorCode::NoSuchKey,
            7 => ErrorCode::RequestTimeout,
            8 => ErrorCode::BackendFailure,
            9 => ErrorCode::ShutdownInProgress,
            10 => ErrorCode::WriteOverflow,
            _ => ErrorCode::Unspecified,
        }
    }
}

/// One notification on the status channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// A lifecycle status, optionally naming the affected peer.
    Status {
        /// What happened.
        code: StatusCode,
        /// Rendered context, typically the peer address.
        context: String,
    },
    /// An error, with context naming the failing operation.
    Error {
        /// What went wrong.
        code: ErrorCode,
        /// Rendered context.
        context: String,
    },
}

impl StatusEvent {
    /// The event rendered as a data-model value, so status can travel
    /// as an ordinary message: a vector of `[kind, code, context]`.
    pub fn to_value(&self) -> Value {
        match self {
            StatusEvent::Status { code, context } => Value::vector([
                Value::EnumValue("status".into()),
                Value::EnumValue(code.as_str().into()),
                Value::from(context.as_str()),
            ]),
            StatusEvent::Error { code, context } => Value::vector([
                Value::EnumValue("error".into()),
                Value::EnumValue(code.as_str().into()),
                Value::from(context.as_str()),
            ]),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_code_tag_round_trip() {
        for code in [
            ErrorCode::PeerInvalid,
            ErrorCode::PeerUnavailable,
            ErrorCode::PeerDisconnectDuringHandshake,
            ErrorCode::PeerIncompatible,
            ErrorCode::TypeClash,
            ErrorCode::NoSuchKey,
            ErrorCode::RequestTimeout,
            ErrorCode::BackendFailure,
            ErrorCode::ShutdownInProgress,
            ErrorCode::WriteOverflow,
            ErrorCode::Unspecified,
        ] {
            assert_eq!(code, ErrorCode::from_tag(code.tag()));
        }
    }

    #[test]
    fn unknown_tag_degrades() {
        assert_eq!(ErrorCode::Unspecified, ErrorCode::from_tag(255));
    }

    #[test]
    fn event_renders_as_value() {
        let ev = StatusEvent::Status {
            code: StatusCode::PeerAdded,
            context: "127.0.0.1:9999".into(),
        };
        match ev.to_value() {
            Value::Vector(v) => {
                assert_eq!(3, v.len());
                assert_eq!(Value::EnumValue("status".into()), v[0]);
                assert_eq!(Value::EnumValue("peer_added".into()), v[1]);
            }
            _ => unreachable!(),
        }
    }
}
