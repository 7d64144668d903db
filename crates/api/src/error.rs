//! Telefab error types.

use std::sync::Arc;

/// The rendered context of one error: a message describing the failing
/// operation, plus the underlying error that caused it when there is
/// one.
///
/// Message and source both sit behind `Arc`s so whole `Result`s stay
/// `Clone`, which shared futures and the status channel need. The
/// source is preserved for `std::error::Error::source` chains rather
/// than flattened into the message.
#[derive(Clone)]
pub struct ErrorCtx {
    msg: Arc<str>,
    source: Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
}

impl ErrorCtx {
    /// Context from a message alone.
    pub fn msg<C: std::fmt::Display>(msg: C) -> Self {
        Self {
            msg: msg.to_string().into_boxed_str().into(),
            source: None,
        }
    }

    /// Context from a message plus the error that caused it.
    pub fn with_source<C, S>(msg: C, source: S) -> Self
    where
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    {
        Self {
            msg: msg.to_string().into_boxed_str().into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The rendered message, without the source.
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl std::fmt::Display for ErrorCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source.as_ref() {
            None => f.write_str(&self.msg),
            Some(source) => write!(f, "{}: {source}", self.msg),
        }
    }
}

impl std::fmt::Debug for ErrorCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCtx")
            .field("msg", &self.msg)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for ErrorCtx {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

/// The core telefab error type, used in all external apis as well as
/// internally between the endpoint actors.
///
/// This type implements `Clone` to ease the use of shared futures and
/// broadcastable status events, which require the entire `Result` to be
/// `Clone`.
///
/// Variants group errors into the classes the fabric reacts to
/// differently: transport errors tear down a peer connection and trigger
/// retry, protocol errors close a connection permanently, semantic store
/// errors are returned to the caller without touching any connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FabError {
    /// A connection-level failure (dial, read, write, close).
    #[error("transport: {0}")]
    Transport(#[source] ErrorCtx),

    /// A malformed or unexpected frame, or an incompatible peer.
    #[error("protocol: {0}")]
    Protocol(ErrorCtx),

    /// A store operation was applied to a value whose type does not
    /// admit it.
    #[error("type clash: {0}")]
    TypeClash(ErrorCtx),

    /// A store read referenced a key that does not exist.
    #[error("no such key: {0}")]
    NoSuchKey(ErrorCtx),

    /// A store request was not answered within the configured timeout.
    #[error("request timed out: {0}")]
    RequestTimeout(ErrorCtx),

    /// A persistence backend failed, or a clone has no reachable master.
    #[error("backend failure: {0}")]
    BackendFailure(#[source] ErrorCtx),

    /// The endpoint is shutting down; the operation was cancelled.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Generic internal error.
    #[error("{0}")]
    Other(#[source] ErrorCtx),
}

impl FabError {
    /// Construct a transport error with an inner source error.
    pub fn transport_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Transport(ErrorCtx::with_source(ctx, src))
    }

    /// Construct a transport error.
    pub fn transport<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Transport(ErrorCtx::msg(ctx))
    }

    /// Construct a protocol error.
    pub fn protocol<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Protocol(ErrorCtx::msg(ctx))
    }

    /// Construct a type-clash error.
    pub fn type_clash<C: std::fmt::Display>(ctx: C) -> Self {
        Self::TypeClash(ErrorCtx::msg(ctx))
    }

    /// Construct a no-such-key error.
    pub fn no_such_key<C: std::fmt::Display>(ctx: C) -> Self {
        Self::NoSuchKey(ErrorCtx::msg(ctx))
    }

    /// Construct a request-timeout error.
    pub fn request_timeout<C: std::fmt::Display>(ctx: C) -> Self {
        Self::RequestTimeout(ErrorCtx::msg(ctx))
    }

    /// Construct a backend-failure error with an inner source error.
    pub fn backend_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::BackendFailure(ErrorCtx::with_source(ctx, src))
    }

    /// Construct a backend-failure error.
    pub fn backend<C: std::fmt::Display>(ctx: C) -> Self {
        Self::BackendFailure(ErrorCtx::msg(ctx))
    }

    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other(ErrorCtx::with_source(ctx, src))
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other(ErrorCtx::msg(ctx))
    }

    /// The error code this error surfaces as on the status channel.
    pub fn code(&self) -> crate::ErrorCode {
        use crate::ErrorCode::*;
        match self {
            FabError::Transport(..) => Unspecified,
            FabError::Protocol(..) => PeerIncompatible,
            FabError::TypeClash(..) => TypeClash,
            FabError::NoSuchKey(..) => NoSuchKey,
            FabError::RequestTimeout(..) => RequestTimeout,
            FabError::BackendFailure(..) => BackendFailure,
            FabError::ShutdownInProgress => ShutdownInProgress,
            FabError::Other(..) => Unspecified,
        }
    }
}

/// The core telefab result type.
pub type FabResult<T> = Result<T, FabError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!("bla", FabError::other("bla").to_string().as_str());
        assert_eq!(
            "transport: foo: bar",
            FabError::transport_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
        assert_eq!(
            "no such key: k",
            FabError::no_such_key("k").to_string().as_str(),
        );
    }

    #[test]
    fn source_chain_is_preserved() {
        use std::error::Error;
        let err =
            FabError::backend_src("open", std::io::Error::other("disk"));
        let ctx = err.source().map(|s| s.to_string());
        assert_eq!(Some("open: disk".to_string()), ctx);
        let inner = err
            .source()
            .and_then(|s| s.source())
            .map(|s| s.to_string());
        assert_eq!(Some("disk".to_string()), inner);
        assert!(FabError::other("plain").source().is_some());
        assert!(FabError::ShutdownInProgress.source().is_none());
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            crate::ErrorCode::TypeClash,
            FabError::type_clash("add on string").code(),
        );
        assert_eq!(
            crate::ErrorCode::ShutdownInProgress,
            FabError::ShutdownInProgress.code(),
        );
    }

    #[test]
    fn ensure_error_type_is_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(FabError::other("bla"));
    }
}
