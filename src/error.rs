use std::io;

/// Errors surfaced by the server framework.
///
/// Per-connection failures never abort the accept loop; only accept-layer
/// errors and lifecycle signals come back from [`Server::serve`].
///
/// [`Server::serve`]: crate::Server::serve
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned by `serve` and `shutdown` after the server has been closed.
    #[error("ssh: server closed")]
    ServerClosed,

    /// An authentication callback rejected the credentials.
    #[error("permission denied")]
    PermissionDenied {
        /// Marks a partial success (some but not all required methods passed).
        partial_success: bool,
    },

    /// A forwarding callback refused the request.
    #[error("forwarding rejected")]
    Rejected,

    /// PTY allocation is not available on this platform.
    #[error("pty unsupported on this platform")]
    Unsupported,

    /// A request payload did not parse; the request is refused and the
    /// connection continues.
    #[error("malformed {0} payload")]
    Parse(&'static str),

    /// `shutdown` deadline elapsed with connections still live.
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,

    /// `Session::send_exit` was called more than once.
    #[error("exit status already sent")]
    AlreadyExited,

    /// Options may only be applied before the server starts serving.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh::keys::Error),

    #[error(transparent)]
    KeyFormat(#[from] russh::keys::ssh_key::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
