//! Display server session: connection lifecycle, extension negotiation,
//! and asynchronous protocol error interception.
//!
//! A [`DisplayManager`] owns at most one live [`Session`]. Opening a
//! session connects to the server, marks the socket close-on-exec,
//! installs an [`ErrorInterceptor`], probes every known [`Extension`]
//! into an [`ExtensionRegistry`], and then runs the external
//! [`SessionHooks`]. Closing runs the shutdown hook and drops the
//! connection.
//!
//! The server's transport is abstracted behind [`Transport`] and
//! [`Connector`]; [`X11Connector`] is the x11rb implementation.

pub mod extension;
pub mod interceptor;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use extension::{Extension, ExtensionInfo, ExtensionProbe, ExtensionRegistry, ExtensionSupport};
pub use interceptor::{Disposition, ErrorInterceptor, ErrorPolicy, ErrorState, ProtocolError};
pub use session::{DisplayManager, EVENT_BACKLOG, NoHooks, Session, SessionConfig, SessionHooks};
pub use transport::{Connector, Delivery, Transport, X11Connector, X11Transport};

/// Errors returned by the display session core.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    /// The server could not be reached or the address was invalid.
    #[error("cannot open display {display}: {reason}")]
    Connect { display: String, reason: String },

    /// A request or round-trip on a live connection failed (e.g. the
    /// server closed the socket).
    #[error("transport: {0}")]
    Transport(String),

    /// Marking the connection descriptor close-on-exec failed.
    #[error("close-on-exec: {0}")]
    CloseOnExec(#[from] nix::Error),

    /// The transport has no request for this query on this extension.
    #[error("{extension} has no {query} query")]
    Unsupported {
        extension: Extension,
        query: &'static str,
    },
}

/// Type alias for the x11rb-backed manager.
pub type X11DisplayManager<H = NoHooks> = DisplayManager<X11Connector, H>;
