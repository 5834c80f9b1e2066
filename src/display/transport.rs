//! Transport seam: the server connection as the session sees it.
//!
//! [`Transport`] covers what the session needs from a live connection:
//! extension queries, a round-trip barrier, and non-blocking reads that
//! yield either events or asynchronous protocol errors. [`Connector`]
//! opens one. The x11rb implementation wraps a `RustConnection`.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::ReplyError;
use x11rb::protocol::Event;
#[cfg(feature = "compositing")]
use x11rb::protocol::composite::ConnectionExt as _;
#[cfg(feature = "sync")]
use x11rb::protocol::sync::ConnectionExt as _;
#[cfg(feature = "xinerama")]
use x11rb::protocol::xinerama::ConnectionExt as _;
#[cfg(feature = "xkb")]
use x11rb::protocol::xkb::ConnectionExt as _;
use x11rb::protocol::xproto::{self, Screen, Setup, Window};
use x11rb::rust_connection::RustConnection;
use x11rb::x11_utils::X11Error;

use super::extension::{Extension, ExtensionProbe};
use super::interceptor::ProtocolError;
use super::DisplayError;

/// Client versions announced during extension handshakes.
#[cfg(feature = "xkb")]
const XKB_VERSION: (u16, u16) = (1, 0);
#[cfg(feature = "sync")]
const SYNC_VERSION: (u8, u8) = (3, 1);
#[cfg(feature = "compositing")]
const COMPOSITE_VERSION: (u32, u32) = (0, 2);

/// One item read from the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery<E> {
    Event(E),
    Error(ProtocolError),
}

/// A live connection to the display server.
pub trait Transport: ExtensionProbe {
    /// Non-error event type read from the connection.
    type Event;

    /// Mark the connection descriptor close-on-exec.
    fn set_close_on_exec(&self) -> Result<(), DisplayError>;

    /// Round-trip barrier: returns once the server has processed every
    /// request issued before the call, so their errors are readable.
    fn sync(&self) -> Result<(), DisplayError>;

    /// Next already-received event or error, without blocking.
    fn poll(&self) -> Result<Option<Delivery<Self::Event>>, DisplayError>;
}

/// Opens transports.
pub trait Connector {
    type Transport: Transport;

    /// Connect to `display_name`, or the platform default when `None`.
    fn connect(&self, display_name: Option<&str>) -> Result<Self::Transport, DisplayError>;
}

/// Connects through x11rb's pure-Rust connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct X11Connector;

impl Connector for X11Connector {
    type Transport = X11Transport;

    fn connect(&self, display_name: Option<&str>) -> Result<X11Transport, DisplayError> {
        let (conn, screen_num) =
            RustConnection::connect(display_name).map_err(|e| DisplayError::Connect {
                display: display_name.unwrap_or("$DISPLAY").to_owned(),
                reason: e.to_string(),
            })?;

        tracing::debug!(screen = screen_num, "connected to X11 display");
        Ok(X11Transport { conn, screen_num })
    }
}

/// x11rb-backed [`Transport`].
pub struct X11Transport {
    conn: RustConnection,
    screen_num: usize,
}

impl X11Transport {
    /// Request-only view of the connection, for subsystems issuing their
    /// own requests.
    ///
    /// Events and errors are not readable through it: they must go
    /// through [`Session::poll_event`](super::Session::poll_event) so
    /// every error reaches the interceptor.
    ///
    /// ```compile_fail
    /// # fn read(t: &xdisplay::display::X11Transport) {
    /// use x11rb::connection::Connection;
    /// let _ = t.requests().poll_for_event();
    /// # }
    /// ```
    pub fn requests(&self) -> &impl RequestConnection {
        &self.conn
    }

    /// Connection setup sent by the server.
    pub fn setup(&self) -> &Setup {
        self.conn.setup()
    }

    /// Send buffered requests to the server.
    pub fn flush(&self) -> Result<(), DisplayError> {
        self.conn
            .flush()
            .map_err(|e| DisplayError::Transport(format!("flush: {e}")))
    }

    /// Default screen number (from the display name).
    pub fn screen_num(&self) -> usize {
        self.screen_num
    }

    /// Default screen.
    pub fn screen(&self) -> &Screen {
        &self.setup().roots[self.screen_num]
    }

    /// Root window of the default screen.
    pub fn root(&self) -> Window {
        self.screen().root
    }
}

impl ExtensionProbe for X11Transport {
    fn query(&self, ext: Extension) -> Result<Option<u8>, DisplayError> {
        let info = self
            .conn
            .extension_information(ext.protocol_name())
            .map_err(|e| DisplayError::Transport(format!("query {}: {e}", ext.protocol_name())))?;

        Ok(info.map(|info| info.first_event))
    }

    fn is_active(&self, ext: Extension) -> Result<bool, DisplayError> {
        match ext {
            #[cfg(feature = "xinerama")]
            Extension::Xinerama => {
                let reply = self
                    .conn
                    .xinerama_is_active()
                    .map_err(|e| DisplayError::Transport(format!("xinerama_is_active: {e}")))?
                    .reply();
                Ok(answered(ext, reply)?.is_some_and(|r| r.state != 0))
            }
            _ => Ok(true),
        }
    }

    fn initialize(&self, ext: Extension) -> Result<bool, DisplayError> {
        match ext {
            #[cfg(feature = "xkb")]
            Extension::Xkb => {
                let (major, minor) = XKB_VERSION;
                let reply = self
                    .conn
                    .xkb_use_extension(major, minor)
                    .map_err(|e| DisplayError::Transport(format!("xkb_use_extension: {e}")))?
                    .reply();
                Ok(answered(ext, reply)?.is_some_and(|r| r.supported))
            }
            #[cfg(feature = "sync")]
            Extension::Sync => {
                let (major, minor) = SYNC_VERSION;
                let reply = self
                    .conn
                    .sync_initialize(major, minor)
                    .map_err(|e| DisplayError::Transport(format!("sync_initialize: {e}")))?
                    .reply();
                Ok(answered(ext, reply)?.is_some())
            }
            _ => Ok(true),
        }
    }

    fn version(&self, ext: Extension) -> Result<Option<(u32, u32)>, DisplayError> {
        match ext {
            #[cfg(feature = "compositing")]
            Extension::Composite => {
                let (major, minor) = COMPOSITE_VERSION;
                let reply = self
                    .conn
                    .composite_query_version(major, minor)
                    .map_err(|e| DisplayError::Transport(format!("composite_query_version: {e}")))?
                    .reply();
                Ok(answered(ext, reply)?.map(|r| (r.major_version, r.minor_version)))
            }
            _ => Err(DisplayError::Unsupported {
                extension: ext,
                query: "version",
            }),
        }
    }
}

/// Map a handshake reply: a server-side rejection is `None`, a broken
/// connection is an error.
fn answered<T>(ext: Extension, reply: Result<T, ReplyError>) -> Result<Option<T>, DisplayError> {
    match reply {
        Ok(reply) => Ok(Some(reply)),
        Err(ReplyError::X11Error(e)) => {
            tracing::debug!(extension = %ext, error = ?e.error_kind, "handshake rejected");
            Ok(None)
        }
        Err(e) => Err(DisplayError::Transport(format!("{} handshake: {e}", ext.protocol_name()))),
    }
}

/// Split protocol errors off the event stream.
fn classify(event: Event) -> Delivery<Event> {
    match event {
        Event::Error(e) => Delivery::Error(ProtocolError::from(&e)),
        other => Delivery::Event(other),
    }
}

impl Transport for X11Transport {
    type Event = Event;

    fn set_close_on_exec(&self) -> Result<(), DisplayError> {
        let raw_fd = self.conn.stream().as_raw_fd();
        // SAFETY: raw_fd is the X11 connection fd, valid while conn is alive.
        let fd = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(())
    }

    fn sync(&self) -> Result<(), DisplayError> {
        xproto::get_input_focus(&self.conn)
            .map_err(|e| DisplayError::Transport(format!("sync: {e}")))?
            .reply()
            .map_err(|e| DisplayError::Transport(format!("sync reply: {e}")))?;
        Ok(())
    }

    fn poll(&self) -> Result<Option<Delivery<Event>>, DisplayError> {
        let event = self
            .conn
            .poll_for_event()
            .map_err(|e| DisplayError::Transport(format!("poll_for_event: {e}")))?;

        Ok(event.map(classify))
    }
}

impl From<&X11Error> for ProtocolError {
    fn from(e: &X11Error) -> Self {
        Self {
            code: e.error_code,
            kind: e.error_kind,
            sequence: e.sequence,
            bad_value: e.bad_value,
            major_opcode: e.major_opcode,
            minor_opcode: e.minor_opcode,
            request: e.request_name,
        }
    }
}
