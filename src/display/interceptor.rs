//! Protocol error interception: the handler every asynchronous server
//! error is routed through.
//!
//! The server reports a failed request some time after it was issued,
//! interleaved with unrelated replies and events. The session hands
//! each such error to [`ErrorInterceptor::handle`], which records it in
//! the `occurred` flag and decides, from the current mode and the
//! [`ErrorPolicy`], whether to surface it.
//!
//! Ignore mode lets a caller issue requests that are expected to fail
//! (e.g. against windows that may already be gone), then poll
//! `occurred` once instead of checking each request.

use std::collections::BTreeSet;
use std::fmt;

use x11rb::protocol::ErrorKind;
use x11rb::protocol::xproto::WINDOW_ERROR;

/// An error the server reported for an earlier request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    /// Raw error code (core codes, or extension base + offset).
    pub code: u8,
    /// Decoded error, e.g. `ErrorKind::Window`.
    pub kind: ErrorKind,
    /// Sequence number of the failed request.
    pub sequence: u16,
    /// Offending resource ID or value.
    pub bad_value: u32,
    pub major_opcode: u8,
    pub minor_opcode: u16,
    /// Request name, when the transport could decode it.
    pub request: Option<&'static str>,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, code: u8, sequence: u16) -> Self {
        Self {
            code,
            kind,
            sequence,
            bad_value: 0,
            major_opcode: 0,
            minor_opcode: 0,
            request: None,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self.kind, self.code)?;
        match self.request {
            Some(name) => write!(f, " from {name}")?,
            None => write!(f, " from request {}.{}", self.major_opcode, self.minor_opcode)?,
        }
        write!(f, ", value 0x{:x}, sequence {}", self.bad_value, self.sequence)
    }
}

/// What the interceptor did with one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Recorded only; ignore mode was on.
    Ignored,
    /// Recorded only; the error class is expected and benign.
    Suppressed,
    /// Recorded and logged as a diagnostic.
    Reported,
    /// Recorded; the policy says the process must terminate.
    Fatal,
}

/// Decides how errors outside ignore mode are surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPolicy {
    suppressed: BTreeSet<u8>,
    fatal: bool,
}

impl ErrorPolicy {
    /// Policy with no suppressed codes.
    pub fn new(fatal: bool) -> Self {
        Self {
            suppressed: BTreeSet::new(),
            fatal,
        }
    }

    /// Add an error code that is never surfaced.
    pub fn suppress(mut self, code: u8) -> Self {
        self.suppressed.insert(code);
        self
    }

    pub fn with_fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn is_suppressed(&self, code: u8) -> bool {
        self.suppressed.contains(&code)
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn suppressed(&self) -> impl Iterator<Item = u8> + '_ {
        self.suppressed.iter().copied()
    }
}

impl Default for ErrorPolicy {
    /// BadWindow suppressed; fatal in debug builds only.
    fn default() -> Self {
        Self::new(cfg!(debug_assertions)).suppress(WINDOW_ERROR)
    }
}

/// The two interceptor flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorState {
    /// An error was delivered since ignore mode was last entered.
    pub occurred: bool,
    /// Ignore mode is on.
    pub ignore: bool,
}

/// Error handler installed for the lifetime of a session.
#[derive(Debug)]
pub struct ErrorInterceptor {
    state: ErrorState,
    policy: ErrorPolicy,
    surfaced: u64,
}

impl ErrorInterceptor {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            state: ErrorState::default(),
            policy,
            surfaced: 0,
        }
    }

    /// Handle one delivered error.
    ///
    /// Always sets `occurred`. The caller acts on [`Disposition::Fatal`].
    pub fn handle(&mut self, error: &ProtocolError) -> Disposition {
        self.state.occurred = true;

        if self.state.ignore {
            tracing::debug!(code = error.code, %error, "ignoring X error");
            return Disposition::Ignored;
        }

        if self.policy.is_suppressed(error.code) {
            tracing::trace!(code = error.code, %error, "suppressed X error");
            return Disposition::Suppressed;
        }

        self.surfaced += 1;
        if self.policy.is_fatal() {
            Disposition::Fatal
        } else {
            tracing::warn!(code = error.code, %error, "X error");
            Disposition::Reported
        }
    }

    /// Switch ignore mode. Entering it clears `occurred`.
    ///
    /// Callers must have dispatched every error for earlier requests
    /// first; [`Session::ignore_errors`](super::Session::ignore_errors)
    /// does that with a round-trip.
    pub fn set_ignore(&mut self, ignore: bool) {
        self.state.ignore = ignore;
        if ignore {
            self.state.occurred = false;
        }
    }

    pub fn state(&self) -> ErrorState {
        self.state
    }

    pub fn occurred(&self) -> bool {
        self.state.occurred
    }

    pub fn ignoring(&self) -> bool {
        self.state.ignore
    }

    /// Number of errors surfaced (reported or fatal) so far.
    pub fn surfaced(&self) -> u64 {
        self.surfaced
    }

    pub fn policy(&self) -> &ErrorPolicy {
        &self.policy
    }
}
