//! Session lifecycle: open/close orchestration and the live session.
//!
//! [`DisplayManager`] owns at most one [`Session`]. Opening runs, in
//! order: connect, close-on-exec, error handler installation, extension
//! negotiation, then the startup and reload hooks. Closing runs the
//! shutdown hook and then drops the connection.
//!
//! # Error delivery
//!
//! Asynchronous protocol errors reach the session's [`ErrorInterceptor`]
//! only while the session reads from the connection: [`Session::sync`],
//! [`Session::dispatch_pending`], [`Session::poll_event`],
//! [`Session::error_occurred`], and [`Session::ignore_errors`]. After
//! `sync` returns, every error for a request issued before it has been
//! handled. Events read along the way are queued for `poll_event`; the
//! queue holds at most [`EVENT_BACKLOG`] events and drops the oldest
//! once full.

use std::collections::VecDeque;

use super::extension::{self, ExtensionRegistry, ExtensionSupport};
use super::interceptor::{Disposition, ErrorInterceptor, ErrorPolicy, ErrorState, ProtocolError};
use super::transport::{Connector, Delivery, Transport};
use super::DisplayError;

/// Lifecycle hooks for subsystems layered on the session.
///
/// `startup` (property cache) and `reload` (keyboard mapping) run once
/// per successful open, in that order, after extension negotiation.
/// `shutdown` (keyboard mapping) runs once per close, before the
/// connection is released.
pub trait SessionHooks<T: Transport> {
    fn startup(&mut self, _session: &mut Session<T>) {}
    fn reload(&mut self, _session: &mut Session<T>) {}
    fn shutdown(&mut self, _session: &mut Session<T>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<T: Transport> SessionHooks<T> for NoHooks {}

/// Per-session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Extensions to negotiate.
    pub extensions: ExtensionSupport,
    /// How protocol errors outside ignore mode are surfaced.
    pub error_policy: ErrorPolicy,
}

/// Events a session keeps between reads before dropping the oldest.
pub const EVENT_BACKLOG: usize = 4096;

/// A live display server session.
pub struct Session<T: Transport> {
    transport: T,
    extensions: ExtensionRegistry,
    errors: ErrorInterceptor,
    pending: VecDeque<T::Event>,
    dropped_events: u64,
    on_fatal: fn(&ProtocolError) -> !,
}

fn abort_on_fatal(error: &ProtocolError) -> ! {
    tracing::error!(code = error.code, %error, "X error");
    std::process::abort()
}

impl<T: Transport> Session<T> {
    /// Set up a session on a freshly connected transport.
    ///
    /// Never fails: close-on-exec is best-effort and missing extensions
    /// are recorded as absent.
    pub(crate) fn establish(transport: T, config: &SessionConfig) -> Self {
        if let Err(e) = transport.set_close_on_exec() {
            tracing::warn!(error = %e, "failed to set display as close-on-exec");
        }

        let errors = ErrorInterceptor::new(config.error_policy.clone());
        let extensions = extension::negotiate(&transport, &config.extensions);

        Self {
            transport,
            extensions,
            errors,
            pending: VecDeque::new(),
            dropped_events: 0,
            on_fatal: abort_on_fatal,
        }
    }

    /// The transport, for issuing requests. Events and errors must be
    /// read through [`Self::poll_event`] so the interceptor sees them.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn interceptor(&self) -> &ErrorInterceptor {
        &self.errors
    }

    /// Events read from the connection but not yet returned by
    /// [`Self::poll_event`].
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Events discarded because the backlog was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Interceptor flags as of the last read from the connection.
    pub fn error_state(&self) -> ErrorState {
        self.errors.state()
    }

    /// Whether an error has been delivered since ignore mode was last
    /// entered. Handles already-received errors first, without a
    /// round-trip.
    pub fn error_occurred(&mut self) -> Result<bool, DisplayError> {
        self.dispatch_pending()?;
        Ok(self.errors.occurred())
    }

    /// Enter or leave ignore mode.
    ///
    /// Syncs with the server first, so errors for requests issued
    /// before this call are handled under the previous mode. Entering
    /// ignore mode clears `occurred`. If the sync fails the mode is
    /// left unchanged.
    pub fn ignore_errors(&mut self, enable: bool) -> Result<(), DisplayError> {
        self.sync()?;
        self.errors.set_ignore(enable);
        tracing::trace!(ignore = enable, "error ignore mode changed");
        Ok(())
    }

    /// Round-trip with the server, then handle everything it sent.
    pub fn sync(&mut self) -> Result<(), DisplayError> {
        self.transport.sync()?;
        self.dispatch_pending()
    }

    /// Read everything already received without blocking. Errors go to
    /// the interceptor; events are queued for [`Self::poll_event`].
    pub fn dispatch_pending(&mut self) -> Result<(), DisplayError> {
        while let Some(delivery) = self.transport.poll()? {
            match delivery {
                Delivery::Error(error) => self.deliver_error(&error),
                Delivery::Event(event) => self.queue_event(event),
            }
        }
        Ok(())
    }

    fn queue_event(&mut self, event: T::Event) {
        if self.pending.len() >= EVENT_BACKLOG {
            self.pending.pop_front();
            self.dropped_events += 1;
            if self.dropped_events == 1 {
                tracing::warn!(backlog = EVENT_BACKLOG, "event backlog full, dropping oldest events");
            }
        }
        self.pending.push_back(event);
    }

    /// Next event, in arrival order, without blocking. Errors read
    /// while looking for it are handled on the way.
    pub fn poll_event(&mut self) -> Result<Option<T::Event>, DisplayError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        while let Some(delivery) = self.transport.poll()? {
            match delivery {
                Delivery::Error(error) => self.deliver_error(&error),
                Delivery::Event(event) => return Ok(Some(event)),
            }
        }
        Ok(None)
    }

    fn deliver_error(&mut self, error: &ProtocolError) {
        if self.errors.handle(error) == Disposition::Fatal {
            (self.on_fatal)(error);
        }
    }
}

/// Owns the process's display session.
pub struct DisplayManager<C: Connector, H: SessionHooks<C::Transport>> {
    connector: C,
    hooks: H,
    config: SessionConfig,
    session: Option<Session<C::Transport>>,
}

impl<C: Connector, H: SessionHooks<C::Transport>> DisplayManager<C, H> {
    pub fn new(connector: C, hooks: H, config: SessionConfig) -> Self {
        Self {
            connector,
            hooks,
            config,
            session: None,
        }
    }

    /// Open the display. `None` or an empty name selects the platform
    /// default. Returns whether a session is live afterwards.
    ///
    /// On failure nothing is left behind: no session, no registry, no
    /// hooks run.
    pub fn open(&mut self, display_name: Option<&str>) -> bool {
        match self.try_open(display_name) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to open display");
                false
            }
        }
    }

    /// Fallible form of [`Self::open`].
    ///
    /// If a session is already live it is kept and no second
    /// connection is made.
    pub fn try_open(&mut self, display_name: Option<&str>) -> Result<(), DisplayError> {
        if self.session.is_some() {
            tracing::warn!("display already open, keeping existing session");
            return Ok(());
        }

        let display_name = display_name.filter(|name| !name.is_empty());
        let transport = self.connector.connect(display_name)?;
        let session = self.session.insert(Session::establish(transport, &self.config));

        self.hooks.startup(session);
        self.hooks.reload(session);

        tracing::info!(
            extensions = session.extensions().iter().filter(|info| info.present).count(),
            "display opened"
        );
        Ok(())
    }

    /// Run the shutdown hook and release the connection. No-op when
    /// nothing is open.
    pub fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        self.hooks.shutdown(&mut session);
        drop(session);
        tracing::debug!("display closed");
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&Session<C::Transport>> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session<C::Transport>> {
        self.session.as_mut()
    }

    /// Negotiated extensions, or `None` when no session is live.
    pub fn extensions(&self) -> Option<&ExtensionRegistry> {
        self.session.as_ref().map(Session::extensions)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }
}

impl<C: Connector, H: SessionHooks<C::Transport>> Drop for DisplayManager<C, H> {
    fn drop(&mut self) {
        self.close();
    }
}
