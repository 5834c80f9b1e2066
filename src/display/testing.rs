//! Scripted in-process stand-in for a display server.
//!
//! [`FakeServer`] is a cloneable handle onto shared state: tests keep
//! one handle to script the server and inspect what the session did,
//! while the session owns a [`FakeTransport`] built from another.

use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;

use x11rb::protocol::ErrorKind;

use super::extension::{Extension, ExtensionProbe};
use super::interceptor::ProtocolError;
use super::transport::{Connector, Delivery, Transport};
use super::DisplayError;

#[derive(Debug)]
pub struct FakeState {
    /// Extensions the server has, with their event bases.
    pub extensions: BTreeMap<Extension, u8>,
    pub inactive: BTreeSet<Extension>,
    pub init_fails: BTreeSet<Extension>,
    pub query_fails: BTreeSet<Extension>,
    /// `None` makes the server reject the version handshake.
    pub composite_version: Option<(u32, u32)>,
    pub cloexec_fails: bool,
    pub reachable: bool,

    /// Errors for requests the server has not answered yet.
    pub in_flight: VecDeque<ProtocolError>,
    /// Items already readable by the client.
    pub received: VecDeque<Delivery<u32>>,

    /// Extensions queried, in order.
    pub queried: Vec<Extension>,
    pub syncs: usize,
    /// Lifecycle log shared with hooks.
    pub log: Vec<String>,
    next_sequence: u16,
}

#[derive(Debug, Clone)]
pub struct FakeServer {
    state: Rc<RefCell<FakeState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState {
                extensions: BTreeMap::new(),
                inactive: BTreeSet::new(),
                init_fails: BTreeSet::new(),
                query_fails: BTreeSet::new(),
                composite_version: Some((0, 4)),
                cloexec_fails: false,
                reachable: true,
                in_flight: VecDeque::new(),
                received: VecDeque::new(),
                queried: Vec::new(),
                syncs: 0,
                log: Vec::new(),
                next_sequence: 1,
            })),
        }
    }

    pub fn with_extension(self, ext: Extension, event_base: u8) -> Self {
        self.state().extensions.insert(ext, event_base);
        self
    }

    pub fn state(&self) -> RefMut<'_, FakeState> {
        self.state.borrow_mut()
    }

    pub fn log(&self, entry: impl Into<String>) {
        self.state().log.push(entry.into());
    }

    /// Issue a request the server will reject with `kind`. The error is
    /// not readable until the server catches up (see [`Self::deliver`]
    /// or a sync).
    pub fn fail_request(&self, kind: ErrorKind, code: u8) {
        let mut state = self.state();
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.wrapping_add(1);
        state.in_flight.push_back(ProtocolError::new(kind, code, sequence));
    }

    /// Let the server answer everything issued so far.
    pub fn deliver(&self) {
        let mut state = self.state();
        while let Some(error) = state.in_flight.pop_front() {
            state.received.push_back(Delivery::Error(error));
        }
    }

    /// Queue a non-error event, readable immediately.
    pub fn send_event(&self, event: u32) {
        self.state().received.push_back(Delivery::Event(event));
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }
}

impl ExtensionProbe for FakeServer {
    fn query(&self, ext: Extension) -> Result<Option<u8>, DisplayError> {
        let mut state = self.state();
        state.queried.push(ext);
        if state.query_fails.contains(&ext) {
            return Err(DisplayError::Transport(format!("query {ext}: broken pipe")));
        }
        Ok(state.extensions.get(&ext).copied())
    }

    fn is_active(&self, ext: Extension) -> Result<bool, DisplayError> {
        Ok(!self.state().inactive.contains(&ext))
    }

    fn initialize(&self, ext: Extension) -> Result<bool, DisplayError> {
        Ok(!self.state().init_fails.contains(&ext))
    }

    fn version(&self, ext: Extension) -> Result<Option<(u32, u32)>, DisplayError> {
        match ext {
            Extension::Composite => Ok(self.state().composite_version),
            _ => Err(DisplayError::Unsupported {
                extension: ext,
                query: "version",
            }),
        }
    }
}

/// Session-owned end of a [`FakeServer`]. Logs `release` when dropped.
#[derive(Debug)]
pub struct FakeTransport {
    server: FakeServer,
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.server.log("release");
    }
}

impl ExtensionProbe for FakeTransport {
    fn query(&self, ext: Extension) -> Result<Option<u8>, DisplayError> {
        self.server.query(ext)
    }

    fn is_active(&self, ext: Extension) -> Result<bool, DisplayError> {
        self.server.is_active(ext)
    }

    fn initialize(&self, ext: Extension) -> Result<bool, DisplayError> {
        self.server.initialize(ext)
    }

    fn version(&self, ext: Extension) -> Result<Option<(u32, u32)>, DisplayError> {
        self.server.version(ext)
    }
}

impl Transport for FakeTransport {
    type Event = u32;

    fn set_close_on_exec(&self) -> Result<(), DisplayError> {
        if self.server.state().cloexec_fails {
            return Err(DisplayError::CloseOnExec(nix::Error::EBADF));
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), DisplayError> {
        self.server.state().syncs += 1;
        self.server.deliver();
        Ok(())
    }

    fn poll(&self) -> Result<Option<Delivery<u32>>, DisplayError> {
        Ok(self.server.state().received.pop_front())
    }
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    server: FakeServer,
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(&self, display_name: Option<&str>) -> Result<FakeTransport, DisplayError> {
        self.server.log(format!("connect {}", display_name.unwrap_or("default")));
        if !self.server.state().reachable {
            return Err(DisplayError::Connect {
                display: display_name.unwrap_or("default").to_owned(),
                reason: "connection refused".into(),
            });
        }
        Ok(FakeTransport {
            server: self.server.clone(),
        })
    }
}
