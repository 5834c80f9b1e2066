//! X11 display session core.
//!
//! Owns the process's single connection to the display server,
//! negotiates optional protocol extensions, and intercepts the
//! asynchronous protocol errors the server reports. See [`display`].

pub mod display;
