//! Extension negotiation: probes each optional protocol extension and
//! records presence plus event base in an [`ExtensionRegistry`].
//!
//! The set of extensions is fixed. Each one is probed independently;
//! absence is never an error, only a diagnostic. Some extensions carry
//! an extra acceptance rule beyond presence (see [`Requirement`]).

use std::fmt;
use std::str::FromStr;

use super::DisplayError;

/// Optional protocol extensions known to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Extension {
    /// X Keyboard extension (keyboard mapping).
    Xkb,
    /// Non-rectangular window shapes.
    Shape,
    /// Multi-monitor layout.
    Xinerama,
    /// Output configuration.
    Randr,
    /// Counters and alarms.
    Sync,
    /// Off-screen window compositing.
    Composite,
    /// Damage tracking.
    Damage,
    /// Render extension.
    Render,
    /// Resource fixes (XFIXES).
    Fixes,
}

/// Extra condition an extension must meet before it counts as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Presence on the server is enough.
    Presence,
    /// The server must also report the extension as active.
    Active,
    /// A client initialization handshake must also succeed.
    Initialized,
    /// The server's version must be at least `major.minor`.
    MinVersion { major: u32, minor: u32 },
}

impl Extension {
    pub const COUNT: usize = 9;

    /// Every known extension, in registry order.
    pub const ALL: [Extension; Self::COUNT] = [
        Extension::Xkb,
        Extension::Shape,
        Extension::Xinerama,
        Extension::Randr,
        Extension::Sync,
        Extension::Composite,
        Extension::Damage,
        Extension::Render,
        Extension::Fixes,
    ];

    /// Name the server knows the extension by (QueryExtension argument).
    pub fn protocol_name(self) -> &'static str {
        match self {
            Extension::Xkb => "XKEYBOARD",
            Extension::Shape => "SHAPE",
            Extension::Xinerama => "XINERAMA",
            Extension::Randr => "RANDR",
            Extension::Sync => "SYNC",
            Extension::Composite => "Composite",
            Extension::Damage => "DAMAGE",
            Extension::Render => "RENDER",
            Extension::Fixes => "XFIXES",
        }
    }

    /// Human-readable name used in diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            Extension::Xkb => "XKB",
            Extension::Shape => "X Shape",
            Extension::Xinerama => "Xinerama",
            Extension::Randr => "XRandR",
            Extension::Sync => "X Sync",
            Extension::Composite => "X Composite",
            Extension::Damage => "X Damage",
            Extension::Render => "X Render",
            Extension::Fixes => "X Fixes",
        }
    }

    /// Short lowercase identifier, as accepted by [`FromStr`].
    pub fn key(self) -> &'static str {
        match self {
            Extension::Xkb => "xkb",
            Extension::Shape => "shape",
            Extension::Xinerama => "xinerama",
            Extension::Randr => "randr",
            Extension::Sync => "sync",
            Extension::Composite => "composite",
            Extension::Damage => "damage",
            Extension::Render => "render",
            Extension::Fixes => "fixes",
        }
    }

    /// Acceptance rule applied after the presence query succeeds.
    pub fn requirement(self) -> Requirement {
        match self {
            Extension::Xkb | Extension::Sync => Requirement::Initialized,
            Extension::Xinerama => Requirement::Active,
            // 0.2 introduced NameWindowPixmap.
            Extension::Composite => Requirement::MinVersion { major: 0, minor: 2 },
            _ => Requirement::Presence,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.key())
    }
}

impl FromStr for Extension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Extension::ALL
            .into_iter()
            .find(|ext| ext.key() == lower || ext.protocol_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown extension: {s:?}"))
    }
}

/// Whether a reported version satisfies a minimum `major.minor`.
pub fn version_at_least(major: u32, minor: u32, min_major: u32, min_minor: u32) -> bool {
    major > min_major || (major == min_major && minor >= min_minor)
}

/// Server queries needed to negotiate extensions.
///
/// Each method is a stateless query against the live connection.
/// `Err` means the query itself failed (e.g. connection lost); a
/// server answering "no" is `Ok(None)` / `Ok(false)`.
pub trait ExtensionProbe {
    /// Presence query. Returns the event base if the server has it.
    fn query(&self, ext: Extension) -> Result<Option<u8>, DisplayError>;

    /// Liveness check for extensions that can be present but inactive.
    fn is_active(&self, ext: Extension) -> Result<bool, DisplayError>;

    /// Client initialization handshake.
    fn initialize(&self, ext: Extension) -> Result<bool, DisplayError>;

    /// Version negotiation. Returns the server's `(major, minor)`, or
    /// `None` if the server rejected the request.
    fn version(&self, ext: Extension) -> Result<Option<(u32, u32)>, DisplayError>;
}

/// Set of extensions this build (and configuration) will negotiate.
///
/// Disabled extensions are never queried and always reported absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSupport {
    enabled: [bool; Extension::COUNT],
}

impl ExtensionSupport {
    /// Support as compiled into this build via Cargo features.
    pub fn compiled() -> Self {
        let compositing = cfg!(feature = "compositing");
        let mut support = Self::none();
        support.set(Extension::Xkb, cfg!(feature = "xkb"));
        support.set(Extension::Shape, cfg!(feature = "shape"));
        support.set(Extension::Xinerama, cfg!(feature = "xinerama"));
        support.set(Extension::Randr, cfg!(feature = "randr"));
        support.set(Extension::Sync, cfg!(feature = "sync"));
        support.set(Extension::Composite, compositing);
        support.set(Extension::Damage, compositing);
        support.set(Extension::Render, compositing);
        support.set(Extension::Fixes, compositing);
        support
    }

    /// Every extension enabled.
    pub fn all() -> Self {
        Self {
            enabled: [true; Extension::COUNT],
        }
    }

    /// No extension enabled.
    pub fn none() -> Self {
        Self {
            enabled: [false; Extension::COUNT],
        }
    }

    /// Return a copy with `ext` disabled.
    pub fn without(mut self, ext: Extension) -> Self {
        self.set(ext, false);
        self
    }

    pub fn set(&mut self, ext: Extension, enabled: bool) {
        self.enabled[ext.index()] = enabled;
    }

    pub fn is_enabled(&self, ext: Extension) -> bool {
        self.enabled[ext.index()]
    }
}

impl Default for ExtensionSupport {
    fn default() -> Self {
        Self::compiled()
    }
}

/// Negotiated state of one extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionInfo {
    pub extension: Extension,
    pub present: bool,
    event_base: u8,
}

impl ExtensionInfo {
    fn absent(extension: Extension) -> Self {
        Self {
            extension,
            present: false,
            event_base: 0,
        }
    }

    fn present(extension: Extension, event_base: u8) -> Self {
        Self {
            extension,
            present: true,
            event_base,
        }
    }

    /// Event base, or `None` when the extension is absent.
    pub fn event_base(&self) -> Option<u8> {
        self.present.then_some(self.event_base)
    }
}

/// Per-extension negotiation results for one session.
///
/// Built once by [`negotiate`]; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRegistry {
    entries: [ExtensionInfo; Extension::COUNT],
}

impl ExtensionRegistry {
    pub fn get(&self, ext: Extension) -> &ExtensionInfo {
        &self.entries[ext.index()]
    }

    pub fn present(&self, ext: Extension) -> bool {
        self.get(ext).present
    }

    pub fn event_base(&self, ext: Extension) -> Option<u8> {
        self.get(ext).event_base()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionInfo> {
        self.entries.iter()
    }
}

/// Result of probing a single extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Present { event_base: u8 },
    /// Support not enabled for this build; no query was made.
    Disabled,
    Missing,
    Inactive,
    InitFailed,
    VersionTooOld { major: u32, minor: u32 },
    /// The server refused the version handshake.
    VersionRejected,
    QueryFailed(String),
}

/// Probe one extension and apply its [`Requirement`].
pub fn probe<P: ExtensionProbe + ?Sized>(
    probe: &P,
    ext: Extension,
    support: &ExtensionSupport,
) -> ProbeOutcome {
    if !support.is_enabled(ext) {
        return ProbeOutcome::Disabled;
    }

    let event_base = match probe.query(ext) {
        Ok(Some(base)) => base,
        Ok(None) => return ProbeOutcome::Missing,
        Err(e) => return ProbeOutcome::QueryFailed(e.to_string()),
    };

    let accepted = match ext.requirement() {
        Requirement::Presence => Ok(ProbeOutcome::Present { event_base }),
        Requirement::Active => probe.is_active(ext).map(|active| {
            if active {
                ProbeOutcome::Present { event_base }
            } else {
                ProbeOutcome::Inactive
            }
        }),
        Requirement::Initialized => probe.initialize(ext).map(|ok| {
            if ok {
                ProbeOutcome::Present { event_base }
            } else {
                ProbeOutcome::InitFailed
            }
        }),
        Requirement::MinVersion {
            major: min_major,
            minor: min_minor,
        } => probe.version(ext).map(|version| match version {
            Some((major, minor)) if version_at_least(major, minor, min_major, min_minor) => {
                ProbeOutcome::Present { event_base }
            }
            Some((major, minor)) => ProbeOutcome::VersionTooOld { major, minor },
            None => ProbeOutcome::VersionRejected,
        }),
    };

    accepted.unwrap_or_else(|e| ProbeOutcome::QueryFailed(e.to_string()))
}

/// Probe every known extension and build the registry.
///
/// Emits one diagnostic per extension that ends up absent, except
/// those disabled for this build.
pub fn negotiate<P: ExtensionProbe + ?Sized>(
    prober: &P,
    support: &ExtensionSupport,
) -> ExtensionRegistry {
    let entries = Extension::ALL.map(|ext| {
        let outcome = probe(prober, ext, support);
        report(ext, &outcome);
        match outcome {
            ProbeOutcome::Present { event_base } => ExtensionInfo::present(ext, event_base),
            _ => ExtensionInfo::absent(ext),
        }
    });

    ExtensionRegistry { entries }
}

fn report(ext: Extension, outcome: &ProbeOutcome) {
    match outcome {
        ProbeOutcome::Present { event_base } => {
            tracing::debug!(extension = %ext, event_base, "extension present");
        }
        ProbeOutcome::Disabled => {
            tracing::debug!(extension = %ext, "extension support not enabled");
        }
        ProbeOutcome::Missing => {
            tracing::info!(extension = %ext, "{} extension is not present on the server", ext.label());
        }
        ProbeOutcome::Inactive => {
            tracing::info!(extension = %ext, "{} extension is present but not active", ext.label());
        }
        ProbeOutcome::InitFailed => {
            tracing::info!(extension = %ext, "{} extension failed to initialize", ext.label());
        }
        ProbeOutcome::VersionTooOld { major, minor } => {
            tracing::info!(
                extension = %ext,
                major,
                minor,
                "{} extension is an incompatible version",
                ext.label()
            );
        }
        ProbeOutcome::VersionRejected => {
            tracing::info!(
                extension = %ext,
                "{} extension is an incompatible version",
                ext.label()
            );
        }
        ProbeOutcome::QueryFailed(error) => {
            tracing::warn!(extension = %ext, %error, "{} extension query failed", ext.label());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::testing::FakeServer;

    #[test]
    fn composite_version_gate() {
        let min = |major, minor| version_at_least(major, minor, 0, 2);
        assert!(!min(0, 0));
        assert!(!min(0, 1));
        assert!(min(0, 2));
        assert!(min(0, 4));
        assert!(min(1, 0));
        assert!(min(2, 1));
    }

    #[test]
    fn composite_version_probe() {
        let cases = [((0, 1), false), ((0, 2), true), ((1, 0), true)];
        for ((major, minor), expected) in cases {
            let server = FakeServer::new().with_extension(Extension::Composite, 90);
            server.state().composite_version = Some((major, minor));
            let registry = negotiate(&server, &ExtensionSupport::all());
            assert_eq!(
                registry.present(Extension::Composite),
                expected,
                "composite {major}.{minor}"
            );
        }
    }

    #[test]
    fn composite_too_old_reports_version() {
        let server = FakeServer::new().with_extension(Extension::Composite, 90);
        server.state().composite_version = Some((0, 1));
        assert_eq!(
            probe(&server, Extension::Composite, &ExtensionSupport::all()),
            ProbeOutcome::VersionTooOld { major: 0, minor: 1 }
        );
    }

    #[test]
    fn rejected_version_handshake_is_incompatible() {
        let server = FakeServer::new()
            .with_extension(Extension::Composite, 90)
            .with_extension(Extension::Damage, 91);
        server.state().composite_version = None;
        assert_eq!(
            probe(&server, Extension::Composite, &ExtensionSupport::all()),
            ProbeOutcome::VersionRejected
        );

        let registry = negotiate(&server, &ExtensionSupport::all());
        assert!(!registry.present(Extension::Composite));
        assert!(registry.present(Extension::Damage));
    }

    #[test]
    fn present_extensions_carry_event_base() {
        let server = FakeServer::new()
            .with_extension(Extension::Shape, 64)
            .with_extension(Extension::Damage, 91);
        let registry = negotiate(&server, &ExtensionSupport::all());

        assert!(registry.present(Extension::Shape));
        assert_eq!(registry.event_base(Extension::Shape), Some(64));
        assert_eq!(registry.event_base(Extension::Damage), Some(91));
        assert!(!registry.present(Extension::Randr));
        assert_eq!(registry.event_base(Extension::Randr), None);
    }

    #[test]
    fn registry_matches_server_support() {
        let server = FakeServer::new()
            .with_extension(Extension::Xkb, 85)
            .with_extension(Extension::Randr, 89)
            .with_extension(Extension::Render, 0)
            .with_extension(Extension::Fixes, 87);
        let registry = negotiate(&server, &ExtensionSupport::all());

        for info in registry.iter() {
            let expected = matches!(
                info.extension,
                Extension::Xkb | Extension::Randr | Extension::Render | Extension::Fixes
            );
            assert_eq!(info.present, expected, "{}", info.extension);
            assert_eq!(info.event_base().is_some(), expected);
        }
    }

    #[test]
    fn inactive_xinerama_is_absent() {
        let server = FakeServer::new().with_extension(Extension::Xinerama, 0);
        server.state().inactive.insert(Extension::Xinerama);
        let registry = negotiate(&server, &ExtensionSupport::all());
        assert!(!registry.present(Extension::Xinerama));
    }

    #[test]
    fn active_xinerama_is_present() {
        let server = FakeServer::new().with_extension(Extension::Xinerama, 0);
        let registry = negotiate(&server, &ExtensionSupport::all());
        assert!(registry.present(Extension::Xinerama));
        assert_eq!(registry.event_base(Extension::Xinerama), Some(0));
    }

    #[test]
    fn sync_initialize_failure_downgrades() {
        let server = FakeServer::new().with_extension(Extension::Sync, 83);
        server.state().init_fails.insert(Extension::Sync);
        assert_eq!(
            probe(&server, Extension::Sync, &ExtensionSupport::all()),
            ProbeOutcome::InitFailed
        );
    }

    #[test]
    fn disabled_extension_is_never_queried() {
        let server = FakeServer::new()
            .with_extension(Extension::Composite, 90)
            .with_extension(Extension::Shape, 64);
        let support = ExtensionSupport::all().without(Extension::Composite);
        let registry = negotiate(&server, &support);

        assert!(!registry.present(Extension::Composite));
        assert!(registry.present(Extension::Shape));
        assert!(!server.state().queried.contains(&Extension::Composite));
    }

    #[test]
    fn query_failure_only_affects_that_extension() {
        let server = FakeServer::new()
            .with_extension(Extension::Render, 0)
            .with_extension(Extension::Shape, 64);
        server.state().query_fails.insert(Extension::Render);
        let registry = negotiate(&server, &ExtensionSupport::all());

        assert!(!registry.present(Extension::Render));
        assert!(registry.present(Extension::Shape));
    }

    #[test]
    fn every_extension_is_probed_once() {
        let server = FakeServer::new();
        negotiate(&server, &ExtensionSupport::all());
        let mut queried = server.state().queried.clone();
        queried.sort();
        assert_eq!(queried, Extension::ALL.to_vec());
    }

    #[test]
    fn parse_extension_names() {
        assert_eq!("xkb".parse::<Extension>(), Ok(Extension::Xkb));
        assert_eq!("Composite".parse::<Extension>(), Ok(Extension::Composite));
        assert_eq!("XFIXES".parse::<Extension>(), Ok(Extension::Fixes));
        assert_eq!("fixes".parse::<Extension>(), Ok(Extension::Fixes));
        assert!("glx".parse::<Extension>().is_err());
    }

    #[test]
    fn support_toggles() {
        let support = ExtensionSupport::all().without(Extension::Sync);
        assert!(!support.is_enabled(Extension::Sync));
        assert!(support.is_enabled(Extension::Xkb));
        assert!(!ExtensionSupport::none().is_enabled(Extension::Xkb));
    }
}
