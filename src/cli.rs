use clap::{Args, Parser, Subcommand};
use xdisplay::display::{ErrorPolicy, Extension, ExtensionSupport, SessionConfig};

#[derive(Parser)]
#[command(name = "xdisplay", about = "X11 display session probe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Open the display, print negotiated extensions, and close it
    Probe {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Verify that protocol errors are captured while ignoring them
    Check {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args)]
pub struct SessionArgs {
    /// Display to connect to (defaults to $DISPLAY)
    #[arg(long)]
    pub display: Option<String>,

    /// Skip negotiation of an extension (repeatable)
    #[arg(long = "disable", value_name = "EXTENSION")]
    pub disabled: Vec<Extension>,

    /// Protocol error code to suppress outside ignore mode (repeatable)
    #[arg(long = "suppress-error", value_name = "CODE")]
    pub suppressed: Vec<u8>,

    /// Abort on unexpected protocol errors [default: on in debug builds]
    #[arg(long, value_name = "BOOL")]
    pub fatal_errors: Option<bool>,
}

impl SessionArgs {
    pub fn config(&self) -> SessionConfig {
        let extensions = self
            .disabled
            .iter()
            .fold(ExtensionSupport::compiled(), |support, &ext| support.without(ext));

        let mut error_policy = ErrorPolicy::default();
        if let Some(fatal) = self.fatal_errors {
            error_policy = error_policy.with_fatal(fatal);
        }
        for &code in &self.suppressed {
            error_policy = error_policy.suppress(code);
        }

        SessionConfig {
            extensions,
            error_policy,
        }
    }
}
