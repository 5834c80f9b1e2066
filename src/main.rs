mod cli;

use clap::Parser;
use cli::{Cli, Command, SessionArgs};
use tracing_subscriber::EnvFilter;
use x11rb::protocol::xproto;
use xdisplay::display::{DisplayError, NoHooks, X11Connector, X11DisplayManager};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Probe { session } => probe(&session),
        Command::Check { session } => check(&session),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "xdisplay failed");
        eprintln!("xdisplay: {e}");
        std::process::exit(1);
    }
}

fn open(args: &SessionArgs) -> Result<X11DisplayManager, DisplayError> {
    let mut manager = X11DisplayManager::new(X11Connector, NoHooks, args.config());
    manager.try_open(args.display.as_deref())?;
    Ok(manager)
}

/// Print one line per known extension.
fn probe(args: &SessionArgs) -> Result<(), DisplayError> {
    let mut manager = open(args)?;

    if let Some(session) = manager.session() {
        let screen = session.transport().screen();
        println!(
            "screen {} ({}x{}), root 0x{:x}",
            session.transport().screen_num(),
            screen.width_in_pixels,
            screen.height_in_pixels,
            screen.root
        );
        for info in session.extensions().iter() {
            match info.event_base() {
                Some(base) => println!("{:<10} present  event_base={base}", info.extension),
                None => println!("{:<10} absent", info.extension),
            }
        }
    }

    manager.close();
    Ok(())
}

/// Free a pixmap that cannot exist while ignoring errors, then report
/// whether the interceptor saw the server's BadPixmap.
fn check(args: &SessionArgs) -> Result<(), DisplayError> {
    let mut manager = open(args)?;
    let Some(session) = manager.session_mut() else {
        return Ok(());
    };

    session.ignore_errors(true)?;
    let cookie = xproto::free_pixmap(session.transport().requests(), x11rb::NONE)
        .map_err(|e| DisplayError::Transport(format!("free_pixmap: {e}")))?;
    // Unchecked: the error arrives through the event queue.
    drop(cookie);
    session.ignore_errors(false)?;

    let occurred = session.error_occurred()?;
    println!("error intercepted under ignore mode: {occurred}");

    manager.close();
    if occurred {
        Ok(())
    } else {
        Err(DisplayError::Transport(
            "server accepted a request that should have failed".into(),
        ))
    }
}
