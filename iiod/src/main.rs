//! Daemon entry point.

use std::net::TcpListener;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iiod::config::Args;
use iiod::daemon::{serve, Control, Outcome};
use iiod::{sim, IioContext, Registries, SessionOptions};

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    if args.ffs.is_some() {
        warn!(
            nb_pipes = args.nb_pipes,
            "USB FunctionFS carrier is not linked into this build; --ffs ignored"
        );
    }
    if let Some(uri) = &args.uri {
        info!(uri, "context selection is handled by the access layer; serving the simulated context");
    }

    let control = match Control::new() {
        Ok(control) => control,
        Err(e) => {
            error!("control setup failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = control.install_signals() {
        error!("signal setup failed: {e}");
        return ExitCode::FAILURE;
    }

    let options = SessionOptions { demux: args.demux };

    // SIGUSR1 re-runs the daemon loop after a full cleanup.
    loop {
        let ctx = sim::demo_context() as Arc<dyn IioContext>;
        let registries = Registries::new();

        let listener = match TcpListener::bind(("0.0.0.0", args.port)) {
            Ok(listener) => listener,
            Err(e) => {
                error!(port = args.port, "bind failed: {e}");
                return ExitCode::FAILURE;
            }
        };
        info!(port = args.port, "listening");

        match serve(
            listener,
            ctx,
            registries,
            options,
            args.serial.as_ref(),
            &control,
        ) {
            Ok(Outcome::Restart) => {
                control.clear_restart();
                info!("graceful restart");
            }
            Ok(Outcome::Shutdown) => {
                info!("shutting down");
                break;
            }
            Err(e) => {
                error!("daemon loop failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
