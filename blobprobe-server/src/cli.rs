use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use argh::FromArgs;
use blobprobe_service::{TestRunner, create_backend};

use crate::config::Config;
use crate::observability;

/// Measures the latency of a blob upload, delegated read URL, and download.
///
/// Prints one JSON record per run to stdout. The exit status reflects the outcome of the run:
/// 0 on success, 2 to 5 for a failed step, 130 when interrupted, and 1 for configuration errors.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// print the version and exit
    #[argh(switch, short = 'V')]
    pub version: bool,
}

/// Bootstrap the runtime and execute a single run.
pub fn execute() -> Result<ExitCode> {
    let args: Args = argh::from_env();

    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(args.config.as_deref())?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    config.validate()?;

    let backend = create_backend(config.storage_config()?)
        .context("failed to initialize storage backend")?;
    let runner =
        TestRunner::new(backend, config.runner_config()?).with_generator(config.payload_generator()?);

    tracing::info!(
        backend = runner.backend_name(),
        container = config.storage.container(),
        "Running blob storage performance test"
    );

    let report = runtime.block_on(runner.run_until(shutdown_signal()));

    let json = report
        .record()
        .to_json()
        .context("failed to serialize run record")?;
    println!("{json}");

    Ok(ExitCode::from(report.exit_code()))
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// If a signal handler cannot be installed, that signal is never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "failed to listen for ctrl-c"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
