//! Now-playing submission daemon: argument handling, logging setup,
//! daemonisation, and signal installation around [`nowplay::Runtime`].

use clap::Parser;
use daemonize::Daemonize;
use nowplay::config::Config;
use nowplay::{Error, Runtime, Shutdown};
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{fmt, reload, EnvFilter};

#[derive(Parser)]
#[command(name = "nowplayd", version, about = "Now-playing submission daemon")]
struct Args {
    /// Configuration files; reads stdin when none are given.
    config: Vec<PathBuf>,
}

/// Parse arguments, load the configuration, daemonise, and run the chain
/// until a termination signal arrives.
pub fn run() -> Result<(), Error> {
    let args = Args::parse();

    // Log to stderr; RUST_LOG wins over the config file's loglevel.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let filter_from_env = env_filter.is_some();
    let (filter, filter_handle) =
        reload::Layer::new(env_filter.unwrap_or_else(|| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::new();
    if args.config.is_empty() {
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        config.parse_str(&text)?;
    } else {
        for path in &args.config {
            let text = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("open: {}: {}", path.display(), e)))?;
            config.parse_str(&text)?;
        }
    }

    let runtime = Runtime::new(config)?;

    if !filter_from_env {
        let directive = level_directive(runtime.settings().loglevel);
        let _ = filter_handle.modify(|filter| *filter = EnvFilter::new(directive));
    }

    info!("starting");
    let logfile = runtime.settings().logfile.clone();
    daemonize(logfile.as_deref())?;

    let workers = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    workers.block_on(async {
        let shutdown = Shutdown::new();
        install_signals(shutdown.clone());
        runtime.run(shutdown).await
    })
}

/// Detach from the terminal: double-fork, `setsid`, `chdir /`, standard
/// descriptors onto `/dev/null` — stderr onto the logfile when one is
/// configured (append, create, 0600).
fn daemonize(logfile: Option<&str>) -> Result<(), Error> {
    let mut daemon = Daemonize::new().working_directory("/");
    if let Some(path) = logfile {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::Config(format!("open: {}: {}", path, e)))?;
        daemon = daemon.stderr(file);
    }
    daemon
        .start()
        .map_err(|e| Error::Startup(format!("daemonize: {}", e)))
}

/// SIGHUP/INT/QUIT/TERM begin a clean shutdown; a second one aborts the
/// process.
fn install_signals(shutdown: Shutdown) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let installed = (
            signal(SignalKind::hangup()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
            signal(SignalKind::terminate()),
        );
        let (mut hangup, mut interrupt, mut quit, mut terminate) = match installed {
            (Ok(hup), Ok(int), Ok(quit), Ok(term)) => (hup, int, quit, term),
            _ => {
                error!("failed to install signal handlers");
                return;
            }
        };

        let mut already_stopping = false;
        loop {
            let name = tokio::select! {
                _ = hangup.recv() => "SIGHUP",
                _ = interrupt.recv() => "SIGINT",
                _ = quit.recv() => "SIGQUIT",
                _ = terminate.recv() => "SIGTERM",
            };
            if already_stopping {
                std::process::abort();
            }
            already_stopping = true;
            info!(signal = name, "got signal; exiting");
            shutdown.trigger();
        }
    });
}

/// Map the config file's numeric loglevel onto a tracing filter: 0 fatal,
/// 4 error, 8 warning, 12 notice, 16 debug.
fn level_directive(loglevel: u32) -> &'static str {
    match loglevel {
        0..=7 => "error",
        8..=11 => "warn",
        12..=15 => "info",
        _ => "debug",
    }
}
