// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, Arg, ArgMatches};
use futures::future;
use tokio::runtime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use readyset::config::{self, Manifest, Settings};
use readyset::fork::OutputMode;
use readyset::procs::{self, Launcher, Registry, Supervisor};
use readyset::source::GitClone;
use readyset::status;
use readyset::Error;

const CONFIG: &str = "config";
const APPS_DIR: &str = "apps-dir";
const LISTEN: &str = "listen";
const OUTPUT: &str = "output";
const SHUTDOWN_GRACE: &str = "shutdown-grace";
const VERBOSE: &str = "verbose";

fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name(CONFIG)
                .short("c")
                .long(CONFIG)
                .value_name("FILE")
                .env("READYSET_CONFIG")
                .default_value(config::DEFAULT_CONFIG)
                .help("application manifest (YAML)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(APPS_DIR)
                .short("d")
                .long(APPS_DIR)
                .value_name("DIR")
                .env("READYSET_APPS_DIR")
                .default_value(config::DEFAULT_APPS_DIR)
                .help("directory each application is cloned into, as <DIR>/<name>")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(LISTEN)
                .short("l")
                .long(LISTEN)
                .value_name("ADDR")
                .env("READYSET_LISTEN")
                .default_value(config::DEFAULT_LISTEN)
                .validator_os(|s| {
                    s.to_string_lossy()
                        .parse::<std::net::SocketAddr>()
                        .map(|_| ())
                        .map_err(|_| OsString::from("socket address was expected"))
                })
                .help("address of the status endpoint")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(OUTPUT)
                .short("o")
                .long(OUTPUT)
                .value_name("MODE")
                .possible_values(&["inherit", "capture", "discard"])
                .default_value("inherit")
                .help("what to do with the output of launched commands")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(SHUTDOWN_GRACE)
                .long(SHUTDOWN_GRACE)
                .value_name("SECONDS")
                .default_value("5")
                .validator_os(|i| {
                    i.to_string_lossy()
                        .parse::<u64>()
                        .map(|_| ())
                        .map_err(|_| OsString::from("number was expected"))
                })
                .help("how long to wait for killed apps to exit, 0 exits immediately")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(VERBOSE)
                .short("v")
                .long(VERBOSE)
                .help("debug logging, unless RUST_LOG says otherwise"),
        )
}

fn settings(args: &ArgMatches<'_>) -> Result<Settings, Error> {
    let value = |name: &str| -> Result<String, Error> {
        args.value_of_lossy(name)
            .map(|v| v.into_owned())
            .ok_or_else(|| Error::from(format!("{} not specified", name)))
    };

    let listen = value(LISTEN)?;
    let grace = value(SHUTDOWN_GRACE)?;

    Ok(Settings {
        config: PathBuf::from(value(CONFIG)?),
        apps_dir: PathBuf::from(value(APPS_DIR)?),
        listen: listen
            .parse()
            .map_err(|_| format!("invalid listen address: {}", listen))?,
        output: value(OUTPUT)?.parse::<OutputMode>()?,
        shutdown_grace: Duration::from_secs(
            grace
                .parse()
                .map_err(|_| format!("invalid shutdown grace: {}", grace))?,
        ),
    })
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .init();
}

fn main() -> Result<(), Error> {
    let args = app().get_matches();
    init_tracing(args.is_present(VERBOSE));

    let settings = settings(&args)?;

    let runtime = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(settings))
}

async fn run(settings: Settings) -> Result<(), Error> {
    // nothing is touched if this fails
    let manifest = Manifest::load(&settings.config)?;
    info!(config = %settings.config.display(), apps = manifest.apps.len(), "config loaded");

    tokio::fs::create_dir_all(&settings.apps_dir)
        .await
        .map_err(|e| format!("failed to create {}: {}", settings.apps_dir.display(), e))?;

    let registry = Arc::new(Registry::new());
    let groups = procs::detect();
    let supervisor = Supervisor::new(Arc::clone(&registry), Arc::clone(&groups))
        .with_grace(settings.shutdown_grace);

    // installed before any app is set up, so every start from here on is covered
    let signals = ShutdownSignal::install()?;
    tokio::spawn(async move {
        let signal = signals.recv().await;
        info!(signal, "Shutting down all apps...");

        let report = supervisor.shutdown().await;
        if !report.failures.is_empty() {
            warn!(failures = report.failures.len(), "some apps could not be terminated cleanly");
        }

        std::process::exit(0);
    });

    let launcher = Launcher::new(
        settings.apps_dir.clone(),
        Arc::clone(&registry),
        groups,
        Arc::new(GitClone::new(settings.output)),
    )
    .with_output(settings.output);

    launcher.launch_all(&manifest.apps).await;

    let listen = settings.listen;
    tokio::spawn(async move {
        if let Err(e) = status::serve(listen, registry).await {
            error!("status endpoint failed: {}", e);
        }
    });

    // idle until the signal handler exits the process
    future::pending::<()>().await;
    Ok(())
}

/// Interrupt and terminate, each delivered at most once
#[cfg(unix)]
struct ShutdownSignal {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    fn install() -> Result<Self, Error> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(mut self) -> &'static str {
        use futures::future::FutureExt;
        use futures::select;

        select! {
            _ = self.interrupt.recv().fuse() => "SIGINT",
            _ = self.terminate.recv().fuse() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignal;

#[cfg(not(unix))]
impl ShutdownSignal {
    fn install() -> Result<Self, Error> {
        Ok(Self)
    }

    async fn recv(self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            return future::pending().await;
        }

        "ctrl-c"
    }
}
