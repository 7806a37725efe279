use std::{process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use spoli::{
    broker::Broker,
    browser::{Browser, Chrome},
    config::Config,
    console::{self, Console, Input, HELP},
    controller::Controller,
    error::{Error, ErrorKind, Result},
    events::Event,
    handshake::{Device, Handshake, HandshakeError},
    remote::{PlaybackService, WebApi},
    signal,
    token::AccessToken,
    watcher::Watcher,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Holds the Spotify access token. Keep this file private: anyone who
    /// reads it can control your Spotify account until the token expires.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Device name
    ///
    /// Set the device name as it appears in Spotify clients.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// DevTools endpoint
    ///
    /// Of a Chromium-based browser started with `--remote-debugging-port`,
    /// either its `http://` address or its `ws://` debugger URL.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url, env = "SPOLI_DEVTOOLS_URL", default_value = Config::DEFAULT_DEVTOOLS_URL)]
    devtools_url: Url,

    /// Seconds to wait for the browser to report a device
    #[arg(long, value_name = "SECONDS", default_value_t = Config::DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    handshake_timeout: u64,

    /// Device setup attempts before giving up
    #[arg(long, value_name = "COUNT", default_value_t = Config::DEFAULT_HANDSHAKE_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    handshake_attempts: u32,

    /// Do not start playing after taking over playback
    #[arg(long, default_value_t = false)]
    no_autoplay: bool,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            // Quiet and verbose are mutually exclusive, and `verbose` is 0 by
            // default. So this arm means: quiet mode.
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module("spoli", level);
    }

    logger.init();
}

/// Loads the access token, with a hint when the secrets file is missing.
fn load_token(secrets_file: &str) -> Result<AccessToken> {
    let token = AccessToken::from_file(secrets_file);

    if let Err(ref e) = token {
        if e.kind == ErrorKind::NotFound {
            info!("copy secrets.toml.example to {secrets_file} and set your access token");
        }
    }

    token
}

/// Sets up the playback device, unless a shutdown signal comes first.
///
/// Returns `Ok(None)` on shutdown.
async fn connect(
    handshake: &Handshake,
    signals: &mut signal::Handler,
    shutdown: &CancellationToken,
) -> std::result::Result<Option<Device>, HandshakeError> {
    let cancel = shutdown.child_token();
    let attempt = handshake.run_with_retry(&cancel);
    tokio::pin!(attempt);

    loop {
        tokio::select! {
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, cancelling device setup");
                    cancel.cancel();
                    return Ok(None);
                }
                debug!("already setting up a device, ignoring {signal}");
            }

            result = &mut attempt => return result.map(Some),
        }
    }
}

/// Main application loop.
///
/// Sets up the playback device, then forwards console input to the broker
/// until the user quits or a shutdown signal arrives. A reconnect request
/// replaces the device with a new one.
///
/// # Errors
///
/// Returns an error when the device cannot be set up or the console fails.
async fn run(args: Args) -> Result<()> {
    let access_token = load_token(&args.secrets_file)?;

    let mut config = Config::with_access_token(access_token);
    if let Some(name) = args.name {
        config.device_name = name;
    }
    config.devtools_url = args.devtools_url;
    config.handshake_timeout = Duration::from_secs(args.handshake_timeout);
    config.handshake_attempts = args.handshake_attempts;
    config.transfer_autoplay = !args.no_autoplay;

    let service: Arc<dyn PlaybackService> = Arc::new(WebApi::new(&config)?);
    let browser: Arc<dyn Browser> = Arc::new(Chrome::new(&config)?);

    let (broker, commands, dispatcher) = Broker::new(&config);
    console::show_track_changes(&broker);

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn(dispatcher.run(shutdown.clone()));
    tasks.spawn(Controller::new(Arc::clone(&service), commands).run(shutdown.clone()));
    tasks.spawn(
        Watcher::new(Arc::clone(&service), broker.clone(), config.poll_interval)
            .run(shutdown.clone()),
    );

    let handshake = Handshake::new(&config, browser, service);
    let mut signals = signal::Handler::new()?;
    let mut console = Console::stdin();

    let mut device: Option<Device> = None;
    let mut reconnect = true;

    let result = loop {
        if reconnect {
            reconnect = false;
            // The old page must be gone before the new one reports in.
            drop(device.take());

            match connect(&handshake, &mut signals, &shutdown).await {
                Ok(Some(new_device)) => {
                    println!("{} is ready; h for help", config.device_name);
                    device = Some(new_device);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(Error::from(e)),
            }
        }

        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break Ok(());
                }
                info!("received {signal}, reconnecting");
                reconnect = true;
            }

            input = console.next() => match input {
                Ok(Some(Input::Command(kind))) => {
                    if !broker.submit_command(Event::new(kind)).await {
                        warn!("{kind} was dropped, try again");
                    }
                }
                Ok(Some(Input::Reconnect)) => reconnect = true,
                Ok(Some(Input::Help)) => println!("{HELP}"),
                Ok(Some(Input::Quit) | None) => break Ok(()),
                Err(e) => break Err(e),
            }
        }
    };

    drop(device);
    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("task failed: {e}");
        }
    }

    result
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    // Exit right away: dropping the runtime would wait for the blocking
    // stdin read, which only returns on the next line of input.
    match run(args).await {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
