use std::{error::Error, path::PathBuf, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueEnum, ValueHint};
use log::{debug, error, info, warn, LevelFilter};

use sptape::{
    config::Config,
    coordinator::{DownloadCoordinator, DownloadParam, Pipeline},
    error::ErrorKind,
    http,
    key_provider::{ChannelKeyProvider, KeyProvider},
    postprocess::Mp4Decrypt,
    resolve::StorageResolver,
    secrets::Secrets,
    session::Session,
    stream::HttpStreamOpener,
    track::{AudioFormat, Track},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Interval of progress reports.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Where content keys come from.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum KeySourceArg {
    /// Ask the access point
    #[default]
    Channel,

    /// Download files as served
    None,
}

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tracks to download, as GID:FILE_ID:DURATION_MS
    #[arg(required = true, value_name = "TRACK")]
    tracks: Vec<String>,

    /// Secrets file
    ///
    /// Ensure that the this file is kept secure and not shared publicly, as it
    /// contains tokens that grant access to your account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Directory for reusable login credentials
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    credentials_dir: Option<PathBuf>,

    /// Output directory
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value = ".")]
    output_dir: PathBuf,

    /// Audio format of the files
    #[arg(short, long, default_value_t = AudioFormat::default().to_string())]
    format: String,

    /// Number of concurrent downloads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Download at playback speed
    #[arg(long, default_value_t = false)]
    emulate_playback: bool,

    /// Where content keys come from
    #[arg(long, value_enum, default_value_t)]
    key_source: KeySourceArg,

    /// Path of mp4decrypt
    ///
    /// [default: search PATH]
    #[arg(long, value_name = "FILE", value_hint = ValueHint::ExecutablePath)]
    decrypt_tool: Option<PathBuf>,

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
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the tokens from a file.
///
/// # Errors
///
/// Returns an error if the file could not be read or parsed.
fn load_secrets(secrets_file: &str) -> sptape::error::Result<Secrets> {
    let secrets = Secrets::from_file(secrets_file);

    if let Err(ref e) = secrets {
        if e.kind == ErrorKind::NotFound {
            info!("copy secrets.toml.example to {secrets_file} and fill in your access token");
        }
    }

    secrets
}

/// Downloads all tracks on the command line.
///
/// # Errors
///
/// Returns an error when the setup fails or any download failed.
fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let format: AudioFormat = args.format.parse()?;
    let tracks = args
        .tracks
        .iter()
        .map(|track| Ok(track.parse::<Track>()?.with_format(format)))
        .collect::<sptape::error::Result<Vec<_>>>()?;

    let secrets = load_secrets(&args.secrets_file)?;

    let mut config = Config::new();
    if let Some(dir) = args.credentials_dir {
        config.credentials_dir = dir;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.decrypt_tool = args.decrypt_tool;

    let client = Arc::new(http::Client::new(&config)?);

    let key_provider: Option<Arc<dyn KeyProvider>> = match args.key_source {
        KeySourceArg::Channel => {
            let session = Session::connect(&config, &client, &secrets.access_token)?;
            info!("logged in as {}", session.username());
            Some(Arc::new(ChannelKeyProvider::new(Arc::new(session))))
        }
        KeySourceArg::None => None,
    };

    let resolver = StorageResolver::new(
        Arc::clone(&client),
        secrets.access_token.clone(),
        secrets.client_token.clone(),
    )?;
    let opener = HttpStreamOpener::new(Arc::clone(&client), config.max_cached_chunks);
    let pipeline = Pipeline::new(Arc::new(resolver), Arc::new(opener))
        .with_decrypt(Mp4Decrypt::locate(config.decrypt_tool.as_deref()));

    let coordinator = DownloadCoordinator::new(config.workers, pipeline)?;
    for track in tracks {
        let path = args.output_dir.join(track.file_name());
        let mut param = DownloadParam::new(track, path).with_playback_emulation(args.emulate_playback);
        if let Some(ref provider) = key_provider {
            param = param.with_key_provider(Arc::clone(provider));
        }
        coordinator.enqueue(param)?;
    }

    let total = args.tracks.len();
    while coordinator.outcomes()?.len() < total {
        if !coordinator.wait_for_change(PROGRESS_INTERVAL)? {
            for (id, progress) in coordinator.active()? {
                let eta = progress
                    .eta()
                    .map_or_else(|| "unknown".to_owned(), |eta| format!("{}s", eta.as_secs()));
                info!(
                    "{id}: {} {:.0}%, {eta} left",
                    progress.track,
                    progress.fraction() * 100.0
                );
            }
        }
    }

    let outcomes = coordinator.wait_idle()?;
    coordinator.shutdown();

    let failed = outcomes
        .iter()
        .filter(|outcome| outcome.result.is_err())
        .count();
    if failed > 0 {
        warn!("{failed} of {total} downloads failed");
        return Err(format!("{failed} downloads failed").into());
    }

    info!("downloaded {total} tracks");
    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and downloads the tracks.
fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();
    let lang = String::from("en");

    info!("starting {name}/{version}; {BUILD_PROFILE}; {lang}");

    if let Err(e) = run(args) {
        error!("{e}");
        process::exit(1);
    }
}
