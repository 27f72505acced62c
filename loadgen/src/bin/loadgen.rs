use std::{
    env,
    num::{NonZeroU16, NonZeroU64},
    path::PathBuf,
};

use clap::Parser;
use loadgen::{
    config::{self, Config},
    generator::Pool,
    keys,
};
use tokio::{runtime::Builder, signal, task::JoinSet};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Keys(#[from] keys::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("Loadgen pool returned an error: {0}")]
    Generator(#[from] loadgen::generator::Error),
    #[error("Invalid endpoint URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    #[error(transparent)]
    Registration(#[from] loadgen_signal::RegisterError),
    #[error("Could not join the spawned pool task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn default_report_interval() -> NonZeroU64 {
    NonZeroU64::new(10).expect("10 is non-zero")
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// address of the ledger-data service to query
    endpoint: String,
    /// path to a file with one base64-encoded ledger key per line
    key_file: PathBuf,
    /// number of concurrent worker loops
    #[clap(default_value_t = NonZeroU16::MIN)]
    workers: NonZeroU16,
    /// base seed for random key selection, drawn from OS entropy when unset
    #[clap(long)]
    seed: Option<u64>,
    /// emit a statistics block every this many queries on the reporting
    /// worker
    #[clap(long, default_value_t = default_report_interval())]
    report_interval: NonZeroU64,
}

fn expand_seed(seed: u64) -> [u8; 32] {
    let mut out = [0_u8; 32];
    for chunk in out.chunks_exact_mut(8) {
        chunk.copy_from_slice(&seed.to_le_bytes());
    }
    out
}

fn get_config(cli: &Cli) -> Result<Config, Error> {
    if let Ok(contents) = env::var("LOADGEN_CONFIG") {
        debug!("Using config from env var 'LOADGEN_CONFIG'");
        return Ok(Config::from_yaml(&contents)?);
    }

    Ok(Config {
        target_uri: cli.endpoint.parse()?,
        key_file: cli.key_file.clone(),
        workers: cli.workers,
        seed: cli.seed.map_or_else(rand::random, expand_seed),
        report_interval: cli.report_interval,
    })
}

/// Classify one pool join result: `None` to keep looping, `Some` to stop
/// with that outcome. A panicked pool task is an error, not a clean exit.
fn pool_exit(
    res: Result<Result<(), loadgen::generator::Error>, tokio::task::JoinError>,
) -> Option<Result<(), Error>> {
    match res {
        Ok(Ok(())) => {
            debug!("pool shut down successfully");
            None
        }
        Ok(Err(err)) => {
            error!("Pool shut down unexpectedly: {err}");
            Some(Err(Error::Generator(err)))
        }
        Err(err) => {
            error!("Could not join the spawned pool task: {err}");
            Some(Err(Error::Join(err)))
        }
    }
}

async fn inner_main(config: Config) -> Result<(), Error> {
    let keys = keys::load(&config.key_file)?;
    info!(
        "loaded {count} ledger keys from {path}",
        count = keys.len(),
        path = config.key_file.display()
    );

    let (shutdown_watcher, shutdown_broadcast) = loadgen_signal::signal();

    let mut psrv_joinset = JoinSet::new();
    let pool = Pool::new(&config, keys, shutdown_watcher.register()?)?;
    psrv_joinset.spawn(pool.spin());

    // If this watcher outlived the select loop below, `signal_and_wait`
    // would never return.
    drop(shutdown_watcher);

    let res = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break Ok(());
            },
            Some(res) = psrv_joinset.join_next() => {
                if let Some(outcome) = pool_exit(res) {
                    break outcome;
                }
            },
        }
    };
    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting loadgen {version} run.");

    let cli = Cli::parse();
    let config = get_config(&cli)?;

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config));
    info!("Bye!");
    res
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tokio::task::JoinSet;

    use super::{Cli, Error, expand_seed, get_config, pool_exit};

    #[test]
    fn workers_defaults_to_one() {
        let cli = Cli::parse_from(["loadgen", "http://localhost:11626", "keys.txt"]);
        assert_eq!(cli.workers.get(), 1);
        assert_eq!(cli.report_interval.get(), 10);
    }

    #[test]
    fn workers_positional_is_honored() {
        let cli = Cli::parse_from(["loadgen", "http://localhost:11626", "keys.txt", "4"]);
        assert_eq!(cli.workers.get(), 4);
    }

    #[test]
    fn zero_workers_is_a_usage_error() {
        let res = Cli::try_parse_from(["loadgen", "http://localhost:11626", "keys.txt", "0"]);
        assert!(res.is_err());
    }

    #[test]
    fn non_numeric_workers_is_a_usage_error() {
        let res = Cli::try_parse_from(["loadgen", "http://localhost:11626", "keys.txt", "lots"]);
        assert!(res.is_err());
    }

    #[test]
    fn missing_key_file_argument_is_a_usage_error() {
        let res = Cli::try_parse_from(["loadgen", "http://localhost:11626"]);
        assert!(res.is_err());
    }

    #[test]
    fn fixed_seed_is_reproducible() {
        let cli = Cli::parse_from([
            "loadgen",
            "http://localhost:11626",
            "keys.txt",
            "2",
            "--seed",
            "42",
        ]);
        let a = get_config(&cli).expect("config construction failed");
        let b = get_config(&cli).expect("config construction failed");
        assert_eq!(a.seed, b.seed);
        assert_eq!(a.seed, expand_seed(42));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicked_pool_task_is_an_error() {
        let mut joinset: JoinSet<Result<(), loadgen::generator::Error>> = JoinSet::new();
        joinset.spawn(async { panic!("worker pool blew up") });

        let res = joinset.join_next().await.expect("joinset was empty");
        let outcome = pool_exit(res).expect("a panicked task should stop the run");
        assert!(matches!(outcome, Err(Error::Join(_))));
    }

    #[test]
    fn clean_pool_shutdown_keeps_looping() {
        assert!(pool_exit(Ok(Ok(()))).is_none());
    }

    #[test]
    fn pool_error_stops_the_run() {
        let outcome = pool_exit(Ok(Err(loadgen::generator::Error::NoKeys)))
            .expect("a pool error should stop the run");
        assert!(matches!(outcome, Err(Error::Generator(_))));
    }

    #[test]
    fn bad_endpoint_uri_is_rejected() {
        let cli = Cli::parse_from(["loadgen", "not a uri at all", "keys.txt"]);
        assert!(get_config(&cli).is_err());
    }
}
