use boltd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use boltd_consensus::{consensus_params, hash256_from_hex, Checkpoint, ConsensusParams, Network};
use boltd_headerchain::{HeaderChain, HeaderStore};
use boltd_primitives::genesis::genesis_block;
use boltd_primitives::hash::hash256_to_hex;
use boltd_storage::{BlockArchive, SnapshotSlots};
use boltd_sync::{SyncConfig, SyncMetrics, Synchronizer};
use boltd_utxo::TableId;
use fs2::FileExt;
use serde_json::json;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_PRUNE_DEPTH: i32 = 100;
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const HEADERS_FILE_NAME: &str = "headers.dat";
const BLOCKS_DIR_NAME: &str = "blocks";
const SNAPSHOTS_DIR_NAME: &str = "snapshots";

struct Config {
    data_dir: PathBuf,
    network: Network,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
    parse_workers: usize,
    snapshot_interval: u32,
    blocks_per_batch: usize,
    download_tasks: usize,
    prune_depth: i32,
    extra_checkpoints: Vec<Checkpoint>,
    stats_json: bool,
}

enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

fn usage() -> String {
    [
        "usage: boltd [options]",
        "",
        "  --datadir <path>            data directory (default: data)",
        "  --network <name>            mainnet | testnet | regtest",
        "  --log-level <level>         error | warn | info | debug | trace",
        "  --log-format <format>       text | json",
        "  --no-log-timestamps         omit timestamps from text logs",
        "  --parse-workers <n>         batch parse worker threads",
        "  --snapshot-interval <n>     batches between UTXO snapshots",
        "  --batch-blocks <n>          blocks per download batch",
        "  --download-tasks <n>        concurrent block downloads",
        "  --prune-depth <n>           drop forks this far behind main",
        "  --checkpoint <height:hash>  extra checkpoint (repeatable)",
        "  --stats-json                print final sync stats as JSON",
        "  --help, -h                  show this help",
        "  --version, -V               show version",
    ]
    .join("\n")
}

pub fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("boltd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(config),
    }
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut data_dir: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut log_level = logging::Level::Info;
    let mut log_format = logging::Format::Text;
    let mut log_timestamps = true;
    let defaults = SyncConfig::default();
    let mut parse_workers = defaults.parse_workers;
    let mut snapshot_interval = defaults.snapshot_interval;
    let mut blocks_per_batch = defaults.blocks_per_batch;
    let mut download_tasks = defaults.download_tasks;
    let mut prune_depth = DEFAULT_PRUNE_DEPTH;
    let mut extra_checkpoints = Vec::new();
    let mut stats_json = false;

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--datadir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --datadir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--no-log-timestamps" => log_timestamps = false,
            "--parse-workers" => {
                parse_workers = parse_number(&mut args, "--parse-workers")?;
            }
            "--snapshot-interval" => {
                snapshot_interval = parse_number(&mut args, "--snapshot-interval")?;
            }
            "--batch-blocks" => {
                blocks_per_batch = parse_number(&mut args, "--batch-blocks")?;
            }
            "--download-tasks" => {
                download_tasks = parse_number(&mut args, "--download-tasks")?;
            }
            "--prune-depth" => {
                prune_depth = parse_number(&mut args, "--prune-depth")?;
            }
            "--checkpoint" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --checkpoint\n{}", usage()))?;
                extra_checkpoints.push(parse_checkpoint(&value)?);
            }
            "--stats-json" => stats_json = true,
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    Ok(CliAction::Run(Config {
        data_dir: data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
        network,
        log_level,
        log_format,
        log_timestamps,
        parse_workers,
        snapshot_interval,
        blocks_per_batch,
        download_tasks,
        prune_depth,
        extra_checkpoints,
        stats_json,
    }))
}

fn parse_number<T: std::str::FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T, String> {
    let value = args
        .next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))?;
    value
        .parse::<T>()
        .map_err(|_| format!("invalid value '{value}' for {flag}\n{}", usage()))
}

fn parse_checkpoint(raw: &str) -> Result<Checkpoint, String> {
    let (height, hash) = raw
        .split_once(':')
        .ok_or_else(|| format!("checkpoint must be height:hash, got '{raw}'"))?;
    let height = height
        .parse::<i32>()
        .map_err(|_| format!("invalid checkpoint height '{height}'"))?;
    let hash =
        hash256_from_hex(hash).map_err(|err| format!("invalid checkpoint hash '{hash}': {err}"))?;
    Ok(Checkpoint { height, hash })
}

fn run_with_config(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    let start_time = Instant::now();

    std::fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("cannot create data dir {}: {err}", config.data_dir.display()))?;
    let lock_path = config.data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|err| format!("cannot open {}: {err}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "data directory {} is locked by another boltd",
            config.data_dir.display()
        )
    })?;

    let params = build_params(&config);
    let genesis = genesis_block(&params);
    log_info!(
        "Startup: network={}, data_dir={}, genesis={}",
        params.network.as_str(),
        config.data_dir.display(),
        hash256_to_hex(&genesis.header.hash())
    );

    let mut chain = HeaderChain::new(genesis.header, params.clone());
    let header_store = HeaderStore::new(config.data_dir.join(HEADERS_FILE_NAME));
    replay_headers(&mut chain, &header_store)?;
    log_info!(
        "header chain at height {} ({} headers, {} tips)",
        chain.main_height(),
        chain.header_count(),
        chain.tip_count()
    );

    let archive = BlockArchive::new(config.data_dir.join(BLOCKS_DIR_NAME))
        .map_err(|err| format!("cannot open block archive: {err}"))?;
    let slots = SnapshotSlots::new(config.data_dir.join(SNAPSHOTS_DIR_NAME))
        .map_err(|err| format!("cannot open snapshot dir: {err}"))?;
    let (utxo, outcome) =
        Synchronizer::recover_utxo(&slots, &genesis).map_err(|err| err.to_string())?;
    log_info!(
        "UTXO engine recovered ({outcome:?}): batch {}, height {}",
        utxo.archive_index(),
        utxo.block_height()
    );

    let chain = Arc::new(RwLock::new(chain));
    let sync = Synchronizer::new(
        Arc::clone(&chain),
        utxo,
        archive,
        slots,
        SyncConfig {
            parse_workers: config.parse_workers,
            snapshot_interval: config.snapshot_interval,
            blocks_per_batch: config.blocks_per_batch,
            download_tasks: config.download_tasks,
            ..SyncConfig::default()
        },
    );

    let metrics = sync.sync_from_archive().map_err(|err| err.to_string())?;
    log_info!(
        "archive replay complete: {} batches, {} blocks in {:.1}s; no network source configured",
        metrics.batches_merged,
        metrics.blocks_merged,
        start_time.elapsed().as_secs_f64()
    );

    {
        let mut chain = chain.write().expect("chain lock");
        chain.prune_forks(config.prune_depth);
        header_store
            .save(&chain.main_chain_headers())
            .map_err(|err| format!("cannot save headers: {err}"))?;
    }

    report(&sync, &metrics, config.stats_json);
    Ok(())
}

fn build_params(config: &Config) -> ConsensusParams {
    let mut params = consensus_params(config.network);
    let genesis_hash = genesis_block(&params).header.hash();
    params.checkpoints.push(Checkpoint {
        height: 0,
        hash: genesis_hash,
    });
    params
        .checkpoints
        .extend(config.extra_checkpoints.iter().copied());
    params
}

/// Rebuild the in-memory header tree from the persisted main chain. A bad
/// tail is dropped rather than fatal; the chain will re-extend from the
/// network.
fn replay_headers(chain: &mut HeaderChain, store: &HeaderStore) -> Result<(), String> {
    let headers = store.load().map_err(|err| err.to_string())?;
    let mut iter = headers.into_iter();
    if let Some(first) = iter.next() {
        if first.hash() != *chain.hash(chain.genesis()) {
            return Err("persisted headers do not start at this network's genesis".to_string());
        }
    }
    for header in iter {
        if let Err(err) = chain.insert_header(header) {
            log_warn!("dropping persisted headers from bad entry: {err}");
            break;
        }
    }
    Ok(())
}

fn report(sync: &Synchronizer, metrics: &SyncMetrics, as_json: bool) {
    let (height, last_hash, tables) = sync.with_utxo(|utxo| {
        (
            utxo.block_height(),
            hash256_to_hex(utxo.last_header_hash()),
            utxo.metrics(),
        )
    });

    if as_json {
        let stats = json!({
            "height": height,
            "last_block": last_hash,
            "batches_merged": metrics.batches_merged,
            "blocks_merged": metrics.blocks_merged,
            "transactions_merged": metrics.transactions_merged,
            "snapshots_written": metrics.snapshots_written,
            "tables": TableId::ALL
                .iter()
                .zip(tables.iter())
                .map(|(id, m)| {
                    json!({
                        "table": id.snapshot_file(),
                        "primary": m.primary,
                        "collision": m.collision,
                    })
                })
                .collect::<Vec<_>>(),
        });
        println!("{stats}");
    } else {
        log_info!(
            "height {height}, last block {last_hash}, entries {} / {} / {}",
            tables[0].primary + tables[0].collision,
            tables[1].primary + tables[1].collision,
            tables[2].primary + tables[2].collision
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_when_no_args() {
        let action = parse_args_from(args(&[])).expect("parse");
        let CliAction::Run(config) = action else {
            panic!("expected run action");
        };
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.prune_depth, DEFAULT_PRUNE_DEPTH);
    }

    #[test]
    fn parses_network_and_workers() {
        let action = parse_args_from(args(&[
            "--network",
            "regtest",
            "--parse-workers",
            "2",
            "--snapshot-interval",
            "50",
        ]))
        .expect("parse");
        let CliAction::Run(config) = action else {
            panic!("expected run action");
        };
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.parse_workers, 2);
        assert_eq!(config.snapshot_interval, 50);
    }

    #[test]
    fn rejects_unknown_argument() {
        assert!(parse_args_from(args(&["--bogus"])).is_err());
    }

    #[test]
    fn parses_checkpoint() {
        let checkpoint = parse_checkpoint(
            "10:00000000ffff0000000000000000000000000000000000000000000000000000",
        )
        .expect("checkpoint");
        assert_eq!(checkpoint.height, 10);
        assert!(parse_checkpoint("nope").is_err());
    }
}
