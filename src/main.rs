//! swarm-downloader - Main entry point

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use swarm_downloader::{
    collect_contacts, CliArgs, Config, DhtConfig, DhtCrawler, DownloadConfig, DownloadManager, Mode, PeerContact,
    TorrentError, TorrentInfo, TorrentParser,
};
use tracing::{debug, error, info, warn};

/// Log panics through tracing before the default hook runs
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        }
        default_hook(panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    setup_panic_handler();
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args).context("Invalid arguments")?;
    config.validate().context("Invalid configuration")?;

    match config.mode {
        Mode::Download {
            torrent_file,
            output_dir,
            peers,
            dht_peers,
            dht_wait,
            download,
        } => {
            let torrent = load_torrent_file(&torrent_file)?;
            display_torrent_info(&torrent, &output_dir, &download);

            let mut contacts = peers;
            if dht_peers > 0 {
                let found = discover_peers(&torrent, config.dht, dht_peers, dht_wait).await?;
                let mut known: HashSet<PeerContact> = contacts.iter().cloned().collect();
                contacts.extend(found.into_iter().filter(|contact| known.insert(contact.clone())));
            }
            if contacts.is_empty() {
                return Err(TorrentError::peer_error("No peers to download from").into());
            }

            run_download(torrent, contacts, download, &output_dir).await
        }
        Mode::Crawl { info_hash, limit } => run_crawl(info_hash, config.dht, limit).await,
    }
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized");
}

fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    TorrentParser::parse_file(path).with_context(|| format!("Failed to load torrent file {}", path.display()))
}

fn display_torrent_info(torrent: &TorrentInfo, output_dir: &Path, download: &DownloadConfig) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent.name);
    println!("  Size: {} bytes", torrent.length);
    println!("  Pieces: {} x {} bytes", torrent.piece_count(), torrent.piece_length);
    println!("  Info hash: {}", torrent.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", output_dir.display());
    println!("  Block size: {}", download.block_size);
    println!("  Pieces in flight: {}", download.max_in_flight);
    println!("  Peer failures: {:?}", download.peer_failure_policy);
    println!();
}

/// Crawl the DHT until `count` distinct contacts are found or `wait` runs out
async fn discover_peers(
    torrent: &TorrentInfo,
    dht: DhtConfig,
    count: usize,
    wait: std::time::Duration,
) -> Result<Vec<PeerContact>> {
    info!("Looking for {} peers on the DHT", count);
    let (crawler, mut contacts) = DhtCrawler::new(torrent.info_hash, dht);
    let crawl = crawler.start()?;

    let found = collect_contacts(&mut contacts, count, wait).await;
    crawl.abort();
    info!(
        "DHT crawl found {} peers ({} nodes known, {} candidates dropped)",
        found.len(),
        crawler.registry_len(),
        crawler.dropped_count()
    );
    if found.len() < count {
        warn!("Wanted {} DHT peers, continuing with {}", count, found.len());
    }
    Ok(found.into_iter().map(PeerContact::from).collect())
}

async fn run_download(
    torrent: TorrentInfo,
    contacts: Vec<PeerContact>,
    download: DownloadConfig,
    output_dir: &Path,
) -> Result<()> {
    let name = torrent.name.clone();
    let manager = DownloadManager::new(torrent, contacts, download, output_dir)
        .await
        .context("Failed to set up download")?;

    match manager.start().await {
        Ok(Ok(())) => {
            info!("Download completed successfully");
            println!("Saved {}", output_dir.join(&name).display());
            Ok(())
        }
        Ok(Err(e)) => {
            match e.downcast_ref::<TorrentError>() {
                Some(err) if err.is_fatal() => {
                    error!("Download aborted, partial data left in {}.part: {}", name, err)
                }
                _ => error!("Download failed: {}", e),
            }
            Err(e)
        }
        Err(e) => Err(TorrentError::peer_error(format!("Download task failed: {}", e)).into()),
    }
}

/// Print contacts as they are discovered
async fn run_crawl(info_hash: [u8; 20], dht: DhtConfig, limit: Option<usize>) -> Result<()> {
    let (crawler, mut contacts) = DhtCrawler::new(info_hash, dht);
    let crawl = crawler.start()?;

    let mut seen = HashSet::new();
    while let Some(contact) = contacts.recv().await {
        if !seen.insert(contact) {
            continue;
        }
        println!("{}", contact);
        if limit.is_some_and(|limit| seen.len() >= limit) {
            break;
        }
    }

    crawl.abort();
    info!(
        "Crawl stopped after {} peers ({} nodes known, {} candidates dropped)",
        seen.len(),
        crawler.registry_len(),
        crawler.dropped_count()
    );
    Ok(())
}
