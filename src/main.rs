use anyhow::Result;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::{Duration, Instant};
use teloxide::prelude::*;
use tokio::time::sleep;

use tubegrab::cli::{Cli, Commands};
use tubegrab::core::utils::sanitize_filename;
use tubegrab::core::{config, init_logger, metrics};
use tubegrab::download::link::{validate_url, CanonicalResolver};
use tubegrab::download::orchestrator::{self, fetch_media, DownloadSettings};
use tubegrab::download::progress::EditDebouncer;
use tubegrab::download::source::SourceRegistry;
use tubegrab::download::ytdlp;
use tubegrab::download::{DownloadQueue, Quality, SendAs};
use tubegrab::payment::{HttpPaymentProvider, TokenLedger};
use tubegrab::storage::cache::DeliveryCache;
use tubegrab::storage::create_pool;
use tubegrab::telegram::{
    create_bot, process_queue, schema, setup_bot_commands, spawn_debounce_eviction, subscriptions,
    HandlerDeps, UploadDispatcher,
};

/// Main entry point for the Telegram bot
///
/// Parses CLI arguments and dispatches to the appropriate subcommand.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Panics inside the dispatcher are logged and recovered from, not fatal
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    // Load environment variables from .env if present
    let _ = dotenv();

    // Initialize logger (console + file)
    init_logger(&config::LOG_FILE_PATH)?;

    match cli.command {
        Some(Commands::Run) | None => run_bot().await,
        Some(Commands::Download { url, audio, output }) => run_cli_download(url, audio, output).await,
        Some(Commands::UpdateYtdlp) => run_ytdlp_update().await,
    }
}

/// Run the Telegram bot
async fn run_bot() -> Result<()> {
    let boot_start = Instant::now();
    log::info!("Starting tubegrab...");

    metrics::init_metrics();

    // Never block boot on a yt-dlp release check
    ytdlp::check_and_update_ytdlp().await;

    match orchestrator::sweep_stale_work_dirs().await {
        Ok(0) => {}
        Ok(n) => log::info!("Removed {} stale work dir(s) from a previous run", n),
        Err(e) => log::warn!("Could not sweep stale work dirs: {}", e),
    }

    let bot = create_bot()?;

    // A local Bot API server can take a while to come up; retry get_me
    // instead of crash-looping the whole process.
    let bot_info = {
        let startup_max_retries = 60;
        let mut startup_retry = 0;
        loop {
            match bot.get_me().await {
                Ok(info) => break info,
                Err(e) => {
                    let err_str = e.to_string();
                    let is_retryable = err_str.contains("restart")
                        || err_str.contains("network")
                        || err_str.contains("connection")
                        || err_str.contains("timed out")
                        || err_str.contains("Connection refused");

                    startup_retry += 1;
                    if startup_retry >= startup_max_retries || !is_retryable {
                        return Err(anyhow::anyhow!(
                            "Failed to connect to Bot API after {} retries: {}",
                            startup_retry,
                            e
                        ));
                    }

                    log::warn!(
                        "Bot API not ready (attempt {}/{}): {}. Retrying in 5 seconds...",
                        startup_retry,
                        startup_max_retries,
                        err_str
                    );
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    };
    log::info!("Bot username: {:?}, Bot ID: {}", bot_info.username, bot_info.id);

    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Could not register the command menu: {}", e);
    }

    // Create database connection pool
    let db_pool = Arc::new(
        create_pool(&config::DATABASE_PATH)
            .map_err(|e| anyhow::anyhow!("Failed to create database pool: {}", e))?,
    );

    let queue = Arc::new(DownloadQueue::new());
    let cache = DeliveryCache::new((*db_pool).clone());
    let ledger = TokenLedger::new((*db_pool).clone());
    let resolver = Arc::new(CanonicalResolver::new()?);
    let debouncer = Arc::new(EditDebouncer::new());
    let dispatcher = UploadDispatcher::new(cache.clone(), (*db_pool).clone());

    let provider = match HttpPaymentProvider::from_env() {
        Ok(p) => p.map(Arc::new),
        Err(e) => {
            log::warn!("Payment provider misconfigured, /redeem disabled: {}", e);
            None
        }
    };
    if provider.is_some() {
        log::info!("External payment redemption enabled");
    }

    let deps = HandlerDeps {
        db_pool: Arc::clone(&db_pool),
        queue: Arc::clone(&queue),
        registry: Arc::new(SourceRegistry::default_registry()),
        cache,
        ledger,
        resolver,
        debouncer: Arc::clone(&debouncer),
        provider,
        dispatcher,
        started_at: Instant::now(),
    };

    // Background workers: queue consumer, debounce eviction, channel polling
    tokio::spawn(process_queue(bot.clone(), deps.clone()));
    spawn_debounce_eviction(debouncer);
    tokio::spawn(subscriptions::poll_subscriptions(bot.clone(), deps.clone()));

    let handler = schema(deps);

    let mut retry_count = 0;
    let max_retries = config::retry::MAX_DISPATCHER_RETRIES;

    log::info!(
        "Bot initialization complete in {:.2}s, polling for updates",
        boot_start.elapsed().as_secs_f64()
    );

    // Run the dispatcher with retry logic
    loop {
        let bot_clone = bot.clone();
        let handler_clone = handler.clone();

        // A fresh dispatcher per attempt, in its own task so a panic inside
        // teloxide is caught via the JoinHandle instead of killing main
        let handle = tokio::spawn(async move {
            use teloxide::update_listeners::Polling;

            let listener = Polling::builder(bot_clone.clone()).drop_pending_updates().build();

            Dispatcher::builder(bot_clone, handler_clone)
                .dependencies(DependencyMap::new())
                .enable_ctrlc_handler()
                .build()
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await
        });

        match handle.await {
            Ok(()) => {
                log::info!("Dispatcher shutdown gracefully");
                break;
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    log::error!("Dispatcher panicked: {}", join_err);

                    if retry_count < max_retries {
                        retry_count += 1;
                        log::info!("Retrying dispatcher connection (attempt {}/{})...", retry_count, max_retries);
                        exponential_backoff(retry_count).await;
                    } else {
                        log::error!("Max retries reached after panic. Exiting...");
                        break;
                    }
                } else {
                    log::warn!("Dispatcher task was cancelled: {}", join_err);
                    break;
                }
            }
        }

        // Add a delay between retries to avoid hammering the API
        if retry_count > 0 {
            sleep(config::retry::dispatcher_delay()).await;
        }
    }

    Ok(())
}

/// Run one download from the command line, bypassing the bot entirely
async fn run_cli_download(url: String, audio: bool, output: Option<String>) -> Result<()> {
    let url = validate_url(&url)?;
    let registry = SourceRegistry::default_registry();
    let source = registry
        .resolve(&url)
        .ok_or_else(|| anyhow::anyhow!("no backend can handle {}", url))?;

    let settings = DownloadSettings {
        quality: if audio { Quality::Audio } else { Quality::High },
        send_as: if audio { SendAs::Audio } else { SendAs::Video },
        custom_height: None,
    };

    println!("Fetching {} via {}...", url, source.name());
    let (progress_tx, mut progress_rx) =
        tokio::sync::mpsc::unbounded_channel::<tubegrab::download::source::SourceProgress>();
    let printer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(p) = progress_rx.recv().await {
            print!("\r{:>3}%", p.percent);
            let _ = std::io::stdout().flush();
        }
    });

    let fetched = fetch_media(source.as_ref(), &url, &settings, progress_tx).await?;
    let _ = printer.await;
    println!();

    let out_dir = output.unwrap_or_else(|| ".".to_string());
    let mut saved = Vec::new();
    for file in &fetched.files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_filename)
            .ok_or_else(|| anyhow::anyhow!("downloaded file has no name"))?;
        let target = std::path::Path::new(&out_dir).join(&name);
        fs_err::tokio::copy(file, &target).await?;
        saved.push(target);
    }
    fetched.cleanup().await;

    for target in saved {
        println!("Saved {}", target.display());
    }
    Ok(())
}

/// Update yt-dlp and exit
async fn run_ytdlp_update() -> Result<()> {
    let before = ytdlp::current_version().await.unwrap_or_else(|_| "unknown".to_string());
    println!("Current yt-dlp: {}", before);

    let result = ytdlp::update_ytdlp().await?;
    println!("{}", result);
    Ok(())
}

/// Exponential backoff delay for retries
async fn exponential_backoff(retry_count: u32) {
    let delay = Duration::from_secs(config::retry::EXPONENTIAL_BACKOFF_BASE.pow(retry_count));
    sleep(delay).await;
}
