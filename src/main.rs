use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use courier::core::config::{self, Config};
use courier::core::transfer::ProgressInfo;
use courier::db;
use courier::dispatcher::Dispatcher;
use courier::logging;
use courier::utils::short_uuid;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Dispatches queued study transfers")]
struct Cli {
    /// Directory holding courier.db and courier.log
    #[arg(long, global = true, default_value = "./state")]
    state_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher until Ctrl-C, then drain in-flight transfers
    Run,
    /// Put a completed, cancelled or failed session back on the queue (refused while in flight)
    Requeue { uuid: String },
    /// Show the most recent sessions
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (_guard, log_handle) = logging::init(Path::new(&cli.state_dir))?;

    let conn = db::init_db(&cli.state_dir)?;

    // First run: persist defaults so they can be edited in the settings table.
    if !db::has_settings(&conn)? {
        config::save_config_to_db(&conn, &Config::default())?;
    }
    let cfg = config::load_config_from_db(&conn)?;
    cfg.validate().context("invalid settings")?;

    if let Err(e) = logging::apply_level(&log_handle, &cfg.log_level) {
        tracing::error!("Failed to apply persisted log level '{}': {:#}", cfg.log_level, e);
    }

    match cli.command {
        Command::Run => run(conn, cfg).await,
        Command::Requeue { uuid } => {
            if !db::requeue_session(&conn, &uuid)? {
                bail!("no session with uuid {}", uuid);
            }
            println!("requeued {}", uuid);
            Ok(())
        }
        Command::List { limit } => {
            for s in db::list_sessions(&conn, limit)? {
                let progress = ProgressInfo {
                    files_sent: s.files_sent.max(0) as usize,
                    files_total: s.files_total.max(0) as usize,
                    bytes_sent: 0,
                };
                let percent = if progress.files_total > 0 {
                    format!("{:.0}%", progress.percent())
                } else {
                    "-".to_string()
                };
                println!(
                    "{:>6}  {}  {:<9}  queued={}  dest={}  {}/{} {:>4}  {}",
                    s.id,
                    short_uuid(&s.uuid),
                    s.status.as_str(),
                    u8::from(s.queued),
                    s.destination_id,
                    progress.files_sent,
                    progress.files_total,
                    percent,
                    s.error.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
    }
}

async fn run(conn: rusqlite::Connection, cfg: Config) -> Result<()> {
    tracing::info!("Starting courier dispatcher...");
    let conn = Arc::new(Mutex::new(conn));
    let dispatcher = Dispatcher::with_defaults(conn, cfg);
    let handle = dispatcher.handle();
    let join = dispatcher.start();

    tokio::signal::ctrl_c()
        .await
        .context("listen for ctrl-c")?;
    tracing::info!("Interrupt received, draining transfers");
    handle.stop();
    join.await.context("dispatcher task failed")?;
    Ok(())
}
