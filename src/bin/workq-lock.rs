//! workq-lock CLI: operator interface to job locks and the job queue.

use chrono::Utc;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use workq_lock::config::Config;
use workq_lock::db::Db;
use workq_lock::model::JobMessage;
use workq_lock::telemetry::{TelemetryConfig, init_telemetry};
use workq_lock::{ClassLock, DefaultPolicy, JobArgs, LockKey, LockPolicy, LockStore};

#[derive(Parser)]
#[command(name = "workq-lock", about = "Job locks for pgmq workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run migrations and create the job queue
    Init,
    /// Inspect and clear lock records
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Enqueue a job
    Enqueue {
        /// Job name
        job: String,
        /// Arguments as a JSON array
        #[arg(default_value = "[]")]
        args: String,
        /// Seconds before the job becomes visible
        #[arg(long, default_value_t = 0)]
        delay: i32,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// List held locks, oldest first
    List {
        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show one lock
    Show {
        /// Lock key
        key: String,
    },
    /// Delete a lock record (e.g. one left behind by a failed release)
    Clear {
        /// Lock key
        key: String,
    },
    /// Print the key a job invocation would lock on
    Key {
        /// Job name
        job: String,
        /// Arguments as a JSON array
        #[arg(default_value = "[]")]
        args: String,
        /// Lock per job name instead of per arguments
        #[arg(long)]
        class: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Deriving a key needs no database.
    if let Command::Locks {
        action: LockAction::Key { job, args, class },
    } = &cli.command
    {
        return cmd_lock_key(job, args, *class);
    }

    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq-lock".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;

    match cli.command {
        Command::Init => {
            db.migrate().await?;
            db.create_queue(&config.queue).await?;
            println!("Migrated; queue '{}' ready.", config.queue);
            Ok(())
        }
        Command::Locks { action } => match action {
            LockAction::List { prefix } => cmd_lock_list(&db, prefix.as_deref()).await,
            LockAction::Show { key } => cmd_lock_show(&db, key).await,
            LockAction::Clear { key } => cmd_lock_clear(&db, key).await,
            LockAction::Key { .. } => Ok(()),
        },
        Command::Enqueue { job, args, delay } => {
            let args = JobArgs::from_json(&args)?;
            let msg_id = db
                .enqueue(&config.queue, &JobMessage::new(&job, args), delay)
                .await?;
            println!("Enqueued: {job} (msg {msg_id})");
            Ok(())
        }
    }
}

fn cmd_lock_key(job: &str, args: &str, class: bool) -> anyhow::Result<()> {
    let args = JobArgs::from_json(args)?;
    let key = if class {
        ClassLock.lock_key(job, &args)
    } else {
        DefaultPolicy.lock_key(job, &args)
    };
    println!("{key}");
    Ok(())
}

async fn cmd_lock_list(db: &Db, prefix: Option<&str>) -> anyhow::Result<()> {
    let records = db.list(prefix).await?;

    if records.is_empty() {
        println!("No locks held.");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<19}  {:>10}  KEY", "ACQUIRED", "AGE");
    println!("{}", "-".repeat(80));
    for record in &records {
        println!(
            "{:<19}  {:>10}  {}",
            record.acquired_at.format("%Y-%m-%d %H:%M:%S"),
            format_age(now - record.acquired_at),
            record.key
        );
    }

    println!("\n{} lock(s)", records.len());
    Ok(())
}

async fn cmd_lock_show(db: &Db, key: String) -> anyhow::Result<()> {
    let key = LockKey::new(key);
    match db.get(&key).await? {
        Some(record) => {
            println!("Key:       {}", record.key);
            println!("Acquired:  {}", record.acquired_at);
            println!("Age:       {}", format_age(Utc::now() - record.acquired_at));
        }
        None => println!("Not held: {key}"),
    }
    Ok(())
}

async fn cmd_lock_clear(db: &Db, key: String) -> anyhow::Result<()> {
    let key = LockKey::new(key);
    if db.get(&key).await?.is_none() {
        anyhow::bail!("no lock held under '{key}'");
    }
    db.delete(&key).await?;
    tracing::warn!(%key, "lock cleared by operator");
    println!("Cleared: {key}");
    Ok(())
}

fn format_age(age: chrono::TimeDelta) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s if s < 86_400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}
