use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use log::info;
use rand::Rng;
use std::path::PathBuf;
use wagate::GatewayConfig;
use wagate::store::{InstanceStore, SqliteStore};
use wagate::types::{AccountId, EventFilter, InstanceRow, NewInstance};

// Operator tool for the instance database.
//
// Usage:
//   wagate add --account 1 --name sales                  # random token
//   wagate add -a 1 -n support --events Message,Presence
//   wagate list [--account 1]
//   wagate show -a 1 -t <token>
//   wagate qr -a 1 -t <token>

#[derive(Parser)]
#[command(name = "wagate")]
#[command(about = "Manage messaging gateway instances")]
struct Args {
    /// JSON file with gateway settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides the config file
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an instance
    Add {
        #[arg(short, long)]
        account: i32,
        #[arg(short, long)]
        name: String,
        /// Generated when omitted
        #[arg(short, long)]
        token: Option<String>,
        #[arg(short, long, default_value = "")]
        webhook: String,
        #[arg(short, long, default_value = "All")]
        events: String,
        /// Expire the instance after this many days
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// List instances, optionally of one account
    List {
        #[arg(short, long)]
        account: Option<i32>,
    },
    /// Print an instance as JSON
    Show {
        #[arg(short, long)]
        account: i32,
        #[arg(short, long)]
        token: String,
    },
    /// Print the pending pairing QR payload
    Qr {
        #[arg(short, long)]
        account: i32,
        #[arg(short, long)]
        token: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let mut config = load_config(args.config.as_ref())?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(run(args.command, config))
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(GatewayConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

async fn run(command: Command, config: GatewayConfig) -> Result<()> {
    let store = SqliteStore::new(&config.db_path)
        .await
        .with_context(|| format!("Failed to open {}", config.db_path))?;
    info!("Using database {}", config.db_path);

    match command {
        Command::Add {
            account,
            name,
            token,
            webhook,
            events,
            expires_in_days,
        } => {
            let token = token.unwrap_or_else(generate_token);
            let events = EventFilter::parse(&events).to_string();
            let expiration =
                expires_in_days.map(|days| (Utc::now() + ChronoDuration::days(days)).timestamp());
            let row = store
                .insert_instance(NewInstance {
                    account_id: account,
                    name,
                    token,
                    webhook,
                    events,
                    expiration,
                })
                .await?;
            println!("Created instance {} with token {}", row.id, row.token);
        }
        Command::List { account } => {
            let rows = match account {
                Some(account) => store.list_instances_by_account(AccountId(account)).await?,
                None => store.list_instances().await?,
            };
            print_table(&rows);
        }
        Command::Show { account, token } => {
            let row = find(&store, account, &token).await?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Command::Qr { account, token } => {
            let row = find(&store, account, &token).await?;
            match row.qr_code() {
                Some(qr) => println!("{qr}"),
                None if row.pairing_identity().is_some() => {
                    println!("Instance {} is already paired", row.id)
                }
                None => println!("No QR code issued yet for instance {}", row.id),
            }
        }
    }
    Ok(())
}

async fn find(store: &SqliteStore, account: i32, token: &str) -> Result<InstanceRow> {
    match store.get_instance_by_token(token).await? {
        Some(row) if row.account_id == AccountId(account) => Ok(row),
        _ => bail!("Instance not found"),
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn print_table(rows: &[InstanceRow]) {
    println!(
        "{:<6} {:<8} {:<20} {:<10} {:<28} {}",
        "ID", "ACCOUNT", "NAME", "CONNECTED", "PAIRED AS", "EXPIRES"
    );
    for row in rows {
        let expires = match row.expiration {
            Some(ts) if ts > 0 => Utc
                .timestamp_opt(ts, 0)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| ts.to_string()),
            _ => "-".to_string(),
        };
        println!(
            "{:<6} {:<8} {:<20} {:<10} {:<28} {}",
            row.id.0,
            row.account_id.0,
            row.name,
            row.connected,
            row.pairing_identity().unwrap_or("-"),
            expires
        );
    }
}
