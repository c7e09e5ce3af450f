use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

use summary_log_kernel::config::StoreConfig;
use summary_log_kernel::consistency::wait_for_version;
use summary_log_kernel::record::{generate_id, SummaryLog, VersionedSummaryLog};
use summary_log_kernel::state::UploadStatus;
use summary_log_kernel::store::{SqliteSummaryLogStore, SubmissionOutcome, SummaryLogStore};
use summary_log_kernel::validation::{parse_insert, parse_update};

/// Summary log store CLI
#[derive(Parser, Debug)]
#[command(name = "summary-log")]
#[command(about = "Versioned summary log store", long_about = None)]
struct Cli {
    /// Path to the SQLite database (created if missing)
    #[arg(long)]
    db: PathBuf,

    /// Path to store config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Built-in profile used when no config is given
    #[arg(long, value_enum, default_value_t = Profile::Production)]
    profile: Profile,

    /// Raise log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Profile {
    Production,
    Test,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a new upload and retire older pending uploads of its pair
    Upload {
        /// Summary log id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Insert payload JSON file, or `-` for stdin
        #[arg(long)]
        data: String,
    },

    /// Apply a partial update at an expected version
    Update {
        #[arg(long)]
        id: String,

        #[arg(long)]
        version: u64,

        /// Update payload JSON file, or `-` for stdin
        #[arg(long)]
        data: String,
    },

    /// Print a summary log
    Show {
        #[arg(long)]
        id: String,

        /// Wait until the record reaches at least this version
        #[arg(long)]
        min_version: Option<u64>,
    },

    /// Claim the pair's submission slot for a validated summary log
    Submit {
        #[arg(long)]
        id: String,
    },

    /// Supersede pending summary logs no newer than `--exclude`
    Supersede {
        #[arg(long)]
        organisation: String,

        #[arg(long)]
        registration: String,

        #[arg(long)]
        exclude: String,
    },

    /// Print the most recently submitted summary log of a pair
    LatestSubmitted {
        #[arg(long)]
        organisation: String,

        #[arg(long)]
        registration: String,
    },
}

#[derive(Debug, Serialize)]
struct UploadOutput {
    record: VersionedSummaryLog,
    superseded: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOutput {
    success: bool,
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary_log: Option<SummaryLog>,
}

#[derive(Debug, Serialize)]
struct SupersedeOutput {
    superseded: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => {
            let data = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            StoreConfig::from_json(&data)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => match cli.profile {
            Profile::Production => StoreConfig::production(),
            Profile::Test => StoreConfig::test_profile(),
        },
    };

    let store = SqliteSummaryLogStore::open(&cli.db, &config)
        .with_context(|| format!("opening {}", cli.db.display()))?;

    let output = run(&store, &config, cli.command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn run<S: SummaryLogStore>(store: &S, config: &StoreConfig, command: Command) -> Result<Value> {
    let output = match command {
        Command::Upload { id, data } => {
            let id = id.unwrap_or_else(generate_id);
            let insert = parse_insert(&with_upload_status(read_json(&data)?)?)?;

            if let Some((org, reg)) = insert.org_reg() {
                store.check_for_submitting_log(org, reg)?;
            }
            store.insert(&id, &insert)?;

            let superseded = match insert.org_reg() {
                Some((org, reg)) => store.supersede_pending_logs(org, reg, &id)?,
                None => 0,
            };
            let record = wait_for_version(store, &id, 1, &config.consistency)?;

            serde_json::to_value(UploadOutput { record, superseded })?
        }

        Command::Update { id, version, data } => {
            let update = parse_update(&read_json(&data)?)?;
            store.update(&id, version, &update)?;
            let record = wait_for_version(store, &id, version + 1, &config.consistency)?;
            serde_json::to_value(record)?
        }

        Command::Show { id, min_version } => match min_version {
            Some(version) => serde_json::to_value(wait_for_version(
                store,
                &id,
                version,
                &config.consistency,
            )?)?,
            None => {
                let record = store
                    .find_by_id(&id)?
                    .with_context(|| format!("summary log {id} not found"))?;
                serde_json::to_value(record)?
            }
        },

        Command::Submit { id } => {
            let output = match store.transition_to_submitting_exclusive(&id)? {
                SubmissionOutcome::Claimed {
                    summary_log,
                    version,
                } => SubmitOutput {
                    success: true,
                    id,
                    version: Some(version),
                    summary_log: Some(summary_log),
                },
                SubmissionOutcome::AlreadySubmitting => SubmitOutput {
                    success: false,
                    id,
                    version: None,
                    summary_log: None,
                },
            };
            serde_json::to_value(output)?
        }

        Command::Supersede {
            organisation,
            registration,
            exclude,
        } => {
            let superseded = store.supersede_pending_logs(&organisation, &registration, &exclude)?;
            serde_json::to_value(SupersedeOutput { superseded })?
        }

        Command::LatestSubmitted {
            organisation,
            registration,
        } => serde_json::to_value(
            store.find_latest_submitted_for_org_reg(&organisation, &registration)?,
        )?,
    };

    Ok(output)
}

fn read_json(source: &str) -> Result<Value> {
    let data = if source == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        fs::read_to_string(source).with_context(|| format!("reading {source}"))?
    };
    serde_json::from_str(&data).with_context(|| format!("parsing JSON from {source}"))
}

/// An upload without `status` starts where its file's outcome puts it.
fn with_upload_status(mut payload: Value) -> Result<Value> {
    if let Some(obj) = payload.as_object_mut() {
        if !obj.contains_key("status") {
            let file_status = obj
                .get("file")
                .and_then(|file| file.get("status"))
                .and_then(Value::as_str);
            if let Some(file_status) = file_status {
                let status = file_status.parse::<UploadStatus>()?.initial_status();
                obj.insert("status".into(), json!(status));
            }
        }
    }
    Ok(payload)
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
