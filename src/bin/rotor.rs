use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use credit_rotor::config::RotorConfig;
use credit_rotor::db;
use credit_rotor::db::services::account_service::AccountStore;
use credit_rotor::monitor::balance::BalanceMonitor;
use credit_rotor::monitor::readiness::HttpReadinessProbe;
use credit_rotor::orchestrator::{DeploymentRecord, Orchestrator};
use credit_rotor::platform::profile::ProfileSwitcher;
use credit_rotor::platform::runner::{CommandRunner, ProcessRunner};
use credit_rotor::platform::volume::VolumeBrowser;
use credit_rotor::services::encryption_service::EncryptionService;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the account pool
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
    /// Bind an account to the platform profile
    Switch { username: String },
    /// Bind the richest usable account
    Next,
    /// Run the resource preparation phase
    Phase1 { username: String },
    /// Run the install and start phase
    Phase2 { username: String },
    /// Launch the workload on an account and keep it running until Ctrl-C
    Start {
        username: String,
        #[arg(long)]
        gpu: Option<String>,
    },
    /// Stop the workload on the bound account
    Stop,
    /// Re-check one account's balance, or every account's
    Balance { username: Option<String> },
    /// List workflows on the volume
    Workflows,
    /// List generated outputs on the volume
    Outputs,
    /// Download a workflow and print it
    FetchWorkflow { name: String },
    /// Download an output file
    FetchOutput { name: String },
    /// Start on the best account, keep the workload running and rotate accounts
    /// as credit runs out
    Watch {
        #[arg(long)]
        gpu: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    Add {
        username: String,
        token_id: String,
        token_secret: String,
    },
    List,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "rotor.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    // Human-readable on stderr so command output on stdout stays clean
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

async fn build_orchestrator(config: &RotorConfig) -> Result<Orchestrator, BoxError> {
    let db = db::connect(&config.database_url).await?;
    let vault = Arc::new(EncryptionService::from_secret(&config.encryption_secret)?);
    let store = AccountStore::new(db, vault);

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new(&config.platform_cli)?);
    let profiles = ProfileSwitcher::new(runner.clone(), config.command_timeout());
    let volume = VolumeBrowser::new(runner.clone(), config.volume_layout(), config.command_timeout());
    let monitor = BalanceMonitor::new(
        store.clone(),
        profiles.clone(),
        volume.clone(),
        config.balance_file.clone(),
        config.min_credit_threshold,
    );
    let probe = Arc::new(HttpReadinessProbe::new(
        config.readiness_url.clone(),
        PROBE_REQUEST_TIMEOUT,
    )?);

    Ok(Orchestrator::new(
        store,
        runner,
        profiles,
        monitor,
        volume,
        probe,
        config.deployment_settings(),
    ))
}

fn print_record(record: &DeploymentRecord) {
    println!(
        "{} running on {} since {}",
        record.username,
        record.gpu,
        record.started_at.to_rfc3339()
    );
}

/// Holds the process open for the run client and rotates accounts on every tick.
/// The workload is stopped on Ctrl-C, since the remote app lives only as long as
/// this process.
async fn supervise(
    orchestrator: &Orchestrator,
    gpu: Option<&str>,
    interval: Duration,
) -> Result<(), BoxError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C; stopping the workload.");
                orchestrator.stop().await?;
                return Ok(());
            }
            _ = ticker.tick() => {
                if orchestrator.snapshot().record.is_none() {
                    warn!("No workload is running; starting one.");
                    match orchestrator.ensure_running(gpu).await {
                        Ok(record) => print_record(&record),
                        Err(e) => error!(error = %e, "Could not start the workload."),
                    }
                    continue;
                }
                match orchestrator.rotate_if_exhausted().await {
                    Ok(Some(username)) => info!(username = %username, "Rotated to a new account."),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Rotation check failed."),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match RotorConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(&config.log_dir);

    let orchestrator = build_orchestrator(&config).await?;

    match args.command {
        Command::Account { action } => match action {
            AccountAction::Add {
                username,
                token_id,
                token_secret,
            } => {
                let account = orchestrator
                    .add_account(&username, &token_id, &token_secret)
                    .await?;
                println!("Added account {}", account.username);
            }
            AccountAction::List => {
                for account in orchestrator.list_accounts().await? {
                    let checked = account
                        .last_checked
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<20} {:<9} ${:>8.2}  gpu={:<6} checked={}",
                        account.username,
                        account.status,
                        account.balance,
                        account.selected_gpu.as_deref().unwrap_or("-"),
                        checked
                    );
                }
            }
        },
        Command::Switch { username } => {
            let account = orchestrator.switch_to_account(&username).await?;
            println!("Active account: {}", account.username);
        }
        Command::Next => {
            let account = orchestrator.switch_to_next_available().await?;
            println!("Active account: {}", account.username);
        }
        Command::Phase1 { username } => {
            orchestrator.deploy_phase1(&username).await?;
            println!("Phase 1 completed for {username}");
        }
        Command::Phase2 { username } => {
            orchestrator.deploy_phase2(&username).await?;
            println!("Phase 2 completed for {username}");
        }
        Command::Start { username, gpu } => {
            let record = orchestrator.start(&username, gpu.as_deref()).await?;
            print_record(&record);
            supervise(&orchestrator, Some(&record.gpu), config.watch_interval()).await?;
        }
        Command::Stop => match orchestrator.stop_bound_account().await? {
            Some(username) => println!("Stopped workload on {username}"),
            None => println!("No account is bound"),
        },
        Command::Balance { username: Some(username) } => {
            match orchestrator.check_balance(&username).await? {
                Some(balance) => println!("{username}: ${balance:.2}"),
                None => println!("{username}: unknown"),
            }
        }
        Command::Balance { username: None } => {
            for (username, balance) in orchestrator.check_all_balances().await? {
                println!("{username}: ${balance:.2}");
            }
        }
        Command::Workflows => {
            for name in orchestrator.list_workflows().await? {
                println!("{name}");
            }
        }
        Command::Outputs => {
            for name in orchestrator.list_outputs().await? {
                println!("{name}");
            }
        }
        Command::FetchWorkflow { name } => {
            let workflow = orchestrator.fetch_workflow(&name).await?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Command::FetchOutput { name } => {
            let path = orchestrator.fetch_output(&name).await?;
            println!("{}", path.display());
        }
        Command::Watch { gpu } => {
            let record = orchestrator.ensure_running(gpu.as_deref()).await?;
            print_record(&record);
            supervise(&orchestrator, gpu.as_deref(), config.watch_interval()).await?;
        }
    }

    Ok(())
}
