use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::task::LocalSet;
use tracing::info;
use ykoath::{OathConfig, OathContext};
use ykoath_apdu_transport_pcsc::PcscDeviceManager;

mod commands;
mod utils;

use commands::*;
use utils::{PasswordArgs, PutArgs, reader};

#[derive(Parser)]
#[command(version, about = "Manage OATH credentials on a YubiKey over NFC")]
struct Cli {
    /// Optional reader name to use (will auto-detect if not specified)
    #[arg(short, long, global = true)]
    reader: Option<String>,

    /// Directory holding remembered access keys
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Debug level output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    password: PasswordArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available readers
    Readers,

    /// Show the card id, firmware version and authorization
    Info,

    /// Show the codes of every credential
    Codes {
        /// Also calculate HOTP and touch credentials
        #[arg(long)]
        refresh: bool,
    },

    /// Store a credential
    Put(PutArgs),

    /// Delete credentials
    Delete {
        /// Credential names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Calculate credentials one by one
    Refresh {
        /// Credential names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Set the access code, or remove it when none is given
    SetPassword {
        /// New password
        new_password: Option<String>,
    },

    /// Erase every credential and the access code
    Reset {
        /// Confirm the reset
        #[arg(long)]
        force: bool,
    },

    /// Follow tags coming and going, showing the codes of each YubiKey
    Watch,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    // The OATH core is single threaded
    LocalSet::new().run_until(run(cli)).await
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let manager = PcscDeviceManager::new()?;
    let config = match &cli.config_dir {
        Some(dir) => OathConfig::new().with_config_dir(dir),
        None => OathConfig::new(),
    };
    let context = OathContext::new(config);

    match &cli.command {
        Commands::Readers => reader::list_readers(&manager),
        Commands::Watch => watch_command(&manager, &context, &cli.password).await,
        _ => {
            let reader = reader::find_reader(&manager, cli.reader.as_deref())?;
            info!("Using reader: {}", reader.name());

            let mut connection =
                utils::session::Connection::open(&manager, &context, reader.name()).await?;
            let result = match &cli.command {
                Commands::Readers | Commands::Watch => unreachable!(), // Already handled above
                Commands::Info => info_command(&mut connection).await,
                Commands::Codes { refresh } => {
                    codes_command(&mut connection, &cli.password, *refresh).await
                }
                Commands::Put(args) => {
                    put_command(&mut connection, &cli.password, args.token()?).await
                }
                Commands::Delete { names } => {
                    delete_command(&mut connection, &cli.password, names).await
                }
                Commands::Refresh { names } => {
                    refresh_command(&mut connection, &cli.password, names).await
                }
                Commands::SetPassword { new_password } => {
                    set_password_command(
                        &mut connection,
                        &cli.password,
                        new_password.as_deref().unwrap_or_default(),
                    )
                    .await
                }
                Commands::Reset { force } => reset_command(&mut connection, *force).await,
            };
            connection.close();
            result
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_ansi(true)
        .init();
}
