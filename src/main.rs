//! `sblite` CLI entrypoint: bootstraps the shared runtime and serves the
//! HTTP and wire-protocol front ends concurrently (spec.md §5, §6).

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sblite::auth::JwtClaimsProvider;
use sblite::config::{Config, StorageBackend};
use sblite::mail::{CatchMailSink, SmtpMailSink};
use sblite::rls::{Command as RlsCommand, Policy};
use sblite::state::AppState;
use sblite::storage::{LocalFsBlobStore, S3BlobStore};

type BoxError = Box<dyn Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "sblite", about = "Single-binary, SQLite-backed Supabase-compatible backend")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Creates the on-disk data directory and an empty database.
    Init {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Runs the HTTP and PostgreSQL wire-protocol servers.
    Serve,
    Keys {
        #[command(subcommand)]
        command: KeysCmd,
    },
    Policy {
        #[command(subcommand)]
        command: PolicyCmd,
    },
}

#[derive(Subcommand)]
enum KeysCmd {
    /// Prints a random HS256 secret suitable for `SBLITE_JWT_SECRET`.
    Generate,
}

#[derive(Subcommand)]
enum PolicyCmd {
    /// Adds a row-level security policy to a table, enabling RLS on it.
    Add {
        #[arg(long)]
        table: String,
        #[arg(long, value_parser = parse_command)]
        command: RlsCommand,
        #[arg(long)]
        name: String,
        #[arg(long)]
        using: Option<String>,
        #[arg(long)]
        check: Option<String>,
        #[arg(long = "role")]
        roles: Vec<String>,
    },
}

fn parse_command(s: &str) -> Result<RlsCommand, String> {
    match s.to_ascii_uppercase().as_str() {
        "ALL" => Ok(RlsCommand::All),
        "SELECT" => Ok(RlsCommand::Select),
        "INSERT" => Ok(RlsCommand::Insert),
        "UPDATE" => Ok(RlsCommand::Update),
        "DELETE" => Ok(RlsCommand::Delete),
        other => Err(format!("unknown RLS command: {other}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match cli.command {
        Cmd::Init { db_path } => {
            let dir = db_path
                .as_ref()
                .and_then(|p| p.parent())
                .map(PathBuf::from)
                .unwrap_or_else(sblite::config::default_data_dir);
            std::fs::create_dir_all(&dir)?;
            let path = db_path.unwrap_or_else(|| dir.join("sblite.db"));
            sblite::runtime::DbHandle::open(&path).await?;
            println!("initialized database at {}", path.display());
        }
        Cmd::Serve => {
            let config = Config::from_env()?;
            let state = bootstrap(config).await?;
            let http_state = state.clone();
            let wire_state = state.clone();
            tokio::try_join!(
                async move { sblite::http::serve(http_state).await },
                async move { sblite::wire::serve(wire_state).await },
            )?;
        }
        Cmd::Keys { command: KeysCmd::Generate } => {
            use rand::Rng;
            let bytes: [u8; 32] = rand::thread_rng().gen();
            println!("{}", hex_encode(&bytes));
        }
        Cmd::Policy { command: PolicyCmd::Add { table, command, name, using, check, roles } } => {
            let config = Config::from_env()?;
            let state = bootstrap(config).await?;
            let using_expr = using.as_deref().map(sblite::parser::parse_expr_standalone).transpose().map_err(|e| -> BoxError { e.into() })?;
            let check_expr = check.as_deref().map(sblite::parser::parse_expr_standalone).transpose().map_err(|e| -> BoxError { e.into() })?;
            state
                .add_policy(&table, Policy { name, command, roles, using: using_expr, check: check_expr })
                .await?;
            println!("policy added to {table}");
        }
    }
    Ok(())
}

async fn bootstrap(config: Config) -> Result<Arc<AppState>, BoxError> {
    let claims_provider = Box::new(JwtClaimsProvider::new(config.jwt_secret.clone()));
    let blob_store: Box<dyn sblite::storage::BlobStore> = match config.storage_backend {
        StorageBackend::Local => Box::new(LocalFsBlobStore::new(config.storage_root.clone())),
        StorageBackend::S3 => Box::new(S3BlobStore),
    };
    let mail_sink: Box<dyn sblite::mail::MailSink> = match config.mail_mode {
        sblite::config::MailMode::Catch => Box::new(CatchMailSink::new(256)),
        sblite::config::MailMode::Smtp => {
            let smtp = config.smtp.clone().expect("smtp config required in smtp mail mode");
            Box::new(SmtpMailSink { host: smtp.host, port: smtp.port })
        }
    };
    Ok(AppState::bootstrap(config, claims_provider, blob_store, mail_sink).await?)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
