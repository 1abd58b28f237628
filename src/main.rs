use std::path::PathBuf;
use std::sync::Arc;

use authsession::{
    AuthConfig, AuthError, AuthSession, AuthStatus, Credentials, FileStore, HttpAuthApi, MemoryStore, TokenStorage,
};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] authsession::config::ConfigError),
    #[error("storage failed: {0}")]
    Storage(#[from] authsession::storage::StorageError),
    #[error("api client failed: {0}")]
    Api(#[from] authsession::ApiError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error("not signed in")]
    NotSignedIn,
    #[error("missing password; pass --password or set AUTH_PASSWORD")]
    MissingPassword,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "authsession", about = "Sign in, inspect and manage an API session")]
struct Cli {
    #[arg(long, env = "AUTH_API_BASE_URL")]
    base_url: Option<String>,

    /// Where remembered credentials are kept between runs.
    #[arg(long, env = "AUTH_STORE", default_value = ".authsession.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in. Without --remember the session ends with this process.
    Login {
        #[arg(long, env = "AUTH_EMAIL")]
        email: String,
        #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long)]
        remember: bool,
    },
    Logout {
        /// Revoke every session of the account, not only this device.
        #[arg(long)]
        everywhere: bool,
    },
    Status,
    Whoami {
        /// Bypass the cached profile.
        #[arg(long)]
        fresh: bool,
    },
    Refresh,
    Sessions,
    Revoke {
        session_id: String,
    },
    ForgotPassword {
        email: String,
    },
    ResetPassword {
        token: String,
        #[arg(long, env = "AUTH_NEW_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let auth = build_session(&cli)?;

    match cli.command {
        Command::Login { email, password, remember } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            auth.login(&Credentials::new(email, password, remember)).await?;
            print_json(&auth.user())?;
        }
        Command::Logout { everywhere } => {
            auth.check_auth_status().await;
            auth.logout(everywhere).await;
            println!("signed out");
        }
        Command::Status => {
            let status = auth.check_auth_status().await;
            print_json(&StatusReport { status: status.as_str(), session: auth.session(), user: auth.user() })?;
        }
        Command::Whoami { fresh } => {
            require_session(&auth).await?;
            print_json(&auth.get_user(fresh).await?)?;
        }
        Command::Refresh => {
            require_session(&auth).await?;
            auth.refresh_access_token().await?;
            print_json(&auth.session())?;
        }
        Command::Sessions => {
            require_session(&auth).await?;
            print_json(&auth.list_sessions().await?)?;
        }
        Command::Revoke { session_id } => {
            require_session(&auth).await?;
            auth.revoke_session(&session_id).await?;
            println!("revoked {session_id}");
        }
        Command::ForgotPassword { email } => {
            auth.forgot_password(&email).await?;
            println!("reset instructions requested for {email}");
        }
        Command::ResetPassword { token, password } => {
            let password = password.ok_or(CliError::MissingPassword)?;
            auth.reset_password(&token, &password).await?;
            println!("password updated");
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    status: &'static str,
    session: Option<authsession::Session>,
    user: Option<authsession::AuthUser>,
}

fn build_session(cli: &Cli) -> Result<AuthSession, CliError> {
    let mut config = AuthConfig::from_env()?;
    if let Some(url) = &cli.base_url {
        config = config.with_base_url(url)?;
    }
    config.validate()?;

    let api = HttpAuthApi::from_config(&config)?;
    let storage = TokenStorage::new(
        Arc::new(FileStore::open(&cli.store)?),
        Arc::new(MemoryStore::new()),
    );
    Ok(AuthSession::new(Arc::new(api), storage, config))
}

async fn require_session(auth: &AuthSession) -> Result<(), CliError> {
    match auth.check_auth_status().await {
        AuthStatus::Authenticated => Ok(()),
        _ => Err(CliError::NotSignedIn),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
