use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use emg_auth::{
    AuthError, AuthSnapshot, BackendConfig, ConfigError, HostedClient, ProviderError, SessionStore, SignUpProfile,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("{code}: {message}")]
    Auth { code: &'static str, message: String },
    #[error("timed out waiting for session state")]
    Timeout,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<AuthError> for CliError {
    fn from(err: AuthError) -> Self {
        Self::Auth { code: err.code, message: err.message }
    }
}

#[derive(Parser, Debug)]
#[command(name = "emg-auth", about = "EMG session and role inspector")]
struct Cli {
    #[arg(long, env = "EMG_WAIT_SECS", default_value_t = 10, help = "How long to wait for session changes")]
    wait_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap a store and print the resulting snapshot.
    ///
    /// Sessions are held in memory only, so a fresh process starts signed
    /// out unless a refresh token is supplied to restore from.
    Session {
        #[arg(long, env = "EMG_REFRESH_TOKEN")]
        refresh_token: Option<String>,
    },
    /// Sign in and print the signed-in snapshot and landing route.
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long, env = "EMG_PASSWORD")]
        password: String,
        #[arg(long, default_value_t = false)]
        sign_out: bool,
    },
    /// Create an account.
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long, env = "EMG_PASSWORD")]
        password: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// Send a password-reset email.
    ResetPassword {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = BackendConfig::from_env()?;
    let client = HostedClient::new(config)?;
    if let Command::Session { refresh_token: Some(token) } = &cli.command {
        client.restore_from_refresh_token(token).await?;
    }
    let store = SessionStore::start(Arc::new(client.clone()), Arc::new(client));
    let wait = Duration::from_secs(cli.wait_secs);

    let result = run(&store, cli.command, wait).await;
    store.shutdown().await;
    result
}

async fn run(store: &SessionStore, command: Command, wait: Duration) -> Result<(), CliError> {
    wait_for(store, wait, |s| !s.loading).await?;

    match command {
        Command::Session { .. } => print_snapshot(&store.snapshot()),
        Command::SignIn { email, password, sign_out } => {
            store.sign_in(&email, &password).await?;
            let snapshot = wait_for(store, wait, |s| s.is_authenticated() && !s.loading).await?;
            print_snapshot(&snapshot)?;
            if sign_out {
                store.sign_out().await?;
                tracing::info!("signed out");
                print_snapshot(&store.snapshot())?;
            }
            Ok(())
        }
        Command::SignUp { email, password, username, full_name } => {
            let profile = SignUpProfile { username, full_name };
            let response = store.sign_up(&email, &password, &profile).await?;
            let confirmed = response.session.is_some();
            print_json(&json!({
                "user_id": response.user.as_ref().map(|u| u.id),
                "email": response.user.as_ref().and_then(|u| u.email.clone()),
                "confirmed": confirmed,
            }))
        }
        Command::ResetPassword { email } => {
            let payload = store.reset_password(&email).await?;
            print_json(&payload)
        }
    }
}

async fn wait_for(
    store: &SessionStore,
    wait: Duration,
    mut pred: impl FnMut(&AuthSnapshot) -> bool,
) -> Result<AuthSnapshot, CliError> {
    let mut rx = store.watch();
    let snapshot = tokio::time::timeout(wait, rx.wait_for(|s| pred(s)))
        .await
        .map_err(|_| CliError::Timeout)?
        .map_err(|_| CliError::Timeout)?
        .clone();
    Ok(snapshot)
}

fn print_snapshot(snapshot: &AuthSnapshot) -> Result<(), CliError> {
    print_json(&json!({
        "authenticated": snapshot.is_authenticated(),
        "user_id": snapshot.user_id(),
        "email": snapshot.user_email(),
        "name": snapshot.user_name(),
        "role": snapshot.role().map(ToString::to_string),
        "landing_route": snapshot.landing_route(),
        "error": snapshot.error,
    }))
}

fn print_json(value: &serde_json::Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
