//! mychat: command-line client for the mychat service
//!
//! - `login` / `register` against the REST API
//! - `api` for any authenticated call, with transparent token refresh
//! - `chat` for an interactive WebSocket session (stdin lines become messages)

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mychat_core::{Config, CredentialStore, MemoryCredentialStore, TokenPair};

#[derive(Parser, Debug)]
#[command(name = "mychat", about = "mychat API and chat session CLI")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "MYCHAT_CONFIG")]
    config: Option<PathBuf>,

    /// Override `client.api_base_url`
    #[arg(long, env = "MYCHAT_API_URL")]
    api_url: Option<String>,

    /// Override `client.ws_url`
    #[arg(long, env = "MYCHAT_WS_URL")]
    ws_url: Option<String>,

    #[arg(long, env = "MYCHAT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "MYCHAT_REFRESH_TOKEN", hide_env_values = true)]
    refresh_token: Option<String>,

    /// Authenticated user id, used as sender in chat sessions
    #[arg(long, env = "MYCHAT_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and print the issued token pair
    Login {
        #[arg(long)]
        telephone: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account
    Register {
        #[arg(long)]
        telephone: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        nickname: String,
    },
    /// Call an API path and print the response data
    Api {
        /// HTTP method
        #[arg(long, short = 'X', default_value = "POST")]
        method: String,
        /// Path relative to the API base URL, e.g. /session/list
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
    /// Open a chat session; each stdin line is sent to the receiver
    Chat {
        /// Receiver user or group id
        #[arg(long)]
        to: String,
        /// Send lines as image URLs instead of text
        #[arg(long)]
        image: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output on stdout stays machine readable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "mychat=info,mychat_core=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }),
    };
    if let Some(url) = cli.api_url {
        config.client.api_base_url = url;
    }
    if let Some(url) = cli.ws_url {
        config.client.ws_url = url;
    }

    let store = Arc::new(MemoryCredentialStore::with_tokens(TokenPair::new(
        cli.access_token.unwrap_or_default(),
        cli.refresh_token.unwrap_or_default(),
    )));
    if let Some(user_id) = cli.user_id {
        store.set_user_id(user_id);
    }

    match cli.command {
        Command::Login { telephone, password } => {
            commands::login(&config.client, store, &telephone, &password).await
        }
        Command::Register {
            telephone,
            password,
            nickname,
        } => commands::register(&config.client, store, &telephone, &password, &nickname).await,
        Command::Api { method, path, data } => {
            commands::api(&config.client, store, &method, &path, data.as_deref()).await
        }
        Command::Chat { to, image } => commands::chat(&config.client, store, &to, image).await,
    }
}
