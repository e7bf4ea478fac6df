//! Subcommand implementations

use std::sync::Arc;

use anyhow::{Context, bail};
use reqwest::Method;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mychat_core::{
    ApiClient, ChatContent, ClientConfig, CloseReason, CredentialStore, InboundPayload, MemoryCredentialStore,
    OutboundMessage, SessionSocket, SocketEvent, TokenPair,
};

pub async fn login(
    config: &ClientConfig,
    store: Arc<MemoryCredentialStore>,
    telephone: &str,
    password: &str,
) -> anyhow::Result<()> {
    let client = ApiClient::new(config, store)?;
    let resp = client.login(telephone, password).await?;

    if let Some(nickname) = &resp.nickname {
        tracing::info!("Welcome, {}", nickname);
    }
    println!("MYCHAT_ACCESS_TOKEN={}", resp.token);
    println!("MYCHAT_REFRESH_TOKEN={}", resp.refresh_token);
    Ok(())
}

pub async fn register(
    config: &ClientConfig,
    store: Arc<MemoryCredentialStore>,
    telephone: &str,
    password: &str,
    nickname: &str,
) -> anyhow::Result<()> {
    let client = ApiClient::new(config, store)?;
    client.register(telephone, password, nickname).await?;
    tracing::info!("Registered {}", telephone);
    Ok(())
}

pub async fn api(
    config: &ClientConfig,
    store: Arc<MemoryCredentialStore>,
    method: &str,
    path: &str,
    data: Option<&str>,
) -> anyhow::Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method {method}"))?;
    let body: Option<Value> = data
        .map(serde_json::from_str)
        .transpose()
        .context("--data is not valid JSON")?;

    let before = current_tokens(store.as_ref());
    let client = ApiClient::new(config, store.clone())?;
    let resp: Value = client.send(method, path, body.as_ref()).await?;

    println!("{}", serde_json::to_string_pretty(&resp)?);

    let after = current_tokens(store.as_ref());
    if after != before {
        if let Some(tokens) = after {
            eprintln!("Tokens were refreshed:");
            eprintln!("MYCHAT_ACCESS_TOKEN={}", tokens.access_token);
            eprintln!("MYCHAT_REFRESH_TOKEN={}", tokens.refresh_token);
        }
    }
    Ok(())
}

pub async fn chat(
    config: &ClientConfig,
    store: Arc<MemoryCredentialStore>,
    to: &str,
    image: bool,
) -> anyhow::Result<()> {
    let Some(user_id) = store.user_id() else {
        bail!("chat needs a sender id; pass --user-id or set MYCHAT_USER_ID");
    };

    let socket = SessionSocket::new(config, store);
    let (event_tx, mut events) = mpsc::unbounded_channel();
    socket.connect(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SocketEvent::Opened) => tracing::info!("Connected, type a message and press enter"),
                Some(SocketEvent::Message(InboundPayload::Json(value))) => {
                    println!("{}", serde_json::to_string(&value)?);
                }
                Some(SocketEvent::Message(InboundPayload::Raw(text))) => println!("{text}"),
                Some(SocketEvent::Closed(reason)) => {
                    return match reason {
                        CloseReason::Error(e) => bail!("connection lost: {e}"),
                        CloseReason::Remote { code, reason } => {
                            tracing::info!("Server closed the session ({:?}) {}", code, reason);
                            Ok(())
                        }
                        CloseReason::Local => Ok(()),
                    };
                }
                None => return Ok(()),
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let content = if image {
                        ChatContent::new_image(user_id.as_str(), to, line)
                    } else {
                        ChatContent::new_text(user_id.as_str(), to, line)
                    };
                    socket.send(&OutboundMessage::chat(content.with_client_id()));
                }
                None => {
                    stdin_open = false;
                    socket.close();
                }
            },
            _ = tokio::signal::ctrl_c() => {
                stdin_open = false;
                socket.close();
            }
        }
    }
}

fn current_tokens(store: &dyn CredentialStore) -> Option<TokenPair> {
    Some(TokenPair::new(store.access_token()?, store.refresh_token()?))
}
