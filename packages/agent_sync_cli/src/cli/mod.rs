pub mod connect;
pub mod demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

use agent_sync::{
    FileConfig, MemoryTransport, Session, SessionStore, SqliteStore, SyncClient, SyncConfig,
    SyncPaths, WebSocketTransport,
};

/// Endpoint used with `--demo` when none is given.
const DEMO_ENDPOINT: &str = "memory://demo";

#[derive(Parser)]
pub struct ConnectArgs {
    /// WebSocket endpoint of the agent server
    /// (default: the stored session's, then `transport.endpoint` from config)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Conversation to join (default: the most recent one, else a new id)
    #[arg(short, long)]
    pub conversation: Option<String>,

    /// Bearer token sent with the handshake
    #[arg(long)]
    pub token: Option<String>,

    /// Extra handshake parameter (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Talk to a built-in scripted agent instead of a server
    #[arg(long)]
    pub demo: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

async fn open_store(paths: &SyncPaths) -> Result<SqliteStore> {
    SqliteStore::open(&paths.db_url())
        .await
        .context("Failed to open session database")
}

pub async fn connect_command(
    paths: &SyncPaths,
    file_config: &FileConfig,
    config: SyncConfig,
    args: ConnectArgs,
) -> Result<()> {
    let store = open_store(paths).await?;
    let sessions = SessionStore::new(Arc::new(store.clone()));
    let last = sessions
        .last()
        .await
        .context("Failed to read stored session")?;
    let session = resolve_session(&args, last, file_config.transport.endpoint.as_deref())?;

    let builder = SyncClient::builder().config(config).store(store);
    if args.demo {
        let transport = MemoryTransport::new();
        let server = transport.server();
        demo::spawn(server.clone());
        let client = builder.transport(transport).build();
        connect::run(client, session, Some(server)).await
    } else {
        let client = builder.transport(WebSocketTransport::new()).build();
        connect::run(client, session, None).await
    }
}

/// Merge command-line arguments over the stored session. Stored endpoint,
/// token and params are only reused for the same conversation.
fn resolve_session(
    args: &ConnectArgs,
    last: Option<Session>,
    configured_endpoint: Option<&str>,
) -> Result<Session> {
    let conversation_id = args
        .conversation
        .clone()
        .or_else(|| last.as_ref().map(|s| s.conversation_id.clone()))
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let stored = last.filter(|s| s.conversation_id == conversation_id);

    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| stored.as_ref().map(|s| s.server_endpoint.clone()))
        .or_else(|| configured_endpoint.map(str::to_string))
        .or_else(|| args.demo.then(|| DEMO_ENDPOINT.to_string()))
        .context("No endpoint: pass --endpoint or set transport.endpoint in config.toml")?;

    let mut session = Session::new(endpoint, conversation_id);
    if let Some(stored) = stored {
        session.auth_token = stored.auth_token;
        session.extra_params = stored.extra_params;
    }
    if let Some(token) = &args.token {
        session.auth_token = Some(token.clone());
    }
    for (key, value) in &args.params {
        session.extra_params.insert(key.clone(), value.clone());
    }
    Ok(session)
}

pub async fn session_show_command(paths: &SyncPaths, conversation: Option<String>) -> Result<()> {
    let store = open_store(paths).await?;
    let sessions = SessionStore::new(Arc::new(store));
    let session = match conversation {
        Some(id) => sessions.load(&id).await?,
        None => sessions.last().await?,
    };
    match session {
        Some(mut session) => {
            if session.auth_token.is_some() {
                session.auth_token = Some("<redacted>".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
        None => eprintln!("[agent-sync: no stored session]"),
    }
    Ok(())
}

pub async fn session_forget_command(
    paths: &SyncPaths,
    config: SyncConfig,
    conversation: Option<String>,
) -> Result<()> {
    let store = open_store(paths).await?;
    let client = SyncClient::builder().config(config).store(store).build();

    let conversation_id = match conversation {
        Some(id) => id,
        None => match client.last_session().await? {
            Some(session) => session.conversation_id,
            None => {
                eprintln!("[agent-sync: no stored session]");
                return Ok(());
            }
        },
    };
    client
        .forget_stored(&conversation_id)
        .await
        .with_context(|| format!("Failed to forget conversation {conversation_id}"))?;
    eprintln!("[agent-sync: forgot {conversation_id}]");
    Ok(())
}

pub fn config_command(paths: &SyncPaths, file_config: &FileConfig) -> Result<()> {
    eprintln!("# {}", paths.config_toml_path().display());
    let rendered = toml::to_string_pretty(file_config).context("Failed to render config")?;
    print!("{rendered}");
    Ok(())
}
