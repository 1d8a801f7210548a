use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chat_core::{
    config::{load_settings, normalize_database_url, Settings},
    token::{HttpTokenBackend, LoopbackTokenBackend, TokenBackend},
    ChatBackends, ChatError, ChatOptions, ChatSessionManager, ChatSessionSlot, SessionCredential,
};
use clap::{Parser, Subcommand};
use provider_integration::{LoopbackConfig, LoopbackProvider};
use shared::domain::{ConferenceId, ProfileId};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Base URL handed to the in-process token backend, which ignores it.
const LOOPBACK_TOKEN_ENDPOINT: &str = "loopback://local/";

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `database_url` from chat.toml and the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "conf-1")]
    conference: String,
    #[arg(long, default_value = "alice")]
    profile: String,
    /// Fetch chat tokens from this authorization backend instead of minting them locally.
    #[arg(long)]
    auth_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a conference configuration value.
    SetConfig { key: String, value: String },
    /// Print every value stored for a configuration key.
    GetConfig { key: String },
    /// Run a session against the in-process provider and print what it sees.
    Demo {
        #[arg(long, default_value = "lobby")]
        title: String,
        /// Members to invite; a single member with --private makes a direct message.
        #[arg(long = "with")]
        members: Vec<String>,
        #[arg(long)]
        private: bool,
        #[arg(long, default_value = "hello from chatctl")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();
    let settings = load_settings();
    let database_url = normalize_database_url(
        cli.database_url
            .as_deref()
            .unwrap_or(&settings.database_url),
    );
    let storage = Storage::new(&database_url)
        .await
        .with_context(|| format!("failed to open {database_url}"))?;
    let conference_id = ConferenceId::new(cli.conference.as_str());

    match cli.command {
        Command::SetConfig { key, value } => {
            storage.set_config_value(&conference_id, &key, &value).await?;
            println!("{conference_id}: {key} = {value}");
        }
        Command::GetConfig { key } => {
            let values = storage.config_values_by_key(&key, &conference_id).await?;
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        Command::Demo {
            title,
            members,
            private,
            message,
        } => {
            let provider = LoopbackProvider::new(LoopbackConfig {
                signing_secret: settings.provider_signing_secret.clone(),
                ttl_seconds: settings.provider_token_ttl_seconds,
            });
            let (token_backend, token_endpoint) =
                token_backend(&settings, cli.auth_url, Arc::clone(&provider))?;
            let options = ChatOptions {
                token_endpoint: Some(token_endpoint),
                ..ChatOptions::from(&settings)
            };
            let backends = ChatBackends::with_storage(storage, provider.clone(), token_backend);
            let members = members
                .into_iter()
                .map(ProfileId::new)
                .collect::<Vec<_>>();
            for member in &members {
                provider.register_user(member);
            }

            let slot = ChatSessionSlot::new();
            let (manager, outcome) = slot
                .setup(
                    conference_id,
                    ProfileId::new(cli.profile.as_str()),
                    SessionCredential::new(cli.profile),
                    backends,
                    options,
                )
                .await?;
            info!(mirror = ?outcome.mirror, "session ready");

            let result = run_demo(&manager, &title, &members, private, &message).await;
            slot.teardown().await?;
            result?;
        }
    }

    Ok(())
}

fn token_backend(
    settings: &Settings,
    auth_url: Option<String>,
    provider: Arc<LoopbackProvider>,
) -> Result<(Arc<dyn TokenBackend>, String)> {
    match auth_url.or_else(|| settings.token_endpoint.clone()) {
        Some(url) => {
            let backend = HttpTokenBackend::new(Duration::from_secs(settings.http_timeout_seconds))?;
            Ok((Arc::new(backend), url))
        }
        None => Ok((
            Arc::new(LoopbackTokenBackend::new(provider)),
            LOOPBACK_TOKEN_ENDPOINT.to_string(),
        )),
    }
}

async fn run_demo(
    manager: &Arc<ChatSessionManager>,
    title: &str,
    members: &[ProfileId],
    private: bool,
    message: &str,
) -> Result<()> {
    match manager.create_moderation_hub_chat("Moderators").await {
        Ok(hub) => println!("created moderation hub {}", hub.id),
        Err(ChatError::ModerationHubExists(_)) => {}
        Err(err) => return Err(err.into()),
    }

    let chat = manager.create_chat(members, private, title).await?;
    manager.send_message(&chat.id, message).await?;
    println!("chat: {}", serde_json::to_string_pretty(&chat)?);

    let watched = manager.list_watched_chats_unfiltered().await;
    println!("watched: {}", serde_json::to_string_pretty(&watched)?);
    let members = manager.list_chat_members(&chat.id).await;
    println!("members: {}", serde_json::to_string_pretty(&members)?);

    if let Some(mut pager) = manager.get_messages(&chat.id, None).await {
        while let Some(page) = pager.next_page().await? {
            println!("messages: {}", serde_json::to_string_pretty(&page)?);
        }
    }
    Ok(())
}
