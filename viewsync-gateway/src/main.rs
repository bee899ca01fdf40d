//! viewsync-gateway: runs the view-sync engine with a terminal chat surface.
//!
//! Every stdin line is one chat turn. `/state` prints the current view,
//! `/clients` the number of connected clients and `/quit` stops the engine.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use viewsync::{backend_from_config, Origin, ViewSyncConfig, ViewSyncServer};

#[derive(Parser, Debug)]
#[command(name = "viewsync-gateway")]
#[command(about = "Live view synchronization server with a chat-driven design assistant")]
struct Args {
    /// Path to configuration file (TOML format)
    #[arg(long, env = "VIEWSYNC_CONFIG_PATH")]
    config_path: Option<String>,

    /// Address to bind (overrides config)
    #[arg(long, env = "VIEWSYNC_BIND_ADDR")]
    bind_addr: Option<String>,

    /// WebSocket path (overrides config)
    #[arg(long)]
    ws_path: Option<String>,

    /// LLM Provider (echo, openai, openrouter, anthropic)
    #[arg(long, env = "VIEWSYNC_LLM_PROVIDER")]
    llm_provider: Option<String>,

    /// LLM Model
    #[arg(long, env = "VIEWSYNC_LLM_MODEL")]
    llm_model: Option<String>,

    /// LLM API key
    #[arg(long, env = "VIEWSYNC_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// LLM Base URL
    #[arg(long, env = "VIEWSYNC_LLM_BASE_URL")]
    llm_base_url: Option<String>,

    /// Model reply timeout in seconds
    #[arg(long)]
    model_timeout_secs: Option<u64>,

    /// Disable the terminal chat loop (serve sockets only)
    #[arg(long, default_value = "false")]
    no_terminal: bool,
}

impl Args {
    /// Load the config file (if any) and let command-line values win.
    fn into_config(self) -> anyhow::Result<(ViewSyncConfig, bool)> {
        let mut config = match &self.config_path {
            Some(path) => ViewSyncConfig::load_from_file(path)
                .with_context(|| format!("loading config from {}", path))?,
            None => ViewSyncConfig::default(),
        };

        if let Some(addr) = self.bind_addr {
            config.server.bind_addr = addr;
        }
        if let Some(path) = self.ws_path {
            config.server.ws_path = path;
        }
        if let Some(provider) = self.llm_provider {
            config.llm.provider = provider;
        }
        if let Some(model) = self.llm_model {
            config.llm.model = model;
        }
        if let Some(key) = self.llm_api_key {
            config.llm.api_key = Some(key);
        }
        if let Some(url) = self.llm_base_url {
            config.llm.base_url = Some(url);
        }
        if let Some(secs) = self.model_timeout_secs {
            config.bridge.model_timeout_secs = secs;
        }
        config.apply_env();
        config.validate().context("invalid configuration")?;

        Ok((config, !self.no_terminal))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("viewsync=info".parse()?)
                .add_directive("viewsync_gateway=info".parse()?),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    let (config, terminal) = Args::parse().into_config()?;

    let backend = backend_from_config(&config.llm, config.bridge.model_timeout())
        .context("building model backend")?;
    info!(
        "Starting viewsync gateway on {} with {} backend",
        config.server.bind_addr, config.llm.provider
    );

    let server = Arc::new(ViewSyncServer::new(config, Arc::from(backend)));

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
                server.stop();
            }
        });
    }

    if terminal {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = terminal_loop(&server).await {
                error!("Terminal loop failed: {}", e);
            }
            server.stop();
        });
    }

    serving.await.context("server task panicked")??;
    Ok(())
}

async fn terminal_loop(server: &ViewSyncServer) -> anyhow::Result<()> {
    let shutdown = server.shutdown_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type a message to chat, /state, /clients or /quit.");

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            // stdin closed: keep serving sockets until a signal arrives.
            shutdown.cancelled().await;
            return Ok(());
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => return Ok(()),
            "/state" => {
                let snapshot = server.bridge().state().snapshot();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            "/clients" => println!("{} client(s) connected", server.hub().client_count()),
            message => match server.bridge().handle_turn(Origin::Terminal, message).await {
                Ok(outcome) => {
                    println!("{}", outcome.text);
                    if let Some(update) = &outcome.applied {
                        println!(
                            "[applied {}]",
                            update.action.as_deref().unwrap_or("state_replace")
                        );
                    }
                }
                Err(e) => println!("{}", e.user_message()),
            },
        }
    }
}
