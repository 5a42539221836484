mod backoff;
mod chat;
mod client;
mod config;
mod status;

use anyhow::Result;
use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chat::message::current_backend;
use crate::chat::{ApplicationMessage, ConnectionState, WsConnector};
use crate::client::{ChatClient, ConnectionStatus};
use crate::config::Config;
use crate::status::HttpStatusSource;

fn print_help() {
    println!(
        "\
chat-client v{}

Terminal chat client with automatic reconnection.

USAGE:
    chat-client [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/chat.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

COMMANDS (while running):
    /status      Connection state, backend pod and online users
    /reconnect   Reconnect after the client gave up or was stopped
    /quit        Leave the chat

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing, written to stderr
                (e.g. debug, chat_client=debug,warn)

EXAMPLES:
    chat-client                            # uses config/chat.toml
    chat-client /etc/chat/client.toml      # custom config path
    RUST_LOG=debug chat-client 2>chat.log  # debug logging to a file",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("chat-client v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (stderr)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/chat.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let ws_url = config.server.ws_url()?;
    info!("Chat endpoint: {ws_url}");
    info!(
        "Reconnect: {} attempts, {}ms doubling up to {}ms",
        config.reconnect.max_attempts,
        config.reconnect.base_delay_ms,
        config.reconnect.max_delay_ms
    );

    // Start the client in Idle; nothing connects until start()
    let client = ChatClient::spawn(
        WsConnector::new(ws_url),
        config.reconnect.backoff(),
        config.reconnect.max_attempts,
    );

    // Online-user count, polled only while connected
    let (count_tx, count_rx) = watch::channel(None);
    if config.status.enabled {
        let status_url = config.server.status_url()?;
        info!("Status endpoint: {status_url}");
        tokio::spawn(status::poll_while_connected(
            HttpStatusSource::new(status_url),
            client.watch_status(),
            count_tx,
            config.status.poll_interval(),
        ));
    }

    println!("chat-client v{} (type /quit to leave)", env!("CARGO_PKG_VERSION"));
    client.start();

    // Run until /quit, end of input or ctrl-c, then close the connection
    let result = run_terminal(&client, count_rx).await;
    client.shutdown().await;
    result
}

/// Terminal front end: stdin lines go to `send`, incoming messages and
/// state changes are printed to stdout.
async fn run_terminal(client: &ChatClient, mut users: watch::Receiver<Option<u32>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut incoming = client.subscribe();
    let mut status = client.watch_status();
    let mut backend: Option<String> = None;
    let mut users_live = true;

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_input(client, &line, &users).await {
                        break;
                    }
                }
                None => {
                    info!("Input closed, exiting");
                    break;
                }
            },
            msg = incoming.recv() => match msg {
                Ok(msg) => {
                    // Announce the serving pod once
                    if backend.is_none() {
                        backend = current_backend(std::slice::from_ref(&msg)).map(str::to_string);
                        if let Some(pod) = &backend {
                            println!("Backend: {pod}");
                        }
                    }
                    print_message(&msg);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Display fell behind, {skipped} messages not shown");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                print_status(current);
            }
            changed = users.changed(), if users_live => {
                if changed.is_err() {
                    users_live = false;
                } else if let Some(count) = *users.borrow_and_update() {
                    println!("{}", users_online(count));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                break;
            }
        }
    }

    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input(client: &ChatClient, line: &str, users: &watch::Receiver<Option<u32>>) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }

    // Slash commands first, anything else is chat
    match trimmed {
        "/quit" | "/exit" => return false,
        "/reconnect" => {
            println!("Reconnecting...");
            client.start();
        }
        "/status" => {
            let status = client.status();
            let messages = client.messages().await;
            println!("State: {} (retries: {})", status.state, status.retries);
            println!("Backend: {}", current_backend(&messages).unwrap_or("unknown"));
            if let Some(count) = *users.borrow() {
                println!("{}", users_online(count));
            }
            println!("Messages received: {}", messages.len());
        }
        _ => {
            if !client.connected() || !client.send(line).await {
                println!("Not connected, message not sent");
            }
        }
    }
    true
}

fn print_message(msg: &ApplicationMessage) {
    let time = msg
        .sent_at()
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let pod = msg
        .pod_name
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| format!(" (pod: {p})"))
        .unwrap_or_default();
    if msg.is_system() {
        println!("[{time}] * {}{pod}", msg.content);
    } else {
        println!("[{time}] {}{pod}", msg.content);
    }
}

fn print_status(status: ConnectionStatus) {
    match status.state {
        ConnectionState::Open => println!("● Connected"),
        ConnectionState::Reconnecting => println!(
            "○ Disconnected - trying to reconnect (attempt {})...",
            status.retries
        ),
        ConnectionState::Exhausted => {
            error!("Giving up after {} reconnection attempts", status.retries);
            println!("○ Disconnected - no automatic reconnect remains, type /reconnect to retry");
        }
        ConnectionState::Closed => println!("○ Disconnected"),
        ConnectionState::Idle | ConnectionState::Connecting => {}
    }
}

fn users_online(count: u32) -> String {
    if count == 1 {
        "1 user online".to_string()
    } else {
        format!("{count} users online")
    }
}
