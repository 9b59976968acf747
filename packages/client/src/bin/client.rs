//! CLI chat client for the site's real-time chat subsystem.
//!
//! Logs in with an auth token, keeps a socket connection alive, and chats
//! with the site's assistant from stdin. Assistant replies and server
//! notifications are printed as they arrive over the push channel.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin parlor-client -- --token <JWT>
//! cargo run --bin parlor-client    # reuses a previously stored token
//! ```
//!
//! Commands: `/new` starts a fresh main chat, `/audio <text>` requests an
//! audio rendition, `/quit` exits. Anything else is sent to the main chat.

use std::sync::Arc;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::{broadcast, mpsc};

use parlor_client::api::{ChatApi, HttpChatApi};
use parlor_client::audio::NullAudioPlayer;
use parlor_client::scope::Scope;
use parlor_client::services::chat::ChatService;
use parlor_client::services::messaging::MessagingService;
use parlor_client::services::server_events::ServerEventsService;
use parlor_client::services::site_settings::SiteSettingsService;
use parlor_client::services::socket::SocketService;
use parlor_client::services::tarot_chat::TarotChatService;
use parlor_client::services::tarot_game::TarotGameService;
use parlor_client::services::token::{FileTokenStore, TokenService};
use parlor_shared::logger::setup_logger;
use parlor_shared::models::ChatMessageRole;
use parlor_shared::time::SystemClock;

#[derive(Parser, Debug)]
#[command(name = "parlor-client")]
#[command(about = "Chat with the site's assistant over its socket API", long_about = None)]
struct Args {
    /// Auth token (JWT). When omitted, a previously stored token is reused.
    #[arg(short = 't', long)]
    token: Option<String>,

    /// REST API root
    #[arg(long, default_value = "http://127.0.0.1:3000/api")]
    api_url: String,

    /// WebSocket endpoint
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    socket_url: String,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), "info");

    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!("Client error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let scope = Scope::new();
    let messaging = MessagingService::new();

    let token_service = TokenService::new(
        Arc::new(FileTokenStore::default_location()),
        Arc::new(SystemClock),
    );
    if let Some(token) = args.token {
        token_service.set_token(token);
    }
    if token_service.token().is_none() {
        return Err("no auth token available; pass one with --token".into());
    }
    if let Some(payload) = token_service.payload() {
        tracing::info!(
            "Logged in as {}",
            payload.user_name.as_deref().unwrap_or(payload.user_id.as_str())
        );
    }

    let socket = SocketService::new(
        &scope,
        &args.socket_url,
        token_service.token_watch(),
        messaging.clone(),
    );
    let site_settings = SiteSettingsService::new(&scope, socket.clone());
    let _server_events = ServerEventsService::new(&scope, socket.clone(), messaging.clone());

    let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(
        &args.api_url,
        token_service.token_watch(),
    ));
    let chat = ChatService::new(
        &scope,
        api.clone(),
        socket.clone(),
        messaging.clone(),
        site_settings,
        Arc::new(NullAudioPlayer),
        token_service.token_watch(),
    );
    let tarot_games = TarotGameService::new(&scope, api, socket, chat.clone());
    let _tarot_chat = TarotChatService::new(&scope, tarot_games.clone(), chat.clone());

    if let Err(e) = tarot_games.load_tarot_games().await {
        tracing::warn!("Could not load tarot games: {}", e);
    }
    if let Err(e) = tarot_games.load_tarot_chats().await {
        tracing::warn!("Could not load tarot chats: {}", e);
    }

    spawn_user_message_printer(messaging.subscribe());
    spawn_received_message_printer(chat.received_messages());

    println!("\nType a message and press Enter to send. /new, /audio <text>, /quit.\n");

    let mut input_rx = spawn_readline_thread();
    while let Some(line) = input_rx.recv().await {
        if line == "/quit" {
            break;
        }
        if line == "/new" {
            if chat.start_new_main_chat().await.is_some() {
                println!("Started a new chat.");
            }
            continue;
        }
        if let Some(text) = line.strip_prefix("/audio ") {
            chat.request_audio(text).await;
            continue;
        }
        let Some(main) = chat.get_main_chat().await else {
            continue;
        };
        chat.send_chat_message(&main.id, line).await;
    }

    scope.cancel();
    Ok(())
}

/// Print user-facing notifications as they are published.
fn spawn_user_message_printer(
    mut user_messages: broadcast::Receiver<parlor_shared::models::UserMessage>,
) {
    tokio::spawn(async move {
        loop {
            match user_messages.recv().await {
                Ok(message) => {
                    let title = message.title.as_deref().unwrap_or("Notice");
                    println!("\n[{:?}] {}: {}", message.level, title, message.content);
                    redisplay_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notification printer lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Print pushed chat messages (the assistant's replies) as they arrive.
fn spawn_received_message_printer(
    mut received: broadcast::Receiver<parlor_client::services::chat::ReceivedChatMessage>,
) {
    tokio::spawn(async move {
        loop {
            match received.recv().await {
                Ok(received) => {
                    let speaker = match received.message.role {
                        ChatMessageRole::Assistant => "assistant",
                        ChatMessageRole::User => "you",
                        ChatMessageRole::System => "system",
                    };
                    println!("\n{}: {}", speaker, received.message.content);
                    redisplay_prompt();
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Message printer lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn redisplay_prompt() {
    use std::io::Write as _;
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Run rustyline on a blocking thread and bridge lines into the async world.
fn spawn_readline_thread() -> mpsc::UnboundedReceiver<String> {
    let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };

        loop {
            match rl.readline("> ") {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        rl.add_history_entry(line).ok();
                        if input_tx.send(line.to_string()).is_err() {
                            // Channel closed, exit thread
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    // Ctrl+C
                    tracing::info!("Interrupted");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    // Ctrl+D
                    tracing::info!("EOF");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });

    input_rx
}
