//! Chatbot CLI - Interactive Terminal Driver
//!
//! Line-oriented REPL over `chatbot-core`, used to exercise the streaming
//! engine against a real chat server.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (config file + environment)
//! chatbot
//!
//! # Custom server and tone
//! chatbot --base-url https://chat.example.com --tone muneoz
//!
//! # Verbose logging (goes to stderr)
//! RUST_LOG=chatbot_core=debug chatbot
//! ```
//!
//! # Commands
//!
//! - `/ubti`: start a UBTI interview
//! - `/result`: fetch the UBTI result once all questions are answered
//! - `/likes`, `/usage`: recommendations
//! - `/tone general|muneoz`: switch tone
//! - `/state`: show session state
//! - `/reset`: end the conversation and start a new one
//! - `/quit`
//!
//! Ctrl-C cancels the reply being streamed.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chatbot_core::config::{default_config_path, load_config_from_path};
use chatbot_core::{
    ChatClient, ChatError, ConfigOverrides, ExchangeError, ExchangeOutcome, ExchangeStatus,
    HttpTransport, ProtocolEvent, SessionId, StreamChunk, StreamConsumer, Tone, UbtiPhase,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Chatbot - streaming chat and UBTI interview client
#[derive(Parser, Debug)]
#[command(name = "chatbot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Chat server base URL
    #[arg(short = 'u', long, value_name = "URL")]
    base_url: Option<String>,

    /// Answer tone (general, muneoz)
    #[arg(short = 't', long)]
    tone: Option<Tone>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "CHATBOT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Connection timeout in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Initialize logging on stderr so streamed text on stdout stays clean
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chatbot_cli={level},chatbot_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Prints delivered chunks as they arrive
#[derive(Debug, Default)]
struct Printer {
    mid_line: bool,
}

impl Printer {
    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl StreamConsumer for Printer {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => {
                if !self.mid_line {
                    print!("bot> ");
                    self.mid_line = true;
                }
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            StreamChunk::Event(event) => match event {
                ProtocolEvent::MessageEnd => self.end_line(),
                ProtocolEvent::PlanRecommendations { plans } => {
                    self.end_line();
                    for plan in plans {
                        println!("  [plan] {} - {}원 ({}, {})", plan.name, plan.price, plan.data, plan.voice);
                    }
                }
                ProtocolEvent::SubscriptionRecommendations { items } => {
                    self.end_line();
                    let cards = chatbot_core::SubscriptionCards::from_items(&items);
                    if let Some(main) = cards.main_subscription {
                        println!("  [subscription] {} - {}원", main.title, main.price);
                    }
                    if let Some(brand) = cards.life_brand {
                        println!("  [life brand] {}", brand.name);
                    }
                }
                ProtocolEvent::UsageAnalysis { data } => {
                    self.end_line();
                    println!(
                        "  [usage] {} ({}원): {:.0}% used, {:.1}GB left",
                        data.current_plan, data.current_price, data.usage_percentage, data.remaining_data
                    );
                }
                ProtocolEvent::QuestionsComplete => {
                    self.end_line();
                    println!("  (all questions answered, type /result)");
                }
                _ => {}
            },
        }
    }

    fn on_question(&mut self, question: &str) {
        self.end_line();
        println!("  [question] {question}");
    }

    fn on_error(&mut self, error: &ExchangeError) {
        self.end_line();
        if let Some(partial) = error.partial_text() {
            eprintln!("  (reply interrupted after {} chars)", partial.chars().count());
        }
    }
}

/// Run one turn, cancelling it on Ctrl-C
async fn run_turn<F>(client: &ChatClient<HttpTransport>, session: &SessionId, turn: F)
where
    F: std::future::Future<Output = Result<ExchangeOutcome, ChatError>>,
{
    tokio::pin!(turn);
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            _ = tokio::signal::ctrl_c() => {
                if client.cancel(session) {
                    info!(session_id = %session, "Reply cancelled");
                }
            }
        }
    };

    match result {
        Ok(outcome) if outcome.status == ExchangeStatus::Cancelled => println!("\n  (cancelled)"),
        Ok(_) => {}
        Err(e) => eprintln!("error: {e}"),
    }
}

fn print_help() {
    println!("commands: /ubti /result /likes /usage /tone <general|muneoz> /state /reset /quit");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone().or_else(default_config_path))
        .context("Failed to load configuration")?;
    let mut overrides = ConfigOverrides::new();
    overrides.base_url = args.base_url.clone();
    overrides.tone = args.tone;
    overrides.connect_timeout_ms = args.connect_timeout_ms;
    overrides
        .apply(&mut config)
        .context("Invalid command-line option")?;

    info!(
        base_url = %config.base_url,
        tone = %config.tone,
        source = %config.source(),
        "Starting chatbot"
    );

    let transport = HttpTransport::new(&config.base_url, config.connect_timeout)
        .context("Failed to create HTTP transport")?;
    let client = ChatClient::new(transport, config.endpoints.clone(), config.throttle);
    let mut tone = config.tone;
    let mut session = client.create_session(Some(chatbot_core::chat::GREETING));
    println!("bot> {}", chatbot_core::chat::GREETING);
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        let _ = std::io::stdout().flush();
        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut printer = Printer::default();
        match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
            ("/quit" | "/exit", _) => break,
            ("/help", _) => print_help(),
            ("/tone", value) => match value.parse::<Tone>() {
                Ok(t) => {
                    tone = t;
                    println!("  tone: {tone}");
                }
                Err(e) => eprintln!("error: {e}"),
            },
            ("/ubti", _) => {
                let turn = async {
                    client
                        .start_ubti(Some(&session), tone, &mut printer)
                        .await
                        .map(|(_, outcome)| outcome)
                };
                run_turn(&client, &session, turn).await;
            }
            ("/likes", _) => {
                run_turn(&client, &session, client.likes_recommendation(&session, tone, &mut printer)).await;
            }
            ("/usage", _) => {
                run_turn(&client, &session, client.usage_recommendation(&session, tone, &mut printer)).await;
            }
            ("/result", _) => match client.fetch_ubti_result(&session, tone).await {
                Ok(result) => match serde_json::to_string_pretty(&result) {
                    Ok(text) => println!("{text}"),
                    Err(e) => eprintln!("error: {e}"),
                },
                Err(e) => eprintln!("error: {e}"),
            },
            ("/state", _) => {
                let chat = client.chat(&session)?;
                let view = chat.view();
                let ubti = chat.ubti().snapshot();
                println!("  session: {session}");
                println!("  streaming: {:?}", view.streaming_state);
                println!("  ubti: {}", ubti.phase);
                if let Some(progress) = ubti.progress_label() {
                    println!("  question: {progress}");
                }
                if ubti.phase == UbtiPhase::ReadyToSubmit {
                    println!("  result ready, type /result");
                }
            }
            ("/reset", _) => {
                session = client.reset_chat(&session);
                println!("bot> {}", chatbot_core::chat::RESET_GREETING);
            }
            (command, _) if command.starts_with('/') => {
                warn!(command = %command, "Unknown command");
                print_help();
            }
            _ => {
                run_turn(&client, &session, client.send_message(&session, line, tone, &mut printer)).await;
            }
        }
    }

    info!("Goodbye");
    Ok(())
}
