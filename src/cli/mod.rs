//! Line-oriented front end. Deliberately thin: it resolves options, wires a
//! [`ChatSession`], and shuttles text between stdin and the token stream.

use std::error::Error;
use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::core::backends::find_backend;
use crate::core::config::Config;
use crate::core::session::{
    ChatSession, RejectReason, SendOutcome, SessionOptions, SessionPhase,
};
use crate::utils::logging::LoggingState;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "A terminal chat client with automatic online-to-local failover")]
#[command(long_about = "Tandem streams chat completions from a hosted AI provider and, when the \
network or the provider fails mid-conversation, retries the message against \
a local on-device model without losing the conversation.\n\n\
Credentials are read from <BACKEND>_API_KEY environment variables \
(GEMINI_API_KEY, OPENAI_API_KEY, GROQ_API_KEY, ANTHROPIC_API_KEY).\n\n\
Controls:\n\
  Enter             Send the message\n\
  Ctrl+C            Interrupt the current response\n\
  /clear            Discard the conversation\n\
  /quit             Exit")]
pub struct Args {
    #[arg(
        short,
        long,
        help = "Hosted backend to use (gemini, openai, groq, anthropic)"
    )]
    backend: Option<String>,

    #[arg(short, long, help = "Model override for the selected backend")]
    model: Option<String>,

    #[arg(long, help = "Base-URL override for the selected backend")]
    base_url: Option<String>,

    #[arg(long, value_name = "PATH", help = "Local model file for offline inference")]
    model_path: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        help = "Download the local model from this URL before starting"
    )]
    model_url: Option<String>,

    #[arg(long, help = "Cap on generated tokens per reply")]
    max_output_tokens: Option<u32>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Append a transcript of the conversation to FILE"
    )]
    log: Option<String>,
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e}");
            Config::default()
        }
    };

    let backend_id = args
        .backend
        .or(config.backend)
        .unwrap_or_else(|| "openai".to_string());
    let credential = find_backend(&backend_id)
        .and_then(|descriptor| std::env::var(descriptor.credential_env()).ok())
        .unwrap_or_default();
    let logging = LoggingState::new(args.log)?;

    let options = SessionOptions {
        backend_id: Some(backend_id),
        credential,
        model: args.model.or(config.model),
        base_url: args.base_url.or(config.base_url),
        model_path: args.model_path.or(config.model_path),
        max_output_tokens: args.max_output_tokens.or(config.max_output_tokens),
    };
    let model_url = args.model_url.or(config.model_url);

    let mut session = ChatSession::builder().build();

    if options.model_path.is_none() && model_url.is_some() {
        let url = model_url.as_deref().unwrap_or_default();
        println!("Downloading model from {url}");
        if session.provision_model(url, options) {
            if let Some(cancel) = session.provisioning_cancel_handle() {
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
            }
            session
                .wait_for_provisioning(|progress| {
                    match progress.fraction() {
                        Some(fraction) => print!("\r{:>5.1}%", fraction * 100.0),
                        None => print!("\r{} bytes", progress.bytes_downloaded),
                    }
                    let _ = std::io::stdout().flush();
                })
                .await;
            println!();
            if session.phase() == SessionPhase::Uninitialized {
                println!("Download cancelled.");
                return Ok(());
            }
        }
    } else {
        session.initialize(options);
    }

    if session.phase() != SessionPhase::Ready {
        return Err(session
            .status()
            .unwrap_or("setup failed")
            .to_string()
            .into());
    }
    println!("{}", session.status().unwrap_or("Ready"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            prompt();
            continue;
        }
        if text == "/quit" || text == "/exit" {
            break;
        }
        if text == "/clear" {
            session.clear_conversation();
            println!("Conversation cleared.");
            prompt();
            continue;
        }

        if let Err(e) = logging.log_message(&format!("You: {text}")) {
            eprintln!("Failed to log message: {e}");
        }

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        let outcome = session
            .send_with(text, cancel, |token| {
                print!("{token}");
                let _ = std::io::stdout().flush();
            })
            .await;
        watcher.abort();
        println!();

        match outcome {
            SendOutcome::Completed(_) => {
                if let Some(turn) = session.conversation().last_assistant() {
                    if let Err(e) = logging.log_message(&turn.content) {
                        eprintln!("Failed to log response: {e}");
                    }
                }
            }
            SendOutcome::Cancelled => println!("(interrupted)"),
            SendOutcome::Failed { message } => println!("Error: {message}"),
            SendOutcome::Rejected(RejectReason::NoBackendAvailable) => {
                println!("No backend is ready to answer.")
            }
            SendOutcome::Rejected(_) => {}
        }

        for notice in session.take_notices() {
            println!(
                "⚠ {} failed ({}); switched to the local model.",
                notice.backend, notice.message
            );
        }
        prompt();
    }

    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
