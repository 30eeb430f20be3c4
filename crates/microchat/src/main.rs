//! Send a chat request to one of the supported vendors and print the reply.
//!
//! Reads the API key from `MICROCHAT_API_KEY` (not needed for Ollama).
//! `MICROCHAT_PROVIDER`, `MICROCHAT_MODEL` and `MICROCHAT_BASE_URL` supply
//! defaults that the flags below override.
//!
//! # Examples
//!
//! ```sh
//! # Basic request
//! microchat --user "Summarize the plot of Hamlet"
//!
//! # Stream from Anthropic with a system prompt
//! microchat --provider anthropic --stream \
//!   --system "You are terse." --user "Explain SSE in one line."
//!
//! # Pipe content from stdin through a local Ollama server
//! cat notes.md | microchat --provider ollama --stdin --user "Summarize:"
//!
//! # Run on the background worker with a poll loop
//! microchat --user "Hello" --async --stream --retries 3
//! ```

use std::io::{self, Read, Write};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use microchat::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Send a chat request and print the response.
#[derive(Parser)]
#[command(name = "microchat", version)]
struct Cli {
    // ── Message content ────────────────────────────────────────
    /// System prompt to set the assistant's behavior
    #[arg(long)]
    system: Option<String>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin
    #[arg(long)]
    stdin: bool,

    // ── Provider selection ─────────────────────────────────────
    /// Vendor: openai, anthropic, gemini, or ollama
    #[arg(long)]
    provider: Option<Provider>,

    /// Model identifier (defaults to the provider's default model)
    #[arg(long)]
    model: Option<String>,

    /// Override the vendor endpoint
    #[arg(long)]
    base_url: Option<String>,

    // ── Sampling parameters ────────────────────────────────────
    /// Sampling temperature
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Maximum tokens in the response (0 = vendor default)
    #[arg(long, default_value_t = 1024)]
    max_tokens: u32,

    /// Path to a JSON file holding an array of tool definitions
    #[arg(long)]
    tools: Option<String>,

    // ── Execution ──────────────────────────────────────────────
    /// Stream the response as it is generated
    #[arg(long)]
    stream: bool,

    /// Run on the background worker and poll for completion
    #[arg(long = "async")]
    run_async: bool,

    /// Retry transient failures up to this many times
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("microchat=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn read_stdin_content() -> Result<String, String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| format!("failed to read stdin: {e}"))?;
    Ok(buf)
}

fn build_user_content(cli: &Cli) -> Result<String, String> {
    let stdin_text = if cli.stdin {
        Some(read_stdin_content()?)
    } else {
        None
    };

    match (&cli.user, stdin_text) {
        (Some(msg), Some(piped)) => Ok(format!("{msg}\n\n{piped}")),
        (Some(msg), None) => Ok(msg.clone()),
        (None, Some(piped)) => Ok(piped),
        (None, None) => Err("provide --user, --stdin, or both".to_string()),
    }
}

fn load_tools(path: &str) -> Result<Vec<ToolDefinition>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read tools file '{path}': {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("failed to parse tools file '{path}': {e}"))
}

fn build_config(cli: &Cli) -> Result<ClientConfig, String> {
    let mut config = ClientConfig::from_env()?.with_timeout(Duration::from_secs(cli.timeout_secs));
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    if let Some(url) = &cli.base_url {
        config.base_url = Some(url.clone());
    }
    if cli.retries > 0 {
        config = config.with_retries(cli.retries);
    }
    if config.api_key.is_empty() && config.provider.requires_api_key() {
        return Err("MICROCHAT_API_KEY environment variable is not set".to_string());
    }
    Ok(config)
}

fn build_options(cli: &Cli) -> Result<ChatOptions, String> {
    let mut options = ChatOptions::default()
        .with_temperature(cli.temperature)
        .with_max_tokens(cli.max_tokens);
    if let Some(path) = &cli.tools {
        let tools = load_tools(path)?;
        eprintln!("  Loaded {} tool(s) from {path}", tools.len());
        for tool in tools {
            options = options.with_tool(tool);
        }
    }
    Ok(options)
}

fn print_fragment(text: &str, done: bool) {
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(text.as_bytes());
    if done {
        let _ = stdout.write_all(b"\n");
    }
    let _ = stdout.flush();
}

/// Launch on the background slot and poll until the completion callback fires.
async fn run_async(
    client: &mut ChatClient,
    messages: Vec<ChatMessage>,
    options: ChatOptions,
    stream: bool,
) -> Result<ExecutionResult, String> {
    let finished: Arc<Mutex<Option<ExecutionResult>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&finished);
    let on_done = move |result: &ExecutionResult| {
        *sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
    };

    let launched = if stream {
        client.chat_stream_async(messages, options, print_fragment, on_done)
    } else {
        client.chat_async(messages, options, on_done)
    };
    if !launched {
        let message = client.last_error_message();
        return Err(if message.is_empty() {
            "failed to start background request".to_string()
        } else {
            message
        });
    }

    while !client.poll_async() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let result = finished
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .unwrap_or_else(|| client.async_result());
    Ok(result)
}

async fn send_request(cli: &Cli) -> Result<String, String> {
    let user_content = build_user_content(cli)?;
    let config = build_config(cli)?;
    let options = build_options(cli)?;

    let mut messages = Vec::new();
    if let Some(sys) = &cli.system {
        messages.push(ChatMessage::system(sys));
    }
    messages.push(ChatMessage::user(user_content));

    let mut client = ChatClient::new(config)?;

    let result = match (cli.run_async, cli.stream) {
        (true, stream) => run_async(&mut client, messages, options, stream).await?,
        (false, true) => {
            client
                .chat_stream_messages(&messages, &options, print_fragment)
                .await
        }
        (false, false) => client.chat_messages(&messages, &options).await,
    };

    if !result.success {
        let kind = result.error.map(|k| k.as_str()).unwrap_or("Unknown");
        return Err(format!("{kind}: {}", result.error_message));
    }

    let mut output = if cli.stream { String::new() } else { result.content.clone() };
    if result.has_tool_calls() {
        let json = serde_json::to_string_pretty(&result.tool_calls)
            .map_err(|e| format!("failed to serialize tool calls: {e}"))?;
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&format!("[tool_calls]\n{json}"));
    }
    if result.total_tokens() > 0 {
        eprintln!(
            "  [tokens] prompt={} completion={} total={}",
            result.prompt_tokens,
            result.completion_tokens,
            result.total_tokens()
        );
    }
    Ok(output)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match send_request(&cli).await {
        Ok(response) if response.is_empty() => {}
        Ok(response) => println!("{response}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
