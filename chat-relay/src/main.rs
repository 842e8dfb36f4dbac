use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Error, bail, ensure};
use clap::Parser;
use hyper::Uri;
use tokio::fs;

use chat_relay::{
    Router,
    openai::{
        relay::MessageRelay,
        stream::DEFAULT_WARMUP_CHUNKS,
        upstream::{HttpUpstream, OPENAI_COMPLETIONS_URL},
    },
    ratelimit::{DEFAULT_MAX_REQUESTS, RateLimited, SlidingWindow},
    serve,
    service::Nothing,
};

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Address to listen for client connections
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    addr: String,
    /// Chat completions endpoint URL
    #[arg(short, long, default_value = OPENAI_COMPLETIONS_URL)]
    upstream: String,
    /// Model to request completions from
    #[arg(long)]
    model: Option<String>,
    /// System prompt, or `file:<path>` to read it from a file
    #[arg(long)]
    prompt: Option<String>,
    /// Number of forwarded chunks before deltas without a newline are no longer held back
    #[arg(long, default_value_t = DEFAULT_WARMUP_CHUNKS)]
    warmup_chunks: usize,
    /// Requests allowed per client within the rate limit window
    #[arg(long, default_value_t = DEFAULT_MAX_REQUESTS)]
    rate_limit: usize,
    /// Rate limit window in seconds
    #[arg(long, default_value_t = 10)]
    rate_limit_window: u64,
}

async fn load_prompt(prompt: String) -> Result<String, Error> {
    match prompt.strip_prefix("file:") {
        Some(path) => fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read prompt from {path:?}")),
        None => Ok(prompt),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::builder().init();
    let args = Args::parse();

    let upstream_url = args
        .upstream
        .parse::<Uri>()
        .context("Cannot parse upstream URL")?;
    let secure = match upstream_url.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        _ => bail!("Upstream URL must be http or https"),
    };
    ensure!(upstream_url.authority().is_some(), "Upstream URL has no host");

    if let Err(e) = dotenvy::dotenv() {
        log::warn!("Cannot load .env file: {e}");
    }
    let api_key = match env::var("OPENAI_API_KEY") {
        Ok(key) => Some(key),
        Err(_) if !secure => None,
        Err(e) => return Err(e).context("OpenAI API key is not set"),
    };
    let system_prompt = match args.prompt.or_else(|| env::var("SYSTEM_PROMPT").ok()) {
        Some(prompt) => Some(load_prompt(prompt).await?),
        None => None,
    };
    log::info!("System prompt: {system_prompt:?}");

    let window = Duration::from_secs(args.rate_limit_window);
    log::info!(
        "Rate limit: {} requests per {window:?} per client",
        args.rate_limit
    );
    // Shared by all connections.
    let limiter = Arc::new(SlidingWindow::new(args.rate_limit, window));

    serve(args.addr, async move || {
        Ok(Router::new(Nothing).push(
            "/api/message",
            RateLimited::new(
                limiter.clone(),
                MessageRelay::new(HttpUpstream::new(upstream_url.clone()).api_key(api_key.clone()))
                    .model(args.model.clone())
                    .system_prompt(system_prompt.clone())
                    .warmup_chunks(args.warmup_chunks),
            ),
        ))
    })
    .await
}
