use std::io::Write;

use anyhow::{Context, Error};
use clap::Parser;
use hyper::Uri;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc::UnboundedReceiver,
};
use tokio_util::sync::CancellationToken;

use chat_relay::client::{ChatSession, GREETING, HttpTransport, SendState, SessionEvent};

#[derive(Clone, Debug, Parser)]
struct Args {
    /// Relay message endpoint
    #[arg(short, long, default_value = "http://127.0.0.1:3000/api/message")]
    url: String,
}

/// Prints reply text as it arrives, until the submission settles.
async fn print_reply(events: &mut UnboundedReceiver<SessionEvent>) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Chunk { text, .. } => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            SessionEvent::Notification(text) => eprintln!("\n[{text}]"),
            SessionEvent::State(SendState::Done) => {
                println!();
                return;
            }
            SessionEvent::State(SendState::Failed) => return,
            SessionEvent::State(state) => log::debug!("Session state: {state:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::builder().init();
    let args = Args::parse();
    let url = args.url.parse::<Uri>().context("Cannot parse relay URL")?;

    let mut session = ChatSession::new(HttpTransport::new(url));
    let mut events = session.subscribe();

    println!("{GREETING}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });
        let (res, ()) = tokio::join!(session.submit(line, &cancel), print_reply(&mut events));
        interrupt.abort();

        if let Err(err) = res {
            log::warn!("{err}");
        }
    }
    Ok(())
}
