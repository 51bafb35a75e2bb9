//! hubmq-cli – interactive subscriber shell.
//
//  $ hubmq-cli 127.0.0.1:7878 --id dashboard-1
//  > sub orders eu
//  > start
//  > [orders/eu] {"total":9000} @ 1724577600000

use std::time::Duration;

use clap::Parser;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use uuid::Uuid;

use hubmq::client::{ClientOptions, HubClient};
use hubmq::config::ClientConfig;
use hubmq::logging::init_logging_with;
use hubmq::HubError;

#[derive(Debug, Parser)]
#[command(name = "hubmq-cli", version, about = "hubmq subscriber shell")]
struct Cli {
    /// Hub address (host:port)
    addr: String,

    /// Client identity; generated when omitted.
    #[arg(short, long)]
    id: Option<String>,

    /// Milliseconds to wait for command acks (0 = fire and forget).
    #[arg(long, default_value_t = 1_000)]
    ack_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging_with("warn");
    let cli = Cli::parse();

    let identity = cli.id.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4()));
    let options = ClientOptions::from_config(&cli.addr, &ClientConfig::default())
        .with_identifier(identity.as_str())
        .with_ack_timeout(Duration::from_millis(cli.ack_timeout_ms));

    let (client, mut inbox) = HubClient::connect(options).await?;
    println!("Connected to {} as {identity}. Type `help` for commands.", cli.addr);

    // Background task prints every delivered envelope.
    let printer = tokio::spawn(async move {
        while let Some(msg) = inbox.recv().await {
            let subjects = msg
                .subjects
                .iter()
                .map(|(subject, key)| match key {
                    Some(key) => format!("{subject}/{key}"),
                    None => subject.clone(),
                })
                .collect::<Vec<_>>()
                .join(",");
            let payload = String::from_utf8_lossy(&msg.payload);
            println!("[{subjects}] {payload} @ {}", msg.sent_at_ms);
        }
    });

    let mut rl: Editor<(), DefaultHistory> = DefaultEditor::new()?;
    loop {
        let Ok(line) = rl.readline("> ") else { break };
        let _ = rl.add_history_entry(line.as_str());

        let keep_going = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["help"] => {
                println!(
                    "sub <subject> [key ...] | unsub <subject> [key ...] | \
                     start [from_ms] | stop | subjects | exit"
                );
                true
            }
            ["exit" | "quit"] => false,

            ["sub", subject, keys @ ..] => {
                report(client.subscribe(*subject, owned_keys(keys)).await)
            }

            ["unsub", subject, keys @ ..] => {
                report(client.unsubscribe(*subject, owned_keys(keys)).await)
            }

            ["start"] => report(client.start_receive(None).await),
            ["start", from] => match from.parse::<u64>() {
                Ok(from_ms) => report(client.start_receive(Some(from_ms)).await),
                Err(_) => {
                    println!("start takes a millisecond timestamp");
                    true
                }
            },

            ["stop"] => report(client.stop_receive().await),

            ["subjects"] => {
                for subject in client.subjects() {
                    println!("{subject}");
                }
                true
            }

            [] => true,
            _ => {
                println!("Unknown cmd. Type `help`.");
                true
            }
        };
        if !keep_going {
            break;
        }
    }

    client.close().await;
    let _ = printer.await;
    Ok(())
}

/// Empty key list on the wire means the subject-wide wildcard.
fn owned_keys(keys: &[&str]) -> Option<Vec<String>> {
    (!keys.is_empty()).then(|| keys.iter().map(|k| k.to_string()).collect())
}

/// Prints the outcome; a fatal error ends the shell.
fn report(result: Result<(), HubError>) -> bool {
    match result {
        Ok(()) => {
            println!("ok");
            true
        }
        Err(err) => {
            println!("❌ {err}");
            !err.is_fatal()
        }
    }
}
