//! The pipekvs client.
//!
//! Connects to a server's intake pipe and turns stdin commands into session
//! requests:
//!
//! ```text
//! SUBSCRIBE <key>
//! UNSUBSCRIBE <key>
//! DELAY <ms>
//! DISCONNECT
//! HELP
//! ```
//!
//! A background thread prints every notification frame as a `(key,value)`
//! line; end-of-input on the notification pipe (the server shut the session
//! down) terminates the client. The connection's subscription ledger refuses
//! duplicate subscriptions and enforces the per-client limit before anything
//! reaches the server.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;

use pipekvs::{ClientConnection, SubscribeOutcome, UnsubscribeOutcome};

const HELP_TEXT: &str = "Available commands:\n  SUBSCRIBE <key>\n  UNSUBSCRIBE <key>\n  DELAY <ms>\n  DISCONNECT\n  HELP";

#[derive(Debug, Parser)]
#[command(name = "pipekvs-client", version, about = "Interactive client for the pipekvs server")]
struct Args {
    /// Identifier used to name this client's pipes
    client_id: String,
    /// Path of the server's intake FIFO
    intake_path: PathBuf,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        eprintln!("pipekvs-client: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> io::Result<()> {
    let dir = std::env::temp_dir();
    let request_path = dir.join(format!("req{}", args.client_id));
    let response_path = dir.join(format!("resp{}", args.client_id));
    let notification_path = dir.join(format!("notif{}", args.client_id));

    let connection = ClientConnection::connect(
        &request_path,
        &response_path,
        &notification_path,
        &args.intake_path,
    )?;

    let reader = connection.notifications();
    let _printer = thread::Builder::new()
        .name("notification-printer".to_string())
        .spawn(move || {
            loop {
                match reader.next() {
                    Ok(Some(notification)) => {
                        println!("({},{})", notification.key, notification.value);
                        if notification.is_delete() {
                            println!("Key has been removed from the subscriptions.");
                        }
                    }
                    Ok(None) => {
                        eprintln!("Server closed the notification pipe.");
                        std::process::exit(0);
                    }
                    Err(err) => {
                        eprintln!("Failed to read a notification: {err}");
                        std::process::exit(1);
                    }
                }
            }
        })?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(key) = line.strip_prefix("SUBSCRIBE ") {
            match connection.subscribe(key.trim())? {
                SubscribeOutcome::AlreadySubscribed => {
                    eprintln!("The subscription was already made.");
                }
                SubscribeOutcome::LimitReached => {
                    eprintln!("Maximum number of subscriptions has been reached.");
                }
                SubscribeOutcome::Subscribed | SubscribeOutcome::KeyMissing => {}
            }
        } else if let Some(key) = line.strip_prefix("UNSUBSCRIBE ") {
            match connection.unsubscribe(key.trim())? {
                UnsubscribeOutcome::NoSubscriptions => {
                    eprintln!("No subscriptions done.");
                }
                UnsubscribeOutcome::NotSubscribed => {
                    eprintln!("The key is not subscribed.");
                }
                UnsubscribeOutcome::Unsubscribed | UnsubscribeOutcome::KeyMissing => {}
            }
        } else if let Some(delay) = line.strip_prefix("DELAY ") {
            match delay.trim().parse::<u64>() {
                Ok(ms) => thread::sleep(Duration::from_millis(ms)),
                Err(_) => eprintln!("Invalid delay: {delay}"),
            }
        } else if line == "DISCONNECT" {
            return connection.disconnect();
        } else if line == "HELP" {
            println!("{HELP_TEXT}");
        } else {
            eprintln!("Unknown command: {line}");
        }
    }
    connection.disconnect()
}
