//! Interactive accept prompt.
//!
//! Runs as its own task reading stdin, so the import loop keeps acking and
//! answering discovery while the operator makes up their mind.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use ferry_services::{Decision, ImportHandle, SessionKey};

/// A transfer request waiting for the operator.
#[derive(Debug)]
pub struct Offer {
    pub key: SessionKey,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Yes,
    No,
    Unclear,
}

fn parse_answer(line: &str) -> Answer {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Answer::Yes,
        "n" | "no" => Answer::No,
        _ => Answer::Unclear,
    }
}

pub async fn accept_loop(handle: ImportHandle, mut offers: mpsc::UnboundedReceiver<Offer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(offer) = offers.recv().await {
        let size = offer
            .total_bytes
            .map(|n| format!(" ({n} bytes)"))
            .unwrap_or_default();
        println!(
            "Incoming data transfer request from {}{size}.",
            offer.key.peer.ip()
        );

        let decision = loop {
            print!("Accept data? (y/n): ");
            let _ = std::io::stdout().flush();

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => {
                    // stdin closed: nobody can answer, so refuse.
                    tracing::warn!(key = %offer.key, "stdin closed, rejecting transfer");
                    break Decision::Reject;
                }
            };
            match parse_answer(&line) {
                Answer::Yes => break Decision::Accept,
                Answer::No => break Decision::Reject,
                Answer::Unclear => println!("Please enter 'y' or 'n'."),
            }
        };

        if !handle.decide(offer.key, decision).await {
            println!("Request from {} is no longer pending.", offer.key.peer.ip());
            continue;
        }
        match decision {
            Decision::Accept => println!("Receiving data..."),
            Decision::Reject => println!("Data rejected."),
        }
    }
}
