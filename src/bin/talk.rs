//! Talk to the AI friend over the job API
//!
//! `talk <message>` sends one message; `talk` with no arguments starts an
//! interactive chat that keeps the conversation history between turns.

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use aifriend::memory::AI_FIRST_MESSAGE;
use aifriend::{FriendConfig, JobStatus, Turn};

const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "talk", about = "Talk to the AI friend", long_about = None)]
struct Args {
    /// Message to send; omit it to start an interactive chat
    message: Vec<String>,

    /// Base URL of the API; defaults to http://AIFRIEND_HOST:AIFRIEND_PORT
    #[arg(long, env = "AIFRIEND_API_URL", value_name = "URL")]
    url: Option<String>,
}

#[derive(Deserialize)]
struct Submitted {
    job_id: String,
}

struct TalkClient {
    client: Client,
    url: String,
}

impl TalkClient {
    /// Submit, poll until finished, then forget the job
    async fn talk(&self, message: &str, history: &[Turn]) -> Result<JobStatus> {
        let response = self
            .client
            .post(format!("{}/talk", self.url))
            .json(&json!({ "message": message, "history": history }))
            .send()
            .await
            .context("API is not reachable")?;
        if response.status() != StatusCode::ACCEPTED {
            bail!("submit failed: {}", response.text().await?);
        }
        let submitted: Submitted = response.json().await?;
        let job_id = submitted.job_id;

        let mut last_hint = "";
        let status = loop {
            let status: JobStatus = self
                .client
                .get(format!("{}/status/{}", self.url, job_id))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let hint = match status {
                JobStatus::Pending => "Harry is busy right now",
                JobStatus::Loading => "Harry will wake up soon",
                _ => "",
            };
            if !hint.is_empty() && hint != last_hint {
                println!("({})", hint);
            }
            last_hint = hint;

            if status.is_terminal() {
                break status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        self.client
            .delete(format!("{}/{}", self.url, job_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(status)
    }
}

/// Send one message and print the exchange; returns the updated history
async fn exchange(client: &TalkClient, message: &str, history: Vec<Turn>) -> Result<Vec<Turn>> {
    let start = Instant::now();
    let status = client.talk(message, &history).await?;
    println!("Elapsed: {:>7.3} s\n", start.elapsed().as_secs_f64());

    match status {
        JobStatus::Succeeded { message: reply, history } => {
            println!("Human: {}", message);
            println!("AI: {}\n", reply);
            Ok(history)
        }
        JobStatus::Failed { error } => {
            eprintln!("Generation failed: {}", error);
            Ok(history)
        }
        JobStatus::Cancelled => {
            eprintln!("Job was cancelled");
            Ok(history)
        }
        other => bail!("unexpected final status {:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let url = match args.url {
        Some(url) => url,
        None => FriendConfig::from_env()?.api_url(),
    };

    let client = TalkClient {
        client: Client::new(),
        url: url.trim_end_matches('/').to_string(),
    };

    if !args.message.is_empty() {
        exchange(&client, &args.message.join(" "), Vec::new()).await?;
        return Ok(());
    }

    println!("AI: {}\n", AI_FIRST_MESSAGE);
    let mut history = Vec::new();
    let stdin = io::stdin();
    loop {
        print!("You: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "exit" || message == "quit" {
            break;
        }
        history = exchange(&client, message, history).await?;
    }

    Ok(())
}
