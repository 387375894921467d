use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use llm_query_session::{
    engine::scripted::{Pacing, ScriptedEngine},
    setup_logging, GenerateOptions, LogConfig, ModelOptions, QueryId, QuerySession, QuerySnapshot,
};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const SCRIPT: &str = "Rust programs are built from crates. A crate can be a library or a \
                      binary, and cargo takes care of compiling and linking them together.";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    setup_logging(LogConfig {
        level: tracing::Level::INFO,
        timestamps: false,
        ..Default::default()
    })?;

    // The scripted engine only checks that the model file exists.
    let model_dir = tempfile::tempdir()?;
    std::fs::write(model_dir.path().join("13q4.gguf"), b"GGUF")?;

    let engine = ScriptedEngine::from_text(SCRIPT).with_pacing(Pacing::Fixed(Duration::from_millis(60)));
    let session = QuerySession::builder(engine)
        .with_model_dir(model_dir.path())
        .build()?;
    session.load_model(ModelOptions::default(), GenerateOptions::default(), "13q4.gguf")?;

    // Print only the part of each snapshot not shown yet.
    let shown: Mutex<Option<(QueryId, usize)>> = Mutex::new(None);
    let _subscription = session.subscribe(move |snapshot: &QuerySnapshot| {
        let mut shown = shown.lock();
        let offset = match *shown {
            Some((id, len)) if id == snapshot.query_id => len,
            _ => {
                print!("\n[{}] ", snapshot.query_id);
                0
            }
        };
        print!("{}", &snapshot.text[offset..]);
        let _ = std::io::stdout().flush();
        *shown = Some((snapshot.query_id, snapshot.text.len()));
    });

    info!("Type a prompt and press enter; a new prompt cancels the running one. 'exit' quits.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim().to_string();
        if prompt == "exit" {
            break;
        }
        if prompt.is_empty() {
            continue;
        }

        let session = session.clone();
        tokio::spawn(async move {
            match session.query(prompt).await {
                Ok(outcome) => {
                    println!("\n{:?} after {} tokens", outcome.status, outcome.token_count);
                    if let Some(metrics) = outcome.metrics {
                        println!("{}", metrics);
                    }
                }
                Err(e) => eprintln!("\nQuery failed: {}", e),
            }
        });
    }

    info!("Shutting down...");
    session.shutdown().await;
    if let Some(stats) = session.stats() {
        info!(
            started = stats.queries_started,
            completed = stats.queries_completed,
            cancelled = stats.queries_cancelled,
            "Session finished"
        );
    }
    Ok(())
}
