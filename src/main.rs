//! # quarry
//!
//! Command-line client for a retrieval-augmented knowledge base: ask
//! questions against configured knowledge bases and manage the documents
//! behind them.

#![deny(unsafe_code)]

mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::Level;

use quarry_client::{BackendConfig, DocumentBackend, HttpBackend};
use quarry_core::document::{DocumentStatus, UploadFile};
use quarry_core::ids::DocumentId;
use quarry_core::messages::Message;
use quarry_core::session::Phase;
use quarry_core::QueryConfig;
use quarry_engine::{BatchCoordinator, IngestionTracker, PollPolicy, QueryError, QueryOrchestrator};
use quarry_settings::{
    load_settings, load_settings_from_path, BackendSettings, LoggingSettings, PollingSettings,
    QuarrySettings, QuerySettings,
};
use quarry_store::{MemoryDocumentStore, MemorySessionStore, SessionStore};
use quarry_telemetry::{init_telemetry, TelemetryConfig};

use crate::render::{document_line, seed_lines, AnswerPrinter};

const REFRESH_INTERVAL: Duration = Duration::from_millis(50);

/// Query knowledge bases and manage their documents.
#[derive(Parser, Debug)]
#[command(name = "quarry", about = "Knowledge base client")]
struct Cli {
    /// Settings file (default: ~/.quarry/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a question and print the answer with its sources.
    Ask {
        question: String,

        /// Wait for the complete answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,

        /// Knowledge base to search (repeatable; overrides settings).
        #[arg(long = "kb")]
        kb: Vec<String>,
    },
    /// Upload files one after another and wait for processing.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print a document's processing status.
    Status { document_id: String },
    /// Delete a document.
    Delete { document_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;

    let _telemetry = init_telemetry(telemetry_config(&settings.logging))
        .context("Failed to initialise logging")?;

    let token = settings
        .query
        .token
        .clone()
        .context("No credential configured: set QUARRY_TOKEN or query.token in settings.json")?;
    let backend = Arc::new(
        HttpBackend::new(backend_config(&settings.backend), token.clone())
            .context("Failed to build HTTP client")?,
    );

    match cli.command {
        Command::Ask {
            question,
            no_stream,
            kb,
        } => {
            let mut config = query_config(&settings.query, token);
            if no_stream {
                config.stream = false;
            }
            if !kb.is_empty() {
                config.kb_list = kb;
            }
            ask(backend, config, question).await
        }
        Command::Upload { files } => upload(backend, &settings, &files).await,
        Command::Status { document_id } => {
            let id = DocumentId::from_raw(document_id);
            let report = backend
                .status(&id)
                .await
                .with_context(|| format!("Failed to fetch status of {id}"))?;
            let mut line = format!("{id}  {}  {}", report.status, report.name);
            if let Some(error) = report.error {
                line.push_str(&format!("  ({error})"));
            }
            println!("{line}");
            Ok(())
        }
        Command::Delete { document_id } => {
            let id = DocumentId::from_raw(document_id);
            backend
                .delete(&id)
                .await
                .with_context(|| format!("Failed to delete {id}"))?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

async fn ask(backend: Arc<HttpBackend>, config: QueryConfig, question: String) -> Result<()> {
    let sessions = Arc::new(MemorySessionStore::new());
    let session = sessions.create("cli")?;
    let orchestrator = QueryOrchestrator::new(backend, sessions.clone());

    let submit = orchestrator.submit_query(&session.id, vec![Message::user(question)], &config);
    tokio::pin!(submit);

    let mut stdout = std::io::stdout();
    let mut printer = AnswerPrinter::default();
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    let result = loop {
        tokio::select! {
            result = &mut submit => break result,
            _ = refresh.tick() => {
                let current = sessions.get(&session.id)?;
                printer.show(&mut stdout, &current.response)?;
            }
            _ = tokio::signal::ctrl_c() => {
                orchestrator.abort(&session.id);
            }
        }
    };

    let session = sessions.get(&session.id)?;
    printer.show(&mut stdout, &session.response)?;
    printer.finish(&mut stdout)?;

    let lines = seed_lines(&session.seeds);
    if !lines.is_empty() {
        println!("\nSources:");
        for line in lines {
            println!("  {line}");
        }
    }

    match result {
        Ok(_) => Ok(()),
        Err(QueryError::Aborted) => {
            eprintln!("(aborted)");
            Ok(())
        }
        Err(e) => {
            if let Phase::Error { kind, message } = &session.phase {
                bail!("query failed [{kind}]: {message}");
            }
            Err(e.into())
        }
    }
}

async fn upload(
    backend: Arc<HttpBackend>,
    settings: &QuarrySettings,
    paths: &[PathBuf],
) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(read_upload(path).await?);
    }
    let total = files.len();

    let tracker = Arc::new(IngestionTracker::with_policy(
        backend,
        Arc::new(MemoryDocumentStore::new()),
        poll_policy(&settings.polling),
    ));
    let batch = BatchCoordinator::new(tracker);
    let entries = batch
        .run(files, |progress| {
            eprintln!("uploaded {}/{}", progress.processed, progress.total);
        })
        .await;

    let mut failed = 0;
    for entry in entries {
        let document = entry.finished().await;
        if document.status == DocumentStatus::Error {
            failed += 1;
        }
        println!("{}", document_line(&document));
    }

    if failed > 0 {
        bail!("{failed} of {total} documents failed");
    }
    Ok(())
}

async fn read_upload(path: &Path) -> Result<UploadFile> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(UploadFile::new(name, bytes))
}

fn telemetry_config(logging: &LoggingSettings) -> TelemetryConfig {
    let module_levels = logging
        .modules
        .iter()
        .filter_map(|(module, level)| Some((module.clone(), level.parse::<Level>().ok()?)))
        .collect();
    TelemetryConfig {
        log_level: logging.level.parse().unwrap_or(Level::WARN),
        module_levels,
        json: logging.json,
    }
}

fn backend_config(backend: &BackendSettings) -> BackendConfig {
    BackendConfig {
        base_url: backend.base_url.clone(),
        stream_path: backend.stream_path.clone(),
        query_path: backend.query_path.clone(),
        upload_path: backend.upload_path.clone(),
        status_path: backend.status_path.clone(),
        delete_path: backend.delete_path.clone(),
        connect_timeout: backend.connect_timeout(),
        request_timeout: backend.request_timeout(),
        idle_timeout: backend.idle_timeout(),
    }
}

fn query_config(query: &QuerySettings, token: SecretString) -> QueryConfig {
    QueryConfig {
        token,
        model: query.model.clone(),
        kb_list: query.kb_list.clone(),
        documents: query.documents.clone(),
        temperature: query.temperature,
        max_tokens: query.max_tokens,
        response_format: query.response_format.clone(),
        stream: query.stream,
    }
}

fn poll_policy(polling: &PollingSettings) -> PollPolicy {
    PollPolicy {
        initial_delay: Duration::from_millis(polling.initial_delay_ms),
        interval: Duration::from_millis(polling.interval_ms),
        multiplier: polling.multiplier,
        max_interval: Duration::from_millis(polling.max_interval_ms),
        max_attempts: polling.max_attempts,
    }
}
