//! `ContactLedger` - contact extraction from Gmail, Microsoft Graph and IMAP
//!
//! Reads the run configuration, wires stored credentials into the provider
//! adapters and enrichment sources, and writes contacts plus the run summary
//! as JSON.

#![forbid(unsafe_code)]

mod cli;
mod setup;

use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use contactledger_core::{AccessToken, Pipeline, RunOutput, credentials};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries the JSON result.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "contactledger=info,contactledger_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::StoreToken { provider, file } => {
            store_token(&provider, &file)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::StoreApiKey { source } => {
            store_api_key(&source)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = setup::load_config(args.config.as_deref())?;
    if let Some(days_back) = args.days_back {
        config.days_back = days_back;
    }
    if !args.providers.is_empty() {
        config.providers = args.providers.into_iter().collect();
    }
    if args.enrich {
        config.enrich = true;
    }
    if args.no_enrich {
        config.enrich = false;
    }

    let http = reqwest::Client::builder()
        .user_agent(concat!("contactledger/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let mut pipeline = setup::add_providers(Pipeline::new(config.clone()), &config, &http)?;
    if config.enrich {
        let sources = setup::build_sources(&config, &http, args.hunter_api_key.as_deref())?;
        let cache = setup::open_cache(&config).await;
        pipeline = pipeline.with_enrichment(sources, cache);
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        }
    });

    info!(days_back = config.days_back, enrich = config.enrich, "starting run");
    let output = pipeline.run(&cancel).await?;
    write_output(&output, args.output.as_deref())?;

    let summary = &output.summary;
    info!(
        status = ?summary.status,
        contacts = summary.contacts,
        low_confidence = summary.low_confidence_contacts,
        cancelled = summary.cancelled,
        "done"
    );
    Ok(ExitCode::from(summary.status.exit_code()))
}

fn write_output(output: &RunOutput, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(output).context("failed to serialize result")?;
    match path {
        Some(path) => {
            std::fs::write(path, json + "\n")
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "result written");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}").context("failed to write result")?;
        }
    }
    Ok(())
}

fn store_token(provider: &str, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let token: AccessToken = serde_json::from_str(&raw).context("token file is not valid JSON")?;
    credentials::store_oauth_token(provider, &token)
        .with_context(|| format!("failed to store token for {provider}"))?;
    info!(provider, "token stored");
    Ok(())
}

fn store_api_key(source: &str) -> Result<()> {
    let mut key = String::new();
    std::io::stdin()
        .read_to_string(&mut key)
        .context("failed to read key from stdin")?;
    let key = key.trim();
    if key.is_empty() {
        bail!("no API key given on stdin");
    }
    credentials::store_api_key(source, key)
        .with_context(|| format!("failed to store API key for {source}"))?;
    info!(source, "API key stored");
    Ok(())
}
