// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use streaming_ingest::{
    logger::Formatter, BatchSender, ChannelNegotiator, HttpClient, IngestConfig, IngestError,
    IngestionOrchestrator, RunSummary, TokenCache, TokenSigner,
};

const DOTENV_PATH: &str = "config/.env";

#[tokio::main]
async fn main() -> ExitCode {
    let dotenv_loaded = dotenv::from_filename(DOTENV_PATH).is_ok();

    let config = match IngestConfig::from_os_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("RFID_INGEST | ERROR | {err}");
            return ExitCode::from(2);
        }
    };

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", config.log_level);
    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("RFID_INGEST | ERROR | could not parse log level: {err}");
            return ExitCode::from(2);
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("RFID_INGEST | ERROR | setting default subscriber failed: {err}");
        return ExitCode::FAILURE;
    }
    debug!(dotenv_loaded, "logging subsystem enabled");

    let orchestrator = match build_orchestrator(&config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!("failed to initialize ingestion client: {err}");
            return ExitCode::from(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, finishing run");
                signal_cancel.cancel();
            }
            Err(err) => warn!("could not listen for interrupt: {err}"),
        }
    });

    info!(
        channel = %config.channel_name,
        channels = config.channel_count,
        rate = config.events_per_second,
        batch_size = config.batch_size,
        "starting badge simulator"
    );
    match orchestrator
        .run_partitioned(config.channel_count, cancel)
        .await
    {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(failure) => {
            print_summary(&failure.summary);
            error!("{failure}");
            if failure.error.is_identity_or_config() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn build_orchestrator(config: &IngestConfig) -> Result<IngestionOrchestrator, IngestError> {
    let run_config = config.orchestrator_config();
    let signer = TokenSigner::new(config.credentials()?)?;
    info!(fingerprint = signer.fingerprint(), "loaded key pair");
    let token_cache = TokenCache::new(signer, run_config.audience.clone(), run_config.token_ttl);

    let http = HttpClient::new(config.http_options())
        .map_err(|err| IngestError::InvalidConfig(format!("http client: {err}")))?;
    let negotiator = ChannelNegotiator::new(
        http.clone(),
        config.control_plane_url(),
        config.target.clone(),
        config.backoff_policy(),
        config.scoped_token_ttl,
    );
    let sender = BatchSender::new(http, config.target.clone(), config.backoff_policy());

    Ok(IngestionOrchestrator::new(
        token_cache,
        negotiator,
        sender,
        run_config,
    ))
}

fn print_summary(summary: &RunSummary) {
    info!("{summary}");
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{json}"),
        Err(err) => warn!("could not serialize run summary: {err}"),
    }
}
