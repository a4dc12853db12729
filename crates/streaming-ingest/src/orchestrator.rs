// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end ingestion run for one channel (or several, partitioned).
//!
//! ```text
//!   INIT ──> AUTHENTICATED ──> CHANNEL_OPEN ──> STREAMING ──> DONE
//!                                                 │   ▲
//!                                                 ▼   │
//!                                               REOPENING ──> FAILED
//! ```
//!
//! The generator runs in its own task and feeds a bounded buffer. The
//! orchestrator drains it into batches, sends one batch at a time and only
//! advances the cursor on an acknowledgment. An expired token or a closed
//! channel pauses sending, re-signs, reopens and resends the same batch.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::channel::{ChannelHandle, ChannelNegotiator};
use crate::cursor::Cursor;
use crate::error::IngestError;
use crate::event::BadgeEvent;
use crate::generator::{EventGenerator, GeneratorConfig};
use crate::sender::BatchSender;
use crate::summary::{FinalFlush, RunSummary};
use crate::token::TokenCache;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Audience claim of control-plane tokens (the normalized account).
    pub audience: String,
    pub channel_name: String,
    pub token_ttl: Duration,
    pub batch_size: usize,
    /// Capacity of the buffer between generator and sender.
    pub buffer_capacity: usize,
    /// How long a partial batch may wait for more events.
    pub flush_interval: Duration,
    /// Consecutive reopens tolerated for one batch.
    pub max_reopen_attempts: u32,
    /// Query the committed offset once the run is done.
    pub verify_on_finish: bool,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Authenticated,
    ChannelOpen,
    Streaming,
    Reopening,
    Done,
    Failed,
}

/// A failed run, with everything counted up to the failure.
#[derive(Debug, thiserror::Error)]
#[error("ingestion run failed: {error}")]
pub struct RunFailure {
    pub summary: RunSummary,
    #[source]
    pub error: IngestError,
}

enum Fill {
    Full,
    Linger,
    Closed,
    Cancelled,
}

/// Channel, cursor and counters of a run in progress.
struct Session {
    handle: ChannelHandle,
    cursor: Cursor,
}

pub struct IngestionOrchestrator {
    token_cache: TokenCache,
    negotiator: ChannelNegotiator,
    sender: BatchSender,
    config: OrchestratorConfig,
    state: RunState,
}

impl IngestionOrchestrator {
    pub fn new(
        token_cache: TokenCache,
        negotiator: ChannelNegotiator,
        sender: BatchSender,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            token_cache,
            negotiator,
            sender,
            config,
            state: RunState::Init,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            debug!(channel = %self.config.channel_name, from = ?self.state, to = ?next, "run state");
            self.state = next;
        }
    }

    /// Runs `channel_count` independent channels named `<channel>_<i>`.
    ///
    /// The configured event rate is split evenly across the channels. Each
    /// channel has its own generator, buffer, cursor and sender; their
    /// summaries are merged. The first failure (in channel order) is
    /// returned with the merged summary.
    pub async fn run_partitioned(
        self,
        channel_count: usize,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunFailure> {
        if channel_count <= 1 {
            return self.run(cancel).await;
        }

        let mut tasks = Vec::with_capacity(channel_count);
        for index in 0..channel_count {
            let mut config = self.config.clone();
            config.channel_name = format!("{}_{index}", self.config.channel_name);
            config.generator.rate_per_second =
                self.config.generator.rate_per_second / channel_count as f64;
            config.generator.seed = self
                .config
                .generator
                .seed
                .map(|seed| seed.wrapping_add(index as u64));
            let orchestrator = IngestionOrchestrator::new(
                self.token_cache.clone(),
                self.negotiator.clone(),
                self.sender.clone(),
                config,
            );
            tasks.push(tokio::spawn(orchestrator.run(cancel.clone())));
        }

        let mut merged: Option<RunSummary> = None;
        let mut first_error: Option<IngestError> = None;
        for (index, task) in tasks.into_iter().enumerate() {
            let (summary, error) = match task.await {
                Ok(Ok(summary)) => (summary, None),
                Ok(Err(failure)) => (failure.summary, Some(failure.error)),
                Err(join_error) => {
                    error!(partition = index, "ingestion task panicked: {join_error}");
                    (
                        RunSummary::default(),
                        Some(IngestError::Protocol(format!(
                            "partition {index} did not complete: {join_error}"
                        ))),
                    )
                }
            };
            match merged.as_mut() {
                Some(total) => total.merge(summary),
                None => merged = Some(summary),
            }
            if first_error.is_none() {
                first_error = error;
            }
        }

        let summary = merged.unwrap_or_default();
        info!(channels = channel_count, "partitioned run finished: {summary}");
        match first_error {
            None => Ok(summary),
            Some(error) => Err(RunFailure { summary, error }),
        }
    }

    /// Runs one channel until the generator is exhausted, `cancel` fires or
    /// an unrecoverable error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<RunSummary, RunFailure> {
        let span = tracing::info_span!("ingest", channel = %self.config.channel_name);
        async move {
            let started = Instant::now();
            let mut summary = RunSummary {
                channels: vec![self.config.channel_name.clone()],
                ..Default::default()
            };

            let session = match self.connect().await {
                Ok(session) => session,
                Err(error) => {
                    self.set_state(RunState::Failed);
                    error!("run failed before streaming: {error}");
                    summary.final_flush = FinalFlush::Skipped;
                    summary.duration = started.elapsed();
                    return Err(RunFailure { summary, error });
                }
            };

            let result = self.stream(session, &cancel, &mut summary).await;
            summary.duration = started.elapsed();
            match result {
                Ok(()) => {
                    self.set_state(RunState::Done);
                    info!("run finished: {summary}");
                    Ok(summary)
                }
                Err(error) => {
                    self.set_state(RunState::Failed);
                    error!("run failed: {error}; {summary}");
                    Err(RunFailure { summary, error })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn connect(&mut self) -> Result<Session, IngestError> {
        self.config.generator.interval()?;
        let bearer = self.token_cache.token()?;
        self.set_state(RunState::Authenticated);
        let handle = self
            .negotiator
            .open(&bearer, &self.config.channel_name)
            .await?;
        self.set_state(RunState::ChannelOpen);
        let cursor = handle.cursor();
        Ok(Session { handle, cursor })
    }

    async fn stream(
        &mut self,
        mut session: Session,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), IngestError> {
        let batch_size = self.config.batch_size.max(1);
        let (tx, mut rx) = mpsc::channel(self.config.buffer_capacity.max(batch_size));
        let generator_cancel = cancel.child_token();
        let generator = tokio::spawn(
            EventGenerator::new(self.config.generator.clone())
                .run(tx, generator_cancel.clone())
                .in_current_span(),
        );
        self.set_state(RunState::Streaming);

        let mut batch: Vec<BadgeEvent> = Vec::with_capacity(batch_size);
        let mut received: u64 = 0;
        let mut outcome = Ok(());
        loop {
            let fill = self
                .fill_batch(&mut rx, &mut batch, batch_size, cancel, &mut received)
                .await;
            match fill {
                Fill::Full | Fill::Linger => {
                    if let Err(error) = self.deliver(&mut session, &batch, summary).await {
                        outcome = Err(error);
                        break;
                    }
                    batch.clear();
                }
                Fill::Closed => break,
                Fill::Cancelled => {
                    info!("cancellation requested, draining buffer");
                    break;
                }
            }
        }

        // Stop the producer, then everything it handed over is in `rx` or `batch`.
        generator_cancel.cancel();
        match generator.await {
            Ok(report) => debug!(emitted = report.emitted, stop = ?report.stop, "generator stopped"),
            Err(err) => warn!("generator task failed: {err}"),
        }
        rx.close();
        while let Ok(event) = rx.try_recv() {
            received += 1;
            batch.push(event);
        }
        summary.events_generated = received;

        if let Err(error) = outcome {
            summary.events_unsent = batch.len() as u64;
            summary.final_flush = FinalFlush::Skipped;
            summary.final_offset = session.cursor.offset();
            return Err(error);
        }

        summary.final_flush = self.final_flush(&mut session, &batch, summary).await;
        summary.final_offset = session.cursor.offset();
        if self.config.verify_on_finish {
            self.verify(&session, summary).await;
        }
        Ok(())
    }

    /// Fills `batch` until it is full, the linger deadline passes, the buffer
    /// closes or `cancel` fires.
    async fn fill_batch(
        &self,
        rx: &mut mpsc::Receiver<BadgeEvent>,
        batch: &mut Vec<BadgeEvent>,
        batch_size: usize,
        cancel: &CancellationToken,
        received: &mut u64,
    ) -> Fill {
        let mut deadline = (!batch.is_empty()).then(|| Instant::now() + self.config.flush_interval);
        loop {
            if batch.len() >= batch_size {
                return Fill::Full;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Fill::Cancelled,
                event = rx.recv() => match event {
                    Some(event) => {
                        *received += 1;
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.flush_interval);
                        }
                        batch.push(event);
                    }
                    None => return Fill::Closed,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Fill::Linger;
                }
            }
        }
    }

    /// Sends `batch`, reopening the channel on expiry or closure and
    /// resending the same batch on the fresh channel.
    async fn deliver(
        &mut self,
        session: &mut Session,
        batch: &[BadgeEvent],
        summary: &mut RunSummary,
    ) -> Result<(), IngestError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut reopens = 0u32;
        loop {
            let snapshot = session.cursor.snapshot();
            match self.sender.send(&session.handle, &snapshot, batch).await {
                Ok(result) => {
                    session.cursor.advance(&result.ack);
                    summary.batches_sent += 1;
                    summary.events_accepted += result.accepted_count as u64;
                    summary.events_rejected += result.rejected_rows.len() as u64;
                    if reopens > 0 {
                        self.set_state(RunState::Streaming);
                    }
                    return Ok(());
                }
                Err(error) if error.requires_reopen() => {
                    if reopens >= self.config.max_reopen_attempts {
                        warn!(reopens, "giving up after consecutive reopens: {error}");
                        return Err(error);
                    }
                    reopens += 1;
                    summary.reopen_count += 1;
                    self.set_state(RunState::Reopening);
                    info!(attempt = reopens, "reopening channel: {error}");
                    let handle = self.reopen().await?;
                    session.cursor = handle.cursor();
                    session.handle = handle;
                }
                Err(IngestError::Protocol(reason)) => {
                    warn!(rows = batch.len(), "dropping batch: {reason}");
                    summary.events_dropped += batch.len() as u64;
                    return Ok(());
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn reopen(&mut self) -> Result<ChannelHandle, IngestError> {
        let bearer = self.token_cache.refresh()?;
        self.negotiator
            .open(&bearer, &self.config.channel_name)
            .await
    }

    /// Best-effort delivery of what was left in the buffer at shutdown.
    async fn final_flush(
        &mut self,
        session: &mut Session,
        remaining: &[BadgeEvent],
        summary: &mut RunSummary,
    ) -> FinalFlush {
        if remaining.is_empty() {
            return FinalFlush::Empty;
        }
        let batch_size = self.config.batch_size.max(1);
        let mut chunks = remaining.chunks(batch_size);
        while let Some(chunk) = chunks.next() {
            if let Err(error) = self.deliver(session, chunk, summary).await {
                let unsent = chunk.len() + chunks.map(<[BadgeEvent]>::len).sum::<usize>();
                warn!(unsent, "final flush failed: {error}");
                summary.events_unsent += unsent as u64;
                return FinalFlush::Failed;
            }
        }
        debug!(rows = remaining.len(), "final flush delivered");
        FinalFlush::Delivered
    }

    async fn verify(&self, session: &Session, summary: &mut RunSummary) {
        let names = [session.handle.channel_name.clone()];
        match self.negotiator.bulk_status(&session.handle, &names).await {
            Ok(statuses) => {
                let Some(status) = statuses.get(&session.handle.channel_name) else {
                    return;
                };
                let committed = status.committed_offset();
                summary.committed_offset = committed;
                if committed == Some(session.cursor.offset()) {
                    info!(
                        committed = session.cursor.offset(),
                        status = %status.channel_status_code,
                        "committed offset matches local cursor"
                    );
                } else {
                    warn!(
                        committed = ?committed,
                        local = session.cursor.offset(),
                        status = %status.channel_status_code,
                        "committed offset differs from local cursor"
                    );
                }
            }
            Err(error) => warn!("could not verify committed offset: {error}"),
        }
    }
}
