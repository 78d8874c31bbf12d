//! Dispatch Controller
//!
//! Drives one Delivery Job: a bounded loop of Dispatch Attempts, each of which
//! opens a fresh [`Connection`], waits for OPEN, lets the session settle,
//! probes the target and sends the payload.
//!
//! # Attempt phases
//!
//! ```text
//!  phase 1 (clipped to the attempt deadline)     phase 2 (best effort)
//!  connect ─▶ OPEN ─▶ settle ─▶ probe ─▶ send ─┬─▶ record success ─▶ confirm
//!                                              │
//!                      error ◀─────────────────┘ (no message id)
//! ```
//!
//! The success record is written before the confirmation wait begins. From
//! that point on the job is finished: no reconnect, no retry, and a missing
//! acknowledgement is only logged.
//!
//! # Retry policy
//!
//! Only errors with [`DispatchError::is_retryable`] are retried. Before
//! attempt `n + 1` the controller sleeps `min(cap, base * n^2)`, unless that
//! sleep would run past the overall deadline.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::confirm::{Confirmation, ConfirmationWaiter};
use crate::config::Config;
use crate::connection::{close_error, Connection, ConnectionState, PairingPolicy};
use crate::error::{DispatchError, TransportError};
use crate::session::SessionStore;
use crate::status::{DeliveryStatus, StatusReporter};
use crate::transport::{MessageKey, Transport};

/// Quadratic backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay before the reconnect that follows failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .checked_mul(attempt.saturating_mul(attempt))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Limits for one Delivery Job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchBudget {
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    /// Pause between OPEN and the first protocol call
    pub settle_delay: Duration,
    /// Bound on each probe and send call
    pub query_timeout: Duration,
    pub overall_deadline: Duration,
    pub confirmation_timeout: Duration,
    pub backoff: Backoff,
}

impl DispatchBudget {
    /// Longest an attempt may take before it is cut off.
    fn attempt_span(&self) -> Duration {
        self.connect_timeout + self.settle_delay + self.query_timeout * 2
    }
}

impl Default for DispatchBudget {
    fn default() -> Self {
        Config::default().budget()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Sent,
    Confirmed,
    Failed(String),
}

/// One bounded unit of work.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    pub number: u32,
    pub started_at: Instant,
    pub deadline: Instant,
    pub outcome: AttemptOutcome,
}

/// Every attempt made for one payload, and the backoff sleeps between them.
#[derive(Debug, Clone, Default)]
pub struct DeliveryJob {
    pub target: String,
    pub attempts: Vec<DispatchAttempt>,
    pub backoffs: Vec<Duration>,
}

impl DeliveryJob {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            ..Self::default()
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn set_outcome(&mut self, outcome: AttemptOutcome) {
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.outcome = outcome;
        }
    }
}

/// A message the remote side accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub remote_target: String,
}

/// Terminal result of a Delivery Job.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered {
        message: SentMessage,
        confirmation: Confirmation,
        job: DeliveryJob,
    },
    Failed {
        error: DispatchError,
        job: DeliveryJob,
    },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Process exit code: 0 when a success was recorded, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn job(&self) -> &DeliveryJob {
        match self {
            Self::Delivered { job, .. } | Self::Failed { job, .. } => job,
        }
    }
}

/// Orchestrates Delivery Jobs over one transport.
pub struct DispatchController {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    reporter: Arc<StatusReporter>,
}

impl DispatchController {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        reporter: Arc<StatusReporter>,
    ) -> Self {
        Self {
            transport,
            store,
            reporter,
        }
    }

    /// Deliver `payload` to `target` within `budget`.
    ///
    /// Always leaves a status record behind and never returns an `Err`: the
    /// error of a failed job is part of the outcome.
    pub async fn dispatch(
        &self,
        target: &str,
        payload: &str,
        budget: &DispatchBudget,
    ) -> DeliveryOutcome {
        let target = target.trim();
        let mut job = DeliveryJob::new(target);

        if target.is_empty() {
            return self
                .fail(DispatchError::PreconditionInvalid("target is empty".into()), job)
                .await;
        }
        if payload.trim().is_empty() {
            return self
                .fail(DispatchError::PreconditionInvalid("payload is empty".into()), job)
                .await;
        }
        if budget.max_attempts == 0 {
            return self
                .fail(DispatchError::Config("max_attempts must be at least 1".into()), job)
                .await;
        }

        if self.store.current().await.is_none() {
            self.store.load().await;
        }
        if !self.store.is_ready().await {
            let detail = self.store.describe().await;
            return self
                .fail(
                    DispatchError::AuthNotReady(format!(
                        "{}; run `courier authenticate` first",
                        detail
                    )),
                    job,
                )
                .await;
        }

        let job_deadline = Instant::now() + budget.overall_deadline;
        info!(
            target = %target,
            payload_bytes = payload.len(),
            max_attempts = budget.max_attempts,
            "Starting delivery"
        );

        for number in 1..=budget.max_attempts {
            let started_at = Instant::now();
            let deadline = (started_at + budget.attempt_span()).min(job_deadline);
            job.attempts.push(DispatchAttempt {
                number,
                started_at,
                deadline,
                outcome: AttemptOutcome::Pending,
            });
            info!(attempt = number, max = budget.max_attempts, "Dispatch attempt");

            let result = match tokio::time::timeout_at(
                deadline,
                self.attempt(target, payload, budget),
            )
            .await
            {
                Ok(result) => result,
                Err(_) if Instant::now() >= job_deadline => {
                    Err(DispatchError::DeadlineExceeded(format!(
                        "{}s budget spent during attempt {}",
                        budget.overall_deadline.as_secs(),
                        number
                    )))
                }
                Err(_) => Err(DispatchError::Transport(format!(
                    "attempt {} ran past its deadline",
                    number
                ))),
            };

            let error = match result {
                Ok((connection, message, waiter)) => {
                    job.set_outcome(AttemptOutcome::Sent);
                    info!(
                        attempt = number,
                        message_id = %message.message_id,
                        remote = %message.remote_target,
                        "Message sent"
                    );

                    let status = DeliveryStatus::success(&message, number);
                    if let Err(e) = self.reporter.report(&status).await {
                        error!(error = %e, "Failed to record success");
                    }

                    let key = MessageKey {
                        id: message.message_id.clone(),
                        remote: message.remote_target.clone(),
                    };
                    let confirmation = waiter
                        .await_confirmation(&key, budget.confirmation_timeout)
                        .await;
                    match confirmation {
                        Confirmation::Confirmed(source) => {
                            job.set_outcome(AttemptOutcome::Confirmed);
                            info!(source = ?source, "Delivery acknowledged");
                        }
                        Confirmation::TimedOut => {
                            let note = DispatchError::ConfirmationTimeout(
                                budget.confirmation_timeout.as_secs(),
                            );
                            warn!(error = %note, "Message counted as sent without acknowledgement");
                        }
                    }

                    connection.close().await;
                    return DeliveryOutcome::Delivered {
                        message,
                        confirmation,
                        job,
                    };
                }
                Err(error) => error,
            };

            job.set_outcome(AttemptOutcome::Failed(error.to_string()));

            if !error.is_retryable() {
                return self.fail(error, job).await;
            }
            if number == budget.max_attempts {
                error!(attempts = number, "Attempts exhausted");
                return self.fail(error, job).await;
            }

            let delay = budget.backoff.delay(number);
            if Instant::now() + delay >= job_deadline {
                let error = DispatchError::DeadlineExceeded(format!(
                    "{}s budget spent after {} attempts; last error: {}",
                    budget.overall_deadline.as_secs(),
                    number,
                    error
                ));
                return self.fail(error, job).await;
            }

            warn!(
                attempt = number,
                error = %error,
                backoff_ms = delay.as_millis() as u64,
                "Attempt failed, reconnecting after backoff"
            );
            job.backoffs.push(delay);
            tokio::time::sleep(delay).await;
        }

        // Every loop iteration returns on its last attempt
        let error = DispatchError::Config("attempt loop ended without an outcome".into());
        self.fail(error, job).await
    }

    /// Phase 1 of an attempt: everything up to and including the send.
    async fn attempt(
        &self,
        target: &str,
        payload: &str,
        budget: &DispatchBudget,
    ) -> Result<(Connection, SentMessage, ConfirmationWaiter), DispatchError> {
        let mut connection = Connection::open(
            self.transport.as_ref(),
            Arc::clone(&self.store),
            budget.connect_timeout,
            PairingPolicy::Reject,
        )
        .await?;

        match self.send_on(&mut connection, target, payload, budget).await {
            Ok((message, waiter)) => Ok((connection, message, waiter)),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    async fn send_on(
        &self,
        connection: &mut Connection,
        target: &str,
        payload: &str,
        budget: &DispatchBudget,
    ) -> Result<(SentMessage, ConfirmationWaiter), DispatchError> {
        debug!(settle_ms = budget.settle_delay.as_millis() as u64, "Connection open, settling");
        tokio::time::sleep(budget.settle_delay).await;
        still_usable(connection)?;

        let link = connection.link();
        let query_secs = budget.query_timeout.as_secs();

        let info = match tokio::time::timeout(budget.query_timeout, link.probe_target(target)).await
        {
            Err(_) => {
                return Err(DispatchError::Transport(format!(
                    "target probe timed out after {}s",
                    query_secs
                )))
            }
            Ok(Err(TransportError::Rejected(reason))) => {
                return Err(DispatchError::TargetUnreachable(format!("{}: {}", target, reason)))
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(info)) => info,
        };
        info!(
            target = %info.id,
            subject = info.subject.as_deref().unwrap_or("-"),
            participants = info.participants.unwrap_or(0),
            "Target reachable"
        );

        still_usable(connection)?;
        let waiter = ConfirmationWaiter::arm(link.as_ref());

        let response =
            match tokio::time::timeout(budget.query_timeout, link.send_text(target, payload)).await
            {
                Err(_) => {
                    return Err(DispatchError::SendFailed(format!(
                        "no send response within {}s",
                        query_secs
                    )))
                }
                Ok(Err(TransportError::Protocol(reason)))
                | Ok(Err(TransportError::Rejected(reason))) => {
                    return Err(DispatchError::SendFailed(reason))
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(response)) => response,
            };

        let message_id = response
            .message_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                DispatchError::SendFailed("send response carried no message id".into())
            })?;
        let remote_target = response
            .remote
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| target.to_string());

        Ok((
            SentMessage {
                message_id,
                remote_target,
            },
            waiter,
        ))
    }

    /// Record a terminal failure.
    async fn fail(&self, error: DispatchError, job: DeliveryJob) -> DeliveryOutcome {
        error!(
            kind = error.kind(),
            error = %error,
            attempts = job.attempt_count(),
            "Delivery failed"
        );

        let status = DeliveryStatus::failure(&error, job.attempt_count());
        if let Err(e) = self.reporter.report(&status).await {
            error!(error = %e, "Failed to record failure");
        }

        DeliveryOutcome::Failed { error, job }
    }
}

/// Fail if the open connection closed or asked for pairing since it opened.
fn still_usable(connection: &mut Connection) -> Result<(), DispatchError> {
    if let ConnectionState::Closed { reason, detail } = connection.state() {
        return Err(close_error(reason, &detail));
    }
    if connection.take_challenge().is_some() {
        warn!("Pairing challenge received on an open session");
        return Err(DispatchError::AuthNotReady(
            "pairing challenge received after the connection opened; the stored session is not accepted, run `courier authenticate`"
                .to_string(),
        ));
    }
    Ok(())
}

/// Read the message body from `path`.
pub async fn load_payload(path: &Path) -> Result<String, DispatchError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        DispatchError::PreconditionInvalid(format!(
            "cannot read payload file {}: {}",
            path.display(),
            e
        ))
    })
}
