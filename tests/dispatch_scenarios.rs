//! End-to-end delivery scenarios against the scripted transport.
//!
//! All tests run on a paused clock, so backoff sleeps, settle delays and
//! confirmation timeouts cost no wall time.

use courier::transport::mock::{ConnectionScript, ScriptedAck, ScriptedTransport};
use courier::transport::{AckLevel, SendResponse, TransportEvent};
use courier::{
    AckSource, Confirmation, Credentials, DeliveryOutcome, DeliveryStatus, DispatchBudget,
    DispatchController, DispatchError, SessionStore, StatusReporter, TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GROUP: &str = "120363025246125486@g.us";

struct Harness {
    _dir: TempDir,
    store: Arc<SessionStore>,
    reporter: Arc<StatusReporter>,
    transport: Arc<ScriptedTransport>,
}

impl Harness {
    fn new(paired: bool, scripts: Vec<ConnectionScript>) -> Self {
        let dir = TempDir::new().unwrap();
        let creds_path = dir.path().join("auth").join("creds.json");
        if paired {
            std::fs::create_dir_all(creds_path.parent().unwrap()).unwrap();
            std::fs::write(&creds_path, serde_json::to_vec(&paired_creds()).unwrap()).unwrap();
        }

        Self {
            store: Arc::new(SessionStore::new(&creds_path)),
            reporter: Arc::new(StatusReporter::new(dir.path().join("send_status.json"))),
            transport: Arc::new(ScriptedTransport::new(scripts)),
            _dir: dir,
        }
    }

    async fn dispatch(&self, payload: &str, budget: &DispatchBudget) -> DeliveryOutcome {
        let controller = DispatchController::new(
            self.transport.clone(),
            self.store.clone(),
            self.reporter.clone(),
        );
        controller.dispatch(GROUP, payload, budget).await
    }

    async fn record(&self) -> DeliveryStatus {
        StatusReporter::read(self.reporter.path()).await.unwrap()
    }
}

fn paired_creds() -> Credentials {
    Credentials::new(json!({
        "registered": true,
        "me": { "id": "5511999999999:7@s.whatsapp.net", "name": "courier" },
        "advSecretKey": "c2VjcmV0"
    }))
}

fn payload() -> String {
    "Weekly digest: ".repeat(14).chars().take(200).collect()
}

fn transient() -> ConnectionScript {
    ConnectionScript::closes(Some(428), "Connection Closed")
}

#[tokio::test(start_paused = true)]
async fn delivers_and_records_success() {
    let h = Harness::new(
        true,
        vec![ConnectionScript::opens()
            .with_ack(Duration::from_secs(1), ScriptedAck::Status(AckLevel::DeliveryAck))],
    );
    assert_eq!(payload().len(), 200);

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert_eq!(outcome.exit_code(), 0);
    match &outcome {
        DeliveryOutcome::Delivered {
            message,
            confirmation,
            ..
        } => {
            assert_eq!(message.message_id, "MSG-1");
            assert_eq!(message.remote_target, GROUP);
            assert_eq!(*confirmation, Confirmation::Confirmed(AckSource::StatusUpdate));
        }
        other => panic!("expected delivery, got {:?}", other),
    }

    let record = h.record().await;
    assert!(record.success);
    assert_eq!(record.message_id.as_deref(), Some("MSG-1"));
    assert_eq!(record.remote_target.as_deref(), Some(GROUP));
    assert_eq!(record.attempts, 1);
    assert!(record.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn missing_session_fails_without_connecting() {
    let h = Harness::new(false, vec![ConnectionScript::opens()]);

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::AuthNotReady(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 0);

    let record = h.record().await;
    assert!(!record.success);
    assert_eq!(record.error.as_deref(), Some("AuthNotReady"));
    assert!(record.detail.unwrap().contains("courier authenticate"));
}

#[tokio::test(start_paused = true)]
async fn transient_closes_are_retried_with_quadratic_backoff() {
    let h = Harness::new(
        true,
        vec![transient(), transient(), ConnectionScript::opens()],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        outcome.job().backoffs,
        vec![Duration::from_secs(2), Duration::from_secs(8)]
    );
    assert_eq!(outcome.job().attempts.len(), 3);
    assert_eq!(h.transport.connect_count(), 3);
    assert_eq!(h.transport.send_count(), 1);

    let record = h.record().await;
    assert!(record.success);
    assert_eq!(record.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn missing_confirmation_is_not_a_failure() {
    let h = Harness::new(true, vec![ConnectionScript::opens()]);
    let started = tokio::time::Instant::now();

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert_eq!(outcome.exit_code(), 0);
    assert!(matches!(
        outcome,
        DeliveryOutcome::Delivered { confirmation: Confirmation::TimedOut, .. }
    ));
    // settle delay + confirmation timeout, nothing unbounded
    assert!(started.elapsed() < Duration::from_secs(17));

    let record = h.record().await;
    assert!(record.success);
    assert!(record.message_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn blank_payload_is_rejected_before_connecting() {
    let h = Harness::new(true, vec![ConnectionScript::opens()]);

    let outcome = h.dispatch("  \n\t ", &DispatchBudget::default()).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::PreconditionInvalid(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 0);
    assert_eq!(h.record().await.error.as_deref(), Some("PreconditionInvalid"));
}

#[tokio::test(start_paused = true)]
async fn logged_out_is_never_reconnected() {
    let h = Harness::new(
        true,
        vec![
            ConnectionScript::closes(Some(401), "Connection Failure"),
            ConnectionScript::opens(),
        ],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::LoggedOut(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 1);
    assert!(outcome.job().backoffs.is_empty());
    assert_eq!(h.record().await.error.as_deref(), Some("LoggedOut"));
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_record_last_error() {
    let h = Harness::new(
        true,
        vec![transient(), transient(), transient(), transient(), transient()],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(h.transport.connect_count(), 5);
    assert_eq!(
        outcome.job().backoffs,
        vec![
            Duration::from_secs(2),
            Duration::from_secs(8),
            Duration::from_secs(18),
            Duration::from_secs(30),
        ]
    );

    let record = h.record().await;
    assert!(!record.success);
    assert_eq!(record.error.as_deref(), Some("TransportError"));
    assert_eq!(record.attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn unreachable_target_is_not_retried() {
    let h = Harness::new(
        true,
        vec![
            ConnectionScript::opens()
                .with_probe(Err(TransportError::Rejected("item-not-found".into()))),
            ConnectionScript::opens(),
        ],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::TargetUnreachable(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.transport.send_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn send_without_message_id_is_retried() {
    let h = Harness::new(
        true,
        vec![
            ConnectionScript::opens().with_send(Ok(SendResponse {
                message_id: None,
                remote: Some(GROUP.to_string()),
            })),
            ConnectionScript::opens(),
        ],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.job().backoffs, vec![Duration::from_secs(2)]);
    assert_eq!(h.transport.send_count(), 2);
    assert_eq!(h.record().await.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn pairing_challenge_during_send_means_auth_not_ready() {
    let h = Harness::new(true, vec![ConnectionScript::pairing("2@abc,def,ghi")]);

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::AuthNotReady(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn overall_deadline_cuts_a_stalled_job() {
    let h = Harness::new(
        true,
        vec![
            ConnectionScript::silent(),
            ConnectionScript::silent(),
            ConnectionScript::silent(),
        ],
    );
    let budget = DispatchBudget {
        overall_deadline: Duration::from_secs(20),
        ..DispatchBudget::default()
    };
    let started = tokio::time::Instant::now();

    let outcome = h.dispatch(&payload(), &budget).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::DeadlineExceeded(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 1);
    assert!(started.elapsed() <= Duration::from_secs(21));
    assert_eq!(h.record().await.error.as_deref(), Some("DeadlineExceeded"));
}

#[tokio::test(start_paused = true)]
async fn backoff_that_would_pass_the_deadline_stops_the_job() {
    // 60s connect timeout, then a 2s backoff would end past a 61s budget
    let h = Harness::new(true, vec![ConnectionScript::silent(), ConnectionScript::opens()]);
    let budget = DispatchBudget {
        overall_deadline: Duration::from_secs(61),
        ..DispatchBudget::default()
    };

    let outcome = h.dispatch(&payload(), &budget).await;

    match outcome {
        DeliveryOutcome::Failed {
            error: DispatchError::DeadlineExceeded(detail),
            job,
        } => {
            assert!(detail.contains("Timed out"));
            assert!(job.backoffs.is_empty());
        }
        other => panic!("expected deadline failure, got {:?}", other),
    }
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn rotation_during_dispatch_is_persisted() {
    let rotated = Credentials::new(json!({
        "registered": true,
        "me": { "id": "5511999999999:7@s.whatsapp.net" },
        "signalIdentities": [1, 2, 3]
    }));
    let h = Harness::new(
        true,
        vec![ConnectionScript::opens().with_event(
            Duration::from_secs(1),
            TransportEvent::CredentialsRotated(rotated.clone()),
        )],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;
    assert!(outcome.is_success());

    let on_disk = SessionStore::new(h.store.path()).load().await;
    assert_eq!(on_disk, Some(rotated));
}

#[tokio::test(start_paused = true)]
async fn late_failure_never_overwrites_success() {
    let h = Harness::new(true, vec![ConnectionScript::opens()]);

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;
    assert!(outcome.is_success());

    let late = DeliveryStatus::failure(&DispatchError::Interrupted("Ctrl-C".into()), 1);
    assert!(!h.reporter.report(&late).await.unwrap());

    let record = h.record().await;
    assert!(record.success);
    assert_eq!(record.message_id.as_deref(), Some("MSG-1"));
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_fails_as_connect_timeout() {
    let h = Harness::new(true, vec![ConnectionScript::hangs()]);
    let budget = DispatchBudget {
        max_attempts: 1,
        ..DispatchBudget::default()
    };
    let started = tokio::time::Instant::now();

    let outcome = h.dispatch(&payload(), &budget).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::ConnectTimeout(60), .. }
    ));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert!(started.elapsed() < Duration::from_secs(61));
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.record().await.error.as_deref(), Some("ConnectTimeout"));
}

#[tokio::test(start_paused = true)]
async fn stalled_connect_is_retried() {
    let h = Harness::new(true, vec![ConnectionScript::hangs(), ConnectionScript::opens()]);

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.job().backoffs, vec![Duration::from_secs(2)]);
    assert_eq!(h.transport.connect_count(), 2);
    assert_eq!(h.record().await.attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn pairing_challenge_after_open_stops_before_sending() {
    let h = Harness::new(
        true,
        vec![
            ConnectionScript::opens().with_event(
                Duration::from_secs(1),
                TransportEvent::PairingChallenge("2@late,ref".into()),
            ),
            ConnectionScript::opens(),
        ],
    );

    let outcome = h.dispatch(&payload(), &DispatchBudget::default()).await;

    assert!(matches!(
        outcome,
        DeliveryOutcome::Failed { error: DispatchError::AuthNotReady(_), .. }
    ));
    assert_eq!(h.transport.connect_count(), 1);
    assert_eq!(h.transport.send_count(), 0);
    assert_eq!(h.record().await.error.as_deref(), Some("AuthNotReady"));
}

#[tokio::test(start_paused = true)]
async fn success_is_recorded_while_confirmation_is_pending() {
    // send lands after the 6s settle, the ack 9s later
    let h = Harness::new(
        true,
        vec![ConnectionScript::opens()
            .with_ack(Duration::from_secs(9), ScriptedAck::Status(AckLevel::DeliveryAck))],
    );
    let started = tokio::time::Instant::now();
    let budget = DispatchBudget::default();
    let text = payload();

    let (outcome, mid_wait) = tokio::join!(h.dispatch(&text, &budget), async {
        tokio::time::sleep(Duration::from_secs(8)).await;
        (started.elapsed(), h.record().await)
    });

    let (read_at, record) = mid_wait;
    assert!(read_at < Duration::from_secs(15));
    assert!(record.success);
    assert_eq!(record.message_id.as_deref(), Some("MSG-1"));

    assert!(matches!(
        outcome,
        DeliveryOutcome::Delivered {
            confirmation: Confirmation::Confirmed(AckSource::StatusUpdate),
            ..
        }
    ));
    assert!(started.elapsed() >= Duration::from_secs(15));
}
