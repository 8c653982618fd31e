//! The validation authority: drains the verification queue, probes
//! customer-controlled endpoints and writes the verdict back to storage.

pub mod http01;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::core::VerificationRequest;
use crate::errors::Error;
use crate::problem::Problem;
use crate::storage::{self, Storage};
use crate::trace;

/// A single verification request is dispatched at most
/// `1 + MAX_CHALLENGE_RETRIES` times.
pub const MAX_CHALLENGE_RETRIES: u32 = 5;

/// Depth of the bounded verification queue. Enqueueing blocks once the VA
/// falls this far behind, which is the intended back-pressure signal.
pub const VERIFICATION_QUEUE_DEPTH: usize = 10;

/// How the WFE hands verification requests to the VA, in-process or over
/// RPC.
#[async_trait]
pub trait ValidationAuthority: Send + Sync {
    async fn do_validation(&self, req: VerificationRequest) -> Result<(), Error>;
}

/// In-process deployment: the WFE writes straight into the queue.
pub struct ChannelValidation {
    tx: mpsc::Sender<VerificationRequest>,
}

impl ChannelValidation {
    pub fn new(tx: mpsc::Sender<VerificationRequest>) -> Self {
        ChannelValidation { tx }
    }
}

#[async_trait]
impl ValidationAuthority for ChannelValidation {
    async fn do_validation(&self, req: VerificationRequest) -> Result<(), Error> {
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::Unknown("verification queue closed".to_string()))
    }
}

/// A probe for one challenge type.
#[async_trait]
pub trait ChallengeProbe: Send + Sync {
    async fn probe(&self, req: &VerificationRequest) -> Result<(), Problem>;
}

pub type ProbeRegistry = HashMap<String, Arc<dyn ChallengeProbe>>;

/// The probe registry seeded with the supported challenge types.
pub fn default_probes() -> ProbeRegistry {
    let mut probes: ProbeRegistry = HashMap::new();
    probes.insert(
        crate::core::CHALLENGE_HTTP01.to_string(),
        Arc::new(http01::Http01Probe::new()),
    );
    probes
}

pub struct ValidationWorker {
    rx: mpsc::Receiver<VerificationRequest>,
    tx: mpsc::Sender<VerificationRequest>,
    db: Arc<dyn Storage>,
    probes: Arc<ProbeRegistry>,
    sleep_before_probe: bool,
    drain_grace: Duration,
}

impl ValidationWorker {
    pub fn new(
        tx: mpsc::Sender<VerificationRequest>,
        rx: mpsc::Receiver<VerificationRequest>,
        db: Arc<dyn Storage>,
        probes: ProbeRegistry,
        sleep_before_probe: bool,
    ) -> Self {
        ValidationWorker {
            rx,
            tx,
            db,
            probes: Arc::new(probes),
            sleep_before_probe,
            drain_grace: Duration::from_secs(5),
        }
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Drains the queue until `shutdown` fires or every sender is gone,
    /// then gives in-flight and queued work a bounded grace period.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("VA starting");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(req) => self.dispatch(req),
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.drain().await;
                    break;
                }
            }
        }
        info!("VA stopped");
    }

    fn dispatch(&self, req: VerificationRequest) {
        let db = self.db.clone();
        let tx = self.tx.clone();
        let probes = self.probes.clone();
        let sleep = self.sleep_before_probe;
        let trace_id = req.trace_id.clone();
        let handle = tokio::spawn(trace::scope(
            trace_id,
            perform_validation(db, tx, probes, sleep, req),
        ));
        // Probes are isolated: a panic is logged, never propagated here.
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    error!("Validation probe panicked: {}", err);
                }
            }
        });
    }

    async fn drain(&mut self) {
        info!("Draining verification queue before exit");
        while let Ok(req) = self.rx.try_recv() {
            self.dispatch(req);
        }
        tokio::time::sleep(self.drain_grace).await;
    }
}

async fn perform_validation(
    db: Arc<dyn Storage>,
    tx: mpsc::Sender<VerificationRequest>,
    probes: Arc<ProbeRegistry>,
    sleep_before_probe: bool,
    req: VerificationRequest,
) {
    info!(
        "Starting validation of type {} for challenge {}",
        req.challenge.challenge_type, req.challenge.id
    );
    let probe = match probes.get(&req.challenge.challenge_type) {
        Some(p) => p.clone(),
        None => {
            error!(
                "Verification method {} does not exist, dropping request",
                req.challenge.challenge_type
            );
            return;
        }
    };

    if sleep_before_probe {
        let duration = Duration::from_secs(rand::thread_rng().gen_range(1..=4));
        debug!("Sleeping {:?} before probing, because config.sleep is set", duration);
        tokio::time::sleep(duration).await;
    }

    match probe.probe(&req).await {
        Err(problem) => {
            if req.retries < MAX_CHALLENGE_RETRIES {
                let mut retry = req;
                retry.retries += 1;
                warn!(
                    "Retrying validation of challenge {} (attempt {}): {}",
                    retry.challenge.id, retry.retries, problem
                );
                if tx.send(retry).await.is_err() {
                    warn!("Verification queue closed, dropping retry");
                }
                return;
            }
            warn!("Setting challenge {} invalid: {}", req.challenge.id, problem);
            if let Err(err) = storage::set_challenge_invalid(
                db.as_ref(),
                &req.challenge,
                &req.authorization.id,
                problem,
            )
            .await
            {
                error!("Could not set challenge invalid: {}", err);
            }
        }
        Ok(()) => {
            info!("Setting challenge {} valid", req.challenge.id);
            match tokio::time::timeout(
                Duration::from_secs(5),
                storage::set_challenge_valid(db.as_ref(), &req.challenge, &req.authorization.id),
            )
            .await
            {
                Err(_) => error!("Timed out setting challenge valid"),
                Ok(Err(err)) => error!("Could not set challenge valid: {}", err),
                Ok(Ok(())) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        Authorization, AuthzStatus, Challenge, ChallengeStatus, Identifier,
    };
    use crate::jose::testutil;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingStorage {
        authz_updates: Mutex<Vec<(Option<ChallengeStatus>, AuthzStatus)>>,
    }

    impl RecordingStorage {
        fn new() -> Self {
            RecordingStorage {
                authz_updates: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Storage for RecordingStorage {
        async fn get_account_by_id(&self, _: &str) -> Result<crate::core::Account, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn add_account(&self, _: &crate::core::Account) -> Result<(), Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn update_account(&self, _: &crate::core::Account) -> Result<(), Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn get_order_by_id(&self, _: &str) -> Result<crate::core::Order, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn add_order(&self, _: crate::core::AddOrderRequest) -> Result<String, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn update_order(&self, _: &crate::core::Order) -> Result<(), Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn get_authorization_by_id(&self, _: &str) -> Result<Authorization, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn add_authorization(&self, _: crate::core::AddAuthz) -> Result<String, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn get_auth_from_ident(
            &self,
            _: &Identifier,
            _: &crate::core::Account,
        ) -> Result<Authorization, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn get_challenge_by_id(
            &self,
            _: &str,
        ) -> Result<(Challenge, String, String), Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn update_challenge_status(
            &self,
            _: &str,
            _: ChallengeStatus,
        ) -> Result<(), Error> {
            Ok(())
        }
        async fn update_authorization(
            &self,
            challenge: Option<&Challenge>,
            _: &str,
            status: AuthzStatus,
        ) -> Result<(), Error> {
            self.authz_updates
                .lock()
                .unwrap()
                .push((challenge.map(|c| c.status), status));
            Ok(())
        }
        async fn get_certificate_and_chain(
            &self,
            _: &str,
        ) -> Result<(crate::core::Certificate, Vec<Vec<u8>>), Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn get_certificate_by_serial(
            &self,
            _: &[u8],
            _: &[u8],
        ) -> Result<crate::core::Certificate, Error> {
            Err(Error::NotImplemented("not in this test".to_string()))
        }
        async fn revoke_certificate(&self, _: &str, _: i32) -> Result<(), Error> {
            Ok(())
        }
    }

    struct CountingProbe {
        calls: Arc<AtomicU32>,
        verdict: Result<(), Problem>,
    }

    #[async_trait]
    impl ChallengeProbe for CountingProbe {
        async fn probe(&self, _req: &VerificationRequest) -> Result<(), Problem> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn sample_request(challenge_type: &str) -> VerificationRequest {
        let challenge = Challenge {
            id: "chal-1".to_string(),
            challenge_type: challenge_type.to_string(),
            token: "tok".to_string(),
            status: ChallengeStatus::Processing,
            validated_at: None,
            error: None,
            authz_id: "authz-1".to_string(),
        };
        VerificationRequest {
            challenge: challenge.clone(),
            authorization: Authorization {
                id: "authz-1".to_string(),
                status: AuthzStatus::Pending,
                identifier: Identifier::dns("example.test"),
                expires: chrono::Utc::now() + chrono::Duration::hours(1),
                account_id: "acct-1".to_string(),
                challenges: vec![challenge],
            },
            account_jwk: testutil::public_jwk(&testutil::rsa_key()),
            trace_id: "tid".to_string(),
            retries: 0,
        }
    }

    async fn run_worker_with(
        probes: ProbeRegistry,
        db: Arc<RecordingStorage>,
        req: VerificationRequest,
    ) {
        let (tx, rx) = mpsc::channel(VERIFICATION_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = ValidationWorker::new(tx.clone(), rx, db, probes, false)
            .drain_grace(Duration::from_millis(50));
        let handle = tokio::spawn(worker.run(shutdown_rx));
        tx.send(req).await.unwrap();
        // Let retries churn through the queue.
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failing_probe_is_dispatched_six_times_then_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut probes: ProbeRegistry = HashMap::new();
        probes.insert(
            "http-01".to_string(),
            Arc::new(CountingProbe {
                calls: calls.clone(),
                verdict: Err(Problem::unauthorized("wrong key authorization")),
            }),
        );
        let db = Arc::new(RecordingStorage::new());
        run_worker_with(probes, db.clone(), sample_request("http-01")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_CHALLENGE_RETRIES);
        let updates = db.authz_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0],
            (Some(ChallengeStatus::Invalid), AuthzStatus::Invalid)
        );
    }

    #[tokio::test]
    async fn successful_probe_writes_the_challenge_valid() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut probes: ProbeRegistry = HashMap::new();
        probes.insert(
            "http-01".to_string(),
            Arc::new(CountingProbe {
                calls: calls.clone(),
                verdict: Ok(()),
            }),
        );
        let db = Arc::new(RecordingStorage::new());
        run_worker_with(probes, db.clone(), sample_request("http-01")).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let updates = db.authz_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], (Some(ChallengeStatus::Valid), AuthzStatus::Valid));
    }

    #[tokio::test]
    async fn unknown_challenge_types_are_dropped() {
        let db = Arc::new(RecordingStorage::new());
        run_worker_with(HashMap::new(), db.clone(), sample_request("tls-alpn-01")).await;
        assert!(db.authz_updates.lock().unwrap().is_empty());
    }

    struct PanickingProbe;

    #[async_trait]
    impl ChallengeProbe for PanickingProbe {
        async fn probe(&self, _req: &VerificationRequest) -> Result<(), Problem> {
            panic!("faulty challenge validation code");
        }
    }

    #[tokio::test]
    async fn probe_panic_does_not_kill_the_dispatcher() {
        let mut probes: ProbeRegistry = HashMap::new();
        probes.insert("http-01".to_string(), Arc::new(PanickingProbe));
        let calls = Arc::new(AtomicU32::new(0));
        probes.insert(
            "ok-01".to_string(),
            Arc::new(CountingProbe {
                calls: calls.clone(),
                verdict: Ok(()),
            }),
        );
        let db = Arc::new(RecordingStorage::new());

        let (tx, rx) = mpsc::channel(VERIFICATION_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = ValidationWorker::new(tx.clone(), rx, db.clone(), probes, false)
            .drain_grace(Duration::from_millis(50));
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tx.send(sample_request("http-01")).await.unwrap();
        tx.send(sample_request("ok-01")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The dispatcher survived the panic and processed the second probe.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
