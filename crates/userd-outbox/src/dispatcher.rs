//! Outbox dispatcher.
//!
//! A long-lived background loop that drains pending outbox entries to
//! the event channel, decoupled from request latency. Each pass claims
//! a batch of due entries under a lease, publishes them in sequence
//! order, and marks them delivered on acknowledgment. Failed publishes
//! release the claim for retry with exponential backoff; entries that
//! exhaust their retry budget are moved to the dead state.
//!
//! The lease expires on its own, so entries claimed by a crashed
//! instance become claimable again and are re-published. Consumers see
//! at-least-once delivery and deduplicate on (operation, email, seq).

use crate::channel::{EventChannel, UserEvent};
use crate::error::{ChannelError, OutboxResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use userd_database::{queries, Database};

/// Configuration for dispatcher polling and retry behavior.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll the outbox for due entries.
    pub poll_interval: Duration,
    /// Maximum entries claimed per pass.
    pub batch_size: usize,
    /// How long a claim lease lasts before another instance may take over.
    pub claim_ttl: Duration,
    /// Base duration for exponential backoff on retries.
    pub backoff_base: Duration,
    /// Maximum duration for backoff (caps exponential growth).
    pub backoff_max: Duration,
    /// Attempt ceiling; an entry reaching it is dead-lettered.
    pub max_attempts: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 32,
            claim_ttl: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            max_attempts: 10,
        }
    }
}

/// Outbox dispatcher.
///
/// Multiple instances may run against the same store; the claim lease
/// guarantees each entry is in flight with at most one of them.
pub struct Dispatcher {
    db: Database,
    channel: Arc<dyn EventChannel>,
    config: DispatcherConfig,
    instance_id: String,
}

impl Dispatcher {
    /// Create a new dispatcher with a unique instance identity.
    pub fn new(db: Database, channel: Arc<dyn EventChannel>, config: DispatcherConfig) -> Self {
        let instance_id = format!("dispatcher-{}", uuid::Uuid::new_v4());
        Self {
            db,
            channel,
            config,
            instance_id,
        }
    }

    /// Get this instance's claim identity.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Run the dispatch loop until the task is dropped.
    pub async fn run(&self) {
        info!(
            instance = %self.instance_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Dispatcher started"
        );

        let mut ticker = interval(self.config.poll_interval);

        loop {
            ticker.tick().await;

            match self.process_once().await {
                Ok(0) => {}
                Ok(delivered) => {
                    debug!(instance = %self.instance_id, delivered, "Dispatch pass complete");
                }
                Err(e) => {
                    warn!(instance = %self.instance_id, error = %e, "Dispatch pass failed");
                }
            }
        }
    }

    /// Run one dispatch pass. Returns the number of entries delivered.
    ///
    /// A publish failure ends the pass after releasing the claim: the
    /// channel is most likely down, and later entries would only burn
    /// their attempt budget.
    pub async fn process_once(&self) -> OutboxResult<usize> {
        let now = Utc::now();

        let candidates = self
            .db
            .with_conn(|conn| queries::list_claimable_outbox(conn, now, self.config.batch_size))?;

        let mut delivered = 0;

        for entry in candidates {
            if !is_due(entry.last_attempt_at, entry.attempt_count, now, &self.config) {
                continue;
            }

            let expires_at = now + to_chrono(self.config.claim_ttl);
            let claimed = self.db.with_conn(|conn| {
                queries::claim_outbox_entry(conn, entry.seq, &self.instance_id, now, expires_at)
            })?;
            if !claimed {
                // Another instance won the race
                continue;
            }

            let event = UserEvent::from_entry(&entry);

            match self.channel.publish(&event).await {
                Ok(()) => {
                    self.db.with_conn(|conn| {
                        queries::mark_outbox_delivered(conn, entry.seq, &self.instance_id, Utc::now())
                    })?;
                    delivered += 1;
                    info!(
                        instance = %self.instance_id,
                        seq = entry.seq,
                        operation = entry.operation.as_str(),
                        email = %entry.email,
                        "Event delivered"
                    );
                }
                Err(e) => {
                    self.handle_publish_failure(&entry.email, entry.seq, entry.attempt_count, &e)?;
                    break;
                }
            }
        }

        Ok(delivered)
    }

    fn handle_publish_failure(
        &self,
        email: &str,
        seq: i64,
        prior_attempts: i64,
        cause: &ChannelError,
    ) -> OutboxResult<()> {
        let now = Utc::now();
        let attempts = prior_attempts + 1;
        let message = cause.to_string();

        if attempts >= self.config.max_attempts {
            self.db.with_conn(|conn| {
                queries::mark_outbox_dead(conn, seq, &self.instance_id, &message, now)
            })?;
            error!(
                instance = %self.instance_id,
                seq,
                email = %email,
                attempts,
                error = %message,
                "Retry ceiling exceeded, entry dead-lettered"
            );
        } else {
            self.db.with_conn(|conn| {
                queries::release_outbox_claim(conn, seq, &self.instance_id, &message, now)
            })?;
            warn!(
                instance = %self.instance_id,
                seq,
                attempts,
                error = %message,
                "Publish failed, claim released for retry"
            );
        }

        Ok(())
    }
}

/// Determines if an entry is due for another attempt based on backoff.
///
/// An entry is due if it has never been attempted, or enough time has
/// passed since the last attempt for its retry count.
fn is_due(
    last_attempt_at: Option<DateTime<Utc>>,
    attempt_count: i64,
    now: DateTime<Utc>,
    config: &DispatcherConfig,
) -> bool {
    let Some(last_attempt) = last_attempt_at else {
        return true;
    };

    now >= last_attempt + compute_backoff(attempt_count, config)
}

/// Binary exponential backoff: `base * 2^(attempts - 1)`, capped at max.
fn compute_backoff(attempt_count: i64, config: &DispatcherConfig) -> chrono::Duration {
    if attempt_count <= 0 {
        return chrono::Duration::zero();
    }

    let base_ms = config.backoff_base.as_millis() as u64;
    let max_ms = config.backoff_max.as_millis() as u64;
    let shift = attempt_count.saturating_sub(1).min(u32::MAX as i64) as u32;
    let multiplier = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

    chrono::Duration::milliseconds(delay_ms as i64)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use userd_database::{DeliveryStatus, OutboxOperation, PoolConfig};
    use userd_service::{UserInput, UserService};

    /// Recording channel with a scriptable number of leading failures.
    struct MockChannel {
        published: Mutex<Vec<UserEvent>>,
        failures_remaining: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl MockChannel {
        fn new() -> Self {
            Self::failing(0)
        }

        fn failing(failures: usize) -> Self {
            Self {
                published: Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(failures),
                attempts: AtomicUsize::new(0),
            }
        }

        fn published(&self) -> Vec<UserEvent> {
            self.published.lock().unwrap().clone()
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventChannel for MockChannel {
        async fn publish(&self, event: &UserEvent) -> Result<(), ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::Publish("simulated broker outage".to_string()));
            }

            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db"), PoolConfig::default()).unwrap();
        (dir, db)
    }

    /// Config with no backoff delay so passes retry immediately.
    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            backoff_base: Duration::ZERO,
            ..DispatcherConfig::default()
        }
    }

    fn input(name: &str, email: &str) -> UserInput {
        UserInput {
            name: name.to_string(),
            email: email.to_string(),
            age: None,
        }
    }

    fn status_counts(db: &Database) -> (i64, i64, i64) {
        db.with_conn(|conn| {
            Ok((
                queries::count_outbox_by_status(conn, DeliveryStatus::Pending)?,
                queries::count_outbox_by_status(conn, DeliveryStatus::Delivered)?,
                queries::count_outbox_by_status(conn, DeliveryStatus::Dead)?,
            ))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_pass_delivers_staged_events_in_seq_order() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::new());
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), fast_config());

        let alice = service.create(input("Alice", "a@ex.com")).unwrap();
        service.create(input("Bob", "b@ex.com")).unwrap();
        service.delete(alice.id).unwrap();

        let delivered = dispatcher.process_once().await.unwrap();
        assert_eq!(delivered, 3);

        let events = channel.published();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].operation, OutboxOperation::Create);
        assert_eq!(events[0].email, "a@ex.com");
        assert_eq!(events[1].operation, OutboxOperation::Create);
        assert_eq!(events[1].email, "b@ex.com");
        assert_eq!(events[2].operation, OutboxOperation::Delete);
        assert_eq!(events[2].email, "a@ex.com");
        assert!(events[0].seq < events[1].seq && events[1].seq < events[2].seq);

        let (pending, delivered, dead) = status_counts(&db);
        assert_eq!((pending, delivered, dead), (0, 3, 0));
    }

    #[tokio::test]
    async fn test_empty_outbox_is_a_quiet_pass() {
        let (_dir, db) = test_db();
        let channel = Arc::new(MockChannel::new());
        let dispatcher = Dispatcher::new(db, channel.clone(), fast_config());

        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_channel_outage_then_recovery_delivers_exactly_once_in_store() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::failing(2));
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), fast_config());

        service.create(input("Bob", "b@ex.com")).unwrap();

        // Two passes against a down channel: claim, fail, release
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);

        let entry = db
            .with_conn(|conn| queries::get_outbox_entry(conn, 1))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, DeliveryStatus::Pending);
        assert_eq!(entry.attempt_count, 2);
        assert!(entry.last_error.is_some());

        // Channel recovers
        assert_eq!(dispatcher.process_once().await.unwrap(), 1);

        let (pending, delivered, dead) = status_counts(&db);
        assert_eq!((pending, delivered, dead), (0, 1, 0));

        // The underlying user mutation was never duplicated
        assert_eq!(service.list().unwrap().len(), 1);
        assert_eq!(channel.published().len(), 1);

        // Nothing left; further passes publish nothing new
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.published().len(), 1);
    }

    #[tokio::test]
    async fn test_entry_exceeding_attempt_ceiling_is_dead_lettered() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::failing(usize::MAX));
        let config = DispatcherConfig {
            max_attempts: 3,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), config);

        service.create(input("Bob", "b@ex.com")).unwrap();

        for _ in 0..3 {
            assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        }

        let (pending, delivered, dead) = status_counts(&db);
        assert_eq!((pending, delivered, dead), (0, 0, 1));

        let entry = db
            .with_conn(|conn| queries::get_outbox_entry(conn, 1))
            .unwrap()
            .unwrap();
        assert_eq!(entry.attempt_count, 3);

        // Dead entries are never attempted again
        let attempts_before = channel.attempts();
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), attempts_before);
    }

    #[tokio::test]
    async fn test_expired_lease_is_republished_after_crash() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::new());
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), fast_config());

        service.create(input("Bob", "b@ex.com")).unwrap();

        // A previous instance claimed the entry, published it, and died
        // before marking it delivered. Its lease has expired.
        let now = Utc::now();
        let expired = now - chrono::Duration::seconds(5);
        db.with_conn(|conn| queries::claim_outbox_entry(conn, 1, "crashed-instance", now, expired))
            .unwrap();

        // A fresh dispatcher re-claims and re-publishes (at-least-once)
        assert_eq!(dispatcher.process_once().await.unwrap(), 1);
        assert_eq!(channel.published().len(), 1);

        let (pending, delivered, dead) = status_counts(&db);
        assert_eq!((pending, delivered, dead), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_live_lease_blocks_other_instances() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::new());
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), fast_config());

        service.create(input("Bob", "b@ex.com")).unwrap();

        // Another instance holds a live lease on the entry
        let now = Utc::now();
        let expires = now + chrono::Duration::seconds(60);
        db.with_conn(|conn| queries::claim_outbox_entry(conn, 1, "other-instance", now, expires))
            .unwrap();

        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::failing(1));
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(60),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), config);

        service.create(input("Bob", "b@ex.com")).unwrap();

        // First attempt fails and records last_attempt_at
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), 1);

        // Immediately after, the entry is not yet due
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failure_aborts_rest_of_pass() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::failing(1));
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), fast_config());

        service.create(input("Alice", "a@ex.com")).unwrap();
        service.create(input("Bob", "b@ex.com")).unwrap();

        // First entry fails; the pass stops without touching the second
        assert_eq!(dispatcher.process_once().await.unwrap(), 0);
        assert_eq!(channel.attempts(), 1);

        // Next pass delivers both
        assert_eq!(dispatcher.process_once().await.unwrap(), 2);
        assert_eq!(channel.published().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_size_limits_a_pass() {
        let (_dir, db) = test_db();
        let service = UserService::new(db.clone());
        let channel = Arc::new(MockChannel::new());
        let config = DispatcherConfig {
            batch_size: 2,
            ..fast_config()
        };
        let dispatcher = Dispatcher::new(db.clone(), channel.clone(), config);

        for i in 0..5 {
            service.create(input("U", &format!("u{}@ex.com", i))).unwrap();
        }

        assert_eq!(dispatcher.process_once().await.unwrap(), 2);
        assert_eq!(dispatcher.process_once().await.unwrap(), 2);
        assert_eq!(dispatcher.process_once().await.unwrap(), 1);

        let (pending, delivered, dead) = status_counts(&db);
        assert_eq!((pending, delivered, dead), (0, 5, 0));
    }

    #[test]
    fn test_compute_backoff_caps_and_grows() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(10),
            ..DispatcherConfig::default()
        };

        assert_eq!(compute_backoff(0, &config), chrono::Duration::zero());
        assert_eq!(compute_backoff(1, &config), chrono::Duration::seconds(2));
        assert_eq!(compute_backoff(2, &config), chrono::Duration::seconds(4));
        assert_eq!(compute_backoff(3, &config), chrono::Duration::seconds(8));
        assert_eq!(compute_backoff(4, &config), chrono::Duration::seconds(10));
        assert_eq!(compute_backoff(100, &config), chrono::Duration::seconds(10));
    }

    #[test]
    fn test_compute_backoff_zero_for_non_positive_attempts() {
        let config = DispatcherConfig::default();
        assert_eq!(compute_backoff(0, &config), chrono::Duration::zero());
        assert_eq!(compute_backoff(-1, &config), chrono::Duration::zero());
    }

    #[test]
    fn test_is_due_respects_backoff() {
        let config = DispatcherConfig {
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(10),
            ..DispatcherConfig::default()
        };

        let now = Utc::now();
        assert!(is_due(None, 0, now, &config));

        let last_attempt = now;
        assert!(!is_due(Some(last_attempt), 1, now, &config));
        assert!(is_due(
            Some(last_attempt),
            1,
            now + chrono::Duration::seconds(3),
            &config
        ));
    }

    #[test]
    fn test_dispatcher_instances_have_distinct_identity() {
        let (_dir, db) = test_db();
        let channel = Arc::new(MockChannel::new());

        let a = Dispatcher::new(db.clone(), channel.clone(), DispatcherConfig::default());
        let b = Dispatcher::new(db, channel, DispatcherConfig::default());

        assert!(a.instance_id().starts_with("dispatcher-"));
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
