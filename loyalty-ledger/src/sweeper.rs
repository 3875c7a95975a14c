//! Expiration sweeper
//!
//! Turns time-expired lots into explicit `expiration` entries for audit.
//! Balances never depend on it: the calculator already excludes expired
//! lots. The sweep holds one user's lock for one lot at a time, so live
//! redemptions wait at most for a single append.
//!
//! # Background task
//!
//! ```text
//! ┌──────────────────────────────┐
//! │    SweeperHandle (Clone)     │  trigger() / shutdown()
//! └──────────────┬───────────────┘
//!                │ mpsc::channel (bounded)
//!                ▼
//! ┌──────────────────────────────┐
//! │  SweeperActor (single task)  │  interval tick → sweep(now)
//! └──────────────┬───────────────┘
//!                ▼
//!     per user: lock → replay → append expiration → unlock
//! ```

use crate::{
    balance::LotBook,
    types::{NewLedgerEntry, SweepFailure, SweepReport, UserId},
    Error, LoyaltyLedger, Result,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Sweep every user holding lots expired at `as_of` (capped at now)
pub(crate) async fn sweep(
    ledger: &LoyaltyLedger,
    as_of: Option<DateTime<Utc>>,
) -> Result<SweepReport> {
    let started = Instant::now();
    let now = ledger.now();
    let cutoff = as_of.map_or(now, |at| at.min(now));

    let mut report = SweepReport::new(cutoff);
    let users = ledger.storage().users_with_expired_lots(cutoff)?;

    for user_id in users {
        match expire_user(ledger, user_id, cutoff).await {
            Ok((0, _)) => {}
            Ok((lots, jewels)) => {
                report.lots_expired += lots;
                report.users_affected += 1;
                report.jewels_expired += jewels;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Expiration sweep failed for user, retrying next cycle"
                );
                report.failures.push(SweepFailure {
                    user_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    ledger.prune_locks();
    ledger.metrics().record_expired(report.jewels_expired);
    ledger
        .metrics()
        .record_sweep_duration(started.elapsed().as_secs_f64());

    tracing::info!(
        as_of = %cutoff,
        lots_expired = report.lots_expired,
        users_affected = report.users_affected,
        jewels_expired = report.jewels_expired,
        failures = report.failures.len(),
        "Expiration sweep complete"
    );

    Ok(report)
}

/// Expire a user's lots one at a time, re-taking the lock per lot
async fn expire_user(
    ledger: &LoyaltyLedger,
    user_id: UserId,
    cutoff: DateTime<Utc>,
) -> Result<(usize, i64)> {
    let mut lots = 0;
    let mut jewels = 0;

    loop {
        let guard = ledger.lock_user(user_id).await?;

        let entries = ledger.storage().get_user_entries(&user_id)?;
        let book = LotBook::replay(user_id, &entries)?;
        let Some(lot) = book
            .lots()
            .iter()
            .find(|lot| lot.is_expired_at(cutoff))
            .cloned()
        else {
            return Ok((lots, jewels));
        };

        let appended = ledger.append_locked(
            &guard,
            NewLedgerEntry::expiration(user_id, lot.lot_id, lot.remaining),
            |_, _| Ok(()),
        )?;
        drop(guard);

        tracing::debug!(
            user_id = %user_id,
            lot_id = %lot.lot_id,
            entry_id = %appended.entry.id,
            jewels = lot.remaining,
            "Lot expired"
        );

        lots += 1;
        jewels += lot.remaining;
    }
}

/// Message sent to the sweeper task
#[derive(Debug)]
pub enum SweeperMessage {
    /// Run a sweep now
    Trigger {
        /// Cut-off, defaults to now
        as_of: Option<DateTime<Utc>>,
        /// Sweep outcome
        response: oneshot::Sender<Result<SweepReport>>,
    },

    /// Stop the task
    Shutdown,
}

/// Task running the periodic sweep
#[derive(Debug)]
pub struct SweeperActor {
    ledger: Arc<LoyaltyLedger>,
    mailbox: mpsc::Receiver<SweeperMessage>,
    period: Duration,
}

impl SweeperActor {
    /// Create new actor
    pub fn new(
        ledger: Arc<LoyaltyLedger>,
        mailbox: mpsc::Receiver<SweeperMessage>,
        period: Duration,
    ) -> Self {
        Self {
            ledger,
            mailbox,
            period,
        }
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(SweeperMessage::Trigger { as_of, response }) => {
                        let result = sweep(&self.ledger, as_of).await;
                        let _ = response.send(result);
                    }
                    Some(SweeperMessage::Shutdown) | None => break,
                },

                _ = ticker.tick() => {
                    self.periodic_sweep().await;
                }
            }
        }

        tracing::info!("Expiration sweeper stopped");
    }

    async fn periodic_sweep(&self) {
        match sweep(&self.ledger, None).await.and_then(SweepReport::into_result) {
            Ok(_) => {}
            Err(e @ Error::SweepPartialFailure { .. }) => {
                tracing::warn!(error = %e, "Periodic sweep incomplete");
            }
            Err(e) => {
                tracing::error!(error = %e, "Periodic sweep failed");
            }
        }
    }
}

/// Handle for the sweeper task
#[derive(Debug, Clone)]
pub struct SweeperHandle {
    sender: mpsc::Sender<SweeperMessage>,
}

impl SweeperHandle {
    /// Run a sweep now and wait for its report
    pub async fn trigger(&self, as_of: Option<DateTime<Utc>>) -> Result<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SweeperMessage::Trigger {
                as_of,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Sweeper mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Stop the sweeper
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SweeperMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Sweeper mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the periodic sweeper
pub fn spawn_sweeper(ledger: Arc<LoyaltyLedger>, period: Duration) -> SweeperHandle {
    let (tx, rx) = mpsc::channel(16);
    let actor = SweeperActor::new(ledger, rx, period);

    tokio::spawn(async move {
        actor.run().await;
    });

    SweeperHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, Config, EntryReason, ExpiryPolicy};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn create_test_ledger() -> (Arc<LoyaltyLedger>, ManualClock, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let clock = ManualClock::new(start());
        let ledger = LoyaltyLedger::open_with_clock(config, Arc::new(clock.clone())).unwrap();
        (Arc::new(ledger), clock, temp_dir)
    }

    async fn earn(ledger: &LoyaltyLedger, user: UserId, jewels: i64, expires_in_days: i64) {
        ledger
            .post_earn(
                user,
                jewels,
                EntryReason::BookingReward,
                ExpiryPolicy::At(start() + ChronoDuration::days(expires_in_days)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expires_only_due_lots() {
        let (ledger, clock, _dir) = create_test_ledger();
        let user = UserId::random();
        earn(&ledger, user, 100, 10).await;
        earn(&ledger, user, 50, 20).await;

        clock.set(start() + ChronoDuration::days(15));
        let report = ledger.sweep_expirations(None).await.unwrap();

        assert_eq!(report.lots_expired, 1);
        assert_eq!(report.users_affected, 1);
        assert_eq!(report.jewels_expired, 100);
        assert!(report.failures.is_empty());

        let balance = ledger.get_balance(user).await.unwrap();
        assert_eq!(balance.active, 50);
        assert_eq!(balance.lifetime_expired, 100);
        assert!(ledger.verify_summary(user).is_ok());
    }

    #[tokio::test]
    async fn test_future_as_of_is_capped_at_now() {
        let (ledger, _clock, _dir) = create_test_ledger();
        let user = UserId::random();
        earn(&ledger, user, 100, 10).await;

        let report = ledger
            .sweep_expirations(Some(start() + ChronoDuration::days(30)))
            .await
            .unwrap();

        assert_eq!(report.as_of, start());
        assert_eq!(report.lots_expired, 0);
        assert_eq!(ledger.get_balance(user).await.unwrap().active, 100);
    }

    #[tokio::test]
    async fn test_sweep_skips_users_without_due_lots() {
        let (ledger, clock, _dir) = create_test_ledger();
        let due = UserId::random();
        let fresh = UserId::random();
        earn(&ledger, due, 100, 1).await;
        earn(&ledger, fresh, 100, 100).await;

        clock.advance(ChronoDuration::days(2));
        let report = ledger.sweep_expirations(None).await.unwrap();

        assert_eq!(report.users_affected, 1);
        assert_eq!(ledger.entries(fresh).unwrap().len(), 1);
        assert_eq!(ledger.entries(due).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_records_locked_user_as_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.locking.lock_timeout_ms = 20;
        let clock = ManualClock::new(start());
        let ledger = LoyaltyLedger::open_with_clock(config, Arc::new(clock.clone())).unwrap();

        let blocked = UserId::random();
        let free = UserId::random();
        earn(&ledger, blocked, 100, 1).await;
        earn(&ledger, free, 100, 1).await;
        clock.advance(ChronoDuration::days(2));

        let guard = ledger.lock_user(blocked).await.unwrap();
        let report = ledger.sweep_expirations(None).await.unwrap();
        drop(guard);

        assert_eq!(report.users_affected, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].user_id, blocked);
        assert!(matches!(
            report.clone().into_result(),
            Err(Error::SweepPartialFailure { failed_users: 1, .. })
        ));

        // Retried on the next cycle
        let retry = ledger.sweep_expirations(None).await.unwrap();
        assert_eq!(retry.users_affected, 1);
        assert!(retry.failures.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_task_trigger_and_shutdown() {
        let (ledger, clock, _dir) = create_test_ledger();
        let user = UserId::random();
        earn(&ledger, user, 100, 1).await;
        clock.advance(ChronoDuration::days(2));

        let handle = spawn_sweeper(ledger.clone(), Duration::from_secs(3600));
        let report = handle.trigger(None).await.unwrap();
        // The first interval tick may already have swept the lot
        assert!(report.failures.is_empty());

        let expirations = ledger
            .entries(user)
            .unwrap()
            .into_iter()
            .filter(|entry| entry.reason == EntryReason::Expiration)
            .count();
        assert_eq!(expirations, 1);

        handle.shutdown().await.unwrap();
    }
}
