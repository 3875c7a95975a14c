//! Main ledger orchestration layer
//!
//! This module ties together storage, per-user locking, the balance
//! calculator and the summary projection into the API the rest of the
//! platform calls: post earn events, redeem, read balances, sweep expiries.
//!
//! # Example
//!
//! ```no_run
//! use loyalty_ledger::{Config, EntryReason, ExpiryPolicy, LoyaltyLedger, UserId};
//!
//! #[tokio::main]
//! async fn main() -> loyalty_ledger::Result<()> {
//!     let ledger = LoyaltyLedger::open(Config::default())?;
//!     let guest = UserId::random();
//!
//!     ledger
//!         .post_earn(guest, 150, EntryReason::BookingReward, ExpiryPolicy::Default)
//!         .await?;
//!     let result = ledger.redeem(guest, 100).await?;
//!     println!("discount: {} {}", result.discount_amount, result.currency);
//!
//!     Ok(())
//! }
//! ```

use crate::{
    balance::{self, LotBook},
    clock::{Clock, SystemClock},
    locks::{UserGuard, UserLocks},
    metrics::Metrics,
    projection,
    storage::{ClosedLot, Storage, StorageStats},
    sweeper,
    types::{
        Balance, BalanceSnapshot, EarnLot, EntryReason, ExpiryPolicy, LedgerEntry, LotDraw,
        NewLedgerEntry, RedemptionResult, SweepReport, UserId, UserLoyaltySummary,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Main ledger interface
pub struct LoyaltyLedger {
    storage: Arc<Storage>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl std::fmt::Debug for LoyaltyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoyaltyLedger")
            .field("storage", &self.storage)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// A committed append and what it did
#[derive(Debug)]
pub(crate) struct Appended {
    pub entry: LedgerEntry,
    pub draws: Vec<LotDraw>,
    pub snapshot: BalanceSnapshot,
}

impl LoyaltyLedger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open ledger reading time from `clock`
    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Other(format!("metrics registry: {}", e)))?,
        );
        let locks = UserLocks::new(std::time::Duration::from_millis(
            config.locking.lock_timeout_ms,
        ));

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            min_redemption = config.loyalty.min_redemption,
            rate = %config.loyalty.jewel_to_currency_rate,
            "Loyalty ledger opened"
        );

        Ok(Self {
            storage,
            locks,
            clock,
            metrics,
            config,
        })
    }

    /// Grant jewels to a user.
    ///
    /// Only `booking_reward` and `manual_adjustment` may credit.
    pub async fn post_earn(
        &self,
        user_id: UserId,
        jewels: i64,
        reason: EntryReason,
        expiry: ExpiryPolicy,
    ) -> Result<LedgerEntry> {
        if jewels <= 0 {
            return Err(Error::InvalidEntry(format!(
                "earned jewels must be positive, got {}",
                jewels
            )));
        }
        if !reason.allows_credit() {
            return Err(Error::InvalidEntry(format!(
                "reason {} cannot credit jewels",
                reason
            )));
        }

        let expires_at = match expiry {
            ExpiryPolicy::Default => {
                let lifetime_days = self.config.loyalty.default_lot_lifetime_days;
                let expires_at = Duration::try_days(lifetime_days)
                    .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        Error::InvalidEntry(format!(
                            "lot lifetime of {} days is out of range",
                            lifetime_days
                        ))
                    })?;
                Some(expires_at)
            }
            ExpiryPolicy::At(at) => Some(at),
            ExpiryPolicy::Never => None,
        };

        self.append(NewLedgerEntry::credit(user_id, jewels, reason, expires_at))
            .await
    }

    /// Append a fully formed entry.
    ///
    /// Assigns id and timestamp, validates funding against the user's log,
    /// and commits the entry with the refreshed summary in one batch.
    pub async fn append(&self, candidate: NewLedgerEntry) -> Result<LedgerEntry> {
        validate_shape(&candidate)?;

        let guard = self.lock_user(candidate.user_id).await?;
        let appended = self.append_locked(&guard, candidate, |_, _| Ok(()))?;
        Ok(appended.entry)
    }

    /// Redeem jewels for a checkout discount
    pub async fn redeem(&self, user_id: UserId, jewels_requested: i64) -> Result<RedemptionResult> {
        let minimum = self.config.loyalty.min_redemption;
        if jewels_requested < minimum {
            self.metrics.record_redemption_rejected();
            return Err(Error::BelowMinimumThreshold {
                requested: jewels_requested,
                minimum,
            });
        }

        let result = self.redeem_checked(user_id, jewels_requested).await;
        match &result {
            Ok(redemption) => {
                self.metrics.record_redemption(redemption.jewels_redeemed);
                tracing::info!(
                    user_id = %user_id,
                    entry_id = %redemption.entry_id,
                    jewels = redemption.jewels_redeemed,
                    discount = %redemption.discount_amount,
                    new_active_balance = redemption.new_active_balance,
                    "Jewels redeemed"
                );
            }
            Err(e) => {
                self.metrics.record_redemption_rejected();
                tracing::debug!(user_id = %user_id, error = %e, "Redemption rejected");
            }
        }
        result
    }

    async fn redeem_checked(&self, user_id: UserId, jewels: i64) -> Result<RedemptionResult> {
        let discount_amount = self.discount_for(jewels)?;
        let guard = self.lock_user(user_id).await?;

        let appended = self.append_locked(
            &guard,
            NewLedgerEntry::redemption(user_id, jewels),
            |book, at| {
                let available = book.active_at(at);
                if available < jewels {
                    return Err(Error::InsufficientBalance {
                        requested: jewels,
                        available,
                    });
                }
                Ok(())
            },
        )?;

        Ok(RedemptionResult {
            entry_id: appended.entry.id,
            jewels_redeemed: jewels,
            discount_amount,
            currency: self.config.loyalty.currency.clone(),
            new_active_balance: appended.snapshot.active_balance,
            lots_consumed: appended.draws,
        })
    }

    /// Currency value of `jewels` at the configured rate
    pub fn discount_for(&self, jewels: i64) -> Result<Decimal> {
        Decimal::from(jewels)
            .checked_mul(self.config.loyalty.jewel_to_currency_rate)
            .ok_or_else(|| {
                Error::InvalidEntry(format!("discount for {} jewels overflows", jewels))
            })
    }

    /// Current balance. Served from the summary while it is fresh, otherwise
    /// replayed from the log. Never writes.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Balance> {
        let now = self.clock.now();

        match self.storage.get_summary(&user_id)? {
            None => Ok(Balance::from(&BalanceSnapshot::empty(user_id, now))),
            Some(summary) if summary.is_fresh_at(now) => Ok(Balance {
                as_of: now,
                ..Balance::from(&summary)
            }),
            Some(_) => Ok(Balance::from(&self.snapshot(user_id)?)),
        }
    }

    /// Replay the user's log at `as_of`
    pub fn compute_balance(&self, user_id: UserId, as_of: DateTime<Utc>) -> Result<BalanceSnapshot> {
        let entries = self.storage.get_user_entries(&user_id)?;
        balance::compute_balance(user_id, &entries, as_of)
    }

    /// Replay the whole log at now, or at the last entry if that is later
    pub fn snapshot(&self, user_id: UserId) -> Result<BalanceSnapshot> {
        let entries = self.storage.get_user_entries(&user_id)?;
        let book = LotBook::replay(user_id, &entries)?;
        let as_of = book
            .last_created_at()
            .map_or(self.clock.now(), |last| last.max(self.clock.now()));
        Ok(book.snapshot(as_of))
    }

    /// Recompute and store the user's summary with a bumped version
    pub async fn refresh(&self, user_id: UserId) -> Result<UserLoyaltySummary> {
        let _guard = self.lock_user(user_id).await?;

        let entries = self.storage.get_user_entries(&user_id)?;
        let previous = self.storage.get_summary(&user_id)?;
        if entries.is_empty() && previous.is_none() {
            return Err(Error::EntryNotFound(format!(
                "no ledger entries for user {}",
                user_id
            )));
        }

        let book = LotBook::replay(user_id, &entries)?;
        let as_of = next_timestamp(self.clock.now(), book.last_created_at());
        let summary = projection::project(&book.snapshot(as_of), previous.as_ref());
        self.storage.put_summary(&summary)?;

        tracing::debug!(user_id = %user_id, version = summary.version, "Summary refreshed");
        Ok(summary)
    }

    /// Stored summary, possibly stale
    pub fn get_summary(&self, user_id: UserId) -> Result<Option<UserLoyaltySummary>> {
        self.storage.get_summary(&user_id)
    }

    /// Check the stored summary against a full replay at its `refreshed_at`
    pub fn verify_summary(&self, user_id: UserId) -> Result<UserLoyaltySummary> {
        let summary = self.storage.get_summary(&user_id)?.ok_or_else(|| {
            Error::EntryNotFound(format!("no summary for user {}", user_id))
        })?;
        let replayed = self.compute_balance(user_id, summary.refreshed_at)?;
        projection::verify(&summary, &replayed)?;
        Ok(summary)
    }

    /// earned == active + redeemed + expired on a live replay
    pub fn check_conservation(&self, user_id: UserId) -> Result<bool> {
        Ok(self.snapshot(user_id)?.is_conserved())
    }

    /// Convert time-expired lots into explicit expiration entries.
    ///
    /// `as_of` defaults to now and is capped at now.
    pub async fn sweep_expirations(&self, as_of: Option<DateTime<Utc>>) -> Result<SweepReport> {
        sweeper::sweep(self, as_of).await
    }

    /// Full history of a user in FIFO order
    pub fn entries(&self, user_id: UserId) -> Result<Vec<LedgerEntry>> {
        self.storage.get_user_entries(&user_id)
    }

    /// Entry by id
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        self.storage.get_entry(entry_id)
    }

    /// Users with at least one entry
    pub fn users(&self) -> Result<Vec<UserId>> {
        self.storage.list_users()
    }

    /// Approximate entry, user and pending-expiry counts
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current time per the ledger's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Forget locks no task is holding or waiting on
    pub(crate) fn prune_locks(&self) {
        self.locks.prune();
    }

    pub(crate) async fn lock_user(&self, user_id: UserId) -> Result<UserGuard> {
        let guard = self.locks.acquire(user_id).await;
        if guard.is_err() {
            self.metrics.record_lock_conflict();
        }
        guard
    }

    /// Validate and commit `candidate` while holding its user's lock.
    ///
    /// `check` runs against the replayed book before anything is written.
    pub(crate) fn append_locked<F>(
        &self,
        guard: &UserGuard,
        candidate: NewLedgerEntry,
        check: F,
    ) -> Result<Appended>
    where
        F: FnOnce(&LotBook, DateTime<Utc>) -> Result<()>,
    {
        let user_id = candidate.user_id;
        if guard.user_id() != user_id {
            return Err(Error::InvariantViolation(format!(
                "append for {} under lock of {}",
                user_id,
                guard.user_id()
            )));
        }

        let started = Instant::now();

        let entries = self.storage.get_user_entries(&user_id)?;
        let mut book = LotBook::replay(user_id, &entries)?;
        let previous = self.storage.get_summary(&user_id)?;

        let created_at = next_timestamp(self.clock.now(), book.last_created_at());
        if let (true, Some(expires_at)) = (candidate.delta > 0, candidate.expires_at) {
            if expires_at <= created_at {
                return Err(Error::InvalidEntry(format!(
                    "expires_at {} is not after entry time {}",
                    expires_at, created_at
                )));
            }
        }

        check(&book, created_at)?;

        let prior_lots: Vec<EarnLot> = book.lots().to_vec();
        let entry = candidate.into_entry(Uuid::now_v7(), created_at);
        let draws = book.apply(&entry)?;
        let snapshot = book.snapshot(created_at);

        let summary = projection::project(&snapshot, previous.as_ref());
        if !summary.is_conserved() {
            return Err(Error::InvariantViolation(format!(
                "append of {} would break conservation for {}",
                entry.id, user_id
            )));
        }

        let closed_lots: Vec<ClosedLot> = draws
            .iter()
            .filter(|draw| snapshot.lot_remaining(draw.lot_id).is_none())
            .filter_map(|draw| {
                prior_lots
                    .iter()
                    .find(|lot| lot.lot_id == draw.lot_id)
                    .and_then(|lot| lot.expires_at)
                    .map(|expires_at| ClosedLot {
                        expires_at,
                        lot_id: draw.lot_id,
                    })
            })
            .collect();

        self.storage
            .append_entry_atomic(&entry, &summary, &closed_lots)?;

        if entry.is_credit() {
            self.metrics.record_earn(entry.delta);
        }
        self.metrics
            .record_append_duration(started.elapsed().as_secs_f64());

        Ok(Appended {
            entry,
            draws,
            snapshot,
        })
    }
}

/// Checks that need no history
fn validate_shape(candidate: &NewLedgerEntry) -> Result<()> {
    if candidate.delta == 0 {
        return Err(Error::InvalidEntry("delta must be non-zero".to_string()));
    }
    if candidate.delta == i64::MIN {
        return Err(Error::InvalidEntry(format!(
            "delta {} out of range",
            candidate.delta
        )));
    }

    if candidate.delta > 0 {
        if !candidate.reason.allows_credit() {
            return Err(Error::InvalidEntry(format!(
                "reason {} cannot carry a positive delta",
                candidate.reason
            )));
        }
        if candidate.source_lot_id.is_some() {
            return Err(Error::InvalidEntry(
                "earn entries cannot reference a source lot".to_string(),
            ));
        }
    } else {
        if !candidate.reason.allows_debit() {
            return Err(Error::InvalidEntry(format!(
                "reason {} cannot carry a negative delta",
                candidate.reason
            )));
        }
        if candidate.expires_at.is_some() {
            return Err(Error::InvalidEntry(
                "only earn entries may set expires_at".to_string(),
            ));
        }
        if candidate.reason == EntryReason::Expiration && candidate.source_lot_id.is_none() {
            return Err(Error::InvalidEntry(
                "expiration entry requires source_lot_id".to_string(),
            ));
        }
    }

    Ok(())
}

/// Strictly increasing per-user entry time
fn next_timestamp(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}
