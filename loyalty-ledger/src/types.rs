//! Core types for the jewels ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Integer jewel arithmetic (no floating point)
//! - Exact currency arithmetic (Decimal for discounts)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account identifier owned by the platform's user directory.
///
/// The ledger only holds a weak reference; it never creates or deletes users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a random user id (tests, fixtures)
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw key bytes (16)
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a ledger entry exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntryReason {
    /// Jewels granted on booking completion
    BookingReward = 1,
    /// Admin grant (positive) or clawback (negative)
    ManualAdjustment = 2,
    /// Jewels spent at checkout
    Redemption = 3,
    /// Jewels lost to lot expiry
    Expiration = 4,
}

impl EntryReason {
    /// Wire/database tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryReason::BookingReward => "booking_reward",
            EntryReason::ManualAdjustment => "manual_adjustment",
            EntryReason::Redemption => "redemption",
            EntryReason::Expiration => "expiration",
        }
    }

    /// Parse from tag
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "booking_reward" => Some(EntryReason::BookingReward),
            "manual_adjustment" => Some(EntryReason::ManualAdjustment),
            "redemption" => Some(EntryReason::Redemption),
            "expiration" => Some(EntryReason::Expiration),
            _ => None,
        }
    }

    /// Whether this reason may carry a positive delta
    pub fn allows_credit(&self) -> bool {
        matches!(self, EntryReason::BookingReward | EntryReason::ManualAdjustment)
    }

    /// Whether this reason may carry a negative delta
    pub fn allows_debit(&self) -> bool {
        !matches!(self, EntryReason::BookingReward)
    }
}

impl fmt::Display for EntryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable ledger entry. Never updated or deleted once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (UUIDv7, assigned on append)
    pub id: Uuid,

    /// Owning account
    pub user_id: UserId,

    /// Signed jewel delta (positive = earn)
    pub delta: i64,

    /// Reason tag
    pub reason: EntryReason,

    /// Server-assigned timestamp; FIFO order is (created_at, id)
    pub created_at: DateTime<Utc>,

    /// Lot expiry, earn entries only. `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,

    /// Earn lot this entry draws down (expiration entries)
    pub source_lot_id: Option<Uuid>,

    /// Free-text memo (booking reference, admin note)
    #[serde(default)]
    pub note: Option<String>,
}

impl LedgerEntry {
    /// Positive entries open a new earn lot
    pub fn is_credit(&self) -> bool {
        self.delta > 0
    }

    /// FIFO sort key
    pub fn order_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Append candidate: a `LedgerEntry` without `id` and `created_at`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerEntry {
    /// Owning account
    pub user_id: UserId,
    /// Signed jewel delta
    pub delta: i64,
    /// Reason tag
    pub reason: EntryReason,
    /// Lot expiry (earn entries only)
    pub expires_at: Option<DateTime<Utc>>,
    /// Lot being drawn down (expiration entries)
    pub source_lot_id: Option<Uuid>,
    /// Free-text memo
    pub note: Option<String>,
}

impl NewLedgerEntry {
    /// Earn candidate
    pub fn credit(
        user_id: UserId,
        jewels: i64,
        reason: EntryReason,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            user_id,
            delta: jewels,
            reason,
            expires_at,
            source_lot_id: None,
            note: None,
        }
    }

    /// Redemption candidate
    pub fn redemption(user_id: UserId, jewels: i64) -> Self {
        Self {
            user_id,
            delta: -jewels,
            reason: EntryReason::Redemption,
            expires_at: None,
            source_lot_id: None,
            note: None,
        }
    }

    /// Expiration candidate closing `remaining` jewels of `lot_id`
    pub fn expiration(user_id: UserId, lot_id: Uuid, remaining: i64) -> Self {
        Self {
            user_id,
            delta: -remaining,
            reason: EntryReason::Expiration,
            expires_at: None,
            source_lot_id: Some(lot_id),
            note: None,
        }
    }

    /// Attach a memo
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Stamp with id and timestamp
    pub fn into_entry(self, id: Uuid, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id,
            user_id: self.user_id,
            delta: self.delta,
            reason: self.reason,
            created_at,
            expires_at: self.expires_at,
            source_lot_id: self.source_lot_id,
            note: self.note,
        }
    }
}

/// How long an earn lot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    /// Configured default lifetime from the entry's timestamp
    #[default]
    Default,
    /// Fixed expiry instant
    At(DateTime<Utc>),
    /// Never expires
    Never,
}

/// Earn lot derived by replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarnLot {
    /// Earn entry that opened the lot
    pub lot_id: Uuid,
    /// Earn timestamp
    pub created_at: DateTime<Utc>,
    /// Jewels granted
    pub original: i64,
    /// Jewels not yet redeemed or expired
    pub remaining: i64,
    /// Expiry, if any
    pub expires_at: Option<DateTime<Utc>>,
}

impl EarnLot {
    /// Expired at `at` (expiry is inclusive)
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= at)
    }

    /// Still has jewels
    pub fn is_open(&self) -> bool {
        self.remaining > 0
    }
}

/// One lot's contribution to a redemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotDraw {
    /// Lot drawn down
    pub lot_id: Uuid,
    /// Jewels taken from it
    pub jewels: i64,
}

/// Deterministic replay result for one user at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Account
    pub user_id: UserId,
    /// Instant the snapshot describes
    pub as_of: DateTime<Utc>,
    /// Spendable jewels
    pub active_balance: i64,
    /// Net jewels ever granted (grants minus clawbacks)
    pub lifetime_earned: i64,
    /// Jewels ever redeemed
    pub lifetime_redeemed: i64,
    /// Jewels ever expired, explicit and implicit
    pub lifetime_expired: i64,
    /// Implicitly expired jewels with no expiration entry yet
    pub unswept_expired: i64,
    /// Unexpired lots with jewels left, FIFO order
    pub open_lots: Vec<EarnLot>,
    /// Expired lots with jewels left (sweep candidates)
    pub expired_lots: Vec<EarnLot>,
    /// Entries replayed
    pub entry_count: usize,
}

impl BalanceSnapshot {
    /// Zero snapshot for a user with no history
    pub fn empty(user_id: UserId, as_of: DateTime<Utc>) -> Self {
        Self {
            user_id,
            as_of,
            active_balance: 0,
            lifetime_earned: 0,
            lifetime_redeemed: 0,
            lifetime_expired: 0,
            unswept_expired: 0,
            open_lots: Vec::new(),
            expired_lots: Vec::new(),
            entry_count: 0,
        }
    }

    /// earned == active + redeemed + expired
    pub fn is_conserved(&self) -> bool {
        self.active_balance
            .checked_add(self.lifetime_redeemed)
            .and_then(|sum| sum.checked_add(self.lifetime_expired))
            == Some(self.lifetime_earned)
    }

    /// Earliest expiry among open lots
    pub fn next_expiry_at(&self) -> Option<DateTime<Utc>> {
        self.open_lots.iter().filter_map(|lot| lot.expires_at).min()
    }

    /// Remaining jewels of a lot, open or expired
    pub fn lot_remaining(&self, lot_id: Uuid) -> Option<i64> {
        self.open_lots
            .iter()
            .chain(self.expired_lots.iter())
            .find(|lot| lot.lot_id == lot_id)
            .map(|lot| lot.remaining)
    }
}

/// Cached per-user rollup (see `projection`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoyaltySummary {
    /// Account
    pub user_id: UserId,
    /// Spendable jewels at `refreshed_at`
    pub active_balance: i64,
    /// Net jewels ever granted
    pub lifetime_earned: i64,
    /// Jewels ever redeemed
    pub lifetime_redeemed: i64,
    /// Jewels ever expired
    pub lifetime_expired: i64,
    /// Optimistic-concurrency counter, bumped on every write
    pub version: u64,
    /// Instant the figures were computed at
    pub refreshed_at: DateTime<Utc>,
    /// The summary goes stale at this instant
    pub next_expiry_at: Option<DateTime<Utc>>,
}

impl UserLoyaltySummary {
    /// earned == active + redeemed + expired
    pub fn is_conserved(&self) -> bool {
        self.active_balance
            .checked_add(self.lifetime_redeemed)
            .and_then(|sum| sum.checked_add(self.lifetime_expired))
            == Some(self.lifetime_earned)
    }

    /// Figures still describe `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.refreshed_at && self.next_expiry_at.map_or(true, |exp| now < exp)
    }
}

/// Public balance read model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable jewels
    pub active: i64,
    /// Net jewels ever granted
    pub lifetime_earned: i64,
    /// Jewels ever redeemed
    pub lifetime_redeemed: i64,
    /// Jewels ever expired
    pub lifetime_expired: i64,
    /// Instant the figures describe
    pub as_of: DateTime<Utc>,
}

impl From<&BalanceSnapshot> for Balance {
    fn from(snapshot: &BalanceSnapshot) -> Self {
        Self {
            active: snapshot.active_balance,
            lifetime_earned: snapshot.lifetime_earned,
            lifetime_redeemed: snapshot.lifetime_redeemed,
            lifetime_expired: snapshot.lifetime_expired,
            as_of: snapshot.as_of,
        }
    }
}

impl From<&UserLoyaltySummary> for Balance {
    fn from(summary: &UserLoyaltySummary) -> Self {
        Self {
            active: summary.active_balance,
            lifetime_earned: summary.lifetime_earned,
            lifetime_redeemed: summary.lifetime_redeemed,
            lifetime_expired: summary.lifetime_expired,
            as_of: summary.refreshed_at,
        }
    }
}

/// Outcome of a successful redemption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionResult {
    /// Redemption entry
    pub entry_id: Uuid,
    /// Jewels spent
    pub jewels_redeemed: i64,
    /// Currency value of the jewels
    pub discount_amount: Decimal,
    /// ISO 4217 code of `discount_amount`
    pub currency: String,
    /// Active balance after the redemption
    pub new_active_balance: i64,
    /// FIFO consumption breakdown
    pub lots_consumed: Vec<LotDraw>,
}

/// One user the sweeper could not process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFailure {
    /// Account
    pub user_id: UserId,
    /// Error text
    pub reason: String,
}

/// Sweep totals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Cut-off instant
    pub as_of: DateTime<Utc>,
    /// Expiration entries appended
    pub lots_expired: usize,
    /// Users that received at least one expiration entry
    pub users_affected: usize,
    /// Jewels expired in this sweep
    pub jewels_expired: i64,
    /// Users left for the next cycle
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    /// Empty report
    pub fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            lots_expired: 0,
            users_affected: 0,
            jewels_expired: 0,
            failures: Vec::new(),
        }
    }

    /// `Err(SweepPartialFailure)` if any user failed
    pub fn into_result(self) -> crate::Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        Err(crate::Error::SweepPartialFailure {
            failed_users: self.failures.len(),
            first_error: self.failures[0].reason.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reason_round_trip_tags() {
        for reason in [
            EntryReason::BookingReward,
            EntryReason::ManualAdjustment,
            EntryReason::Redemption,
            EntryReason::Expiration,
        ] {
            assert_eq!(EntryReason::from_str(reason.as_str()), Some(reason));
        }
        assert_eq!(EntryReason::from_str("cashback"), None);
    }

    #[test]
    fn test_reason_sign_rules() {
        assert!(EntryReason::BookingReward.allows_credit());
        assert!(!EntryReason::BookingReward.allows_debit());
        assert!(EntryReason::ManualAdjustment.allows_credit());
        assert!(EntryReason::ManualAdjustment.allows_debit());
        assert!(!EntryReason::Redemption.allows_credit());
        assert!(!EntryReason::Expiration.allows_credit());
    }

    #[test]
    fn test_lot_expiry_is_inclusive() {
        let now = Utc::now();
        let lot = EarnLot {
            lot_id: Uuid::now_v7(),
            created_at: now,
            original: 100,
            remaining: 100,
            expires_at: Some(now + Duration::days(1)),
        };
        assert!(!lot.is_expired_at(now));
        assert!(lot.is_expired_at(now + Duration::days(1)));

        let forever = EarnLot { expires_at: None, ..lot };
        assert!(!forever.is_expired_at(now + Duration::days(10_000)));
    }

    #[test]
    fn test_summary_freshness() {
        let now = Utc::now();
        let summary = UserLoyaltySummary {
            user_id: UserId::random(),
            active_balance: 50,
            lifetime_earned: 50,
            lifetime_redeemed: 0,
            lifetime_expired: 0,
            version: 1,
            refreshed_at: now,
            next_expiry_at: Some(now + Duration::hours(1)),
        };
        assert!(summary.is_fresh_at(now));
        assert!(!summary.is_fresh_at(now + Duration::hours(1)));
        assert!(!summary.is_fresh_at(now - Duration::seconds(1)));
        assert!(summary.is_conserved());

        let wrapped = UserLoyaltySummary {
            active_balance: i64::MAX,
            lifetime_redeemed: 1,
            lifetime_earned: i64::MIN,
            ..summary
        };
        assert!(!wrapped.is_conserved());
    }

    #[test]
    fn test_sweep_report_into_result() {
        let now = Utc::now();
        assert!(SweepReport::new(now).into_result().is_ok());

        let mut report = SweepReport::new(now);
        report.failures.push(SweepFailure {
            user_id: UserId::random(),
            reason: "lock timeout".to_string(),
        });
        match report.into_result() {
            Err(crate::Error::SweepPartialFailure { failed_users, .. }) => {
                assert_eq!(failed_users, 1)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
