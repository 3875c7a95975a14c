//! Balance calculator
//!
//! Replays a user's entries in `(created_at, id)` order over a FIFO book of
//! earn lots. Everything here is pure: the same entries and `as_of` always
//! produce the same [`BalanceSnapshot`].
//!
//! # Replay rules
//!
//! - Earn entry: opens a lot `{remaining: delta, expires_at}`.
//! - Redemption or clawback at `t`: draws down the oldest lots still
//!   unexpired at `t` until the delta is covered.
//! - Expiration at `t`: draws down its `source_lot_id`, which must already be
//!   expired at `t`.
//! - At `as_of`, lots with `expires_at <= as_of` are excluded from the active
//!   balance whether or not they were swept; their remainder is reported as
//!   expired.

use crate::{
    error::{Error, Result},
    types::{BalanceSnapshot, EarnLot, EntryReason, LedgerEntry, LotDraw, UserId},
};
use chrono::{DateTime, Utc};

/// FIFO book of open earn lots for one user
#[derive(Debug, Clone)]
pub struct LotBook {
    user_id: UserId,

    /// Lots with `remaining > 0`, oldest first
    lots: Vec<EarnLot>,

    granted: i64,
    clawed_back: i64,
    redeemed: i64,
    expired: i64,

    entry_count: usize,
    last_created_at: Option<DateTime<Utc>>,
}

impl LotBook {
    /// Empty book
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            lots: Vec::new(),
            granted: 0,
            clawed_back: 0,
            redeemed: 0,
            expired: 0,
            entry_count: 0,
            last_created_at: None,
        }
    }

    /// Replay a stored history. Any entry that cannot be applied means the log
    /// itself is inconsistent.
    pub fn replay<'a, I>(user_id: UserId, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        let mut ordered: Vec<&LedgerEntry> = entries.into_iter().collect();
        ordered.sort_by_key(|entry| entry.order_key());

        let mut book = Self::new(user_id);
        for entry in ordered {
            book.apply(entry).map_err(|e| match e {
                Error::InvalidEntry(msg) => Error::InvariantViolation(format!(
                    "stored entry {} cannot be replayed: {}",
                    entry.id, msg
                )),
                other => other,
            })?;
        }
        Ok(book)
    }

    /// Apply one entry, returning the lots it drew from.
    ///
    /// Fails with `InvalidEntry` when the entry is unfunded or malformed; the
    /// book is left untouched in that case.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<Vec<LotDraw>> {
        if entry.user_id != self.user_id {
            return Err(Error::InvariantViolation(format!(
                "entry {} belongs to user {}, not {}",
                entry.id, entry.user_id, self.user_id
            )));
        }

        let draws = match (entry.delta.signum(), entry.reason) {
            (0, _) => {
                return Err(Error::InvalidEntry("delta must be non-zero".to_string()));
            }
            (1, reason) if reason.allows_credit() => {
                let granted = self.granted.checked_add(entry.delta).ok_or_else(|| {
                    Error::InvalidEntry(format!(
                        "credit of {} overflows lifetime total {}",
                        entry.delta, self.granted
                    ))
                })?;
                self.lots.push(EarnLot {
                    lot_id: entry.id,
                    created_at: entry.created_at,
                    original: entry.delta,
                    remaining: entry.delta,
                    expires_at: entry.expires_at,
                });
                self.granted = granted;
                Vec::new()
            }
            (-1, EntryReason::Expiration) => {
                let lot_id = entry.source_lot_id.ok_or_else(|| {
                    Error::InvalidEntry("expiration entry requires source_lot_id".to_string())
                })?;
                let amount = debit_amount(entry)?;
                let expired = checked_total(self.expired, amount)?;
                let draw = self.expire_lot(lot_id, amount, entry.created_at)?;
                self.expired = expired;
                vec![draw]
            }
            (-1, reason @ (EntryReason::Redemption | EntryReason::ManualAdjustment)) => {
                let amount = debit_amount(entry)?;
                let current = if reason == EntryReason::Redemption {
                    self.redeemed
                } else {
                    self.clawed_back
                };
                let updated = checked_total(current, amount)?;
                let draws = self.draw_fifo(amount, entry.created_at)?;
                if reason == EntryReason::Redemption {
                    self.redeemed = updated;
                } else {
                    self.clawed_back = updated;
                }
                draws
            }
            (_, reason) => {
                return Err(Error::InvalidEntry(format!(
                    "reason {} cannot carry delta {}",
                    reason, entry.delta
                )));
            }
        };

        self.entry_count += 1;
        self.last_created_at = Some(
            self.last_created_at
                .map_or(entry.created_at, |last| last.max(entry.created_at)),
        );
        Ok(draws)
    }

    /// Spendable jewels at `at`
    pub fn active_at(&self, at: DateTime<Utc>) -> i64 {
        sum_remaining(self.lots.iter().filter(|lot| !lot.is_expired_at(at)))
    }

    /// Open lots, oldest first (may include lots expired by now)
    pub fn lots(&self) -> &[EarnLot] {
        &self.lots
    }

    /// Timestamp of the newest applied entry
    pub fn last_created_at(&self) -> Option<DateTime<Utc>> {
        self.last_created_at
    }

    /// Project the book at `as_of`
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> BalanceSnapshot {
        let (expired_lots, open_lots): (Vec<EarnLot>, Vec<EarnLot>) = self
            .lots
            .iter()
            .cloned()
            .partition(|lot| lot.is_expired_at(as_of));

        // Bounded by `granted`, which `apply` keeps within i64
        let active_balance = sum_remaining(&open_lots);
        let unswept_expired = sum_remaining(&expired_lots);

        BalanceSnapshot {
            user_id: self.user_id,
            as_of,
            active_balance,
            lifetime_earned: self.granted.saturating_sub(self.clawed_back),
            lifetime_redeemed: self.redeemed,
            lifetime_expired: self.expired.saturating_add(unswept_expired),
            unswept_expired,
            open_lots,
            expired_lots,
            entry_count: self.entry_count,
        }
    }

    fn draw_fifo(&mut self, amount: i64, at: DateTime<Utc>) -> Result<Vec<LotDraw>> {
        let available = self.active_at(at);
        if available < amount {
            return Err(Error::InvalidEntry(format!(
                "debit of {} exceeds unexpired balance {}",
                amount, available
            )));
        }

        let mut needed = amount;
        let mut draws = Vec::new();
        for lot in self.lots.iter_mut() {
            if needed == 0 {
                break;
            }
            if lot.is_expired_at(at) {
                continue;
            }
            let take = lot.remaining.min(needed);
            lot.remaining -= take;
            needed -= take;
            draws.push(LotDraw {
                lot_id: lot.lot_id,
                jewels: take,
            });
        }
        self.lots.retain(EarnLot::is_open);

        Ok(draws)
    }

    fn expire_lot(
        &mut self,
        lot_id: uuid::Uuid,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<LotDraw> {
        let lot = self
            .lots
            .iter_mut()
            .find(|lot| lot.lot_id == lot_id)
            .ok_or_else(|| Error::InvalidEntry(format!("lot {} is not open", lot_id)))?;

        if !lot.is_expired_at(at) {
            return Err(Error::InvalidEntry(format!(
                "lot {} has not expired at {}",
                lot_id, at
            )));
        }
        if lot.remaining < amount {
            return Err(Error::InvalidEntry(format!(
                "expiration of {} exceeds lot {} remaining {}",
                amount, lot_id, lot.remaining
            )));
        }

        lot.remaining -= amount;
        self.lots.retain(EarnLot::is_open);

        Ok(LotDraw {
            lot_id,
            jewels: amount,
        })
    }
}

/// Jewels taken by a debit entry
fn debit_amount(entry: &LedgerEntry) -> Result<i64> {
    entry
        .delta
        .checked_neg()
        .ok_or_else(|| Error::InvalidEntry(format!("delta {} out of range", entry.delta)))
}

fn checked_total(total: i64, amount: i64) -> Result<i64> {
    total.checked_add(amount).ok_or_else(|| {
        Error::InvalidEntry(format!("debit of {} overflows lifetime total {}", amount, total))
    })
}

fn sum_remaining<'a, I>(lots: I) -> i64
where
    I: IntoIterator<Item = &'a EarnLot>,
{
    lots.into_iter()
        .fold(0i64, |sum, lot| sum.saturating_add(lot.remaining))
}

/// Compute a user's balance at `as_of` from their full history.
///
/// Entries created after `as_of` are ignored, so an earlier `as_of` yields
/// the balance as it stood then.
pub fn compute_balance(
    user_id: UserId,
    entries: &[LedgerEntry],
    as_of: DateTime<Utc>,
) -> Result<BalanceSnapshot> {
    let book = LotBook::replay(
        user_id,
        entries.iter().filter(|entry| entry.created_at <= as_of),
    )?;
    Ok(book.snapshot(as_of))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewLedgerEntry;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn stamp(candidate: NewLedgerEntry, at: DateTime<Utc>) -> LedgerEntry {
        candidate.into_entry(Uuid::now_v7(), at)
    }

    fn earn(user: UserId, jewels: i64, at: DateTime<Utc>, expires: Option<DateTime<Utc>>) -> LedgerEntry {
        stamp(
            NewLedgerEntry::credit(user, jewels, EntryReason::BookingReward, expires),
            at,
        )
    }

    #[test]
    fn test_empty_history() {
        let user = UserId::random();
        let snapshot = compute_balance(user, &[], day(0)).unwrap();
        assert_eq!(snapshot, BalanceSnapshot::empty(user, day(0)));
    }

    #[test]
    fn test_fifo_consumes_oldest_lot_first() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let b = earn(user, 50, day(0) + Duration::seconds(1), Some(day(20)));
        let redeem = stamp(NewLedgerEntry::redemption(user, 120), day(5));

        let snapshot = compute_balance(user, &[a.clone(), b.clone(), redeem], day(5)).unwrap();

        assert_eq!(snapshot.active_balance, 30);
        assert_eq!(snapshot.lot_remaining(a.id), None);
        assert_eq!(snapshot.lot_remaining(b.id), Some(30));
        assert_eq!(snapshot.lifetime_redeemed, 120);
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn test_apply_reports_draws() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let b = earn(user, 50, day(1), Some(day(20)));
        let mut book = LotBook::replay(user, [&a, &b]).unwrap();

        let draws = book
            .apply(&stamp(NewLedgerEntry::redemption(user, 120), day(5)))
            .unwrap();

        assert_eq!(
            draws,
            vec![
                LotDraw { lot_id: a.id, jewels: 100 },
                LotDraw { lot_id: b.id, jewels: 20 },
            ]
        );
    }

    #[test]
    fn test_expired_lot_excluded_without_sweep() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let b = earn(user, 50, day(1), Some(day(20)));

        let snapshot = compute_balance(user, &[a.clone(), b], day(10)).unwrap();

        assert_eq!(snapshot.active_balance, 50);
        assert_eq!(snapshot.unswept_expired, 100);
        assert_eq!(snapshot.lifetime_expired, 100);
        assert_eq!(snapshot.expired_lots.len(), 1);
        assert_eq!(snapshot.expired_lots[0].lot_id, a.id);
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn test_redemption_skips_expired_lots() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let b = earn(user, 150, day(1), Some(day(20)));
        let redeem = stamp(NewLedgerEntry::redemption(user, 120), day(12));

        let snapshot = compute_balance(user, &[a.clone(), b.clone(), redeem], day(12)).unwrap();

        assert_eq!(snapshot.lot_remaining(a.id), Some(100));
        assert_eq!(snapshot.lot_remaining(b.id), Some(30));
        assert_eq!(snapshot.active_balance, 30);
        assert_eq!(snapshot.lifetime_expired, 100);
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn test_explicit_expiration_closes_lot() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let expire = stamp(NewLedgerEntry::expiration(user, a.id, 100), day(11));

        let snapshot = compute_balance(user, &[a, expire], day(11)).unwrap();

        assert_eq!(snapshot.unswept_expired, 0);
        assert_eq!(snapshot.lifetime_expired, 100);
        assert!(snapshot.expired_lots.is_empty());
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn test_expiration_before_expiry_rejected() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let mut book = LotBook::replay(user, [&a]).unwrap();

        let early = stamp(NewLedgerEntry::expiration(user, a.id, 100), day(9));
        assert!(matches!(book.apply(&early), Err(Error::InvalidEntry(_))));
        assert_eq!(book.active_at(day(9)), 100);
    }

    #[test]
    fn test_double_expiration_rejected() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let first = stamp(NewLedgerEntry::expiration(user, a.id, 100), day(11));
        let mut book = LotBook::replay(user, [&a, &first]).unwrap();

        let second = stamp(NewLedgerEntry::expiration(user, a.id, 100), day(12));
        assert!(matches!(book.apply(&second), Err(Error::InvalidEntry(_))));
    }

    #[test]
    fn test_overdraft_rejected_and_book_unchanged() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), None);
        let mut book = LotBook::replay(user, [&a]).unwrap();

        let redeem = stamp(NewLedgerEntry::redemption(user, 101), day(1));
        assert!(matches!(book.apply(&redeem), Err(Error::InvalidEntry(_))));
        assert_eq!(book.active_at(day(1)), 100);
        assert_eq!(book.snapshot(day(1)).entry_count, 1);
    }

    #[test]
    fn test_clawback_reduces_lifetime_earned() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), None);
        let clawback = stamp(
            NewLedgerEntry {
                user_id: user,
                delta: -40,
                reason: EntryReason::ManualAdjustment,
                expires_at: None,
                source_lot_id: None,
                note: Some("booking cancelled".to_string()),
            },
            day(1),
        );

        let snapshot = compute_balance(user, &[a, clawback], day(1)).unwrap();
        assert_eq!(snapshot.active_balance, 60);
        assert_eq!(snapshot.lifetime_earned, 60);
        assert_eq!(snapshot.lifetime_redeemed, 0);
        assert!(snapshot.is_conserved());
    }

    #[test]
    fn test_illegal_reason_sign_rejected() {
        let user = UserId::random();
        let mut book = LotBook::new(user);

        let negative_reward = stamp(
            NewLedgerEntry::credit(user, -10, EntryReason::BookingReward, None),
            day(0),
        );
        assert!(matches!(book.apply(&negative_reward), Err(Error::InvalidEntry(_))));

        let positive_redemption = stamp(NewLedgerEntry::redemption(user, -10), day(0));
        assert!(matches!(book.apply(&positive_redemption), Err(Error::InvalidEntry(_))));
    }

    #[test]
    fn test_as_of_ignores_future_entries() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), None);
        let b = earn(user, 50, day(3), None);

        let past = compute_balance(user, &[a.clone(), b.clone()], day(1)).unwrap();
        assert_eq!(past.active_balance, 100);
        assert_eq!(past.entry_count, 1);

        let now = compute_balance(user, &[a, b], day(3)).unwrap();
        assert_eq!(now.active_balance, 150);
    }

    #[test]
    fn test_replay_is_order_independent_of_input() {
        let user = UserId::random();
        let a = earn(user, 100, day(0), Some(day(10)));
        let b = earn(user, 50, day(1), Some(day(20)));
        let redeem = stamp(NewLedgerEntry::redemption(user, 120), day(5));

        let forward = compute_balance(user, &[a.clone(), b.clone(), redeem.clone()], day(6)).unwrap();
        let shuffled = compute_balance(user, &[redeem, b, a], day(6)).unwrap();
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_out_of_range_amounts_rejected() {
        let user = UserId::random();
        let big = earn(user, i64::MAX, day(0), None);
        let mut book = LotBook::replay(user, [&big]).unwrap();

        let one_more = earn(user, 1, day(1), None);
        assert!(matches!(book.apply(&one_more), Err(Error::InvalidEntry(_))));

        let min_redemption = stamp(
            NewLedgerEntry {
                delta: i64::MIN,
                ..NewLedgerEntry::redemption(user, 1)
            },
            day(1),
        );
        assert!(matches!(book.apply(&min_redemption), Err(Error::InvalidEntry(_))));

        let snapshot = book.snapshot(day(1));
        assert_eq!(snapshot.active_balance, i64::MAX);
        assert_eq!(snapshot.lifetime_earned, i64::MAX);
        assert_eq!(snapshot.entry_count, 1);
        assert!(snapshot.is_conserved());

        // A corrupt log holding both credits fails replay instead of wrapping
        assert!(matches!(
            compute_balance(user, &[big, one_more], day(2)),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_corrupt_log_is_invariant_violation() {
        let user = UserId::random();
        let redeem = stamp(NewLedgerEntry::redemption(user, 100), day(0));
        assert!(matches!(
            compute_balance(user, &[redeem], day(1)),
            Err(Error::InvariantViolation(_))
        ));
    }
}
