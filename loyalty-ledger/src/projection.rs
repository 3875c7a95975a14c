//! Summary projection
//!
//! [`UserLoyaltySummary`] is a cache of the balance calculator's output. It
//! is rebuilt from a [`BalanceSnapshot`] inside every mutating critical
//! section and can always be reproduced by replaying the log.

use crate::{
    error::{Error, Result},
    types::{BalanceSnapshot, UserLoyaltySummary},
};

/// Build the next summary version from a fresh snapshot
pub fn project(snapshot: &BalanceSnapshot, previous: Option<&UserLoyaltySummary>) -> UserLoyaltySummary {
    UserLoyaltySummary {
        user_id: snapshot.user_id,
        active_balance: snapshot.active_balance,
        lifetime_earned: snapshot.lifetime_earned,
        lifetime_redeemed: snapshot.lifetime_redeemed,
        lifetime_expired: snapshot.lifetime_expired,
        version: previous.map_or(1, |summary| summary.version + 1),
        refreshed_at: snapshot.as_of,
        next_expiry_at: snapshot.next_expiry_at(),
    }
}

/// Compare a stored summary against a replay at its `refreshed_at`
pub fn verify(summary: &UserLoyaltySummary, replayed: &BalanceSnapshot) -> Result<()> {
    if !summary.is_conserved() {
        return Err(Error::InvariantViolation(format!(
            "summary for {} breaks conservation: earned {} != active {} + redeemed {} + expired {}",
            summary.user_id,
            summary.lifetime_earned,
            summary.active_balance,
            summary.lifetime_redeemed,
            summary.lifetime_expired
        )));
    }

    let expected = project(replayed, None);
    let diverged = summary.user_id != expected.user_id
        || summary.active_balance != expected.active_balance
        || summary.lifetime_earned != expected.lifetime_earned
        || summary.lifetime_redeemed != expected.lifetime_redeemed
        || summary.lifetime_expired != expected.lifetime_expired
        || summary.next_expiry_at != expected.next_expiry_at;

    if diverged {
        return Err(Error::InvariantViolation(format!(
            "summary for {} (v{}) diverges from replay: stored {:?}, replayed {:?}",
            summary.user_id, summary.version, summary, expected
        )));
    }

    Ok(())
}
