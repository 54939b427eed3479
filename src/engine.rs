use std::fmt;
use std::str::FromStr;

use axum::http::StatusCode;

use crate::error::ApiError;

// Challenge lifecycle.
pub(crate) const CHALLENGE_OPEN: &str = "open";
pub(crate) const CHALLENGE_SETTLED: &str = "settled";
pub(crate) const CHALLENGE_EXPIRED: &str = "expired";

// Queue entry lifecycle.
pub(crate) const ENTRY_WAITING: &str = "waiting";
pub(crate) const ENTRY_MATCHED: &str = "matched";
pub(crate) const ENTRY_CANCELLED: &str = "cancelled";
pub(crate) const ENTRY_REFUNDED: &str = "refunded";

// Payout job / entry lifecycle.
pub(crate) const JOB_QUEUED: &str = "queued";
pub(crate) const JOB_RUNNING: &str = "running";
pub(crate) const JOB_COMPLETED: &str = "completed";
pub(crate) const JOB_FAILED: &str = "failed";
pub(crate) const PAYOUT_PENDING: &str = "pending";
pub(crate) const PAYOUT_COMPLETED: &str = "completed";
pub(crate) const PAYOUT_FAILED: &str = "failed";

// Wallet transaction types.
pub(crate) const TX_STAKE_HOLD: &str = "stake_hold";
pub(crate) const TX_QUEUE_CANCEL_REFUND: &str = "queue_cancel_refund";
pub(crate) const TX_EXPIRED_REFUND: &str = "challenge_expired_refund";
pub(crate) const TX_DRAW_REFUND: &str = "draw_refund";
pub(crate) const TX_CHALLENGE_PAYOUT: &str = "challenge_payout";
pub(crate) const TX_DEV_TOPUP: &str = "dev_topup";

// Partner wallet transaction types.
pub(crate) const PTX_SETTLEMENT_CREDIT: &str = "settlement_credit";
pub(crate) const PTX_WITHDRAWAL_DEBIT: &str = "withdrawal_debit";

// Withdrawal lifecycle.
pub(crate) const WD_PENDING: &str = "pending";
pub(crate) const WD_APPROVED: &str = "approved";
pub(crate) const WD_REJECTED: &str = "rejected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Yes,
    No,
}

impl Side {
    pub(crate) fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            other => Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("invalid side: {other}"),
            )),
        }
    }
}

/// Settlement outcome. `Draw` refunds all matched stakes; a winning side
/// produces a payout job for that side's matched entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Winner(Side),
    Draw,
}

impl Outcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Outcome::Winner(s) => s.as_str(),
            Outcome::Draw => "draw",
        }
    }
}

impl FromStr for Outcome {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draw" => Ok(Outcome::Draw),
            other => Ok(Outcome::Winner(other.parse()?)),
        }
    }
}

/// Repeat settle calls must carry the result that was recorded the first
/// time; a conflicting result is rejected rather than echoed back.
pub(crate) fn check_recorded_result(
    stored: Option<&str>,
    requested: Outcome,
) -> Result<Outcome, ApiError> {
    let stored = stored.ok_or_else(|| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "settled challenge has no recorded result",
        )
    })?;
    let recorded: Outcome = stored.parse()?;
    if recorded != requested {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Challenge already settled with a different result",
        ));
    }
    Ok(recorded)
}

/// True when a queue entry's stake belongs to the settled pool. Matched
/// entries count, and so do refunded entries that were matched before a
/// draw; an expiry refund of a still-waiting entry does not.
pub(crate) fn stake_in_matched_pool(status: &str, was_matched: bool) -> bool {
    status == ENTRY_MATCHED || (status == ENTRY_REFUNDED && was_matched)
}

/// A matched queue entry as settlement sees it, in FCFS match order.
#[derive(Debug, Clone)]
pub(crate) struct MatchedStake {
    pub(crate) entry_id: i64,
    pub(crate) user_id: i64,
    pub(crate) side: Side,
    pub(crate) stake_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WinnerPayout {
    pub(crate) entry_id: i64,
    pub(crate) user_id: i64,
    pub(crate) amount: i64,
}

/// Filter matched entries down to the winning side and pair each with its
/// share of the winner pool. Input order is preserved, so the first winner
/// in match order receives the split remainder.
pub(crate) fn derive_winner_payouts(
    matched: &[MatchedStake],
    winning_side: Side,
    winner_pool: i64,
) -> Vec<WinnerPayout> {
    let winners: Vec<&MatchedStake> = matched.iter().filter(|m| m.side == winning_side).collect();
    let amounts = winner_amounts(winner_pool, winners.len());
    winners
        .iter()
        .zip(amounts)
        .map(|(w, amount)| WinnerPayout {
            entry_id: w.entry_id,
            user_id: w.user_id,
            amount,
        })
        .collect()
}

/// Platform cut of the matched pool, rounded down. Widens through i128 so
/// pool * bps cannot overflow.
pub(crate) fn platform_fee_minor(total_pool: i64, fee_bps: i64) -> i64 {
    if total_pool <= 0 || fee_bps <= 0 {
        return 0;
    }
    ((total_pool as i128 * fee_bps as i128) / 10_000) as i64
}

/// Partner share of an already-computed platform fee, rounded down.
pub(crate) fn partner_fee_minor(platform_fee: i64, share_bps: i64) -> i64 {
    if platform_fee <= 0 || share_bps <= 0 {
        return 0;
    }
    ((platform_fee as i128 * share_bps as i128) / 10_000) as i64
}

/// Even split of the winner pool. Returns (base share, remainder); the
/// remainder goes entirely to the first winner in FCFS order.
pub(crate) fn split_winner_pool(winner_pool: i64, winners: usize) -> Option<(i64, i64)> {
    if winners == 0 || winner_pool < 0 {
        return None;
    }
    let n = winners as i64;
    Some((winner_pool / n, winner_pool % n))
}

/// Per-winner payout amounts in FCFS order.
pub(crate) fn winner_amounts(winner_pool: i64, winners: usize) -> Vec<i64> {
    let Some((share, remainder)) = split_winner_pool(winner_pool, winners) else {
        return Vec::new();
    };
    let mut out = vec![share; winners];
    if let Some(first) = out.first_mut() {
        *first += remainder;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_is_five_percent_floored() {
        assert_eq!(platform_fee_minor(2000, 500), 100);
        assert_eq!(platform_fee_minor(1999, 500), 99);
        assert_eq!(platform_fee_minor(0, 500), 0);
        assert_eq!(platform_fee_minor(19, 500), 0);
    }

    #[test]
    fn fee_survives_large_pools() {
        let pool = i64::MAX / 2;
        let fee = platform_fee_minor(pool, 500);
        assert_eq!(fee, ((pool as i128 * 500) / 10_000) as i64);
    }

    #[test]
    fn partner_share_floors() {
        // 30% of a 100-unit platform fee.
        assert_eq!(partner_fee_minor(100, 3000), 30);
        assert_eq!(partner_fee_minor(101, 3000), 30);
        assert_eq!(partner_fee_minor(0, 3000), 0);
    }

    #[test]
    fn remainder_goes_to_first_winner() {
        let amounts = winner_amounts(1900, 3);
        assert_eq!(amounts, vec![634, 633, 633]);
        assert_eq!(amounts.iter().sum::<i64>(), 1900);
    }

    #[test]
    fn even_split_has_no_remainder() {
        let amounts = winner_amounts(1900, 2);
        assert_eq!(amounts, vec![950, 950]);
    }

    #[test]
    fn split_rejects_zero_winners() {
        assert!(split_winner_pool(1900, 0).is_none());
        assert!(winner_amounts(1900, 0).is_empty());
    }

    #[test]
    fn two_player_pool_example() {
        // Two stakes of 1000 each: pool 2000, fee 100, winner takes 1900.
        let pool = 2000;
        let fee = platform_fee_minor(pool, 500);
        assert_eq!(fee, 100);
        assert_eq!(winner_amounts(pool - fee, 1), vec![1900]);
    }

    #[test]
    fn expiry_refunds_stay_out_of_pool() {
        // Matched pair plus a waiting entry refunded when the challenge
        // expired: the pool is the two matched stakes only.
        let entries = [
            (ENTRY_MATCHED, true, 1000i64),
            (ENTRY_MATCHED, true, 1000),
            (ENTRY_REFUNDED, false, 1000),
        ];
        let pool: i64 = entries
            .iter()
            .filter(|(status, was_matched, _)| stake_in_matched_pool(status, *was_matched))
            .map(|(_, _, stake)| stake)
            .sum();
        assert_eq!(pool, 2000);
        assert_eq!(platform_fee_minor(pool, 500), 100);
    }

    #[test]
    fn draw_refunds_stay_in_pool() {
        assert!(stake_in_matched_pool(ENTRY_REFUNDED, true));
        assert!(stake_in_matched_pool(ENTRY_MATCHED, true));
        assert!(!stake_in_matched_pool(ENTRY_REFUNDED, false));
        assert!(!stake_in_matched_pool(ENTRY_CANCELLED, false));
    }

    #[test]
    fn winner_payouts_follow_match_order() {
        let matched = vec![
            MatchedStake { entry_id: 1, user_id: 10, side: Side::Yes, stake_amount: 1000 },
            MatchedStake { entry_id: 2, user_id: 20, side: Side::No, stake_amount: 1000 },
            MatchedStake { entry_id: 3, user_id: 30, side: Side::Yes, stake_amount: 1000 },
            MatchedStake { entry_id: 4, user_id: 40, side: Side::No, stake_amount: 1000 },
        ];
        let payouts = derive_winner_payouts(&matched, Side::Yes, 3800);
        assert_eq!(
            payouts,
            vec![
                WinnerPayout { entry_id: 1, user_id: 10, amount: 1900 },
                WinnerPayout { entry_id: 3, user_id: 30, amount: 1900 },
            ]
        );
    }

    #[test]
    fn first_winner_in_match_order_takes_remainder() {
        let matched = vec![
            MatchedStake { entry_id: 5, user_id: 50, side: Side::No, stake_amount: 1000 },
            MatchedStake { entry_id: 6, user_id: 60, side: Side::No, stake_amount: 1000 },
            MatchedStake { entry_id: 7, user_id: 70, side: Side::Yes, stake_amount: 1000 },
            MatchedStake { entry_id: 8, user_id: 80, side: Side::No, stake_amount: 1000 },
        ];
        let payouts = derive_winner_payouts(&matched, Side::No, 1900);
        assert_eq!(payouts.iter().map(|p| p.amount).collect::<Vec<_>>(), vec![634, 633, 633]);
        assert_eq!(payouts[0].user_id, 50);
        assert_eq!(payouts.iter().map(|p| p.amount).sum::<i64>(), 1900);
    }

    #[test]
    fn losing_side_gets_no_payout() {
        let matched = vec![MatchedStake {
            entry_id: 1,
            user_id: 10,
            side: Side::No,
            stake_amount: 1000,
        }];
        assert!(derive_winner_payouts(&matched, Side::Yes, 950).is_empty());
    }

    #[test]
    fn repeat_settle_must_match_recorded_result() {
        let ok = check_recorded_result(Some("yes"), Outcome::Winner(Side::Yes)).unwrap();
        assert_eq!(ok, Outcome::Winner(Side::Yes));

        let conflict = check_recorded_result(Some("no"), Outcome::Winner(Side::Yes)).unwrap_err();
        assert_eq!(conflict.status, StatusCode::CONFLICT);

        let draw_conflict = check_recorded_result(Some("draw"), Outcome::Winner(Side::No)).unwrap_err();
        assert_eq!(draw_conflict.status, StatusCode::CONFLICT);

        assert!(check_recorded_result(None, Outcome::Draw).is_err());
    }

    #[test]
    fn side_parsing_round_trips() {
        assert_eq!("yes".parse::<Side>().unwrap(), Side::Yes);
        assert_eq!(" NO ".parse::<Side>().unwrap(), Side::No);
        assert_eq!(Side::Yes.opposite(), Side::No);
        assert!("maybe".parse::<Side>().is_err());
    }

    #[test]
    fn outcome_parsing() {
        assert_eq!("draw".parse::<Outcome>().unwrap(), Outcome::Draw);
        assert_eq!("yes".parse::<Outcome>().unwrap(), Outcome::Winner(Side::Yes));
        assert!("tie".parse::<Outcome>().is_err());
    }
}
