//! Payout multipliers, in basis points (10_000 = 1.00x).
//!
//! Every function here is a pure function of the game parameters and the
//! revealed outcomes. Intermediate math is done in u128 and floored once per step.

use crate::games::types::{DiceDirection, Guess};

pub const BPS_SCALE: u64 = 10_000;

/// Return-to-player factor applied on every winning step
pub const RTP_BPS: u64 = 9_900;

/// Hard ceiling on any multiplier (1,000,000x)
pub const MAX_MULTIPLIER_BPS: u64 = 1_000_000 * BPS_SCALE;

/// Bounds on the dice win chance, in hundredths of a percent
pub const DICE_MIN_CHANCE: u32 = 100;
pub const DICE_MAX_CHANCE: u32 = 9_800;

/// Winning rolls out of 10_000 for a dice bet
pub fn dice_chance(target: u32, direction: DiceDirection) -> u32 {
    match direction {
        DiceDirection::Under => target,
        DiceDirection::Over => 9_999u32.saturating_sub(target),
    }
}

pub fn dice_wins(target: u32, direction: DiceDirection, roll: u32) -> bool {
    match direction {
        DiceDirection::Under => roll < target,
        DiceDirection::Over => roll > target,
    }
}

/// Multiplier for a resolved dice roll; zero on a loss
pub fn dice(target: u32, direction: DiceDirection, roll: u32) -> u64 {
    let chance = dice_chance(target, direction);
    if chance == 0 || !dice_wins(target, direction, roll) {
        return 0;
    }
    let bps = RTP_BPS as u128 * BPS_SCALE as u128 / chance as u128;
    clamp(bps)
}

/// Apply one winning step paying `numerator / denominator` fair odds
pub fn apply_step(current_bps: u64, numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return current_bps;
    }
    let factor = RTP_BPS as u128 * numerator as u128;
    let next = current_bps as u128 * factor / (denominator as u128 * BPS_SCALE as u128);
    clamp(next)
}

/// Multiplier after `safe_reveals` safe cells with `mines` mines on a 25-cell board
pub fn minesweeper(mines: u8, safe_reveals: u32) -> u64 {
    let safe = 25u64.saturating_sub(mines as u64);
    (0..safe_reveals).fold(BPS_SCALE, |bps, _| apply_step(bps, 25, safe))
}

/// TILES: one trap per row, so a row is survived with chance (columns-1)/columns
pub fn tiles(columns: u8, rows_cleared: u8) -> u64 {
    let columns = columns as u64;
    (0..rows_cleared).fold(BPS_SCALE, |bps, _| apply_step(bps, columns, columns.saturating_sub(1)))
}

/// TILES2: one safe tile per row, so a row is survived with chance 1/columns
pub fn tiles2(columns: u8, rows_cleared: u8) -> u64 {
    (0..rows_cleared).fold(BPS_SCALE, |bps, _| apply_step(bps, columns as u64, 1))
}

/// Ranks that win a hi-lo guess from `card`; equal ranks push
pub fn sequence_winning_ranks(card: u8, guess: Guess) -> u64 {
    match guess {
        Guess::Higher => 13u64.saturating_sub(card as u64),
        Guess::Lower => (card as u64).saturating_sub(1),
    }
}

/// One winning hi-lo step: fair odds over the 12 non-equal ranks
pub fn sequence_step(current_bps: u64, card: u8, guess: Guess) -> u64 {
    apply_step(current_bps, 12, sequence_winning_ranks(card, guess))
}

/// Payout for a bet at a multiplier, floored to the smallest unit
pub fn payout(bet_amount: u64, multiplier_bps: u64) -> u64 {
    let value = bet_amount as u128 * multiplier_bps as u128 / BPS_SCALE as u128;
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn clamp(bps: u128) -> u64 {
    bps.min(MAX_MULTIPLIER_BPS as u128) as u64
}
