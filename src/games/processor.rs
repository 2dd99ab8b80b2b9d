//! Game rules: validates bet parameters and applies one player action to a
//! session's state, using the outcome generator for the action's nonce.

use crate::errors::{EngineError, EngineResult};
use crate::games::multiplier::{self, DICE_MAX_CHANCE, DICE_MIN_CHANCE};
use crate::games::outcome::{self, MINESWEEPER_CELLS};
use crate::games::types::{GameAction, GameParams, Outcome, SessionMetadata};

pub const MAX_TOWER_COLUMNS: u8 = 5;
pub const MAX_TOWER_ROWS: u8 = 10;

/// How a play left the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepVerdict {
    /// Step survived; session keeps playing
    Continue,
    /// Terminal win at the returned multiplier
    Won,
    /// Terminal loss, multiplier zero
    Lost,
}

impl StepVerdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepVerdict::Continue)
    }
}

/// Result of applying one action
#[derive(Debug, Clone)]
pub struct StepResult {
    pub outcome: Outcome,
    pub metadata: SessionMetadata,
    pub multiplier_bps: u64,
    pub verdict: StepVerdict,
}

/// Per-game limits that come from configuration
#[derive(Debug, Clone, Copy)]
pub struct GameLimits {
    pub sequence_max_steps: u32,
}

impl Default for GameLimits {
    fn default() -> Self {
        Self { sequence_max_steps: 20 }
    }
}

/// Check creation parameters; failures are reported as `InvalidBet`
pub fn validate_params(params: &GameParams) -> EngineResult<()> {
    match *params {
        GameParams::Dice { target, direction } => {
            let chance = multiplier::dice_chance(target, direction);
            if !(DICE_MIN_CHANCE..=DICE_MAX_CHANCE).contains(&chance) {
                return Err(EngineError::InvalidBet(format!(
                    "dice win chance {} out of range {}..={} (target {}, {:?})",
                    chance, DICE_MIN_CHANCE, DICE_MAX_CHANCE, target, direction
                )));
            }
        }
        GameParams::Tiles { columns, rows } | GameParams::Tiles2 { columns, rows } => {
            if !(2..=MAX_TOWER_COLUMNS).contains(&columns) {
                return Err(EngineError::InvalidBet(format!(
                    "columns must be 2..={}, got {}",
                    MAX_TOWER_COLUMNS, columns
                )));
            }
            if !(1..=MAX_TOWER_ROWS).contains(&rows) {
                return Err(EngineError::InvalidBet(format!(
                    "rows must be 1..={}, got {}",
                    MAX_TOWER_ROWS, rows
                )));
            }
        }
        GameParams::Minesweeper { mines } => {
            if mines == 0 || mines >= MINESWEEPER_CELLS {
                return Err(EngineError::InvalidBet(format!(
                    "mines must be 1..={}, got {}",
                    MINESWEEPER_CELLS - 1,
                    mines
                )));
            }
        }
        GameParams::Sequence => {}
    }
    Ok(())
}

/// Opening card of a SEQUENCE session, drawn at nonce 0 during creation
pub fn opening_card(server_seed: &str, client_seed: &str) -> (Outcome, u8) {
    let outcome = outcome::generate(server_seed, client_seed, 0, &GameParams::Sequence);
    let card = match outcome {
        Outcome::Sequence { card } => card,
        _ => 1,
    };
    (outcome, card)
}

/// Apply `action` at `nonce`. Pure: nothing is written here.
pub fn play_step(
    server_seed: &str,
    client_seed: &str,
    nonce: u64,
    metadata: &SessionMetadata,
    current_bps: u64,
    action: &GameAction,
    limits: &GameLimits,
) -> EngineResult<StepResult> {
    let params = metadata.params();

    match (metadata, action) {
        (SessionMetadata::Dice(state), GameAction::Roll) => {
            let outcome = outcome::generate(server_seed, client_seed, nonce, &params);
            let Outcome::Dice { roll } = outcome else {
                return Err(mismatch(&outcome));
            };
            let bps = multiplier::dice(state.target, state.direction, roll);
            let mut next = state.clone();
            next.roll = Some(roll);
            Ok(StepResult {
                outcome,
                metadata: SessionMetadata::Dice(next),
                multiplier_bps: bps,
                verdict: if bps > 0 { StepVerdict::Won } else { StepVerdict::Lost },
            })
        }

        (SessionMetadata::Minesweeper(state), GameAction::Reveal { cell }) => {
            if *cell >= MINESWEEPER_CELLS {
                return Err(EngineError::InvalidAction(format!(
                    "cell {} is off the 5x5 board",
                    cell
                )));
            }
            if state.revealed.contains(cell) {
                return Err(EngineError::InvalidAction(format!("cell {} already revealed", cell)));
            }

            let outcome = outcome::generate(server_seed, client_seed, nonce, &params);
            let Outcome::Minesweeper { mines } = &outcome else {
                return Err(mismatch(&outcome));
            };
            let hit = mines.contains(cell);

            let mut next = state.clone();
            if hit {
                return Ok(StepResult {
                    outcome,
                    metadata: SessionMetadata::Minesweeper(next),
                    multiplier_bps: 0,
                    verdict: StepVerdict::Lost,
                });
            }

            next.revealed.push(*cell);
            let bps = multiplier::minesweeper(next.mines, next.revealed.len() as u32);
            let cleared = next.revealed.len() >= (MINESWEEPER_CELLS - next.mines) as usize;
            Ok(StepResult {
                outcome,
                metadata: SessionMetadata::Minesweeper(next),
                multiplier_bps: bps,
                verdict: if cleared { StepVerdict::Won } else { StepVerdict::Continue },
            })
        }

        (SessionMetadata::Tiles(state), GameAction::Pick { column })
        | (SessionMetadata::Tiles2(state), GameAction::Pick { column }) => {
            if *column >= state.columns {
                return Err(EngineError::InvalidAction(format!(
                    "column {} out of range 0..{}",
                    column, state.columns
                )));
            }

            let outcome = outcome::generate(server_seed, client_seed, nonce, &params);
            let (safe, one_safe) = match outcome {
                Outcome::Tiles { index } => (*column != index, false),
                Outcome::Tiles2 { index } => (*column == index, true),
                _ => return Err(mismatch(&outcome)),
            };

            let mut next = state.clone();
            next.picks.push(*column);
            let wrap = |s| {
                if one_safe {
                    SessionMetadata::Tiles2(s)
                } else {
                    SessionMetadata::Tiles(s)
                }
            };

            if !safe {
                return Ok(StepResult {
                    outcome,
                    metadata: wrap(next),
                    multiplier_bps: 0,
                    verdict: StepVerdict::Lost,
                });
            }

            next.row += 1;
            let bps = if one_safe {
                multiplier::tiles2(next.columns, next.row)
            } else {
                multiplier::tiles(next.columns, next.row)
            };
            let cleared = next.row >= next.rows;
            Ok(StepResult {
                outcome,
                metadata: wrap(next),
                multiplier_bps: bps,
                verdict: if cleared { StepVerdict::Won } else { StepVerdict::Continue },
            })
        }

        (SessionMetadata::Sequence(state), GameAction::Guess { guess }) => {
            if multiplier::sequence_winning_ranks(state.current_card, *guess) == 0 {
                return Err(EngineError::InvalidAction(format!(
                    "no card can be {:?} than {}",
                    guess, state.current_card
                )));
            }

            let outcome = outcome::generate(server_seed, client_seed, nonce, &params);
            let Outcome::Sequence { card } = outcome else {
                return Err(mismatch(&outcome));
            };

            let mut next = state.clone();
            let previous = next.current_card;
            next.history.push(card);
            next.current_card = card;

            if card == previous {
                next.pushes += 1;
                return Ok(StepResult {
                    outcome,
                    metadata: SessionMetadata::Sequence(next),
                    multiplier_bps: current_bps,
                    verdict: StepVerdict::Continue,
                });
            }

            let won = match guess {
                crate::games::types::Guess::Higher => card > previous,
                crate::games::types::Guess::Lower => card < previous,
            };
            if !won {
                return Ok(StepResult {
                    outcome,
                    metadata: SessionMetadata::Sequence(next),
                    multiplier_bps: 0,
                    verdict: StepVerdict::Lost,
                });
            }

            next.steps += 1;
            let bps = multiplier::sequence_step(current_bps, previous, *guess);
            let verdict = if next.steps >= limits.sequence_max_steps {
                StepVerdict::Won
            } else {
                StepVerdict::Continue
            };
            Ok(StepResult {
                outcome,
                metadata: SessionMetadata::Sequence(next),
                multiplier_bps: bps,
                verdict,
            })
        }

        (metadata, action) => Err(EngineError::InvalidAction(format!(
            "{:?} is not a valid action for {}",
            action,
            metadata.game_type()
        ))),
    }
}

/// Cash-out is only meaningful for multi-play games with at least one won step
pub fn check_cash_out(metadata: &SessionMetadata) -> EngineResult<()> {
    if !metadata.game_type().is_multi_play() {
        return Err(EngineError::InvalidAction(format!(
            "{} resolves on its roll and cannot be cashed out",
            metadata.game_type()
        )));
    }
    if metadata.progress() == 0 {
        return Err(EngineError::InvalidAction(
            "nothing to cash out yet; cancel the session instead".to_string(),
        ));
    }
    Ok(())
}

fn mismatch(outcome: &Outcome) -> EngineError {
    EngineError::PersistenceFailure(format!(
        "outcome {} does not match session game",
        outcome.game_type()
    ))
}
