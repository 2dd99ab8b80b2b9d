use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported game types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    Dice,
    Tiles,
    Minesweeper,
    Tiles2,
    Sequence,
}

impl GameType {
    pub fn all() -> [GameType; 5] {
        [
            GameType::Dice,
            GameType::Tiles,
            GameType::Minesweeper,
            GameType::Tiles2,
            GameType::Sequence,
        ]
    }

    /// Games that keep accepting plays until a loss, a cleared board or a cash-out
    pub fn is_multi_play(&self) -> bool {
        !matches!(self, GameType::Dice)
    }
}

impl fmt::Display for GameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameType::Dice => write!(f, "DICE"),
            GameType::Tiles => write!(f, "TILES"),
            GameType::Minesweeper => write!(f, "MINESWEEPER"),
            GameType::Tiles2 => write!(f, "TILES2"),
            GameType::Sequence => write!(f, "SEQUENCE"),
        }
    }
}

/// Which side of the target a dice roll must land on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiceDirection {
    Under,
    Over,
}

/// Hi-lo guess for the next card in a sequence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Guess {
    Higher,
    Lower,
}

/// Bet parameters fixed at session creation.
///
/// Together with the seed pair and nonce these fully determine every outcome
/// and multiplier of the session, so they are returned by verification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameParams {
    /// `target` is in hundredths (5000 = 50.00)
    Dice { target: u32, direction: DiceDirection },
    /// One trap tile per row
    Tiles { columns: u8, rows: u8 },
    Minesweeper { mines: u8 },
    /// One safe tile per row
    Tiles2 { columns: u8, rows: u8 },
    Sequence,
}

impl GameParams {
    pub fn game_type(&self) -> GameType {
        match self {
            GameParams::Dice { .. } => GameType::Dice,
            GameParams::Tiles { .. } => GameType::Tiles,
            GameParams::Minesweeper { .. } => GameType::Minesweeper,
            GameParams::Tiles2 { .. } => GameType::Tiles2,
            GameParams::Sequence => GameType::Sequence,
        }
    }

    /// Parameters used when a create request names only the game type
    pub fn default_for(game_type: GameType) -> Self {
        match game_type {
            GameType::Dice => GameParams::Dice {
                target: 5_000,
                direction: DiceDirection::Under,
            },
            GameType::Tiles => GameParams::Tiles { columns: 3, rows: 8 },
            GameType::Minesweeper => GameParams::Minesweeper { mines: 3 },
            GameType::Tiles2 => GameParams::Tiles2 { columns: 3, rows: 8 },
            GameType::Sequence => GameParams::Sequence,
        }
    }
}

/// Player action submitted to `play`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GameAction {
    Roll,
    Reveal { cell: u8 },
    Pick { column: u8 },
    Guess { guess: Guess },
}

/// Raw outcome produced by the outcome generator for one nonce
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Roll in hundredths, 0..=9999
    Dice { roll: u32 },
    /// Hidden tile index of the current row (the trap)
    Tiles { index: u8 },
    /// Sorted mine cells of a 5x5 board
    Minesweeper { mines: Vec<u8> },
    /// Hidden tile index of the current row (the only safe tile)
    Tiles2 { index: u8 },
    /// Card rank, 1..=13
    Sequence { card: u8 },
}

impl Outcome {
    pub fn game_type(&self) -> GameType {
        match self {
            Outcome::Dice { .. } => GameType::Dice,
            Outcome::Tiles { .. } => GameType::Tiles,
            Outcome::Minesweeper { .. } => GameType::Minesweeper,
            Outcome::Tiles2 { .. } => GameType::Tiles2,
            Outcome::Sequence { .. } => GameType::Sequence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiceState {
    pub target: u32,
    pub direction: DiceDirection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<u32>,
}

/// Shared by TILES and TILES2
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TowerState {
    pub columns: u8,
    pub rows: u8,
    /// Rows cleared so far
    pub row: u8,
    pub picks: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinesweeperState {
    pub mines: u8,
    pub revealed: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceState {
    pub current_card: u8,
    pub steps: u32,
    pub pushes: u32,
    pub history: Vec<u8>,
}

/// Game-specific session state (discriminated union)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "game", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMetadata {
    Dice(DiceState),
    Tiles(TowerState),
    Minesweeper(MinesweeperState),
    Tiles2(TowerState),
    Sequence(SequenceState),
}

impl SessionMetadata {
    /// Fresh state for a new session. SEQUENCE needs its opening card.
    pub fn initial(params: &GameParams, opening_card: Option<u8>) -> Self {
        match *params {
            GameParams::Dice { target, direction } => SessionMetadata::Dice(DiceState {
                target,
                direction,
                roll: None,
            }),
            GameParams::Tiles { columns, rows } => SessionMetadata::Tiles(TowerState {
                columns,
                rows,
                row: 0,
                picks: Vec::new(),
            }),
            GameParams::Minesweeper { mines } => SessionMetadata::Minesweeper(MinesweeperState {
                mines,
                revealed: Vec::new(),
            }),
            GameParams::Tiles2 { columns, rows } => SessionMetadata::Tiles2(TowerState {
                columns,
                rows,
                row: 0,
                picks: Vec::new(),
            }),
            GameParams::Sequence => {
                let card = opening_card.unwrap_or(1);
                SessionMetadata::Sequence(SequenceState {
                    current_card: card,
                    steps: 0,
                    pushes: 0,
                    history: vec![card],
                })
            }
        }
    }

    pub fn game_type(&self) -> GameType {
        match self {
            SessionMetadata::Dice(_) => GameType::Dice,
            SessionMetadata::Tiles(_) => GameType::Tiles,
            SessionMetadata::Minesweeper(_) => GameType::Minesweeper,
            SessionMetadata::Tiles2(_) => GameType::Tiles2,
            SessionMetadata::Sequence(_) => GameType::Sequence,
        }
    }

    /// Recover the creation parameters from the state
    pub fn params(&self) -> GameParams {
        match self {
            SessionMetadata::Dice(s) => GameParams::Dice {
                target: s.target,
                direction: s.direction,
            },
            SessionMetadata::Tiles(s) => GameParams::Tiles {
                columns: s.columns,
                rows: s.rows,
            },
            SessionMetadata::Minesweeper(s) => GameParams::Minesweeper { mines: s.mines },
            SessionMetadata::Tiles2(s) => GameParams::Tiles2 {
                columns: s.columns,
                rows: s.rows,
            },
            SessionMetadata::Sequence(_) => GameParams::Sequence,
        }
    }

    /// Number of winning steps taken; zero means there is nothing to cash out
    pub fn progress(&self) -> u32 {
        match self {
            SessionMetadata::Dice(_) => 0,
            SessionMetadata::Tiles(s) | SessionMetadata::Tiles2(s) => s.row as u32,
            SessionMetadata::Minesweeper(s) => s.revealed.len() as u32,
            SessionMetadata::Sequence(s) => s.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_game_type_wire_names() {
        assert_eq!(serde_json::to_string(&GameType::Tiles2).unwrap(), "\"TILES2\"");
        assert_eq!(serde_json::to_string(&GameType::Minesweeper).unwrap(), "\"MINESWEEPER\"");
        let parsed: GameType = serde_json::from_str("\"SEQUENCE\"").unwrap();
        assert_eq!(parsed, GameType::Sequence);
        assert_eq!(GameType::Dice.to_string(), "DICE");
    }

    #[test]
    fn test_params_tagging() {
        let json = r#"{"game":"DICE","target":5000,"direction":"under"}"#;
        let params: GameParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.game_type(), GameType::Dice);

        let json = r#"{"game":"SEQUENCE"}"#;
        let params: GameParams = serde_json::from_str(json).unwrap();
        assert_eq!(params, GameParams::Sequence);
    }

    #[test]
    fn test_action_tagging() {
        let action: GameAction = serde_json::from_str(r#"{"action":"reveal","cell":7}"#).unwrap();
        assert_eq!(action, GameAction::Reveal { cell: 7 });
        let action: GameAction = serde_json::from_str(r#"{"action":"guess","guess":"higher"}"#).unwrap();
        assert_eq!(action, GameAction::Guess { guess: Guess::Higher });
    }

    #[test]
    fn test_metadata_keeps_params() {
        for game_type in GameType::all() {
            let params = GameParams::default_for(game_type);
            let metadata = SessionMetadata::initial(&params, Some(7));
            assert_eq!(metadata.game_type(), game_type);
            assert_eq!(metadata.params(), params);
            assert_eq!(metadata.progress(), 0);
        }
    }

    #[test]
    fn test_metadata_is_tagged_by_game() {
        let metadata = SessionMetadata::initial(&GameParams::Minesweeper { mines: 5 }, None);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["game"], "MINESWEEPER");
        assert_eq!(value["mines"], 5);
        let back: SessionMetadata = serde_json::from_value(value).unwrap();
        assert_eq!(back, metadata);
    }
}
