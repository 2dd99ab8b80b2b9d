//! Outcome generator
//!
//! Outcomes are a pure function of `(server_seed, client_seed, nonce, params)`.
//! The byte stream is `HMAC-SHA256(key = server_seed, msg = "{client_seed}:{nonce}:{round}")`
//! for round = 0, 1, 2, ... Each 32-byte block is read as big-endian u32 words.
//! Bounded integers use rejection sampling, so no value is favoured by modulo
//! reduction.
//!
//! Changing any mapping below breaks every outstanding fairness proof. Bump
//! `OUTCOME_ALGORITHM_VERSION` when doing so.

use crate::games::types::{GameParams, Outcome};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const OUTCOME_ALGORITHM_VERSION: u32 = 1;

/// Dice rolls are 0..=9999 hundredths (0.00 to 99.99)
pub const DICE_RANGE: u32 = 10_000;

/// Minesweeper board is 5x5
pub const MINESWEEPER_CELLS: u8 = 25;

pub const CARD_RANKS: u8 = 13;

/// Deterministic uniform byte stream keyed by the server seed
pub struct OutcomeStream {
    server_seed: Vec<u8>,
    client_seed: String,
    nonce: u64,
    round: u64,
    block: [u8; 32],
    offset: usize,
}

impl OutcomeStream {
    pub fn new(server_seed: &str, client_seed: &str, nonce: u64) -> Self {
        let mut stream = Self {
            server_seed: server_seed.as_bytes().to_vec(),
            client_seed: client_seed.to_string(),
            nonce,
            round: 0,
            block: [0u8; 32],
            offset: 0,
        };
        stream.block = stream.compute_block(0);
        stream
    }

    fn compute_block(&self, round: u64) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.server_seed)
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{}:{}:{}", self.client_seed, self.nonce, round).as_bytes());
        mac.finalize().into_bytes().into()
    }

    pub fn next_u32(&mut self) -> u32 {
        if self.offset + 4 > self.block.len() {
            self.round += 1;
            self.block = self.compute_block(self.round);
            self.offset = 0;
        }
        let word = [
            self.block[self.offset],
            self.block[self.offset + 1],
            self.block[self.offset + 2],
            self.block[self.offset + 3],
        ];
        self.offset += 4;
        u32::from_be_bytes(word)
    }

    /// Uniform integer in `0..bound`
    pub fn next_below(&mut self, bound: u32) -> u32 {
        if bound <= 1 {
            return 0;
        }
        let bound = bound as u64;
        // Largest multiple of `bound` that fits in the u32 range
        let zone = ((u32::MAX as u64 + 1) / bound) * bound;
        loop {
            let value = self.next_u32() as u64;
            if value < zone {
                return (value % bound) as u32;
            }
        }
    }
}

/// Generate the outcome for one nonce of a session
pub fn generate(server_seed: &str, client_seed: &str, nonce: u64, params: &GameParams) -> Outcome {
    let mut stream = OutcomeStream::new(server_seed, client_seed, nonce);

    match *params {
        GameParams::Dice { .. } => Outcome::Dice {
            roll: stream.next_below(DICE_RANGE),
        },
        GameParams::Tiles { columns, .. } => Outcome::Tiles {
            index: stream.next_below(columns as u32) as u8,
        },
        GameParams::Minesweeper { mines } => Outcome::Minesweeper {
            mines: place_mines(&mut stream, mines),
        },
        GameParams::Tiles2 { columns, .. } => Outcome::Tiles2 {
            index: stream.next_below(columns as u32) as u8,
        },
        GameParams::Sequence => Outcome::Sequence {
            card: stream.next_below(CARD_RANKS as u32) as u8 + 1,
        },
    }
}

/// Partial Fisher-Yates over the 25 cells; the first `mines` slots are mines
fn place_mines(stream: &mut OutcomeStream, mines: u8) -> Vec<u8> {
    let mut cells: Vec<u8> = (0..MINESWEEPER_CELLS).collect();
    let mines = mines.min(MINESWEEPER_CELLS) as usize;

    for i in 0..mines {
        let remaining = (MINESWEEPER_CELLS as usize - i) as u32;
        let j = i + stream.next_below(remaining) as usize;
        cells.swap(i, j);
    }

    let mut placed = cells[..mines].to_vec();
    placed.sort_unstable();
    placed
}
