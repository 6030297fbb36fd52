//! Dice notation and rolling.
//!
//! Supported notation: `[count]d<sides>[kh<n>|kl<n>][+|-<modifier>]`, for
//! example `d20`, `2d6+3`, `4d6kh3`, `d100-1`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

const MAX_DICE: u32 = 100;
const MAX_SIDES: u32 = 1000;
const MAX_MODIFIER: i64 = 10_000;

/// Errors produced while parsing or rolling dice notation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("invalid dice notation '{notation}': {reason}")]
    InvalidNotation { notation: String, reason: String },
}

impl DiceError {
    fn invalid(notation: &str, reason: impl Into<String>) -> Self {
        DiceError::InvalidNotation {
            notation: notation.to_string(),
            reason: reason.into(),
        }
    }
}

/// How many times a roll is made and which result is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RollMode {
    #[default]
    Normal,
    /// Roll twice, keep the higher total.
    Advantage,
    /// Roll twice, keep the lower total.
    Disadvantage,
}

impl RollMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollMode::Normal => "normal",
            RollMode::Advantage => "advantage",
            RollMode::Disadvantage => "disadvantage",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "normal" => Some(RollMode::Normal),
            "advantage" => Some(RollMode::Advantage),
            "disadvantage" => Some(RollMode::Disadvantage),
            _ => None,
        }
    }
}

/// The structured outcome of one roll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollResult {
    pub total: i64,
    /// Every die rolled, in roll order.
    pub rolls: Vec<i64>,
    pub modifier: i64,
    pub notation: String,
}

impl RollResult {
    /// Human-readable breakdown, e.g. `2d6+3: [4, 5] + 3 = 12`.
    pub fn details(&self) -> String {
        let dice = self
            .rolls
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match self.modifier {
            0 => format!("{}: [{}] = {}", self.notation, dice, self.total),
            m if m > 0 => format!("{}: [{}] + {} = {}", self.notation, dice, m, self.total),
            m => format!("{}: [{}] - {} = {}", self.notation, dice, -m, self.total),
        }
    }
}

/// Anything that can turn notation into a roll result.
///
/// Implementations must be cheap to share between tool handlers.
pub trait DiceRoller: Send + Sync {
    fn roll(&self, notation: &str) -> Result<RollResult, DiceError>;
}

/// Which dice of a pool count towards the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    All,
    Highest(u32),
    Lowest(u32),
}

/// Parsed form of a dice expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiceExpr {
    pub count: u32,
    pub sides: u32,
    pub keep: Keep,
    pub modifier: i64,
}

impl DiceExpr {
    /// Parse dice notation. Whitespace is ignored and the `d` is case-insensitive.
    pub fn parse(notation: &str) -> Result<Self, DiceError> {
        let cleaned: String = notation
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        let (count_part, rest) = cleaned
            .split_once('d')
            .ok_or_else(|| DiceError::invalid(notation, "missing 'd'"))?;

        let count = if count_part.is_empty() {
            1
        } else {
            count_part
                .parse::<u32>()
                .map_err(|_| DiceError::invalid(notation, "dice count is not a number"))?
        };
        if count == 0 || count > MAX_DICE {
            return Err(DiceError::invalid(
                notation,
                format!("dice count must be between 1 and {MAX_DICE}"),
            ));
        }

        let (body, modifier) = match rest.find(['+', '-']) {
            Some(idx) => {
                let (body, signed) = rest.split_at(idx);
                let digits = &signed[1..];
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(DiceError::invalid(notation, "modifier is not a number"));
                }
                let value = digits
                    .parse::<i64>()
                    .ok()
                    .filter(|v| *v <= MAX_MODIFIER)
                    .ok_or_else(|| {
                        DiceError::invalid(
                            notation,
                            format!("modifier must be at most {MAX_MODIFIER}"),
                        )
                    })?;
                if signed.starts_with('-') {
                    (body, -value)
                } else {
                    (body, value)
                }
            }
            None => (rest, 0),
        };

        let (sides_part, keep) = if let Some((sides, n)) = body.split_once("kh") {
            (sides, Keep::Highest(parse_keep(notation, n, count)?))
        } else if let Some((sides, n)) = body.split_once("kl") {
            (sides, Keep::Lowest(parse_keep(notation, n, count)?))
        } else {
            (body, Keep::All)
        };

        let sides = sides_part
            .parse::<u32>()
            .map_err(|_| DiceError::invalid(notation, "die size is not a number"))?;
        if !(2..=MAX_SIDES).contains(&sides) {
            return Err(DiceError::invalid(
                notation,
                format!("die size must be between 2 and {MAX_SIDES}"),
            ));
        }

        Ok(Self {
            count,
            sides,
            keep,
            modifier,
        })
    }

    /// Evaluate the expression with the given random source.
    pub fn evaluate<R: Rng + ?Sized>(&self, rng: &mut R, notation: &str) -> RollResult {
        let rolls: Vec<i64> = (0..self.count)
            .map(|_| rng.gen_range(1..=self.sides) as i64)
            .collect();
        let kept = self.kept_sum(&rolls);

        RollResult {
            total: kept.saturating_add(self.modifier),
            rolls,
            modifier: self.modifier,
            notation: notation.trim().to_string(),
        }
    }

    fn kept_sum(&self, rolls: &[i64]) -> i64 {
        let mut sorted = rolls.to_vec();
        match self.keep {
            Keep::All => rolls.iter().sum(),
            Keep::Highest(n) => {
                sorted.sort_unstable_by(|a, b| b.cmp(a));
                sorted.iter().take(n as usize).sum()
            }
            Keep::Lowest(n) => {
                sorted.sort_unstable();
                sorted.iter().take(n as usize).sum()
            }
        }
    }
}

fn parse_keep(notation: &str, raw: &str, count: u32) -> Result<u32, DiceError> {
    let n = raw
        .parse::<u32>()
        .map_err(|_| DiceError::invalid(notation, "keep count is not a number"))?;
    if n == 0 || n > count {
        return Err(DiceError::invalid(
            notation,
            "keep count must be between 1 and the dice count",
        ));
    }
    Ok(n)
}

/// Default roller backed by a seedable RNG.
pub struct StandardRoller {
    rng: Mutex<StdRng>,
}

impl StandardRoller {
    /// Create a roller seeded from system entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a deterministic roller.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for StandardRoller {
    fn default() -> Self {
        Self::new()
    }
}

impl DiceRoller for StandardRoller {
    fn roll(&self, notation: &str) -> Result<RollResult, DiceError> {
        let expr = DiceExpr::parse(notation)?;
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(expr.evaluate(&mut *rng, notation))
    }
}

/// Roll according to `mode`, returning the kept result and, for
/// advantage/disadvantage, the discarded one.
pub fn roll_with_mode(
    roller: &dyn DiceRoller,
    notation: &str,
    mode: RollMode,
) -> Result<(RollResult, Option<RollResult>), DiceError> {
    let first = roller.roll(notation)?;
    if mode == RollMode::Normal {
        return Ok((first, None));
    }

    let second = roller.roll(notation)?;
    let first_wins = match mode {
        RollMode::Advantage => first.total >= second.total,
        _ => first.total <= second.total,
    };
    if first_wins {
        Ok((first, Some(second)))
    } else {
        Ok((second, Some(first)))
    }
}
