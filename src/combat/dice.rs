//! Dice rolling engine
//!
//! Parses and rolls dice notation like "2d6+3", "4d6kh3", "2d20kl1".
//! Advantage and disadvantage are keep-highest/keep-lowest over two d20s.

use std::fmt;
use std::str::FromStr;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of entries in a single batch roll
pub const MAX_BATCH_ROLLS: usize = 20;
/// Maximum dice in one expression
pub const MAX_DICE: u32 = 100;
/// Maximum sides on one die
pub const MAX_SIDES: u32 = 1000;
/// Maximum absolute flat modifier
pub const MAX_MODIFIER: i32 = 10_000;

/// Dice parsing and rolling errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiceError {
    #[error("invalid dice notation '{notation}': unexpected {token}")]
    Parse { notation: String, token: String },

    #[error("invalid dice notation '{notation}': {reason}")]
    OutOfRange { notation: String, reason: String },

    #[error("cannot roll with both advantage and disadvantage")]
    ConflictingVantage,

    #[error("batch roll requires at least one entry")]
    EmptyBatch,

    #[error("too many rolls in batch ({count} > {max})")]
    TooManyRolls { count: usize, max: usize },
}

/// Keep clause of an expression (`kh3`, `kl1`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keep {
    Highest(u32),
    Lowest(u32),
}

impl Keep {
    fn count(&self) -> u32 {
        match self {
            Keep::Highest(n) | Keep::Lowest(n) => *n,
        }
    }
}

/// Advantage state for a d20 roll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vantage {
    #[default]
    Normal,
    Advantage,
    Disadvantage,
}

impl Vantage {
    /// Build from a pair of request flags; both at once is a configuration error
    pub fn from_flags(advantage: bool, disadvantage: bool) -> Result<Self, DiceError> {
        match (advantage, disadvantage) {
            (true, true) => Err(DiceError::ConflictingVantage),
            (true, false) => Ok(Vantage::Advantage),
            (false, true) => Ok(Vantage::Disadvantage),
            (false, false) => Ok(Vantage::Normal),
        }
    }

    /// Resolve several sources: any advantage together with any
    /// disadvantage cancels out, no matter how many of each
    pub fn resolve(sources: impl IntoIterator<Item = Vantage>) -> Vantage {
        let (mut advantage, mut disadvantage) = (false, false);
        for source in sources {
            match source {
                Vantage::Advantage => advantage = true,
                Vantage::Disadvantage => disadvantage = true,
                Vantage::Normal => {}
            }
        }
        match (advantage, disadvantage) {
            (true, false) => Vantage::Advantage,
            (false, true) => Vantage::Disadvantage,
            _ => Vantage::Normal,
        }
    }
}

/// A parsed dice expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceExpression {
    /// Number of dice to roll
    pub count: u32,
    /// Number of sides per die
    pub sides: u32,
    /// Flat modifier added after keeping
    pub modifier: i32,
    /// Optional keep-highest/keep-lowest clause
    pub keep: Option<Keep>,
}

impl DiceExpression {
    /// Create an expression without a keep clause
    pub fn new(count: u32, sides: u32, modifier: i32) -> Self {
        Self {
            count,
            sides,
            modifier,
            keep: None,
        }
    }

    /// A plain d20 with a modifier
    pub fn d20(modifier: i32) -> Self {
        Self::new(1, 20, modifier)
    }

    /// Parse dice notation
    pub fn parse(notation: &str) -> Result<Self, DiceError> {
        let normalized = notation.trim().to_lowercase();
        let mut parser = Parser {
            notation,
            tokens: tokenize(&normalized),
            pos: 0,
        };
        let expr = parser.expression()?;
        expr.validate(notation)?;
        Ok(expr)
    }

    fn validate(&self, notation: &str) -> Result<(), DiceError> {
        let out_of_range = |reason: String| DiceError::OutOfRange {
            notation: notation.to_string(),
            reason,
        };

        if self.count == 0 || self.count > MAX_DICE {
            return Err(out_of_range(format!(
                "dice count must be between 1 and {}",
                MAX_DICE
            )));
        }
        if self.sides < 2 || self.sides > MAX_SIDES {
            return Err(out_of_range(format!(
                "die sides must be between 2 and {}",
                MAX_SIDES
            )));
        }
        if self.modifier.unsigned_abs() > MAX_MODIFIER.unsigned_abs() {
            return Err(out_of_range(format!(
                "modifier must be within ±{}",
                MAX_MODIFIER
            )));
        }
        if let Some(keep) = self.keep {
            if keep.count() == 0 || keep.count() > self.count {
                return Err(out_of_range(format!(
                    "keep count must be between 1 and {}",
                    self.count
                )));
            }
        }
        Ok(())
    }

    /// Rewrite a single d20 into the two-dice advantage/disadvantage form
    ///
    /// `1d20+5` with advantage becomes `2d20kh1+5`. Expressions that are not a
    /// single unkept d20 are returned unchanged.
    pub fn with_vantage(self, vantage: Vantage) -> Self {
        if self.count != 1 || self.sides != 20 || self.keep.is_some() {
            return self;
        }
        match vantage {
            Vantage::Normal => self,
            Vantage::Advantage => Self {
                count: 2,
                keep: Some(Keep::Highest(1)),
                ..self
            },
            Vantage::Disadvantage => Self {
                count: 2,
                keep: Some(Keep::Lowest(1)),
                ..self
            },
        }
    }

    /// Same expression with the dice count doubled (critical damage)
    pub fn doubled_dice(self) -> Self {
        Self {
            count: self.count.saturating_mul(2),
            keep: self.keep.map(|k| match k {
                Keep::Highest(n) => Keep::Highest(n * 2),
                Keep::Lowest(n) => Keep::Lowest(n * 2),
            }),
            ..self
        }
    }

    fn kept_count(&self) -> u32 {
        self.keep.map_or(self.count, |k| k.count())
    }

    /// Minimum possible total
    pub fn min(&self) -> i32 {
        self.kept_count() as i32 + self.modifier
    }

    /// Maximum possible total
    pub fn max(&self) -> i32 {
        (self.kept_count() * self.sides) as i32 + self.modifier
    }
}

impl FromStr for DiceExpression {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DiceExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d{}", self.count, self.sides)?;
        match self.keep {
            Some(Keep::Highest(n)) => write!(f, "kh{}", n)?,
            Some(Keep::Lowest(n)) => write!(f, "kl{}", n)?,
            None => {}
        }
        if self.modifier > 0 {
            write!(f, "+{}", self.modifier)
        } else if self.modifier < 0 {
            write!(f, "{}", self.modifier)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(String),
    D,
    Plus,
    Minus,
    KeepHighest,
    KeepLowest,
    Unknown(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "'{}'", n),
            Token::D => write!(f, "'d'"),
            Token::Plus => write!(f, "'+'"),
            Token::Minus => write!(f, "'-'"),
            Token::KeepHighest => write!(f, "'kh'"),
            Token::KeepLowest => write!(f, "'kl'"),
            Token::Unknown(c) => write!(f, "'{}'", c),
        }
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        let token = match c {
            '0'..='9' => {
                let mut digits = String::from(c);
                while let Some(next) = chars.next_if(|n| n.is_ascii_digit()) {
                    digits.push(next);
                }
                Token::Number(digits)
            }
            'd' => Token::D,
            '+' => Token::Plus,
            '-' => Token::Minus,
            'k' => match chars.peek() {
                Some('h') => {
                    chars.next();
                    Token::KeepHighest
                }
                Some('l') => {
                    chars.next();
                    Token::KeepLowest
                }
                _ => Token::Unknown('k'),
            },
            c if c.is_whitespace() => continue,
            other => Token::Unknown(other),
        };
        tokens.push(token);
    }

    tokens
}

struct Parser<'a> {
    notation: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn unexpected(&self, token: Option<&Token>) -> DiceError {
        DiceError::Parse {
            notation: self.notation.to_string(),
            token: token.map_or_else(|| "end of input".to_string(), |t| t.to_string()),
        }
    }

    fn number(&mut self) -> Result<u32, DiceError> {
        match self.advance() {
            Some(Token::Number(digits)) => digits.parse().map_err(|_| DiceError::OutOfRange {
                notation: self.notation.to_string(),
                reason: format!("number '{}' is too large", digits),
            }),
            other => Err(self.unexpected(other.as_ref())),
        }
    }

    fn expression(&mut self) -> Result<DiceExpression, DiceError> {
        let count = match self.peek() {
            Some(Token::Number(_)) => self.number()?,
            _ => 1,
        };

        match self.advance() {
            Some(Token::D) => {}
            other => return Err(self.unexpected(other.as_ref())),
        }

        let sides = self.number()?;
        let mut modifier: Option<i32> = None;
        let mut keep: Option<Keep> = None;

        while let Some(token) = self.advance() {
            match token {
                Token::Plus | Token::Minus if modifier.is_none() => {
                    let value = self.number()?;
                    let value = i32::try_from(value).map_err(|_| DiceError::OutOfRange {
                        notation: self.notation.to_string(),
                        reason: format!("modifier {} is too large", value),
                    })?;
                    modifier = Some(if token == Token::Minus { -value } else { value });
                }
                Token::KeepHighest if keep.is_none() => keep = Some(Keep::Highest(self.number()?)),
                Token::KeepLowest if keep.is_none() => keep = Some(Keep::Lowest(self.number()?)),
                other => return Err(self.unexpected(Some(&other))),
            }
        }

        Ok(DiceExpression {
            count,
            sides,
            modifier: modifier.unwrap_or(0),
            keep,
        })
    }
}

/// The evaluated outcome of one expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollResult {
    /// Canonical notation that was rolled
    pub expression: String,
    /// Every die in roll order
    pub rolls: Vec<u32>,
    /// The dice that counted, in roll order
    pub kept: Vec<u32>,
    pub modifier: i32,
    pub total: i32,
}

impl RollResult {
    /// The single kept die, for d20 tests
    pub fn natural(&self) -> Option<u32> {
        match self.kept.as_slice() {
            [single] => Some(*single),
            _ => None,
        }
    }
}

/// Where dice values come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RollSource {
    /// Fresh seed from the thread RNG
    #[default]
    Entropy,
    /// Reproducible stream from a fixed seed
    Seeded { seed: u64 },
    /// Every die shows this value (clamped to the die)
    Forced { value: u32 },
}

/// Rolls dice from a pluggable source
#[derive(Debug, Clone)]
pub struct DiceRoller {
    rng: ChaCha8Rng,
    forced: Option<u32>,
}

impl Default for DiceRoller {
    fn default() -> Self {
        Self::new(RollSource::Entropy)
    }
}

impl DiceRoller {
    /// Create a roller for the given source
    pub fn new(source: RollSource) -> Self {
        match source {
            RollSource::Entropy => Self {
                rng: ChaCha8Rng::from_rng(&mut rand::rng()),
                forced: None,
            },
            RollSource::Seeded { seed } => Self {
                rng: ChaCha8Rng::seed_from_u64(seed),
                forced: None,
            },
            RollSource::Forced { value } => Self {
                rng: ChaCha8Rng::seed_from_u64(0),
                forced: Some(value),
            },
        }
    }

    /// Seeded when a seed is given, entropy otherwise
    pub fn from_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::new(RollSource::Seeded { seed }),
            None => Self::new(RollSource::Entropy),
        }
    }

    fn die(&mut self, sides: u32) -> u32 {
        match self.forced {
            Some(value) => value.clamp(1, sides),
            None => self.rng.random_range(1..=sides),
        }
    }

    /// Roll an expression
    pub fn roll(&mut self, expr: &DiceExpression) -> RollResult {
        let rolls: Vec<u32> = (0..expr.count).map(|_| self.die(expr.sides)).collect();
        let kept = select_kept(&rolls, expr.keep);
        let sum = kept.iter().fold(0i32, |acc, &die| acc.saturating_add_unsigned(die));

        RollResult {
            expression: expr.to_string(),
            total: sum.saturating_add(expr.modifier),
            modifier: expr.modifier,
            rolls,
            kept,
        }
    }

    /// Parse, apply vantage and roll
    pub fn roll_notation(
        &mut self,
        notation: &str,
        vantage: Vantage,
    ) -> Result<RollResult, DiceError> {
        let expr = DiceExpression::parse(notation)?.with_vantage(vantage);
        Ok(self.roll(&expr))
    }

    /// Roll a d20 test with a modifier
    pub fn roll_d20(&mut self, modifier: i32, vantage: Vantage) -> RollResult {
        let expr = DiceExpression::d20(modifier).with_vantage(vantage);
        self.roll(&expr)
    }

    /// Roll a list of labelled expressions
    ///
    /// Batch size is checked before any die is rolled. Entries fail
    /// individually; the grand total sums the entries that rolled.
    pub fn roll_batch(&mut self, entries: &[BatchEntry]) -> Result<BatchOutcome, DiceError> {
        if entries.is_empty() {
            return Err(DiceError::EmptyBatch);
        }
        if entries.len() > MAX_BATCH_ROLLS {
            return Err(DiceError::TooManyRolls {
                count: entries.len(),
                max: MAX_BATCH_ROLLS,
            });
        }

        let results: Vec<BatchEntryResult> = entries
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let outcome = Vantage::from_flags(entry.advantage, entry.disadvantage)
                    .and_then(|vantage| self.roll_notation(&entry.expression, vantage));
                let (result, error) = match outcome {
                    Ok(result) => (Some(result), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                BatchEntryResult {
                    index,
                    label: entry.label.clone(),
                    expression: entry.expression.clone(),
                    result,
                    error,
                }
            })
            .collect();

        let grand_total = results
            .iter()
            .filter_map(|r| r.result.as_ref())
            .map(|r| r.total)
            .sum();
        let failed = results.iter().filter(|r| r.error.is_some()).count();

        Ok(BatchOutcome {
            succeeded: results.len() - failed,
            failed,
            grand_total,
            results,
        })
    }
}

fn select_kept(rolls: &[u32], keep: Option<Keep>) -> Vec<u32> {
    let Some(keep) = keep else {
        return rolls.to_vec();
    };

    let mut order: Vec<usize> = (0..rolls.len()).collect();
    match keep {
        Keep::Highest(_) => order.sort_by(|a, b| rolls[*b].cmp(&rolls[*a])),
        Keep::Lowest(_) => order.sort_by(|a, b| rolls[*a].cmp(&rolls[*b])),
    }
    order.truncate(keep.count() as usize);
    order.sort_unstable();
    order.into_iter().map(|i| rolls[i]).collect()
}

/// One entry of a batch roll request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub expression: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub advantage: bool,
    #[serde(default)]
    pub disadvantage: bool,
}

impl BatchEntry {
    pub fn new(expression: &str) -> Self {
        Self {
            expression: expression.to_string(),
            ..Default::default()
        }
    }

    pub fn labelled(expression: &str, label: &str) -> Self {
        Self {
            expression: expression.to_string(),
            label: Some(label.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntryResult {
    pub index: usize,
    pub label: Option<String>,
    pub expression: String,
    pub result: Option<RollResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub results: Vec<BatchEntryResult>,
    pub grand_total: i32,
    pub succeeded: usize,
    pub failed: usize,
}
