//! Encounter state machine
//!
//! An encounter owns its participants, their initiative order and the
//! turn/round counters. Turn advancement ticks conditions on the
//! combatant whose turn ends, skips combatants confirmed dead and runs
//! the start-of-turn hooks (hazard regions and auras).

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::conditions::{ConditionError, ConditionInstance, ConditionKind, ConditionTracker};
use super::damage::{DamageProfile, DamageResult, DamageType};
use super::delta::{EntityStatus, StateDelta};
use super::dice::{DiceError, DiceExpression, DiceRoller, RollResult, Vantage, MAX_MODIFIER};

/// One grid square is five feet
pub const FEET_PER_SQUARE: u32 = 5;

/// Successes (or failures) needed to settle a death-save track
pub const DEATH_SAVES_NEEDED: u8 = 3;

/// Damage dice used when a participant doesn't name its own
pub const DEFAULT_DAMAGE_DICE: &str = "1d6";

/// Encounter engine errors
#[derive(Debug, Error)]
pub enum CombatError {
    #[error("encounter not found: {0}")]
    EncounterNotFound(String),

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("encounter {0} has ended")]
    EncounterEnded(String),

    #[error("no active participants in encounter {0}")]
    NoActiveParticipants(String),

    #[error("{0}")]
    Validation(String),

    #[error("{actor} cannot {action}: {reason}")]
    ActionEconomy {
        actor: String,
        action: String,
        reason: String,
    },

    #[error(transparent)]
    Dice(#[from] DiceError),

    #[error(transparent)]
    Condition(#[from] ConditionError),
}

/// Caller-facing classification of a [`CombatError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    ValidationError,
    ActionEconomyViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ActionEconomyViolation => "ActionEconomyViolation",
        }
    }
}

impl CombatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CombatError::EncounterNotFound(_) | CombatError::ParticipantNotFound(_) => {
                ErrorKind::NotFound
            }
            CombatError::EncounterEnded(_) | CombatError::NoActiveParticipants(_) => {
                ErrorKind::InvalidState
            }
            CombatError::Validation(_) | CombatError::Dice(_) => ErrorKind::ValidationError,
            CombatError::ActionEconomy { .. } => ErrorKind::ActionEconomyViolation,
            CombatError::Condition(ConditionError::InstanceNotFound(_)) => ErrorKind::NotFound,
            CombatError::Condition(_) => ErrorKind::ValidationError,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        CombatError::Validation(message.into())
    }
}

/// Grid position in squares; `z` is altitude for flyers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<i32>,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y, z: None }
    }

    /// Squares between two positions; diagonals count as one
    pub fn squares_to(&self, other: &Position) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        let dz = self.z.unwrap_or(0).abs_diff(other.z.unwrap_or(0));
        dx.max(dy).max(dz)
    }

    pub fn distance_feet(&self, other: &Position) -> u32 {
        self.squares_to(other).saturating_mul(FEET_PER_SQUARE)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.z {
            Some(z) => write!(f, "({}, {}, {})", self.x, self.y, z),
            None => write!(f, "({}, {})", self.x, self.y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Deals damage at the start of a turn spent inside it
    Hazard,
    /// Impassable
    Obstacle,
    /// Costs double movement
    Difficult,
}

/// A named rectangle on the map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerrainRegion {
    pub name: String,
    pub kind: RegionKind,
    pub x: i32,
    pub y: i32,
    #[serde(default = "one")]
    pub width: u32,
    #[serde(default = "one")]
    pub height: u32,
    /// Damage expression for hazards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_type: Option<DamageType>,
}

fn one() -> u32 {
    1
}

impl TerrainRegion {
    pub fn contains(&self, pos: &Position) -> bool {
        pos.x >= self.x
            && pos.y >= self.y
            && i64::from(pos.x) < i64::from(self.x) + i64::from(self.width)
            && i64::from(pos.y) < i64::from(self.y) + i64::from(self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terrain {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub regions: Vec<TerrainRegion>,
}

impl Default for Terrain {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            regions: Vec::new(),
        }
    }
}

impl Terrain {
    pub fn in_bounds(&self, pos: &Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }

    pub fn regions_at<'a>(&'a self, pos: &'a Position) -> impl Iterator<Item = &'a TerrainRegion> {
        self.regions.iter().filter(move |r| r.contains(pos))
    }

    pub fn is_blocked(&self, pos: &Position) -> bool {
        self.regions_at(pos).any(|r| r.kind == RegionKind::Obstacle)
    }

    pub fn is_difficult(&self, pos: &Position) -> bool {
        self.regions_at(pos).any(|r| r.kind == RegionKind::Difficult)
    }

    fn validate(&self) -> Result<(), CombatError> {
        if self.width == 0 || self.height == 0 {
            return Err(CombatError::validation("terrain dimensions must be at least 1"));
        }
        for region in &self.regions {
            if region.width == 0 || region.height == 0 {
                return Err(CombatError::validation(format!(
                    "region '{}' must be at least 1x1",
                    region.name
                )));
            }
            if let Some(damage) = &region.damage {
                DiceExpression::parse(damage)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lighting {
    #[default]
    Bright,
    Dim,
    Darkness,
}

/// Who an aura applies to, relative to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuraTarget {
    Enemies,
    Allies,
}

/// Effect applied to creatures starting their turn near the owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aura {
    #[serde(default)]
    pub name: Option<String>,
    pub radius_feet: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damage_type: Option<DamageType>,
    pub affects: AuraTarget,
}

impl Aura {
    fn validate(&self) -> Result<(), CombatError> {
        if self.damage.is_none() && self.heal.is_none() {
            return Err(CombatError::validation("aura needs damage or heal dice"));
        }
        for dice in self.damage.iter().chain(self.heal.iter()) {
            DiceExpression::parse(dice)?;
        }
        Ok(())
    }
}

/// Slot of the action economy an action uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Action,
    BonusAction,
    Reaction,
    Movement,
    Free,
}

impl fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionCategory::Action => "action",
            ActionCategory::BonusAction => "bonus action",
            ActionCategory::Reaction => "reaction",
            ActionCategory::Movement => "movement",
            ActionCategory::Free => "free action",
        };
        f.write_str(s)
    }
}

/// What a participant can still do this turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEconomy {
    pub action: bool,
    pub bonus_action: bool,
    pub reaction: bool,
    /// Feet of movement left
    pub movement: u32,
}

impl ActionEconomy {
    pub fn fresh(movement: u32) -> Self {
        Self {
            action: true,
            bonus_action: true,
            reaction: true,
            movement,
        }
    }

    /// Whether the category is still available
    pub fn check(&self, category: ActionCategory) -> Result<(), &'static str> {
        match category {
            ActionCategory::Action if !self.action => Err("action already used this turn"),
            ActionCategory::BonusAction if !self.bonus_action => {
                Err("bonus action already used this turn")
            }
            ActionCategory::Reaction if !self.reaction => Err("reaction already used this round"),
            ActionCategory::Movement if self.movement == 0 => Err("no movement left"),
            _ => Ok(()),
        }
    }

    pub fn spend(&mut self, category: ActionCategory) {
        match category {
            ActionCategory::Action => self.action = false,
            ActionCategory::BonusAction => self.bonus_action = false,
            ActionCategory::Reaction => self.reaction = false,
            ActionCategory::Movement | ActionCategory::Free => {}
        }
    }
}

/// Death-save track of a participant at 0 hp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeathSaves {
    pub successes: u8,
    pub failures: u8,
    pub stable: bool,
    pub dead: bool,
}

impl DeathSaves {
    fn add_failures(&mut self, count: u8) {
        if self.dead {
            return;
        }
        if self.stable {
            *self = Self::default();
        }
        self.failures = (self.failures + count).min(DEATH_SAVES_NEEDED);
        if self.failures >= DEATH_SAVES_NEEDED {
            self.dead = true;
        }
    }

    fn add_success(&mut self) {
        self.successes = (self.successes + 1).min(DEATH_SAVES_NEEDED);
        if self.successes >= DEATH_SAVES_NEEDED {
            self.stable = true;
        }
    }

    fn die(&mut self) {
        self.stable = false;
        self.dead = true;
    }
}

/// One combatant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub hp: i32,
    pub max_hp: i32,
    pub armor_class: i32,
    /// Walking speed in feet
    pub speed: u32,
    pub position: Position,
    pub is_enemy: bool,
    pub initiative_modifier: i32,
    pub initiative: i32,
    pub attack_bonus: i32,
    pub damage_dice: String,
    pub damage_type: Option<DamageType>,
    pub damage_profile: DamageProfile,
    pub aura: Option<Aura>,
    pub economy: ActionEconomy,
    pub death_saves: DeathSaves,
    pub dodging: bool,
    pub disengaged: bool,
    pub hidden: bool,
    /// An ally's Help grants advantage on the next attack
    pub helped: bool,
    pub readied: Option<String>,
}

impl Participant {
    /// Three failed death saves or massive damage
    pub fn is_dead(&self) -> bool {
        self.death_saves.dead
    }

    pub fn is_down(&self) -> bool {
        self.hp == 0
    }

    pub fn is_stable(&self) -> bool {
        self.death_saves.stable
    }

    pub fn status(&self) -> EntityStatus {
        let mut markers = Vec::new();
        if self.death_saves.dead {
            markers.push("dead");
        }
        if self.death_saves.stable {
            markers.push("stable");
        }
        EntityStatus::derive(self.hp, &markers)
    }

    /// Whether `other` is on the same side
    pub fn is_ally_of(&self, other: &Participant) -> bool {
        self.is_enemy == other.is_enemy
    }
}

/// Participant as supplied by the caller
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    /// Defaults to `max_hp`
    #[serde(default)]
    pub hp: Option<i32>,
    pub max_hp: i32,
    #[serde(default = "default_armor_class")]
    pub armor_class: i32,
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub is_enemy: bool,
    #[serde(default)]
    pub initiative_modifier: i32,
    /// Rolled on the encounter's dice when absent
    #[serde(default)]
    pub initiative: Option<i32>,
    #[serde(default)]
    pub attack_bonus: i32,
    #[serde(default)]
    pub damage_dice: Option<String>,
    #[serde(default)]
    pub damage_type: Option<DamageType>,
    #[serde(default)]
    pub damage_profile: DamageProfile,
    #[serde(default)]
    pub aura: Option<Aura>,
}

fn default_armor_class() -> i32 {
    10
}

fn default_speed() -> u32 {
    30
}

impl ParticipantSpec {
    pub fn new(id: &str, name: &str, max_hp: i32) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            hp: None,
            max_hp,
            armor_class: default_armor_class(),
            speed: default_speed(),
            position: Position::default(),
            is_enemy: false,
            initiative_modifier: 0,
            initiative: None,
            attack_bonus: 0,
            damage_dice: None,
            damage_type: None,
            damage_profile: DamageProfile::default(),
            aura: None,
        }
    }

    pub fn with_initiative(mut self, initiative: i32) -> Self {
        self.initiative = Some(initiative);
        self
    }

    pub fn with_initiative_modifier(mut self, modifier: i32) -> Self {
        self.initiative_modifier = modifier;
        self
    }

    pub fn enemy(mut self) -> Self {
        self.is_enemy = true;
        self
    }

    pub fn at(mut self, x: i32, y: i32) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_hp(mut self, hp: i32) -> Self {
        self.hp = Some(hp);
        self
    }

    pub fn with_armor_class(mut self, armor_class: i32) -> Self {
        self.armor_class = armor_class;
        self
    }

    pub fn with_attack(mut self, attack_bonus: i32, damage_dice: &str) -> Self {
        self.attack_bonus = attack_bonus;
        self.damage_dice = Some(damage_dice.to_string());
        self
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_aura(mut self, aura: Aura) -> Self {
        self.aura = Some(aura);
        self
    }

    fn validate(&self) -> Result<(), CombatError> {
        if self.name.trim().is_empty() {
            return Err(CombatError::validation("participant name is required"));
        }
        if self.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(CombatError::validation("participant id must not be empty"));
        }
        if self.max_hp < 1 {
            return Err(CombatError::validation(format!(
                "{}: maxHp must be at least 1",
                self.name
            )));
        }
        if let Some(hp) = self.hp {
            if hp < 0 || hp > self.max_hp {
                return Err(CombatError::validation(format!(
                    "{}: hp must be between 0 and {}",
                    self.name, self.max_hp
                )));
            }
        }
        for (field, value) in [
            ("initiativeModifier", self.initiative_modifier),
            ("attackBonus", self.attack_bonus),
        ] {
            if value.unsigned_abs() > MAX_MODIFIER.unsigned_abs() {
                return Err(CombatError::validation(format!(
                    "{}: {} must be within ±{}",
                    self.name, field, MAX_MODIFIER
                )));
            }
        }
        if let Some(dice) = &self.damage_dice {
            DiceExpression::parse(dice)?;
        }
        if let Some(aura) = &self.aura {
            aura.validate()?;
        }
        Ok(())
    }

    /// The starting square must lie on the map
    fn validate_placement(&self, terrain: &Terrain) -> Result<(), CombatError> {
        if terrain.in_bounds(&self.position) {
            return Ok(());
        }
        Err(CombatError::validation(format!(
            "{}: position {} is outside the {}x{} map",
            self.name, self.position, terrain.width, terrain.height
        )))
    }

    fn build(self, roller: &mut DiceRoller) -> Participant {
        let initiative = self
            .initiative
            .unwrap_or_else(|| roller.roll_d20(self.initiative_modifier, Vantage::Normal).total);

        Participant {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            hp: self.hp.unwrap_or(self.max_hp),
            name: self.name,
            max_hp: self.max_hp,
            armor_class: self.armor_class,
            speed: self.speed,
            position: self.position,
            is_enemy: self.is_enemy,
            initiative_modifier: self.initiative_modifier,
            initiative,
            attack_bonus: self.attack_bonus,
            damage_dice: self
                .damage_dice
                .unwrap_or_else(|| DEFAULT_DAMAGE_DICE.to_string()),
            damage_type: self.damage_type,
            damage_profile: self.damage_profile,
            aura: self.aura,
            economy: ActionEconomy::fresh(self.speed),
            death_saves: DeathSaves::default(),
            dodging: false,
            disengaged: false,
            hidden: false,
            helped: false,
            readied: None,
        }
    }
}

/// Request to start an encounter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEncounter {
    #[serde(default)]
    pub name: Option<String>,
    pub participants: Vec<ParticipantSpec>,
    #[serde(default)]
    pub terrain: Terrain,
    #[serde(default)]
    pub lighting: Lighting,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl CreateEncounter {
    pub fn new(participants: Vec<ParticipantSpec>) -> Self {
        Self {
            participants,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncounterStatus {
    Active,
    Ended,
}

/// Direct hit point change from an outside collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum HpChange {
    Damage {
        amount: i32,
        #[serde(default)]
        damage_type: Option<DamageType>,
        #[serde(default)]
        critical: bool,
    },
    Heal {
        amount: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HpChangeOutcome {
    pub target_id: String,
    pub previous: i32,
    pub current: i32,
    pub max: i32,
    pub damage: Option<DamageResult>,
    pub healed: Option<i32>,
    pub status: EntityStatus,
}

/// Damage or healing applied at the start of a turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEffect {
    /// Region or aura owner that caused it
    pub source: String,
    pub target_id: String,
    pub roll: RollResult,
    pub damage: Option<DamageResult>,
    pub healed: Option<i32>,
}

/// Result of advancing the turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnAdvance {
    pub round: u32,
    pub turn_index: usize,
    pub previous_participant_id: String,
    pub combatant: Participant,
    /// Conditions that ran out on the previous combatant
    pub expired: Vec<ConditionInstance>,
    /// Dead combatants passed over
    pub skipped: Vec<String>,
    pub effects: Vec<TurnEffect>,
    pub death_save_reminder: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeathSaveOutcome {
    pub participant_id: String,
    pub roll: RollResult,
    pub natural: u32,
    pub successes: u8,
    pub failures: u8,
    pub stable: bool,
    pub dead: bool,
    /// Natural 20: back on their feet with 1 hp
    pub revived: bool,
    pub hp: i32,
    pub narration: String,
}

/// Participant plus tracker-derived state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    #[serde(flatten)]
    pub participant: Participant,
    pub status: EntityStatus,
    pub conditions: Vec<ConditionKind>,
    pub exhaustion: u8,
}

/// Full view of an encounter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterState {
    pub id: String,
    pub name: String,
    pub status: EncounterStatus,
    pub round: u32,
    pub turn_index: usize,
    pub active_participant_id: String,
    /// Participant ids in initiative order
    pub initiative_order: Vec<String>,
    pub participants: Vec<ParticipantState>,
    pub terrain: Terrain,
    pub lighting: Lighting,
    pub seed: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Short listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterSummary {
    pub id: String,
    pub name: String,
    pub status: EncounterStatus,
    pub round: u32,
    pub participants: usize,
    pub active_participant_id: String,
    pub created_at: DateTime<Utc>,
}

/// Speed after conditions and exhaustion
pub fn effective_speed(participant: &Participant, tracker: &ConditionTracker) -> u32 {
    let exhaustion = tracker.exhaustion(&participant.id);
    let immobile = tracker
        .kinds(&participant.id)
        .iter()
        .any(|kind| kind.immobilizes());

    if participant.is_down() || immobile || exhaustion >= 5 {
        0
    } else if exhaustion >= 2 {
        participant.speed / 2
    } else {
        participant.speed
    }
}

/// Initiative descending, then initiative modifier, then insertion order
fn initiative_order(participants: &[Participant]) -> Vec<String> {
    let mut indices: Vec<usize> = (0..participants.len()).collect();
    indices.sort_by(|&a, &b| {
        let (a, b) = (&participants[a], &participants[b]);
        b.initiative
            .cmp(&a.initiative)
            .then(b.initiative_modifier.cmp(&a.initiative_modifier))
    });
    indices
        .into_iter()
        .map(|i| participants[i].id.clone())
        .collect()
}

/// One combat session
#[derive(Debug)]
pub struct Encounter {
    pub id: String,
    pub name: String,
    participants: Vec<Participant>,
    order: Vec<String>,
    turn_index: usize,
    round: u32,
    status: EncounterStatus,
    pub terrain: Terrain,
    pub lighting: Lighting,
    seed: Option<u64>,
    pub(crate) roller: DiceRoller,
    pub created_at: DateTime<Utc>,
}

impl Encounter {
    /// Validate the request, roll initiative and start at round 1
    pub fn new(request: CreateEncounter, default_seed: Option<u64>) -> Result<Self, CombatError> {
        if request.participants.is_empty() {
            return Err(CombatError::validation(
                "an encounter needs at least one participant",
            ));
        }
        request.terrain.validate()?;

        let mut seen = HashSet::new();
        for spec in &request.participants {
            spec.validate()?;
            spec.validate_placement(&request.terrain)?;
            if let Some(id) = &spec.id {
                if !seen.insert(id.clone()) {
                    return Err(CombatError::validation(format!(
                        "duplicate participant id: {}",
                        id
                    )));
                }
            }
        }

        let seed = request.seed.or(default_seed);
        let mut roller = DiceRoller::from_seed(seed);
        let participants: Vec<Participant> = request
            .participants
            .into_iter()
            .map(|spec| spec.build(&mut roller))
            .collect();
        let order = initiative_order(&participants);

        let id = Uuid::new_v4().to_string();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Encounter {}", &id[..8]));

        debug!(
            "Encounter {} created with {} participants, order {:?}",
            id,
            participants.len(),
            order
        );

        Ok(Self {
            id,
            name,
            participants,
            order,
            turn_index: 0,
            round: 1,
            status: EncounterStatus::Active,
            terrain: request.terrain,
            lighting: request.lighting,
            seed,
            roller,
            created_at: Utc::now(),
        })
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn turn_index(&self) -> usize {
        self.turn_index
    }

    pub fn status(&self) -> EncounterStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == EncounterStatus::Active
    }

    /// Participants in insertion order
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Participant ids in initiative order
    pub fn initiative_order(&self) -> &[String] {
        &self.order
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn active_id(&self) -> &str {
        &self.order[self.turn_index]
    }

    pub(crate) fn index_of(&self, id: &str) -> Result<usize, CombatError> {
        self.participants
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| CombatError::ParticipantNotFound(id.to_string()))
    }

    pub(crate) fn participant_at(&self, index: usize) -> &Participant {
        &self.participants[index]
    }

    pub(crate) fn participant_at_mut(&mut self, index: usize) -> &mut Participant {
        &mut self.participants[index]
    }

    pub(crate) fn ensure_active(&self) -> Result<(), CombatError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(CombatError::EncounterEnded(self.id.clone()))
        }
    }

    /// Apply damage through the target's damage profile
    ///
    /// Damage taken at 0 hp adds death-save failures (two on a critical);
    /// damage left over after reaching 0 that is at least the hit point
    /// maximum kills outright. Dropping to 0 breaks the target's
    /// concentration.
    pub(crate) fn apply_damage(
        &mut self,
        tracker: &ConditionTracker,
        index: usize,
        base: i32,
        damage_type: Option<DamageType>,
        critical: bool,
        deltas: &mut Vec<StateDelta>,
    ) -> DamageResult {
        let target = &mut self.participants[index];
        let result = target.damage_profile.calculate(base, damage_type);
        let damage = result.final_damage;
        let previous = target.hp;
        let previous_status = target.status();

        if damage > 0 {
            if target.hp == 0 {
                if damage >= target.max_hp {
                    target.death_saves.die();
                } else {
                    target.death_saves.add_failures(if critical { 2 } else { 1 });
                }
            } else {
                let overflow = damage - target.hp;
                target.hp = (target.hp - damage).max(0);
                if target.hp == 0 {
                    target.death_saves = DeathSaves::default();
                    if overflow >= target.max_hp {
                        target.death_saves.die();
                    }
                }
            }
        }

        let dropped = previous > 0 && target.hp == 0;
        let target_id = target.id.clone();
        push_hp_deltas(target, previous, previous_status, deltas);

        if dropped {
            for broken in tracker.break_concentration(&target_id) {
                deltas.push(StateDelta::ConditionRemoved {
                    entity_id: broken.target_id,
                    condition: broken.kind,
                    reason: format!("{} lost concentration", target_id),
                });
            }
        }
        result
    }

    /// Heal up to the maximum; returns hit points regained
    pub(crate) fn apply_healing(
        &mut self,
        index: usize,
        amount: i32,
        deltas: &mut Vec<StateDelta>,
    ) -> i32 {
        let target = &mut self.participants[index];
        if target.is_dead() || amount <= 0 {
            return 0;
        }

        let previous = target.hp;
        let previous_status = target.status();
        target.hp = target.hp.saturating_add(amount).min(target.max_hp);
        if previous == 0 && target.hp > 0 {
            target.death_saves = DeathSaves::default();
        }
        let healed = target.hp - previous;
        push_hp_deltas(target, previous, previous_status, deltas);
        healed
    }

    /// Direct damage or healing, bypassing attack rolls
    pub fn apply_hp_change(
        &mut self,
        tracker: &ConditionTracker,
        target_id: &str,
        change: HpChange,
    ) -> Result<(HpChangeOutcome, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        let index = self.index_of(target_id)?;
        let mut deltas = Vec::new();
        let previous = self.participants[index].hp;

        let (damage, healed) = match change {
            HpChange::Damage {
                amount,
                damage_type,
                critical,
            } => {
                if amount < 0 {
                    return Err(CombatError::validation("damage amount must not be negative"));
                }
                let result =
                    self.apply_damage(tracker, index, amount, damage_type, critical, &mut deltas);
                (Some(result), None)
            }
            HpChange::Heal { amount } => {
                if amount < 0 {
                    return Err(CombatError::validation("heal amount must not be negative"));
                }
                if self.participants[index].is_dead() {
                    return Err(CombatError::validation(format!(
                        "{} is dead and cannot be healed",
                        self.participants[index].name
                    )));
                }
                (None, Some(self.apply_healing(index, amount, &mut deltas)))
            }
        };

        let target = &self.participants[index];
        Ok((
            HpChangeOutcome {
                target_id: target.id.clone(),
                previous,
                current: target.hp,
                max: target.max_hp,
                damage,
                healed,
                status: target.status(),
            },
            deltas,
        ))
    }

    /// End the current turn and start the next living combatant's turn
    pub fn advance_turn(
        &mut self,
        tracker: &ConditionTracker,
        process_effects: bool,
        process_auras: bool,
    ) -> Result<(TurnAdvance, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        if self.participants.iter().all(|p| p.is_down()) {
            return Err(CombatError::NoActiveParticipants(self.id.clone()));
        }

        let mut deltas = Vec::new();
        let previous_id = self.active_id().to_string();

        let expired = tracker.tick(&previous_id).expired;
        for instance in &expired {
            deltas.push(StateDelta::ConditionRemoved {
                entity_id: instance.target_id.clone(),
                condition: instance.kind,
                reason: "expired".to_string(),
            });
        }
        let previous_index = self.index_of(&previous_id)?;
        self.participants[previous_index].disengaged = false;

        // At least one participant is above 0 hp, so this finds someone
        let count = self.order.len();
        let mut skipped = Vec::new();
        for _ in 0..count {
            self.turn_index = (self.turn_index + 1) % count;
            if self.turn_index == 0 {
                self.round += 1;
            }
            let id = &self.order[self.turn_index];
            if self.participant(id).is_some_and(|p| p.is_dead()) {
                skipped.push(id.clone());
                continue;
            }
            break;
        }

        let active_id = self.active_id().to_string();
        let index = self.index_of(&active_id)?;
        let speed = effective_speed(&self.participants[index], tracker);
        {
            let active = &mut self.participants[index];
            active.economy = ActionEconomy::fresh(speed);
            active.dodging = false;
            active.readied = None;
        }
        deltas.push(StateDelta::TurnChanged {
            round: self.round,
            turn_index: self.turn_index,
            active_entity_id: active_id.clone(),
        });

        let mut effects = Vec::new();
        if process_effects {
            self.apply_hazards(tracker, index, &mut effects, &mut deltas)?;
        }
        if process_auras {
            self.apply_auras(tracker, index, &mut effects, &mut deltas)?;
        }

        let active = &self.participants[index];
        let death_save_reminder = (active.is_down() && !active.is_stable() && !active.is_dead())
            .then(|| format!("{} is dying and must make a death saving throw", active.name));

        debug!(
            "Encounter {} round {} turn {}: {}",
            self.id, self.round, self.turn_index, active.name
        );

        Ok((
            TurnAdvance {
                round: self.round,
                turn_index: self.turn_index,
                previous_participant_id: previous_id,
                combatant: active.clone(),
                expired,
                skipped,
                effects,
                death_save_reminder,
            },
            deltas,
        ))
    }

    fn apply_hazards(
        &mut self,
        tracker: &ConditionTracker,
        index: usize,
        effects: &mut Vec<TurnEffect>,
        deltas: &mut Vec<StateDelta>,
    ) -> Result<(), CombatError> {
        let position = self.participants[index].position;
        let hazards: Vec<(String, String, Option<DamageType>)> = self
            .terrain
            .regions_at(&position)
            .filter(|r| r.kind == RegionKind::Hazard)
            .filter_map(|r| {
                r.damage
                    .clone()
                    .map(|dice| (r.name.clone(), dice, r.damage_type))
            })
            .collect();

        for (name, dice, damage_type) in hazards {
            let roll = self.roller.roll(&DiceExpression::parse(&dice)?);
            let damage = self.apply_damage(tracker, index, roll.total, damage_type, false, deltas);
            effects.push(TurnEffect {
                source: name,
                target_id: self.participants[index].id.clone(),
                roll,
                damage: Some(damage),
                healed: None,
            });
        }
        Ok(())
    }

    fn apply_auras(
        &mut self,
        tracker: &ConditionTracker,
        index: usize,
        effects: &mut Vec<TurnEffect>,
        deltas: &mut Vec<StateDelta>,
    ) -> Result<(), CombatError> {
        let target = &self.participants[index];
        let auras: Vec<(String, Aura)> = self
            .participants
            .iter()
            .filter(|owner| owner.id != target.id && !owner.is_down())
            .filter_map(|owner| {
                let aura = owner.aura.as_ref()?;
                let in_range = owner.position.distance_feet(&target.position) <= aura.radius_feet;
                let applies = match aura.affects {
                    AuraTarget::Allies => owner.is_ally_of(target),
                    AuraTarget::Enemies => !owner.is_ally_of(target),
                };
                let source = aura.name.clone().unwrap_or_else(|| owner.name.clone());
                (in_range && applies).then(|| (source, aura.clone()))
            })
            .collect();

        for (source, aura) in auras {
            let target_id = self.participants[index].id.clone();
            if let Some(dice) = &aura.damage {
                let roll = self.roller.roll(&DiceExpression::parse(dice)?);
                let damage =
                    self.apply_damage(tracker, index, roll.total, aura.damage_type, false, deltas);
                effects.push(TurnEffect {
                    source: source.clone(),
                    target_id: target_id.clone(),
                    roll,
                    damage: Some(damage),
                    healed: None,
                });
            }
            if let Some(dice) = &aura.heal {
                let roll = self.roller.roll(&DiceExpression::parse(dice)?);
                let healed = self.apply_healing(index, roll.total, deltas);
                effects.push(TurnEffect {
                    source,
                    target_id,
                    roll,
                    damage: None,
                    healed: Some(healed),
                });
            }
        }
        Ok(())
    }

    /// Roll a death saving throw for a participant at 0 hp
    pub fn roll_death_save(
        &mut self,
        participant_id: &str,
    ) -> Result<(DeathSaveOutcome, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        let index = self.index_of(participant_id)?;
        {
            let p = &self.participants[index];
            if p.is_dead() {
                return Err(CombatError::validation(format!("{} is dead", p.name)));
            }
            if !p.is_down() {
                return Err(CombatError::validation(format!("{} is not dying", p.name)));
            }
            if p.is_stable() {
                return Err(CombatError::validation(format!("{} is already stable", p.name)));
            }
        }

        let roll = self.roller.roll_d20(0, Vantage::Normal);
        let natural = roll.natural().unwrap_or_default();
        let mut deltas = Vec::new();

        let p = &mut self.participants[index];
        let previous_status = p.status();
        let mut revived = false;
        let narration = match natural {
            20 => {
                p.hp = 1;
                p.death_saves = DeathSaves::default();
                revived = true;
                deltas.push(StateDelta::HpChanged {
                    entity_id: p.id.clone(),
                    previous: 0,
                    current: 1,
                    max: p.max_hp,
                });
                format!("{} rolls a natural 20 and regains consciousness!", p.name)
            }
            1 => {
                p.death_saves.add_failures(2);
                format!("{} rolls a natural 1: two failures", p.name)
            }
            n if n >= 10 => {
                p.death_saves.add_success();
                format!("{} succeeds a death save ({})", p.name, n)
            }
            n => {
                p.death_saves.add_failures(1);
                format!("{} fails a death save ({})", p.name, n)
            }
        };

        let status = p.status();
        if status != previous_status {
            deltas.push(StateDelta::StatusChanged {
                entity_id: p.id.clone(),
                status,
            });
        }

        Ok((
            DeathSaveOutcome {
                participant_id: p.id.clone(),
                roll,
                natural,
                successes: p.death_saves.successes,
                failures: p.death_saves.failures,
                stable: p.death_saves.stable,
                dead: p.death_saves.dead,
                revived,
                hp: p.hp,
                narration,
            },
            deltas,
        ))
    }

    /// Join mid-fight without changing whose turn it is
    pub fn add_participant(
        &mut self,
        spec: ParticipantSpec,
    ) -> Result<(Participant, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        spec.validate()?;
        spec.validate_placement(&self.terrain)?;
        if let Some(id) = &spec.id {
            if self.participant(id).is_some() {
                return Err(CombatError::validation(format!(
                    "duplicate participant id: {}",
                    id
                )));
            }
        }

        let participant = spec.build(&mut self.roller);
        let position = self
            .order
            .iter()
            .position(|id| {
                self.participant(id).is_some_and(|other| {
                    participant.initiative > other.initiative
                        || (participant.initiative == other.initiative
                            && participant.initiative_modifier > other.initiative_modifier)
                })
            })
            .unwrap_or(self.order.len());

        self.order.insert(position, participant.id.clone());
        if position <= self.turn_index {
            self.turn_index += 1;
        }
        self.participants.push(participant.clone());

        let delta = StateDelta::EntityAdded {
            entity_id: participant.id.clone(),
            name: participant.name.clone(),
            position: participant.position,
            hp: participant.hp,
            max_hp: participant.max_hp,
            armor_class: participant.armor_class,
            is_enemy: participant.is_enemy,
        };
        Ok((participant, vec![delta]))
    }

    /// Leave the fight; removing the active combatant passes the turn on
    pub fn remove_participant(
        &mut self,
        tracker: &ConditionTracker,
        participant_id: &str,
    ) -> Result<(Participant, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        let index = self.index_of(participant_id)?;
        if self.participants.len() == 1 {
            return Err(CombatError::validation(
                "cannot remove the last participant",
            ));
        }

        if let Some(position) = self.order.iter().position(|id| id == participant_id) {
            self.order.remove(position);
            if position < self.turn_index {
                self.turn_index -= 1;
            } else if self.turn_index >= self.order.len() {
                self.turn_index = 0;
            }
        }
        let removed = self.participants.remove(index);
        tracker.clear(participant_id);

        Ok((
            removed,
            vec![StateDelta::EntityRemoved {
                entity_id: participant_id.to_string(),
            }],
        ))
    }

    /// Mark exhaustion death on a participant
    pub(crate) fn kill(&mut self, index: usize) -> Vec<StateDelta> {
        let mut deltas = Vec::new();
        let p = &mut self.participants[index];
        let previous = p.hp;
        let previous_status = p.status();
        p.hp = 0;
        p.death_saves.die();
        push_hp_deltas(p, previous, previous_status, &mut deltas);
        deltas
    }

    pub fn end(&mut self) -> Result<StateDelta, CombatError> {
        self.ensure_active()?;
        self.status = EncounterStatus::Ended;
        debug!("Encounter {} ended in round {}", self.id, self.round);
        Ok(StateDelta::EncounterEnded { round: self.round })
    }

    pub fn state(&self, tracker: &ConditionTracker) -> EncounterState {
        EncounterState {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            round: self.round,
            turn_index: self.turn_index,
            active_participant_id: self.active_id().to_string(),
            initiative_order: self.order.clone(),
            participants: self
                .participants
                .iter()
                .map(|p| ParticipantState {
                    status: p.status(),
                    conditions: tracker.kinds(&p.id),
                    exhaustion: tracker.exhaustion(&p.id),
                    participant: p.clone(),
                })
                .collect(),
            terrain: self.terrain.clone(),
            lighting: self.lighting,
            seed: self.seed,
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> EncounterSummary {
        EncounterSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            round: self.round,
            participants: self.participants.len(),
            active_participant_id: self.active_id().to_string(),
            created_at: self.created_at,
        }
    }
}

fn push_hp_deltas(
    participant: &Participant,
    previous_hp: i32,
    previous_status: EntityStatus,
    deltas: &mut Vec<StateDelta>,
) {
    if participant.hp != previous_hp {
        deltas.push(StateDelta::HpChanged {
            entity_id: participant.id.clone(),
            previous: previous_hp,
            current: participant.hp,
            max: participant.max_hp,
        });
    }
    let status = participant.status();
    if status != previous_status {
        deltas.push(StateDelta::StatusChanged {
            entity_id: participant.id.clone(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::conditions::{ConditionDuration, NewCondition};
    use crate::combat::dice::RollSource;

    fn duel() -> Encounter {
        Encounter::new(
            CreateEncounter::new(vec![
                ParticipantSpec::new("fighter", "Fighter", 20).with_initiative(10),
                ParticipantSpec::new("goblin", "Goblin", 7)
                    .with_initiative(5)
                    .enemy(),
            ]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_two_participant_scenario() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        assert_eq!(enc.round(), 1);
        assert_eq!(enc.active_id(), "fighter");

        let (turn, deltas) = enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(turn.combatant.id, "goblin");
        assert_eq!(turn.round, 1);
        assert!(matches!(deltas[0], StateDelta::TurnChanged { .. }));

        let (turn, _) = enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(turn.combatant.id, "fighter");
        assert_eq!(turn.round, 2);
    }

    #[test]
    fn test_turn_round_invariant() {
        let tracker = ConditionTracker::new();
        let specs: Vec<ParticipantSpec> = (0..4)
            .map(|i| ParticipantSpec::new(&format!("p{}", i), "P", 10))
            .collect();
        let mut enc = Encounter::new(CreateEncounter::new(specs).with_seed(3), None).unwrap();

        for n in 1..=25u32 {
            enc.advance_turn(&tracker, true, true).unwrap();
            assert_eq!(enc.round(), 1 + n / 4);
            assert_eq!(enc.turn_index(), (n % 4) as usize);
        }
    }

    #[test]
    fn test_initiative_tie_break() {
        let enc = Encounter::new(
            CreateEncounter::new(vec![
                ParticipantSpec::new("a", "A", 5).with_initiative(12),
                ParticipantSpec::new("b", "B", 5)
                    .with_initiative(12)
                    .with_initiative_modifier(3),
                ParticipantSpec::new("c", "C", 5).with_initiative(12),
                ParticipantSpec::new("d", "D", 5).with_initiative(18),
            ]),
            None,
        )
        .unwrap();

        assert_eq!(enc.initiative_order(), ["d", "b", "a", "c"]);
    }

    #[test]
    fn test_seeded_initiative_reproducible() {
        let request = || {
            CreateEncounter::new(vec![
                ParticipantSpec::new("a", "A", 5).with_initiative_modifier(2),
                ParticipantSpec::new("b", "B", 5),
                ParticipantSpec::new("c", "C", 5),
            ])
            .with_seed(99)
        };
        let first = Encounter::new(request(), None).unwrap();
        let second = Encounter::new(request(), None).unwrap();

        let rolls = |e: &Encounter| e.participants().iter().map(|p| p.initiative).collect::<Vec<_>>();
        assert_eq!(rolls(&first), rolls(&second));
        assert_eq!(first.initiative_order(), second.initiative_order());
    }

    #[test]
    fn test_create_validation() {
        assert!(Encounter::new(CreateEncounter::new(vec![]), None).is_err());

        let dup = CreateEncounter::new(vec![
            ParticipantSpec::new("a", "A", 5),
            ParticipantSpec::new("a", "A again", 5),
        ]);
        let err = Encounter::new(dup, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        let bad_hp = CreateEncounter::new(vec![ParticipantSpec::new("a", "A", 5).with_hp(9)]);
        assert!(Encounter::new(bad_hp, None).is_err());

        let no_hp = CreateEncounter::new(vec![ParticipantSpec::new("a", "A", 0)]);
        assert!(Encounter::new(no_hp, None).is_err());

        let bad_dice =
            CreateEncounter::new(vec![ParticipantSpec::new("a", "A", 5).with_attack(2, "2x6")]);
        assert!(matches!(
            Encounter::new(bad_dice, None),
            Err(CombatError::Dice(DiceError::Parse { .. }))
        ));

        for spec in [
            ParticipantSpec::new("a", "A", 5).with_initiative_modifier(i32::MIN),
            ParticipantSpec::new("a", "A", 5).with_attack(MAX_MODIFIER + 1, "1d6"),
        ] {
            let err = Encounter::new(CreateEncounter::new(vec![spec]), None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ValidationError);
        }
    }

    #[test]
    fn test_hp_invariant() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        let mut roller = DiceRoller::new(RollSource::Seeded { seed: 7 });

        for i in 0..200 {
            let amount = roller.roll(&DiceExpression::new(1, 30, 0)).total;
            let change = if i % 3 == 0 {
                HpChange::Heal { amount }
            } else {
                HpChange::Damage {
                    amount,
                    damage_type: None,
                    critical: false,
                }
            };
            // Healing the dead is rejected; that's fine here
            let _ = enc.apply_hp_change(&tracker, "fighter", change);
            let p = enc.participant("fighter").unwrap();
            assert!(p.hp >= 0 && p.hp <= p.max_hp);
        }
    }

    #[test]
    fn test_extreme_amounts_stay_in_bounds() {
        let tracker = ConditionTracker::new();
        let mut enc = Encounter::new(
            CreateEncounter::new(vec![
                ParticipantSpec::new("squire", "Squire", 10).with_initiative(10),
                ParticipantSpec::new("wraith", "Wraith", 30).with_initiative(5),
            ]),
            None,
        )
        .unwrap();

        enc.apply_hp_change(
            &tracker,
            "squire",
            HpChange::Damage {
                amount: 3,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();
        let (outcome, deltas) = enc
            .apply_hp_change(&tracker, "squire", HpChange::Heal { amount: i32::MAX })
            .unwrap();
        assert_eq!(outcome.current, 10);
        assert_eq!(outcome.healed, Some(3));
        assert_eq!(
            deltas,
            vec![StateDelta::HpChanged {
                entity_id: "squire".to_string(),
                previous: 7,
                current: 10,
                max: 10,
            }]
        );

        enc.participants[1].damage_profile.vulnerabilities = vec![DamageType::Radiant];
        let (outcome, _) = enc
            .apply_hp_change(
                &tracker,
                "wraith",
                HpChange::Damage {
                    amount: i32::MAX,
                    damage_type: Some(DamageType::Radiant),
                    critical: true,
                },
            )
            .unwrap();
        assert_eq!(outcome.current, 0);
        assert_eq!(outcome.damage.map(|d| d.final_damage), Some(i32::MAX));
        assert_eq!(outcome.status, EntityStatus::Dead);
    }

    #[test]
    fn test_hp_bounds_under_mixed_damage() {
        let tracker = ConditionTracker::new();
        let troll = || {
            let mut spec = ParticipantSpec::new("troll", "Troll", 84).with_initiative(10);
            spec.damage_profile = DamageProfile {
                immunities: vec![DamageType::Poison],
                resistances: vec![DamageType::Slashing],
                vulnerabilities: vec![DamageType::Fire, DamageType::Acid],
            };
            Encounter::new(
                CreateEncounter::new(vec![
                    spec,
                    ParticipantSpec::new("ranger", "Ranger", 30).with_initiative(5),
                ]),
                None,
            )
            .unwrap()
        };
        let types = [
            None,
            Some(DamageType::Poison),
            Some(DamageType::Slashing),
            Some(DamageType::Fire),
            Some(DamageType::Acid),
        ];
        let mut enc = troll();
        let mut roller = DiceRoller::new(RollSource::Seeded { seed: 21 });

        for _ in 0..500 {
            if enc.participant("troll").unwrap().is_dead() {
                enc = troll();
            }
            let pick = roller.roll(&DiceExpression::new(1, 12, 0)).total;
            let amount = match roller.roll(&DiceExpression::new(1, 20, 0)).total {
                20 => i32::MAX,
                19 => i32::MAX / 2 + 1,
                _ => roller.roll(&DiceExpression::new(2, 20, 0)).total,
            };
            let change = if pick <= 4 {
                HpChange::Heal { amount }
            } else {
                HpChange::Damage {
                    amount,
                    damage_type: types[(pick as usize) % types.len()],
                    critical: pick == 12,
                }
            };
            let (outcome, _) = enc.apply_hp_change(&tracker, "troll", change).unwrap();
            assert!(
                (0..=outcome.max).contains(&outcome.current),
                "hp {} outside 0..={}",
                outcome.current,
                outcome.max
            );
        }
    }

    #[test]
    fn test_positions_must_be_on_the_map() {
        let off_map = CreateEncounter::new(vec![ParticipantSpec::new("a", "A", 5).at(20, 0)]);
        let err = Encounter::new(off_map, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("outside the 20x20 map"));

        let far = CreateEncounter::new(vec![ParticipantSpec::new("a", "A", 5).at(i32::MAX, i32::MIN)]);
        assert!(Encounter::new(far, None).is_err());

        let mut enc = duel();
        let err = enc
            .add_participant(ParticipantSpec::new("bat", "Bat", 1).at(-1, 4))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(enc.participant("bat").is_none());
        enc.add_participant(ParticipantSpec::new("bat", "Bat", 1).at(19, 19))
            .unwrap();
    }

    #[test]
    fn test_massive_damage_kills() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();

        // 7 hp goblin: 7 to reach 0, 7 more left over is its max
        let (outcome, deltas) = enc
            .apply_hp_change(
                &tracker,
                "goblin",
                HpChange::Damage {
                    amount: 14,
                    damage_type: None,
                    critical: false,
                },
            )
            .unwrap();
        assert_eq!(outcome.current, 0);
        assert_eq!(outcome.status, EntityStatus::Dead);
        assert!(deltas.contains(&StateDelta::StatusChanged {
            entity_id: "goblin".to_string(),
            status: EntityStatus::Dead,
        }));
    }

    #[test]
    fn test_damage_at_zero_adds_failures() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        let damage = |amount, critical| HpChange::Damage {
            amount,
            damage_type: None,
            critical,
        };

        enc.apply_hp_change(&tracker, "fighter", damage(20, false)).unwrap();
        let p = enc.participant("fighter").unwrap();
        assert_eq!(p.status(), EntityStatus::Unconscious);
        assert_eq!(p.death_saves.failures, 0);

        enc.apply_hp_change(&tracker, "fighter", damage(3, true)).unwrap();
        assert_eq!(enc.participant("fighter").unwrap().death_saves.failures, 2);

        enc.apply_hp_change(&tracker, "fighter", damage(3, false)).unwrap();
        assert!(enc.participant("fighter").unwrap().is_dead());

        let heal = enc.apply_hp_change(&tracker, "fighter", HpChange::Heal { amount: 5 });
        assert!(heal.is_err());
    }

    #[test]
    fn test_healing_resets_death_saves() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        enc.apply_hp_change(
            &tracker,
            "fighter",
            HpChange::Damage {
                amount: 25,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();
        enc.apply_hp_change(
            &tracker,
            "fighter",
            HpChange::Damage {
                amount: 1,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();

        let (outcome, _) = enc
            .apply_hp_change(&tracker, "fighter", HpChange::Heal { amount: 50 })
            .unwrap();
        assert_eq!(outcome.current, 20);
        assert_eq!(outcome.healed, Some(20));
        let p = enc.participant("fighter").unwrap();
        assert_eq!(p.death_saves, DeathSaves::default());
        assert_eq!(p.status(), EntityStatus::Alive);
    }

    #[test]
    fn test_dead_are_skipped_unconscious_keep_turn() {
        let tracker = ConditionTracker::new();
        let mut enc = Encounter::new(
            CreateEncounter::new(vec![
                ParticipantSpec::new("a", "A", 10).with_initiative(20),
                ParticipantSpec::new("b", "B", 10).with_initiative(15),
                ParticipantSpec::new("c", "C", 10).with_initiative(10),
            ]),
            None,
        )
        .unwrap();

        // b dies outright, c is merely down
        let massive = HpChange::Damage {
            amount: 30,
            damage_type: None,
            critical: false,
        };
        let down = HpChange::Damage {
            amount: 10,
            damage_type: None,
            critical: false,
        };
        enc.apply_hp_change(&tracker, "b", massive).unwrap();
        enc.apply_hp_change(&tracker, "c", down).unwrap();

        let (turn, _) = enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(turn.combatant.id, "c");
        assert_eq!(turn.skipped, vec!["b".to_string()]);
        assert!(turn.death_save_reminder.is_some());

        let (turn, _) = enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(turn.combatant.id, "a");
        assert_eq!(turn.round, 2);
        assert!(turn.death_save_reminder.is_none());
    }

    #[test]
    fn test_no_active_participants() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        for id in ["fighter", "goblin"] {
            enc.apply_hp_change(
                &tracker,
                id,
                HpChange::Damage {
                    amount: 20,
                    damage_type: None,
                    critical: false,
                },
            )
            .unwrap();
        }
        let err = enc.advance_turn(&tracker, false, false).unwrap_err();
        assert!(matches!(err, CombatError::NoActiveParticipants(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_advance_ticks_ending_combatant() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        tracker
            .add(
                "fighter",
                NewCondition::new(ConditionKind::Poisoned, ConditionDuration::rounds(1)),
            )
            .unwrap();
        tracker
            .add(
                "goblin",
                NewCondition::new(ConditionKind::Prone, ConditionDuration::rounds(1)),
            )
            .unwrap();

        let (turn, deltas) = enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(turn.expired.len(), 1);
        assert_eq!(turn.expired[0].kind, ConditionKind::Poisoned);
        assert!(tracker.has("goblin", ConditionKind::Prone));
        assert!(matches!(
            &deltas[0],
            StateDelta::ConditionRemoved { entity_id, .. } if entity_id == "fighter"
        ));
    }

    #[test]
    fn test_death_save_transitions() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        enc.apply_hp_change(
            &tracker,
            "fighter",
            HpChange::Damage {
                amount: 20,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();

        enc.roller = DiceRoller::new(RollSource::Forced { value: 12 });
        for _ in 0..3 {
            enc.roll_death_save("fighter").unwrap();
        }
        let p = enc.participant("fighter").unwrap();
        assert!(p.is_stable());
        assert_eq!(p.status(), EntityStatus::Stable);
        assert!(enc.roll_death_save("fighter").is_err());

        // Damage knocks a stable creature back into dying
        enc.apply_hp_change(
            &tracker,
            "fighter",
            HpChange::Damage {
                amount: 1,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();
        enc.roller = DiceRoller::new(RollSource::Forced { value: 1 });
        let (outcome, _) = enc.roll_death_save("fighter").unwrap();
        assert_eq!(outcome.failures, 3);
        assert!(outcome.dead);
    }

    #[test]
    fn test_natural_20_death_save_revives() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        enc.apply_hp_change(
            &tracker,
            "goblin",
            HpChange::Damage {
                amount: 7,
                damage_type: None,
                critical: false,
            },
        )
        .unwrap();

        enc.roller = DiceRoller::new(RollSource::Forced { value: 20 });
        let (outcome, deltas) = enc.roll_death_save("goblin").unwrap();
        assert!(outcome.revived);
        assert_eq!(outcome.hp, 1);
        assert!(deltas.iter().any(|d| matches!(d, StateDelta::HpChanged { current: 1, .. })));
    }

    #[test]
    fn test_hazard_and_aura_hooks() {
        let tracker = ConditionTracker::new();
        let mut request = CreateEncounter::new(vec![
            ParticipantSpec::new("paladin", "Paladin", 30)
                .with_initiative(15)
                .at(0, 0)
                .with_aura(Aura {
                    name: Some("Aura of Vitality".to_string()),
                    radius_feet: 10,
                    damage: None,
                    heal: Some("1d4".to_string()),
                    damage_type: None,
                    affects: AuraTarget::Allies,
                }),
            ParticipantSpec::new("cleric", "Cleric", 20)
                .with_initiative(10)
                .with_hp(10)
                .at(2, 2),
        ]);
        request.terrain.regions.push(TerrainRegion {
            name: "Lava".to_string(),
            kind: RegionKind::Hazard,
            x: 2,
            y: 2,
            width: 1,
            height: 1,
            damage: Some("1d4".to_string()),
            damage_type: Some(DamageType::Fire),
        });
        let mut enc = Encounter::new(request, None).unwrap();
        enc.roller = DiceRoller::new(RollSource::Forced { value: 3 });

        let (turn, _) = enc.advance_turn(&tracker, true, true).unwrap();
        assert_eq!(turn.effects.len(), 2);
        assert_eq!(turn.effects[0].source, "Lava");
        assert_eq!(turn.effects[0].damage.as_ref().map(|d| d.final_damage), Some(3));
        assert_eq!(turn.effects[1].source, "Aura of Vitality");
        assert_eq!(turn.effects[1].healed, Some(3));
        assert_eq!(enc.participant("cleric").unwrap().hp, 10);

        // Hooks are opt-in
        enc.advance_turn(&tracker, false, false).unwrap();
        let (turn, _) = enc.advance_turn(&tracker, false, false).unwrap();
        assert!(turn.effects.is_empty());
        assert_eq!(enc.participant("cleric").unwrap().hp, 10);
    }

    #[test]
    fn test_add_and_remove_keep_active_combatant() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        enc.advance_turn(&tracker, false, false).unwrap();
        assert_eq!(enc.active_id(), "goblin");

        enc.add_participant(ParticipantSpec::new("rogue", "Rogue", 12).with_initiative(18))
            .unwrap();
        assert_eq!(enc.initiative_order(), ["rogue", "fighter", "goblin"]);
        assert_eq!(enc.active_id(), "goblin");

        enc.remove_participant(&tracker, "rogue").unwrap();
        assert_eq!(enc.active_id(), "goblin");

        enc.remove_participant(&tracker, "goblin").unwrap();
        assert_eq!(enc.active_id(), "fighter");
        assert!(enc.remove_participant(&tracker, "fighter").is_err());
        assert!(matches!(
            enc.remove_participant(&tracker, "ghost"),
            Err(CombatError::ParticipantNotFound(_))
        ));
    }

    #[test]
    fn test_ended_encounter_rejects_mutation() {
        let tracker = ConditionTracker::new();
        let mut enc = duel();
        assert_eq!(enc.end().unwrap(), StateDelta::EncounterEnded { round: 1 });

        let err = enc.advance_turn(&tracker, false, false).unwrap_err();
        assert!(matches!(err, CombatError::EncounterEnded(_)));
        assert!(enc.end().is_err());
    }

    #[test]
    fn test_effective_speed() {
        let tracker = ConditionTracker::new();
        let enc = duel();
        let fighter = enc.participant("fighter").unwrap();
        assert_eq!(effective_speed(fighter, &tracker), 30);

        tracker.apply_exhaustion("fighter", 2);
        assert_eq!(effective_speed(fighter, &tracker), 15);

        tracker
            .add(
                "fighter",
                NewCondition::new(ConditionKind::Grappled, ConditionDuration::Permanent),
            )
            .unwrap();
        assert_eq!(effective_speed(fighter, &tracker), 0);
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0, 0);
        assert_eq!(a.distance_feet(&Position::new(3, 1)), 15);
        assert_eq!(a.distance_feet(&Position { x: 1, y: 1, z: Some(4) }), 20);

        let corner = Position::new(i32::MIN, i32::MIN);
        assert_eq!(corner.squares_to(&Position::new(i32::MAX, 0)), u32::MAX);
        assert_eq!(corner.distance_feet(&Position::new(i32::MAX, 0)), u32::MAX);
    }
}
