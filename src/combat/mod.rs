//! Combat engine
//!
//! Implements D&D 5e encounter rules with:
//! - Dice notation, advantage/disadvantage and batch rolls
//! - Damage types with immunity, resistance and vulnerability
//! - Conditions with durations, plus exhaustion
//! - Initiative, turns and rounds, action economy and death saves
//! - State deltas for observers

mod actions;
mod conditions;
mod damage;
mod delta;
mod dice;
mod encounter;
mod manager;

pub use actions::{ActionOutcome, ActionRequest, ActionType};
pub use conditions::{
    exhaustion_effects, Ability, ConditionDuration, ConditionError, ConditionInstance,
    ConditionKind, ConditionSummary, ConditionTracker, ExhaustionOutcome, NewCondition,
    RemoveOutcome, RestKind, RestReport, SaveAttempt, SavingThrow, TickReport, MAX_EXHAUSTION,
};
pub use damage::{DamageModifier, DamageProfile, DamageResult, DamageType};
pub use delta::{DeltaSink, EntityStatus, StateDelta};
pub use dice::{
    BatchEntry, BatchEntryResult, BatchOutcome, DiceError, DiceExpression, DiceRoller, Keep,
    RollResult, RollSource, Vantage, MAX_BATCH_ROLLS,
};
pub use encounter::{
    effective_speed, ActionCategory, ActionEconomy, Aura, AuraTarget, CombatError,
    CreateEncounter, DeathSaveOutcome, DeathSaves, Encounter, EncounterState, EncounterStatus,
    EncounterSummary, ErrorKind, HpChange, HpChangeOutcome, Lighting, Participant,
    ParticipantSpec, ParticipantState, Position, RegionKind, Terrain, TerrainRegion,
    TurnAdvance, TurnEffect,
};
pub use manager::EncounterManager;
