//! State deltas
//!
//! Minimal tagged descriptions of one engine mutation, published to
//! observers instead of resending full encounter state.

use serde::Serialize;
use uuid::Uuid;

use super::conditions::{ConditionDuration, ConditionKind};
use super::encounter::Position;

/// Life state of an entity as shown to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Alive,
    Unconscious,
    Stable,
    Dead,
}

impl EntityStatus {
    /// Derive from hit points and the entity's condition/marker names
    pub fn derive<S: AsRef<str>>(hp: i32, markers: &[S]) -> Self {
        let has = |name: &str| markers.iter().any(|m| m.as_ref() == name);
        if hp > 0 {
            EntityStatus::Alive
        } else if has("dead") {
            EntityStatus::Dead
        } else if has("stable") {
            EntityStatus::Stable
        } else {
            EntityStatus::Unconscious
        }
    }
}

/// One state change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StateDelta {
    EntityMoved {
        entity_id: String,
        from: Position,
        to: Position,
    },
    HpChanged {
        entity_id: String,
        previous: i32,
        current: i32,
        max: i32,
    },
    ConditionAdded {
        entity_id: String,
        condition: ConditionKind,
        instance_id: Uuid,
        duration: ConditionDuration,
    },
    ConditionRemoved {
        entity_id: String,
        condition: ConditionKind,
        reason: String,
    },
    ExhaustionChanged {
        entity_id: String,
        previous: u8,
        level: u8,
    },
    TurnChanged {
        round: u32,
        turn_index: usize,
        active_entity_id: String,
    },
    EntityAdded {
        entity_id: String,
        name: String,
        position: Position,
        hp: i32,
        max_hp: i32,
        armor_class: i32,
        is_enemy: bool,
    },
    EntityRemoved {
        entity_id: String,
    },
    StatusChanged {
        entity_id: String,
        status: EntityStatus,
    },
    AttackResolved {
        attacker_id: String,
        target_id: String,
        natural: u32,
        total: i32,
        target_ac: i32,
        hit: bool,
        critical: bool,
        damage: i32,
    },
    EncounterEnded {
        round: u32,
    },
}

/// Receives deltas as an operation commits, in the order it applied them
pub trait DeltaSink: Send + Sync {
    fn publish(&self, encounter_id: &str, delta: &StateDelta);
}
