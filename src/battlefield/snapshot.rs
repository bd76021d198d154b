//! Battlefield snapshots
//!
//! The full picture an observer needs to render an encounter before it
//! starts applying deltas.

use serde::Serialize;

use crate::combat::{
    EncounterManager, EncounterState, EncounterStatus, EntityStatus, Lighting, Position,
    TerrainRegion,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: String,
    pub name: String,
    pub position: Position,
    pub hp: i32,
    pub max_hp: i32,
    pub armor_class: i32,
    pub is_enemy: bool,
    pub status: EntityStatus,
    pub conditions: Vec<String>,
    pub exhaustion: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BattlefieldState {
    pub encounter_id: String,
    pub name: String,
    pub status: EncounterStatus,
    pub width: u32,
    pub height: u32,
    pub lighting: Lighting,
    pub regions: Vec<TerrainRegion>,
    pub entities: Vec<EntitySnapshot>,
    pub round: u32,
    pub current_turn_entity_id: String,
}

impl From<&EncounterState> for BattlefieldState {
    fn from(state: &EncounterState) -> Self {
        let entities = state
            .participants
            .iter()
            .map(|p| {
                let mut names: Vec<String> =
                    p.conditions.iter().map(|c| c.as_str().to_string()).collect();
                if p.participant.death_saves.dead {
                    names.push("dead".to_string());
                }
                if p.participant.death_saves.stable {
                    names.push("stable".to_string());
                }
                EntitySnapshot {
                    id: p.participant.id.clone(),
                    name: p.participant.name.clone(),
                    position: p.participant.position,
                    hp: p.participant.hp,
                    max_hp: p.participant.max_hp,
                    armor_class: p.participant.armor_class,
                    is_enemy: p.participant.is_enemy,
                    status: EntityStatus::derive(p.participant.hp, &names),
                    conditions: names,
                    exhaustion: p.exhaustion,
                }
            })
            .collect();

        Self {
            encounter_id: state.id.clone(),
            name: state.name.clone(),
            status: state.status,
            width: state.terrain.width,
            height: state.terrain.height,
            lighting: state.lighting,
            regions: state.terrain.regions.clone(),
            entities,
            round: state.round,
            current_turn_entity_id: state.active_participant_id.clone(),
        }
    }
}

/// Anything that can describe an encounter for observers
pub trait SnapshotSource {
    /// Build a snapshot and pass it to `attach` while the encounter is held,
    /// so no delta is published between the two. Returns false when the
    /// encounter doesn't exist.
    fn attach_snapshot(
        &self,
        encounter_id: &str,
        attach: &mut dyn FnMut(BattlefieldState),
    ) -> bool;

    fn snapshot(&self, encounter_id: &str) -> Option<BattlefieldState> {
        let mut snapshot = None;
        self.attach_snapshot(encounter_id, &mut |state: BattlefieldState| {
            snapshot = Some(state)
        });
        snapshot
    }
}

impl SnapshotSource for EncounterManager {
    fn attach_snapshot(
        &self,
        encounter_id: &str,
        attach: &mut dyn FnMut(BattlefieldState),
    ) -> bool {
        self.with_state(encounter_id, |state| attach(BattlefieldState::from(&state)))
            .is_ok()
    }
}
