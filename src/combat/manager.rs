//! Encounter store
//!
//! One `EncounterManager` per process holds every encounter behind its
//! own mutex together with the conditions of its participants, plus the
//! free-standing dice roller. Deltas produced by an operation go to the
//! registered sink before the encounter lock is released, so observers
//! see them in the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::actions::{ActionOutcome, ActionRequest};
use super::conditions::{
    ConditionInstance, ConditionKind, ConditionSummary, ConditionTracker, ExhaustionOutcome,
    NewCondition, RemoveOutcome, RestKind, RestReport, SaveAttempt, TickReport,
};
use super::delta::{DeltaSink, StateDelta};
use super::dice::{
    BatchEntry, BatchOutcome, DiceError, DiceRoller, RollResult, Vantage, MAX_MODIFIER,
};
use super::encounter::{
    CombatError, CreateEncounter, DeathSaveOutcome, Encounter, EncounterState, EncounterSummary,
    HpChange, HpChangeOutcome, Participant, ParticipantSpec, TurnAdvance,
};

/// An encounter and the conditions on its participants
///
/// Conditions and exhaustion are scoped to the encounter: a participant id
/// reused in another encounter is a different creature.
struct Slot {
    encounter: Mutex<Encounter>,
    conditions: ConditionTracker,
}

type Shared = Arc<Slot>;

pub struct EncounterManager {
    encounters: RwLock<HashMap<String, Shared>>,
    roller: Mutex<DiceRoller>,
    default_seed: Option<u64>,
    sink: Option<Arc<dyn DeltaSink>>,
}

impl Default for EncounterManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EncounterManager {
    /// Create a store; `default_seed` applies to encounters that bring none
    pub fn new(default_seed: Option<u64>) -> Self {
        Self {
            encounters: RwLock::new(HashMap::new()),
            roller: Mutex::new(DiceRoller::from_seed(default_seed)),
            default_seed,
            sink: None,
        }
    }

    /// Publish deltas to `sink` after each operation
    pub fn with_sink(mut self, sink: Arc<dyn DeltaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn get(&self, encounter_id: &str) -> Result<Shared, CombatError> {
        self.encounters
            .read()
            .get(encounter_id)
            .cloned()
            .ok_or_else(|| CombatError::EncounterNotFound(encounter_id.to_string()))
    }

    fn publish(&self, encounter_id: &str, deltas: &[StateDelta]) {
        if let Some(sink) = &self.sink {
            for delta in deltas {
                sink.publish(encounter_id, delta);
            }
        }
    }

    /// Run `op` under the encounter's lock and publish its deltas before
    /// releasing it
    ///
    /// Lock order is encounter, then whatever the sink takes. Subscribing
    /// follows the same order (see [`EncounterManager::with_state`]).
    fn mutate<T>(
        &self,
        encounter_id: &str,
        op: impl FnOnce(&mut Encounter, &ConditionTracker) -> Result<(T, Vec<StateDelta>), CombatError>,
    ) -> Result<T, CombatError> {
        let slot = self.get(encounter_id)?;
        let mut encounter = slot.encounter.lock();
        let (value, deltas) = op(&mut *encounter, &slot.conditions)?;
        self.publish(encounter_id, &deltas);
        Ok(value)
    }

    fn read<T>(
        &self,
        encounter_id: &str,
        op: impl FnOnce(&Encounter, &ConditionTracker) -> T,
    ) -> Result<T, CombatError> {
        let slot = self.get(encounter_id)?;
        let encounter = slot.encounter.lock();
        Ok(op(&*encounter, &slot.conditions))
    }

    pub fn create_encounter(&self, request: CreateEncounter) -> Result<EncounterState, CombatError> {
        let encounter = Encounter::new(request, self.default_seed)?;
        let conditions = ConditionTracker::new();
        let state = encounter.state(&conditions);
        info!(
            "Encounter '{}' ({}) started with {} participants",
            state.name,
            state.id,
            state.participants.len()
        );
        self.encounters.write().insert(
            encounter.id.clone(),
            Arc::new(Slot {
                encounter: Mutex::new(encounter),
                conditions,
            }),
        );
        Ok(state)
    }

    pub fn get_encounter_state(&self, encounter_id: &str) -> Result<EncounterState, CombatError> {
        self.read(encounter_id, |e, tracker| e.state(tracker))
    }

    /// Hand the current state to `op` while the encounter lock is held
    ///
    /// No delta for this encounter can be published while `op` runs.
    pub fn with_state<T>(
        &self,
        encounter_id: &str,
        op: impl FnOnce(EncounterState) -> T,
    ) -> Result<T, CombatError> {
        self.read(encounter_id, |e, tracker| op(e.state(tracker)))
    }

    /// Every encounter, oldest first
    pub fn list_encounters(&self) -> Vec<EncounterSummary> {
        let slots: Vec<Shared> = self.encounters.read().values().cloned().collect();
        let mut summaries: Vec<EncounterSummary> =
            slots.iter().map(|s| s.encounter.lock().summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn advance_turn(
        &self,
        encounter_id: &str,
        process_effects: bool,
        process_auras: bool,
    ) -> Result<TurnAdvance, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.advance_turn(tracker, process_effects, process_auras)
        })
    }

    pub fn execute_action(
        &self,
        encounter_id: &str,
        request: ActionRequest,
    ) -> Result<ActionOutcome, CombatError> {
        self.mutate(encounter_id, |e, tracker| e.execute_action(tracker, request))
    }

    pub fn roll_death_save(
        &self,
        encounter_id: &str,
        participant_id: &str,
    ) -> Result<DeathSaveOutcome, CombatError> {
        self.mutate(encounter_id, |e, _| e.roll_death_save(participant_id))
    }

    pub fn apply_hp_change(
        &self,
        encounter_id: &str,
        target_id: &str,
        change: HpChange,
    ) -> Result<HpChangeOutcome, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.apply_hp_change(tracker, target_id, change)
        })
    }

    pub fn add_participant(
        &self,
        encounter_id: &str,
        spec: ParticipantSpec,
    ) -> Result<Participant, CombatError> {
        self.mutate(encounter_id, |e, _| e.add_participant(spec))
    }

    pub fn remove_participant(
        &self,
        encounter_id: &str,
        participant_id: &str,
    ) -> Result<Participant, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.remove_participant(tracker, participant_id)
        })
    }

    /// Apply a condition to a member of the encounter
    pub fn add_condition(
        &self,
        encounter_id: &str,
        target_id: &str,
        condition: NewCondition,
    ) -> Result<ConditionInstance, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            e.index_of(target_id)?;
            let instance = tracker.add(target_id, condition)?;
            let delta = StateDelta::ConditionAdded {
                entity_id: target_id.to_string(),
                condition: instance.kind,
                instance_id: instance.id,
                duration: instance.duration,
            };
            Ok((instance, vec![delta]))
        })
    }

    pub fn remove_condition(
        &self,
        encounter_id: &str,
        target_id: &str,
        kind: ConditionKind,
        source_id: Option<&str>,
    ) -> Result<RemoveOutcome, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            e.index_of(target_id)?;
            let outcome = tracker.remove(target_id, kind, source_id);
            let deltas = match &outcome {
                RemoveOutcome::Removed { .. } => vec![StateDelta::ConditionRemoved {
                    entity_id: target_id.to_string(),
                    condition: kind,
                    reason: "removed".to_string(),
                }],
                RemoveOutcome::NotAffected { .. } => Vec::new(),
            };
            Ok((outcome, deltas))
        })
    }

    /// Tick a member's round durations outside of turn advancement
    pub fn tick_conditions(
        &self,
        encounter_id: &str,
        target_id: &str,
    ) -> Result<TickReport, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            e.index_of(target_id)?;
            let report = tracker.tick(target_id);
            let deltas = report
                .expired
                .iter()
                .map(|c| StateDelta::ConditionRemoved {
                    entity_id: target_id.to_string(),
                    condition: c.kind,
                    reason: "expired".to_string(),
                })
                .collect();
            Ok((report, deltas))
        })
    }

    /// Roll a saving throw against a save-ends condition on the encounter's dice
    pub fn attempt_save(
        &self,
        encounter_id: &str,
        target_id: &str,
        instance_id: Uuid,
        modifier: i32,
    ) -> Result<SaveAttempt, CombatError> {
        if modifier.unsigned_abs() > MAX_MODIFIER.unsigned_abs() {
            return Err(CombatError::validation(format!(
                "save modifier must be within ±{}",
                MAX_MODIFIER
            )));
        }
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            e.index_of(target_id)?;
            let roll = e.roller.roll_d20(modifier, Vantage::Normal);
            let attempt = tracker.attempt_save(target_id, instance_id, roll.total)?;
            let deltas = if attempt.success {
                vec![StateDelta::ConditionRemoved {
                    entity_id: target_id.to_string(),
                    condition: attempt.kind,
                    reason: "saved".to_string(),
                }]
            } else {
                Vec::new()
            };
            Ok((attempt, deltas))
        })
    }

    pub fn conditions_of(
        &self,
        encounter_id: &str,
        target_id: &str,
    ) -> Result<ConditionSummary, CombatError> {
        self.read(encounter_id, |e, tracker| {
            e.index_of(target_id).map(|_| tracker.summary(target_id))
        })?
    }

    /// Rest a member of the encounter
    pub fn rest(
        &self,
        encounter_id: &str,
        target_id: &str,
        rest: RestKind,
    ) -> Result<RestReport, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            e.index_of(target_id)?;
            let report = tracker.rest(target_id, rest);

            let mut deltas: Vec<StateDelta> = report
                .cleared
                .iter()
                .map(|c| StateDelta::ConditionRemoved {
                    entity_id: target_id.to_string(),
                    condition: c.kind,
                    reason: "rest".to_string(),
                })
                .collect();
            if report.exhaustion_after != report.exhaustion_before {
                deltas.push(StateDelta::ExhaustionChanged {
                    entity_id: target_id.to_string(),
                    previous: report.exhaustion_before,
                    level: report.exhaustion_after,
                });
            }
            Ok((report, deltas))
        })
    }

    /// Change a member's exhaustion; level 6 kills it
    pub fn apply_exhaustion(
        &self,
        encounter_id: &str,
        target_id: &str,
        delta: i32,
    ) -> Result<ExhaustionOutcome, CombatError> {
        self.mutate(encounter_id, |e, tracker| {
            e.ensure_active()?;
            let index = e.index_of(target_id)?;
            let outcome = tracker.apply_exhaustion(target_id, delta);
            let mut deltas = Vec::new();
            if outcome.level() != outcome.previous() {
                deltas.push(StateDelta::ExhaustionChanged {
                    entity_id: target_id.to_string(),
                    previous: outcome.previous(),
                    level: outcome.level(),
                });
            }
            if let ExhaustionOutcome::Dead { .. } = outcome {
                if !e.participant_at(index).is_dead() {
                    info!("{} died of exhaustion in {}", target_id, encounter_id);
                    deltas.extend(e.kill(index));
                }
            }
            debug!("Exhaustion on {} is now {}", target_id, outcome.level());
            Ok((outcome, deltas))
        })
    }

    pub fn end_encounter(&self, encounter_id: &str) -> Result<EncounterState, CombatError> {
        let state = self.mutate(encounter_id, |e, tracker| {
            let delta = e.end()?;
            Ok((e.state(tracker), vec![delta]))
        })?;
        info!("Encounter {} ended after {} rounds", encounter_id, state.round);
        Ok(state)
    }

    /// Roll free-standing dice on the process roller
    pub fn roll_dice(
        &self,
        notation: &str,
        advantage: bool,
        disadvantage: bool,
    ) -> Result<RollResult, DiceError> {
        let vantage = Vantage::from_flags(advantage, disadvantage)?;
        self.roller.lock().roll_notation(notation, vantage)
    }

    pub fn roll_batch(&self, entries: &[BatchEntry]) -> Result<BatchOutcome, DiceError> {
        self.roller.lock().roll_batch(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::conditions::ConditionDuration;
    use crate::combat::delta::EntityStatus;
    use crate::combat::encounter::ErrorKind;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(String, StateDelta)>>,
    }

    impl DeltaSink for RecordingSink {
        fn publish(&self, encounter_id: &str, delta: &StateDelta) {
            self.seen.lock().push((encounter_id.to_string(), delta.clone()));
        }
    }

    fn duel() -> CreateEncounter {
        CreateEncounter::new(vec![
            ParticipantSpec::new("hero", "Hero", 20).with_initiative(10),
            ParticipantSpec::new("ogre", "Ogre", 30)
                .with_initiative(5)
                .enemy(),
        ])
    }

    #[test]
    fn test_create_get_list() {
        let manager = EncounterManager::new(Some(1));
        let state = manager.create_encounter(duel()).unwrap();
        assert_eq!(state.round, 1);
        assert_eq!(state.active_participant_id, "hero");
        assert_eq!(state.seed, Some(1));

        let fetched = manager.get_encounter_state(&state.id).unwrap();
        assert_eq!(fetched.id, state.id);
        assert_eq!(manager.list_encounters().len(), 1);

        let err = manager.get_encounter_state("missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_deltas_published_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let manager = EncounterManager::new(None).with_sink(sink.clone());
        let id = manager.create_encounter(duel()).unwrap().id;

        manager.advance_turn(&id, false, false).unwrap();
        manager
            .add_condition(
                &id,
                "hero",
                NewCondition::new(ConditionKind::Prone, ConditionDuration::rounds(1)),
            )
            .unwrap();

        let seen = sink.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(eid, _)| eid == &id));
        assert!(matches!(
            seen[0].1,
            StateDelta::TurnChanged {
                round: 1,
                turn_index: 1,
                ..
            }
        ));
        assert!(matches!(seen[1].1, StateDelta::ConditionAdded { .. }));
    }

    #[test]
    fn test_failed_operation_publishes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let manager = EncounterManager::new(None).with_sink(sink.clone());
        let id = manager.create_encounter(duel()).unwrap().id;

        let err = manager
            .add_condition(
                &id,
                "stranger",
                NewCondition::new(ConditionKind::Prone, ConditionDuration::rounds(1)),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(sink.seen.lock().is_empty());
        let err = manager.conditions_of(&id, "stranger").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_ended_encounter() {
        let manager = EncounterManager::new(None);
        let id = manager.create_encounter(duel()).unwrap().id;
        let state = manager.end_encounter(&id).unwrap();
        assert_eq!(state.status, crate::combat::encounter::EncounterStatus::Ended);

        let err = manager.advance_turn(&id, false, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(manager
            .execute_action(&id, ActionRequest::attack("hero", "ogre"))
            .is_err());
        // Still readable
        assert!(manager.get_encounter_state(&id).is_ok());
    }

    #[test]
    fn test_remove_condition_is_informational() {
        let manager = EncounterManager::new(None);
        let id = manager.create_encounter(duel()).unwrap().id;
        let outcome = manager
            .remove_condition(&id, "hero", ConditionKind::Blinded, None)
            .unwrap();
        assert!(outcome.removed().is_empty());
    }

    #[test]
    fn test_exhaustion_death_marks_participant() {
        let sink = Arc::new(RecordingSink::default());
        let manager = EncounterManager::new(None).with_sink(sink.clone());
        let id = manager.create_encounter(duel()).unwrap().id;

        let outcome = manager.apply_exhaustion(&id, "ogre", 6).unwrap();
        assert_eq!(outcome.level(), 6);

        let state = manager.get_encounter_state(&id).unwrap();
        let ogre = state
            .participants
            .iter()
            .find(|p| p.participant.id == "ogre")
            .unwrap();
        assert_eq!(ogre.participant.hp, 0);
        assert_eq!(ogre.status, EntityStatus::Dead);
        assert_eq!(ogre.exhaustion, 6);
        let seen = sink.seen.lock();
        assert_eq!(
            seen[0].1,
            StateDelta::ExhaustionChanged {
                entity_id: "ogre".to_string(),
                previous: 0,
                level: 6,
            }
        );
        assert!(seen
            .iter()
            .any(|(_, d)| matches!(d, StateDelta::StatusChanged { status: EntityStatus::Dead, .. })));
    }

    #[test]
    fn test_exhaustion_below_death_is_broadcast() {
        let sink = Arc::new(RecordingSink::default());
        let manager = EncounterManager::new(None).with_sink(sink.clone());
        let id = manager.create_encounter(duel()).unwrap().id;

        manager.apply_exhaustion(&id, "hero", 2).unwrap();
        // Already at the floor: nothing to report
        manager.apply_exhaustion(&id, "ogre", -1).unwrap();

        let seen = sink.seen.lock();
        assert_eq!(
            *seen,
            vec![(
                id.clone(),
                StateDelta::ExhaustionChanged {
                    entity_id: "hero".to_string(),
                    previous: 0,
                    level: 2,
                }
            )]
        );
    }

    #[test]
    fn test_rest_passthrough() {
        let sink = Arc::new(RecordingSink::default());
        let manager = EncounterManager::new(None).with_sink(sink.clone());
        let id = manager.create_encounter(duel()).unwrap().id;
        manager
            .add_condition(
                &id,
                "hero",
                NewCondition::new(ConditionKind::Frightened, ConditionDuration::UntilRest),
            )
            .unwrap();
        manager.apply_exhaustion(&id, "hero", 2).unwrap();
        sink.seen.lock().clear();

        let report = manager.rest(&id, "hero", RestKind::Long).unwrap();
        assert_eq!(report.cleared.len(), 1);
        assert_eq!(report.exhaustion_after, 1);
        assert_eq!(manager.conditions_of(&id, "hero").unwrap().exhaustion, 1);

        let seen: Vec<StateDelta> = sink.seen.lock().iter().map(|(_, d)| d.clone()).collect();
        assert_eq!(
            seen,
            vec![
                StateDelta::ConditionRemoved {
                    entity_id: "hero".to_string(),
                    condition: ConditionKind::Frightened,
                    reason: "rest".to_string(),
                },
                StateDelta::ExhaustionChanged {
                    entity_id: "hero".to_string(),
                    previous: 2,
                    level: 1,
                },
            ]
        );

        // A short rest with nothing to clear is silent
        manager.rest(&id, "hero", RestKind::Short).unwrap();
        assert_eq!(sink.seen.lock().len(), 2);
    }

    #[test]
    fn test_conditions_scoped_per_encounter() {
        let manager = EncounterManager::new(None);
        let first = manager.create_encounter(duel()).unwrap().id;
        let second = manager.create_encounter(duel()).unwrap().id;

        manager
            .add_condition(
                &first,
                "ogre",
                NewCondition::new(ConditionKind::Poisoned, ConditionDuration::rounds(3)),
            )
            .unwrap();
        manager.apply_exhaustion(&first, "ogre", 1).unwrap();

        // Same id, different creature
        let other = manager.conditions_of(&second, "ogre").unwrap();
        assert!(other.conditions.is_empty());
        assert_eq!(other.exhaustion, 0);

        manager.tick_conditions(&second, "ogre").unwrap();
        manager.apply_exhaustion(&second, "ogre", 3).unwrap();
        manager.rest(&second, "ogre", RestKind::Long).unwrap();
        manager.remove_participant(&second, "ogre").unwrap();

        let summary = manager.conditions_of(&first, "ogre").unwrap();
        assert_eq!(summary.conditions.len(), 1);
        assert_eq!(summary.conditions[0].kind, ConditionKind::Poisoned);
        assert_eq!(summary.conditions[0].durations, vec!["3 rounds".to_string()]);
        assert_eq!(summary.exhaustion, 1);
    }

    #[test]
    fn test_deltas_follow_application_order() {
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(EncounterManager::new(None).with_sink(sink.clone()));
        let id = manager
            .create_encounter(CreateEncounter::new(vec![
                ParticipantSpec::new("hero", "Hero", 20).with_initiative(10),
                ParticipantSpec::new("golem", "Golem", 1000)
                    .with_initiative(5)
                    .enemy(),
            ]))
            .unwrap()
            .id;

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let manager = manager.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let change = if worker % 2 == 0 {
                            HpChange::Damage {
                                amount: 3,
                                damage_type: None,
                                critical: false,
                            }
                        } else {
                            HpChange::Heal { amount: 2 }
                        };
                        manager.apply_hp_change(&id, "golem", change).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let hp: Vec<(i32, i32)> = sink
            .seen
            .lock()
            .iter()
            .filter_map(|(_, d)| match d {
                StateDelta::HpChanged {
                    entity_id,
                    previous,
                    current,
                    ..
                } if entity_id == "golem" => Some((*previous, *current)),
                _ => None,
            })
            .collect();
        assert!(!hp.is_empty());
        assert_eq!(hp[0].0, 1000);
        for pair in hp.windows(2) {
            assert_eq!(pair[1].0, pair[0].1, "deltas published out of order");
        }

        let state = manager.get_encounter_state(&id).unwrap();
        let golem = state
            .participants
            .iter()
            .find(|p| p.participant.id == "golem")
            .unwrap();
        assert_eq!(hp.last().map(|h| h.1), Some(golem.participant.hp));
    }

    #[test]
    fn test_attempt_save() {
        let manager = EncounterManager::new(None);
        let id = manager.create_encounter(duel()).unwrap().id;
        let instance = manager
            .add_condition(
                &id,
                "ogre",
                NewCondition::new(
                    ConditionKind::Paralyzed,
                    ConditionDuration::SaveEnds {
                        dc: 5,
                        ability: crate::combat::conditions::Ability::Constitution,
                    },
                ),
            )
            .unwrap();

        // +30 always beats DC 5
        let attempt = manager.attempt_save(&id, "ogre", instance.id, 30).unwrap();
        assert!(attempt.success);
        assert!(manager
            .conditions_of(&id, "ogre")
            .unwrap()
            .conditions
            .is_empty());

        let err = manager
            .attempt_save(&id, "ogre", instance.id, 30)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = manager
            .attempt_save(&id, "ogre", instance.id, i32::MAX)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_dice_on_process_roller() {
        let manager = EncounterManager::new(Some(5));
        let roll = manager.roll_dice("1d20", true, false).unwrap();
        assert_eq!(roll.rolls.len(), 2);
        assert!(manager.roll_dice("1d20", true, true).is_err());

        let entries: Vec<BatchEntry> = (0..21).map(|_| BatchEntry::new("1d6")).collect();
        let err = manager.roll_batch(&entries).unwrap_err();
        assert!(err.to_string().contains("too many rolls"));
    }

    #[test]
    fn test_encounters_are_independent_across_threads() {
        let manager = Arc::new(EncounterManager::new(None));
        let ids: Vec<String> = (0..4)
            .map(|_| manager.create_encounter(duel()).unwrap().id)
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        manager.advance_turn(&id, false, false).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for id in ids {
            let state = manager.get_encounter_state(&id).unwrap();
            assert_eq!(state.round, 26);
            assert_eq!(state.turn_index, 0);
        }
    }
}
