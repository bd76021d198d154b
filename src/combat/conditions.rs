//! Condition tracking
//!
//! Tracks D&D 5e conditions on creatures:
//! - The fixed condition vocabulary (blinded, charmed, ... unconscious)
//! - Durations: rounds, concentration, save-ends, until rest, permanent
//! - Exhaustion levels 0-6 (6 is death)
//! - Rests clearing conditions and exhaustion

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::dice::Vantage;

/// Highest exhaustion level; reaching it kills the creature
pub const MAX_EXHAUSTION: u8 = 6;

/// Condition tracker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("condition {0} does not end on a saving throw")]
    NotSaveEnds(Uuid),

    #[error("round durations must be at least 1")]
    ZeroRounds,
}

/// The D&D 5e condition vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    Blinded,
    Charmed,
    Deafened,
    Frightened,
    Grappled,
    Incapacitated,
    Invisible,
    Paralyzed,
    Petrified,
    Poisoned,
    Prone,
    Restrained,
    Stunned,
    Unconscious,
}

impl ConditionKind {
    pub fn all() -> &'static [ConditionKind] {
        &[
            ConditionKind::Blinded,
            ConditionKind::Charmed,
            ConditionKind::Deafened,
            ConditionKind::Frightened,
            ConditionKind::Grappled,
            ConditionKind::Incapacitated,
            ConditionKind::Invisible,
            ConditionKind::Paralyzed,
            ConditionKind::Petrified,
            ConditionKind::Poisoned,
            ConditionKind::Prone,
            ConditionKind::Restrained,
            ConditionKind::Stunned,
            ConditionKind::Unconscious,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionKind::Blinded => "blinded",
            ConditionKind::Charmed => "charmed",
            ConditionKind::Deafened => "deafened",
            ConditionKind::Frightened => "frightened",
            ConditionKind::Grappled => "grappled",
            ConditionKind::Incapacitated => "incapacitated",
            ConditionKind::Invisible => "invisible",
            ConditionKind::Paralyzed => "paralyzed",
            ConditionKind::Petrified => "petrified",
            ConditionKind::Poisoned => "poisoned",
            ConditionKind::Prone => "prone",
            ConditionKind::Restrained => "restrained",
            ConditionKind::Stunned => "stunned",
            ConditionKind::Unconscious => "unconscious",
        }
    }

    /// Rules text shown once per kind
    pub fn description(&self) -> &'static str {
        match self {
            ConditionKind::Blinded => {
                "Can't see; auto-fails sight checks. Attacks against have advantage, its attacks have disadvantage."
            }
            ConditionKind::Charmed => {
                "Can't attack the charmer; the charmer has advantage on social checks against it."
            }
            ConditionKind::Deafened => "Can't hear; auto-fails hearing checks.",
            ConditionKind::Frightened => {
                "Disadvantage on checks and attacks while the source is in sight; can't move closer to it."
            }
            ConditionKind::Grappled => "Speed becomes 0.",
            ConditionKind::Incapacitated => "Can't take actions or reactions.",
            ConditionKind::Invisible => {
                "Can't be seen. Attacks against have disadvantage, its attacks have advantage."
            }
            ConditionKind::Paralyzed => {
                "Incapacitated, can't move or speak. Fails Str/Dex saves; melee hits within 5 ft are critical."
            }
            ConditionKind::Petrified => {
                "Turned to stone: incapacitated, resistant to all damage, fails Str/Dex saves."
            }
            ConditionKind::Poisoned => "Disadvantage on attack rolls and ability checks.",
            ConditionKind::Prone => {
                "Disadvantage on attacks. Melee attacks against have advantage, ranged attacks disadvantage."
            }
            ConditionKind::Restrained => {
                "Speed 0. Attacks against have advantage, its attacks and Dex saves have disadvantage."
            }
            ConditionKind::Stunned => {
                "Incapacitated, can't move, speaks falteringly. Fails Str/Dex saves; attacks against have advantage."
            }
            ConditionKind::Unconscious => {
                "Incapacitated, drops what it holds, falls prone. Melee hits within 5 ft are critical."
            }
        }
    }

    /// Prevents actions and reactions
    pub fn incapacitates(&self) -> bool {
        matches!(
            self,
            ConditionKind::Incapacitated
                | ConditionKind::Paralyzed
                | ConditionKind::Petrified
                | ConditionKind::Stunned
                | ConditionKind::Unconscious
        )
    }

    /// Reduces speed to 0
    pub fn immobilizes(&self) -> bool {
        matches!(
            self,
            ConditionKind::Grappled
                | ConditionKind::Restrained
                | ConditionKind::Paralyzed
                | ConditionKind::Petrified
                | ConditionKind::Stunned
                | ConditionKind::Unconscious
        )
    }

    /// Effect on attack rolls made by a creature with this condition
    pub fn attacker_vantage(&self) -> Vantage {
        match self {
            ConditionKind::Blinded
            | ConditionKind::Frightened
            | ConditionKind::Poisoned
            | ConditionKind::Prone
            | ConditionKind::Restrained => Vantage::Disadvantage,
            ConditionKind::Invisible => Vantage::Advantage,
            _ => Vantage::Normal,
        }
    }

    /// Effect on attack rolls made against a creature with this condition
    pub fn defender_vantage(&self, melee: bool) -> Vantage {
        match self {
            ConditionKind::Blinded
            | ConditionKind::Paralyzed
            | ConditionKind::Petrified
            | ConditionKind::Restrained
            | ConditionKind::Stunned
            | ConditionKind::Unconscious => Vantage::Advantage,
            ConditionKind::Prone if melee => Vantage::Advantage,
            ConditionKind::Prone => Vantage::Disadvantage,
            ConditionKind::Invisible => Vantage::Disadvantage,
            _ => Vantage::Normal,
        }
    }

    /// Melee hits from within 5 ft are automatically critical
    pub fn melee_hits_are_critical(&self) -> bool {
        matches!(self, ConditionKind::Paralyzed | ConditionKind::Unconscious)
    }
}

impl FromStr for ConditionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ConditionKind::all()
            .iter()
            .find(|k| k.as_str() == wanted)
            .copied()
            .ok_or_else(|| format!("unknown condition: {}", s))
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ability used for a saving throw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    Strength,
    Dexterity,
    Constitution,
    Intelligence,
    Wisdom,
    Charisma,
}

impl fmt::Display for Ability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Ability::Strength => "STR",
            Ability::Dexterity => "DEX",
            Ability::Constitution => "CON",
            Ability::Intelligence => "INT",
            Ability::Wisdom => "WIS",
            Ability::Charisma => "CHA",
        };
        f.write_str(s)
    }
}

/// Saving throw parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavingThrow {
    pub dc: u32,
    pub ability: Ability,
}

/// How long a condition lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionDuration {
    /// Counts down once per turn-end tick
    Rounds { rounds: u32 },
    /// Lasts until the source's concentration breaks
    Concentration,
    /// Lasts until a successful saving throw
    SaveEnds { dc: u32, ability: Ability },
    /// Cleared by a short or long rest
    UntilRest,
    Permanent,
}

impl ConditionDuration {
    pub fn rounds(rounds: u32) -> Self {
        ConditionDuration::Rounds { rounds }
    }

    pub fn description(&self) -> String {
        match self {
            ConditionDuration::Rounds { rounds } => {
                format!("{} round{}", rounds, if *rounds == 1 { "" } else { "s" })
            }
            ConditionDuration::Concentration => "concentration".to_string(),
            ConditionDuration::SaveEnds { dc, ability } => format!("until DC {} {} save", dc, ability),
            ConditionDuration::UntilRest => "until next rest".to_string(),
            ConditionDuration::Permanent => "permanent".to_string(),
        }
    }
}

/// One applied condition
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionInstance {
    pub id: Uuid,
    pub target_id: String,
    pub kind: ConditionKind,
    pub duration: ConditionDuration,
    pub source_id: Option<String>,
    pub save: Option<SavingThrow>,
    pub applied_at: DateTime<Utc>,
}

impl ConditionInstance {
    /// Remaining rounds for round-count durations
    pub fn remaining_rounds(&self) -> Option<u32> {
        match self.duration {
            ConditionDuration::Rounds { rounds } => Some(rounds),
            _ => None,
        }
    }

    /// The save that ends this condition, if any
    pub fn ending_save(&self) -> Option<SavingThrow> {
        match self.duration {
            ConditionDuration::SaveEnds { dc, ability } => Some(SavingThrow { dc, ability }),
            _ => None,
        }
    }
}

/// Parameters for applying a condition
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCondition {
    pub kind: ConditionKind,
    pub duration: ConditionDuration,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub save: Option<SavingThrow>,
}

impl NewCondition {
    pub fn new(kind: ConditionKind, duration: ConditionDuration) -> Self {
        Self {
            kind,
            duration,
            source_id: None,
            save: None,
        }
    }

    pub fn with_source(mut self, source_id: &str) -> Self {
        self.source_id = Some(source_id.to_string());
        self
    }
}

/// Result of removing a condition kind
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed {
        kind: ConditionKind,
        instances: Vec<ConditionInstance>,
    },
    /// The target did not have the condition
    NotAffected { kind: ConditionKind },
}

impl RemoveOutcome {
    pub fn removed(&self) -> &[ConditionInstance] {
        match self {
            RemoveOutcome::Removed { instances, .. } => instances,
            RemoveOutcome::NotAffected { .. } => &[],
        }
    }
}

/// Conditions that expired on a tick
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub target_id: String,
    pub expired: Vec<ConditionInstance>,
}

/// Result of changing exhaustion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExhaustionOutcome {
    Changed { previous: u8, level: u8 },
    /// Level 6 reached
    Dead { previous: u8 },
}

impl ExhaustionOutcome {
    pub fn level(&self) -> u8 {
        match self {
            ExhaustionOutcome::Changed { level, .. } => *level,
            ExhaustionOutcome::Dead { .. } => MAX_EXHAUSTION,
        }
    }

    pub fn previous(&self) -> u8 {
        match self {
            ExhaustionOutcome::Changed { previous, .. } | ExhaustionOutcome::Dead { previous } => {
                *previous
            }
        }
    }
}

/// Cumulative effects of an exhaustion level
pub fn exhaustion_effects(level: u8) -> Vec<&'static str> {
    const EFFECTS: [&str; 6] = [
        "Disadvantage on ability checks",
        "Speed halved",
        "Disadvantage on attack rolls and saving throws",
        "Hit point maximum halved",
        "Speed reduced to 0",
        "Death",
    ];
    EFFECTS
        .iter()
        .take(level.min(MAX_EXHAUSTION) as usize)
        .copied()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestKind {
    Short,
    Long,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestReport {
    pub target_id: String,
    pub rest: RestKind,
    pub cleared: Vec<ConditionInstance>,
    pub exhaustion_before: u8,
    pub exhaustion_after: u8,
}

/// Outcome of a save against a save-ends condition
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAttempt {
    pub instance_id: Uuid,
    pub kind: ConditionKind,
    pub dc: u32,
    pub total: i32,
    pub success: bool,
}

/// Per-kind view used when describing a target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSummary {
    pub kind: ConditionKind,
    pub description: &'static str,
    pub durations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSummary {
    pub target_id: String,
    pub conditions: Vec<KindSummary>,
    pub exhaustion: u8,
    pub exhaustion_effects: Vec<&'static str>,
}

#[derive(Debug, Clone, Default)]
struct TargetConditions {
    instances: Vec<ConditionInstance>,
    exhaustion: u8,
}

impl TargetConditions {
    fn is_empty(&self) -> bool {
        self.instances.is_empty() && self.exhaustion == 0
    }

    fn take_until_rest(&mut self) -> Vec<ConditionInstance> {
        let (cleared, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.instances)
            .into_iter()
            .partition(|c| c.duration == ConditionDuration::UntilRest);
        self.instances = kept;
        cleared
    }
}

/// Condition store for the participants of one encounter
#[derive(Debug, Default)]
pub struct ConditionTracker {
    targets: RwLock<HashMap<String, TargetConditions>>,
}

impl ConditionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a condition; the same kind twice yields two instances
    pub fn add(&self, target_id: &str, spec: NewCondition) -> Result<ConditionInstance, ConditionError> {
        if spec.duration == (ConditionDuration::Rounds { rounds: 0 }) {
            return Err(ConditionError::ZeroRounds);
        }

        let instance = ConditionInstance {
            id: Uuid::new_v4(),
            target_id: target_id.to_string(),
            kind: spec.kind,
            duration: spec.duration,
            source_id: spec.source_id,
            save: spec.save,
            applied_at: Utc::now(),
        };

        debug!(
            "Condition {} applied to {} ({})",
            instance.kind,
            target_id,
            instance.duration.description()
        );

        self.targets
            .write()
            .entry(target_id.to_string())
            .or_default()
            .instances
            .push(instance.clone());

        Ok(instance)
    }

    /// Remove every instance of a kind, or only those imposed by `source_id`
    pub fn remove(
        &self,
        target_id: &str,
        kind: ConditionKind,
        source_id: Option<&str>,
    ) -> RemoveOutcome {
        let mut targets = self.targets.write();
        let Some(entry) = targets.get_mut(target_id) else {
            return RemoveOutcome::NotAffected { kind };
        };

        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut entry.instances)
                .into_iter()
                .partition(|c| {
                    c.kind == kind
                        && source_id.is_none_or(|s| c.source_id.as_deref() == Some(s))
                });
        entry.instances = kept;
        if entry.is_empty() {
            targets.remove(target_id);
        }

        if removed.is_empty() {
            RemoveOutcome::NotAffected { kind }
        } else {
            RemoveOutcome::Removed {
                kind,
                instances: removed,
            }
        }
    }

    /// All active instances on a target
    pub fn query(&self, target_id: &str) -> Vec<ConditionInstance> {
        self.targets
            .read()
            .get(target_id)
            .map(|t| t.instances.clone())
            .unwrap_or_default()
    }

    /// Distinct kinds on a target, sorted
    pub fn kinds(&self, target_id: &str) -> Vec<ConditionKind> {
        let mut kinds: Vec<ConditionKind> = self.query(target_id).iter().map(|c| c.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub fn has(&self, target_id: &str, kind: ConditionKind) -> bool {
        self.targets
            .read()
            .get(target_id)
            .is_some_and(|t| t.instances.iter().any(|c| c.kind == kind))
    }

    /// Per-kind descriptions plus exhaustion
    pub fn summary(&self, target_id: &str) -> ConditionSummary {
        let (instances, exhaustion) = self
            .targets
            .read()
            .get(target_id)
            .map(|t| (t.instances.clone(), t.exhaustion))
            .unwrap_or_default();
        let mut kinds: Vec<ConditionKind> = instances.iter().map(|c| c.kind).collect();
        kinds.sort();
        kinds.dedup();

        let conditions = kinds
            .into_iter()
            .map(|kind| KindSummary {
                kind,
                description: kind.description(),
                durations: instances
                    .iter()
                    .filter(|c| c.kind == kind)
                    .map(|c| c.duration.description())
                    .collect(),
            })
            .collect();

        ConditionSummary {
            target_id: target_id.to_string(),
            conditions,
            exhaustion,
            exhaustion_effects: exhaustion_effects(exhaustion),
        }
    }

    /// Count down round durations; report the ones that ran out
    pub fn tick(&self, target_id: &str) -> TickReport {
        let mut report = TickReport {
            target_id: target_id.to_string(),
            expired: Vec::new(),
        };

        let mut targets = self.targets.write();
        let Some(entry) = targets.get_mut(target_id) else {
            return report;
        };

        let mut still_active = Vec::with_capacity(entry.instances.len());
        for mut instance in std::mem::take(&mut entry.instances) {
            let ran_out = match &mut instance.duration {
                ConditionDuration::Rounds { rounds } => {
                    *rounds = rounds.saturating_sub(1);
                    *rounds == 0
                }
                ConditionDuration::Concentration
                | ConditionDuration::SaveEnds { .. }
                | ConditionDuration::UntilRest
                | ConditionDuration::Permanent => false,
            };
            if ran_out {
                report.expired.push(instance);
            } else {
                still_active.push(instance);
            }
        }
        entry.instances = still_active;
        if entry.is_empty() {
            targets.remove(target_id);
        }

        if !report.expired.is_empty() {
            debug!("{} condition(s) expired on {}", report.expired.len(), target_id);
        }
        report
    }

    /// Resolve a saving throw against a save-ends instance
    pub fn attempt_save(
        &self,
        target_id: &str,
        instance_id: Uuid,
        total: i32,
    ) -> Result<SaveAttempt, ConditionError> {
        let mut targets = self.targets.write();
        let entry = targets
            .get_mut(target_id)
            .ok_or(ConditionError::InstanceNotFound(instance_id))?;
        let index = entry
            .instances
            .iter()
            .position(|c| c.id == instance_id)
            .ok_or(ConditionError::InstanceNotFound(instance_id))?;

        let instance = &entry.instances[index];
        let save = instance
            .ending_save()
            .ok_or(ConditionError::NotSaveEnds(instance_id))?;
        let success = total >= save.dc as i32;
        let attempt = SaveAttempt {
            instance_id,
            kind: instance.kind,
            dc: save.dc,
            total,
            success,
        };

        if success {
            entry.instances.remove(index);
            if entry.is_empty() {
                targets.remove(target_id);
            }
        }
        Ok(attempt)
    }

    /// Drop every concentration condition imposed by `source_id`
    pub fn break_concentration(&self, source_id: &str) -> Vec<ConditionInstance> {
        let mut broken = Vec::new();
        let mut targets = self.targets.write();
        for entry in targets.values_mut() {
            let (ended, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut entry.instances)
                .into_iter()
                .partition(|c| {
                    c.duration == ConditionDuration::Concentration
                        && c.source_id.as_deref() == Some(source_id)
                });
            entry.instances = kept;
            broken.extend(ended);
        }
        targets.retain(|_, t| !t.is_empty());
        broken
    }

    pub fn exhaustion(&self, target_id: &str) -> u8 {
        self.targets
            .read()
            .get(target_id)
            .map_or(0, |t| t.exhaustion)
    }

    /// Add (or with a negative delta, remove) exhaustion levels, clamped to 0-6
    pub fn apply_exhaustion(&self, target_id: &str, delta: i32) -> ExhaustionOutcome {
        let mut targets = self.targets.write();
        let entry = targets.entry(target_id.to_string()).or_default();
        let previous = entry.exhaustion;
        let level = (previous as i32).saturating_add(delta).clamp(0, MAX_EXHAUSTION as i32) as u8;
        entry.exhaustion = level;
        if entry.is_empty() {
            targets.remove(target_id);
        }

        debug!("Exhaustion on {}: {} -> {}", target_id, previous, level);
        if level == MAX_EXHAUSTION {
            ExhaustionOutcome::Dead { previous }
        } else {
            ExhaustionOutcome::Changed { previous, level }
        }
    }

    /// Remove every until-rest instance
    pub fn clear_until_rest(&self, target_id: &str) -> Vec<ConditionInstance> {
        let mut targets = self.targets.write();
        let Some(entry) = targets.get_mut(target_id) else {
            return Vec::new();
        };
        let cleared = entry.take_until_rest();
        if entry.is_empty() {
            targets.remove(target_id);
        }
        cleared
    }

    /// Short and long rests clear until-rest conditions; a long rest also
    /// removes one exhaustion level. Both happen under one write lock.
    pub fn rest(&self, target_id: &str, rest: RestKind) -> RestReport {
        let mut targets = self.targets.write();
        let (cleared, exhaustion_before, exhaustion_after) = match targets.get_mut(target_id) {
            Some(entry) => {
                let cleared = entry.take_until_rest();
                let before = entry.exhaustion;
                if rest == RestKind::Long {
                    entry.exhaustion = before.saturating_sub(1);
                }
                let after = entry.exhaustion;
                if entry.is_empty() {
                    targets.remove(target_id);
                }
                (cleared, before, after)
            }
            None => (Vec::new(), 0, 0),
        };
        drop(targets);

        debug!(
            "{:?} rest for {}: cleared {}, exhaustion {} -> {}",
            rest,
            target_id,
            cleared.len(),
            exhaustion_before,
            exhaustion_after
        );
        RestReport {
            target_id: target_id.to_string(),
            rest,
            cleared,
            exhaustion_before,
            exhaustion_after,
        }
    }

    /// Forget a target entirely
    pub fn clear(&self, target_id: &str) {
        self.targets.write().remove(target_id);
    }
}
