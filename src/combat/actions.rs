//! Action resolution
//!
//! Attacks, healing, movement and the other turn actions. Every request is
//! validated against the actor's state and action economy before any die
//! is rolled or any participant changes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::conditions::{ConditionKind, ConditionTracker};
use super::damage::{DamageResult, DamageType};
use super::delta::StateDelta;
use super::dice::{DiceExpression, RollResult, Vantage};
use super::encounter::{effective_speed, ActionCategory, CombatError, Encounter, Position};

/// Reach within which melee hits on paralyzed or unconscious targets are critical
pub const MELEE_REACH_FEET: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Attack,
    OffhandAttack,
    OpportunityAttack,
    Heal,
    BonusHeal,
    Dash,
    Disengage,
    Dodge,
    Help,
    Hide,
    Ready,
    Move,
    Free,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Attack => "attack",
            ActionType::OffhandAttack => "offhand_attack",
            ActionType::OpportunityAttack => "opportunity_attack",
            ActionType::Heal => "heal",
            ActionType::BonusHeal => "bonus_heal",
            ActionType::Dash => "dash",
            ActionType::Disengage => "disengage",
            ActionType::Dodge => "dodge",
            ActionType::Help => "help",
            ActionType::Hide => "hide",
            ActionType::Ready => "ready",
            ActionType::Move => "move",
            ActionType::Free => "free",
        }
    }

    /// Economy slot the action uses
    pub fn category(&self) -> ActionCategory {
        match self {
            ActionType::OffhandAttack | ActionType::BonusHeal => ActionCategory::BonusAction,
            ActionType::OpportunityAttack => ActionCategory::Reaction,
            ActionType::Move => ActionCategory::Movement,
            ActionType::Free => ActionCategory::Free,
            _ => ActionCategory::Action,
        }
    }

    pub fn is_attack(&self) -> bool {
        matches!(
            self,
            ActionType::Attack | ActionType::OffhandAttack | ActionType::OpportunityAttack
        )
    }

    pub fn is_heal(&self) -> bool {
        matches!(self, ActionType::Heal | ActionType::BonusHeal)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub actor_id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub target_id: Option<String>,
    /// Damage or healing dice; attacks fall back to the actor's own
    #[serde(default)]
    pub dice: Option<String>,
    #[serde(default)]
    pub damage_type: Option<DamageType>,
    #[serde(default)]
    pub advantage: bool,
    #[serde(default)]
    pub disadvantage: bool,
    #[serde(default)]
    pub ranged: bool,
    #[serde(default)]
    pub destination: Option<Position>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ActionRequest {
    pub fn new(actor_id: &str, action_type: ActionType) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            action_type,
            target_id: None,
            dice: None,
            damage_type: None,
            advantage: false,
            disadvantage: false,
            ranged: false,
            destination: None,
            description: None,
        }
    }

    pub fn attack(actor_id: &str, target_id: &str) -> Self {
        Self::new(actor_id, ActionType::Attack).targeting(target_id)
    }

    pub fn move_to(actor_id: &str, x: i32, y: i32) -> Self {
        let mut request = Self::new(actor_id, ActionType::Move);
        request.destination = Some(Position::new(x, y));
        request
    }

    pub fn targeting(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    pub fn with_dice(mut self, dice: &str) -> Self {
        self.dice = Some(dice.to_string());
        self
    }

    pub fn with_advantage(mut self) -> Self {
        self.advantage = true;
        self
    }

    pub fn with_disadvantage(mut self) -> Self {
        self.disadvantage = true;
        self
    }

    pub fn ranged(mut self) -> Self {
        self.ranged = true;
        self
    }
}

/// What happened when an action resolved
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub action_type: ActionType,
    pub actor_id: String,
    pub target_id: Option<String>,
    pub hit: Option<bool>,
    pub critical: bool,
    pub vantage: Vantage,
    pub attack_roll: Option<RollResult>,
    pub damage_roll: Option<RollResult>,
    pub damage: Option<DamageResult>,
    pub healed: Option<i32>,
    pub target_hp: Option<i32>,
    pub movement_left: u32,
    pub narration: String,
}

impl ActionOutcome {
    fn new(request: &ActionRequest) -> Self {
        Self {
            action_type: request.action_type,
            actor_id: request.actor_id.clone(),
            target_id: request.target_id.clone(),
            hit: None,
            critical: false,
            vantage: Vantage::Normal,
            attack_roll: None,
            damage_roll: None,
            damage: None,
            healed: None,
            target_hp: None,
            movement_left: 0,
            narration: String::new(),
        }
    }
}

/// Everything validation resolved up front
struct Plan {
    actor: usize,
    target: Option<usize>,
    dice: Option<DiceExpression>,
    vantage: Vantage,
    movement: Option<(Position, u32)>,
}

impl Encounter {
    /// Validate and resolve one action
    pub fn execute_action(
        &mut self,
        tracker: &ConditionTracker,
        request: ActionRequest,
    ) -> Result<(ActionOutcome, Vec<StateDelta>), CombatError> {
        self.ensure_active()?;
        let plan = self.plan(tracker, &request)?;
        let category = request.action_type.category();
        self.participant_at_mut(plan.actor).economy.spend(category);

        let mut deltas = Vec::new();
        let mut outcome = ActionOutcome::new(&request);

        match request.action_type {
            ActionType::Attack | ActionType::OffhandAttack | ActionType::OpportunityAttack => {
                self.resolve_attack(tracker, &request, &plan, &mut outcome, &mut deltas);
            }
            ActionType::Heal | ActionType::BonusHeal => {
                let target = plan.target.unwrap_or(plan.actor);
                if let Some(dice) = plan.dice {
                    let roll = self.roller.roll(&dice);
                    let healed = self.apply_healing(target, roll.total, &mut deltas);
                    let target = self.participant_at(target);
                    outcome.narration = format!(
                        "{} heals {} for {} hit points",
                        self.participant_at(plan.actor).name,
                        target.name,
                        healed
                    );
                    outcome.target_id = Some(target.id.clone());
                    outcome.target_hp = Some(target.hp);
                    outcome.healed = Some(healed);
                    outcome.damage_roll = Some(roll);
                }
            }
            ActionType::Dash => {
                let speed = effective_speed(self.participant_at(plan.actor), tracker);
                let actor = self.participant_at_mut(plan.actor);
                actor.economy.movement = actor.economy.movement.saturating_add(speed);
                outcome.narration = format!("{} dashes, gaining {} ft of movement", actor.name, speed);
            }
            ActionType::Disengage => {
                let actor = self.participant_at_mut(plan.actor);
                actor.disengaged = true;
                outcome.narration = format!("{} disengages", actor.name);
            }
            ActionType::Dodge => {
                let actor = self.participant_at_mut(plan.actor);
                actor.dodging = true;
                outcome.narration = format!("{} takes the Dodge action", actor.name);
            }
            ActionType::Help => {
                let actor_name = self.participant_at(plan.actor).name.clone();
                if let Some(target) = plan.target {
                    let ally = self.participant_at_mut(target);
                    ally.helped = true;
                    outcome.narration = format!("{} helps {}", actor_name, ally.name);
                }
            }
            ActionType::Hide => {
                let actor = self.participant_at_mut(plan.actor);
                actor.hidden = true;
                outcome.narration = format!("{} hides", actor.name);
            }
            ActionType::Ready => {
                let trigger = request
                    .description
                    .clone()
                    .unwrap_or_else(|| "a readied action".to_string());
                let actor = self.participant_at_mut(plan.actor);
                outcome.narration = format!("{} readies {}", actor.name, trigger);
                actor.readied = Some(trigger);
            }
            ActionType::Move => {
                if let Some((destination, cost)) = plan.movement {
                    let actor = self.participant_at_mut(plan.actor);
                    let from = actor.position;
                    actor.position = destination;
                    actor.economy.movement -= cost;
                    outcome.narration = format!(
                        "{} moves from {} to {} ({} ft)",
                        actor.name, from, destination, cost
                    );
                    deltas.push(StateDelta::EntityMoved {
                        entity_id: actor.id.clone(),
                        from,
                        to: destination,
                    });
                }
            }
            ActionType::Free => {
                let actor = self.participant_at(plan.actor);
                outcome.narration = match &request.description {
                    Some(description) => format!("{}: {}", actor.name, description),
                    None => format!("{} takes a free action", actor.name),
                };
            }
        }

        outcome.movement_left = self.participant_at(plan.actor).economy.movement;
        debug!("Encounter {}: {}", self.id, outcome.narration);
        Ok((outcome, deltas))
    }

    fn plan(&self, tracker: &ConditionTracker, request: &ActionRequest) -> Result<Plan, CombatError> {
        let action = request.action_type;
        let category = action.category();
        let actor_index = self.index_of(&request.actor_id)?;
        let actor = self.participant_at(actor_index);
        let violation = |reason: String| CombatError::ActionEconomy {
            actor: actor.name.clone(),
            action: action.to_string(),
            reason,
        };

        if actor.is_dead() {
            return Err(CombatError::validation(format!("{} is dead", actor.name)));
        }
        if category != ActionCategory::Free {
            let incapacitated = actor.is_down()
                || tracker
                    .kinds(&actor.id)
                    .iter()
                    .any(|kind| kind.incapacitates());
            if incapacitated {
                return Err(violation(format!("{} is incapacitated", actor.name)));
            }
            if category != ActionCategory::Reaction && actor.id != self.active_id() {
                return Err(violation(format!("it is not {}'s turn", actor.name)));
            }
            if category != ActionCategory::Movement {
                actor
                    .economy
                    .check(category)
                    .map_err(|reason| violation(reason.to_string()))?;
            }
        }

        let requested = Vantage::from_flags(request.advantage, request.disadvantage)?;

        let target = match &request.target_id {
            Some(target_id) => Some(self.index_of(target_id)?),
            None if action.is_attack() || action == ActionType::Help => {
                return Err(CombatError::validation(format!(
                    "targetId is required for {}",
                    action
                )));
            }
            None => None,
        };

        if let Some(target_index) = target {
            let target = self.participant_at(target_index);
            if (action.is_attack() || action == ActionType::Help) && target_index == actor_index {
                return Err(CombatError::validation(format!(
                    "{} cannot {} itself",
                    actor.name, action
                )));
            }
            if target.is_dead() && action != ActionType::Free {
                return Err(CombatError::validation(format!("{} is dead", target.name)));
            }
            if action == ActionType::Help && !actor.is_ally_of(target) {
                return Err(CombatError::validation(format!(
                    "{} can only help an ally",
                    actor.name
                )));
            }
        }

        let dice = if action.is_attack() {
            let notation = request.dice.as_deref().unwrap_or(&actor.damage_dice);
            Some(DiceExpression::parse(notation)?)
        } else if action.is_heal() {
            let notation = request.dice.as_deref().ok_or_else(|| {
                CombatError::validation(format!("dice are required for {}", action))
            })?;
            Some(DiceExpression::parse(notation)?)
        } else {
            None
        };

        let movement = if action == ActionType::Move {
            let destination = request
                .destination
                .ok_or_else(|| CombatError::validation("destination is required for move"))?;
            if !self.terrain.in_bounds(&destination) {
                return Err(CombatError::validation(format!(
                    "destination {} is outside the {}x{} map",
                    destination, self.terrain.width, self.terrain.height
                )));
            }
            if self.terrain.is_blocked(&destination) {
                return Err(CombatError::validation(format!(
                    "destination {} is blocked by an obstacle",
                    destination
                )));
            }
            if effective_speed(actor, tracker) == 0 {
                return Err(violation(format!("{}'s speed is 0", actor.name)));
            }

            let mut cost = actor.position.distance_feet(&destination);
            if self.terrain.is_difficult(&destination) {
                cost = cost.saturating_mul(2);
            }
            if cost > actor.economy.movement {
                return Err(violation(format!(
                    "needs {} ft of movement but only {} ft left",
                    cost, actor.economy.movement
                )));
            }
            Some((destination, cost))
        } else {
            None
        };

        Ok(Plan {
            actor: actor_index,
            target,
            dice,
            vantage: requested,
            movement,
        })
    }

    fn resolve_attack(
        &mut self,
        tracker: &ConditionTracker,
        request: &ActionRequest,
        plan: &Plan,
        outcome: &mut ActionOutcome,
        deltas: &mut Vec<StateDelta>,
    ) {
        let (Some(target_index), Some(dice)) = (plan.target, plan.dice) else {
            return;
        };
        let melee = !request.ranged;
        let actor = self.participant_at(plan.actor);
        let target = self.participant_at(target_index);
        let distance = actor.position.distance_feet(&target.position);
        let actor_kinds = tracker.kinds(&actor.id);
        let target_kinds = tracker.kinds(&target.id);
        let helpless = target.is_down() || target_kinds.iter().any(|k| k.incapacitates());

        let mut sources = vec![plan.vantage];
        sources.extend(actor_kinds.iter().map(|k| k.attacker_vantage()));
        sources.extend(target_kinds.iter().map(|k| k.defender_vantage(melee)));
        if target.is_down() {
            sources.push(ConditionKind::Unconscious.defender_vantage(melee));
        }
        if actor.hidden || actor.helped {
            sources.push(Vantage::Advantage);
        }
        if tracker.exhaustion(&actor.id) >= 3 {
            sources.push(Vantage::Disadvantage);
        }
        if target.dodging && !helpless {
            sources.push(Vantage::Disadvantage);
        }
        if !melee && distance <= MELEE_REACH_FEET && !helpless {
            sources.push(Vantage::Disadvantage);
        }
        let vantage = Vantage::resolve(sources);

        let auto_critical = melee
            && distance <= MELEE_REACH_FEET
            && (target.is_down() || target_kinds.iter().any(|k| k.melee_hits_are_critical()));
        let attack_bonus = actor.attack_bonus;
        let target_ac = target.armor_class;
        let damage_type = request.damage_type.or(actor.damage_type);
        let (actor_name, target_name) = (actor.name.clone(), target.name.clone());
        let (actor_id, target_id) = (actor.id.clone(), target.id.clone());

        let roll = self.roller.roll_d20(attack_bonus, vantage);
        let natural = roll.natural().unwrap_or_default();
        let hit = natural == 20 || (natural != 1 && roll.total >= target_ac);
        let critical = hit && (natural == 20 || auto_critical);

        {
            let actor = self.participant_at_mut(plan.actor);
            actor.hidden = false;
            actor.helped = false;
        }

        let mut hp_deltas = Vec::new();
        let mut dealt = 0;
        if hit {
            let expr = if critical { dice.doubled_dice() } else { dice };
            let damage_roll = self.roller.roll(&expr);
            let damage = self.apply_damage(
                tracker,
                target_index,
                damage_roll.total,
                damage_type,
                critical,
                &mut hp_deltas,
            );
            dealt = damage.final_damage;
            outcome.narration = format!(
                "{} {} {} for {} {}damage",
                actor_name,
                if critical { "critically hits" } else { "hits" },
                target_name,
                dealt,
                damage_type.map(|t| format!("{} ", t)).unwrap_or_default()
            );
            outcome.damage_roll = Some(damage_roll);
            outcome.damage = Some(damage);
        } else {
            outcome.narration = format!(
                "{} misses {} ({} vs AC {})",
                actor_name, target_name, roll.total, target_ac
            );
        }

        deltas.push(StateDelta::AttackResolved {
            attacker_id: actor_id,
            target_id: target_id.clone(),
            natural,
            total: roll.total,
            target_ac,
            hit,
            critical,
            damage: dealt,
        });
        deltas.extend(hp_deltas);

        outcome.target_id = Some(target_id);
        outcome.hit = Some(hit);
        outcome.critical = critical;
        outcome.vantage = vantage;
        outcome.target_hp = Some(self.participant_at(target_index).hp);
        outcome.attack_roll = Some(roll);
    }
}
