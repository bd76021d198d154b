//! Damage types and modifiers
//!
//! D&D 5e damage types with immunity (no damage), resistance (half, rounded
//! down) and vulnerability (double).

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Types of damage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageType {
    Acid,
    Bludgeoning,
    Cold,
    Fire,
    Force,
    Lightning,
    Necrotic,
    Piercing,
    Poison,
    Psychic,
    Radiant,
    Slashing,
    Thunder,
}

impl DamageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DamageType::Acid => "acid",
            DamageType::Bludgeoning => "bludgeoning",
            DamageType::Cold => "cold",
            DamageType::Fire => "fire",
            DamageType::Force => "force",
            DamageType::Lightning => "lightning",
            DamageType::Necrotic => "necrotic",
            DamageType::Piercing => "piercing",
            DamageType::Poison => "poison",
            DamageType::Psychic => "psychic",
            DamageType::Radiant => "radiant",
            DamageType::Slashing => "slashing",
            DamageType::Thunder => "thunder",
        }
    }
}

impl FromStr for DamageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "acid" => Ok(DamageType::Acid),
            "bludgeoning" => Ok(DamageType::Bludgeoning),
            "cold" => Ok(DamageType::Cold),
            "fire" => Ok(DamageType::Fire),
            "force" => Ok(DamageType::Force),
            "lightning" => Ok(DamageType::Lightning),
            "necrotic" => Ok(DamageType::Necrotic),
            "piercing" => Ok(DamageType::Piercing),
            "poison" => Ok(DamageType::Poison),
            "psychic" => Ok(DamageType::Psychic),
            "radiant" => Ok(DamageType::Radiant),
            "slashing" => Ok(DamageType::Slashing),
            "thunder" => Ok(DamageType::Thunder),
            other => Err(format!("unknown damage type: {}", other)),
        }
    }
}

impl std::fmt::Display for DamageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a creature takes one damage type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageModifier {
    Immune,
    Resistant,
    #[default]
    Normal,
    Vulnerable,
}

impl DamageModifier {
    /// Apply this modifier to a damage amount
    pub fn apply(&self, damage: i32) -> i32 {
        match self {
            DamageModifier::Immune => 0,
            DamageModifier::Resistant => damage / 2,
            DamageModifier::Normal => damage,
            DamageModifier::Vulnerable => damage.saturating_mul(2),
        }
    }
}

/// Damage after the target's profile was applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageResult {
    /// Rolled damage
    pub base_damage: i32,
    /// Damage that reaches hit points
    pub final_damage: i32,
    pub damage_type: Option<DamageType>,
    pub modifier: DamageModifier,
}

/// Immunities, resistances and vulnerabilities of one creature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageProfile {
    #[serde(default)]
    pub immunities: Vec<DamageType>,
    #[serde(default)]
    pub resistances: Vec<DamageType>,
    #[serde(default)]
    pub vulnerabilities: Vec<DamageType>,
}

impl DamageProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modifier for a damage type; immunity wins over resistance and vulnerability
    pub fn get(&self, dtype: DamageType) -> DamageModifier {
        let resistant = self.resistances.contains(&dtype);
        let vulnerable = self.vulnerabilities.contains(&dtype);
        if self.immunities.contains(&dtype) {
            DamageModifier::Immune
        } else if resistant && vulnerable {
            // 5e: resistance and vulnerability to the same type cancel
            DamageModifier::Normal
        } else if resistant {
            DamageModifier::Resistant
        } else if vulnerable {
            DamageModifier::Vulnerable
        } else {
            DamageModifier::Normal
        }
    }

    /// Calculate damage after applying the profile; untyped damage is unmodified
    pub fn calculate(&self, base: i32, dtype: Option<DamageType>) -> DamageResult {
        let base = base.max(0);
        let modifier = dtype.map_or(DamageModifier::Normal, |t| self.get(t));
        DamageResult {
            base_damage: base,
            final_damage: modifier.apply(base),
            damage_type: dtype,
            modifier,
        }
    }
}
