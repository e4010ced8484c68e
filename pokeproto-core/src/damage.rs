//! Pure-but-mutating damage calculation. Grounded on
//! `original_source/protocol/game_logic.py`'s damage stub and the fuller
//! semantics spelled out by the state machine reference
//! (`original_source/protocol/state_machine.py`), which this reimplements
//! exactly rather than translating.

use crate::model::{Creature, DamageCategory, Move};

const BOOST_MULTIPLIER: f64 = 1.3;
const THICK_FAT_MULTIPLIER: f64 = 0.5;

/// Effectiveness qualifier for `CALCULATION_REPORT.status_message`.
pub enum Effectiveness {
    SuperEffective,
    NoEffect,
    NotVeryEffective,
    Normal,
}

impl Effectiveness {
    pub fn from_multiplier(eff: f64) -> Self {
        if eff <= 0.0 {
            Effectiveness::NoEffect
        } else if eff >= 1.5 {
            Effectiveness::SuperEffective
        } else if eff < 1.0 {
            Effectiveness::NotVeryEffective
        } else {
            Effectiveness::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Effectiveness::SuperEffective => "super effective",
            Effectiveness::NoEffect => "no effect",
            Effectiveness::NotVeryEffective => "not very effective",
            Effectiveness::Normal => "",
        }
    }
}

/// The outcome of one `damage()` call: the integer damage dealt and the
/// raw effectiveness multiplier used, so callers can build the
/// human-readable `status_message`.
pub struct DamageOutcome {
    pub damage: i64,
    pub effectiveness: f64,
}

/// Compute damage dealt by `attacker` using `mv` against `defender`,
/// mutating both creatures' consumable boost-use counters per spec.md
/// §4.5 step 3. Both peers must call this with deep-equal inputs to
/// converge on the same result and the same mutations.
pub fn damage(attacker: &mut Creature, defender: &mut Creature, mv: &Move) -> DamageOutcome {
    if mv.damage_category == DamageCategory::Status {
        return DamageOutcome {
            damage: 0,
            effectiveness: 1.0,
        };
    }

    let (mut atk_stat, mut def_stat) = match mv.damage_category {
        DamageCategory::Physical => {
            let mut atk = attacker.attack;
            if attacker.has_ability("huge power") {
                atk *= 2.0;
            }
            (atk, defender.defense)
        }
        DamageCategory::Special => (attacker.special_attack, defender.special_defense),
        DamageCategory::Status => unreachable!(),
    };

    if mv.damage_category == DamageCategory::Special {
        if attacker.special_attack_uses > 0 {
            attacker.special_attack_uses -= 1;
            atk_stat *= BOOST_MULTIPLIER;
        }
        if defender.special_defense_uses > 0 {
            defender.special_defense_uses -= 1;
            def_stat *= BOOST_MULTIPLIER;
        }
    }

    def_stat = def_stat.max(1.0);

    let mut eff = defender.effectiveness_against(&mv.move_type);
    if defender.has_ability("thick fat") && matches!(mv.move_type.as_str(), "fire" | "ice") {
        eff *= THICK_FAT_MULTIPLIER;
    }

    let power = mv.effective_power(attacker);
    let raw = (power * atk_stat * eff) / def_stat;
    let damage = if eff <= 0.0 { 0 } else { raw.floor().max(1.0) as i64 };

    DamageOutcome {
        damage,
        effectiveness: eff,
    }
}
