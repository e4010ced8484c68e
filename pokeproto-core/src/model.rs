//! Wire-level data model: peer addressing, roles, creatures and moves.
//!
//! `Creature` and `Move` round-trip through JSON (see [`Creature::to_json`]
//! / [`Creature::from_json`]) exactly as `BATTLE_SETUP.pokemon` requires.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An (IPv4 string, UDP port) pair. Two addresses are equal iff both
/// components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        PeerAddr { ip: ip.into(), port }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<std::net::SocketAddr> for PeerAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        PeerAddr::new(addr.ip().to_string(), addr.port())
    }
}

/// The three roles a peer may take in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
    Spectator,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "HOST",
            Role::Joiner => "JOINER",
            Role::Spectator => "SPECTATOR",
        }
    }
}

/// Which side of the turn a peer is currently resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOwner {
    Local,
    Remote,
}

impl TurnOwner {
    #[must_use]
    pub fn flipped(self) -> TurnOwner {
        match self {
            TurnOwner::Local => TurnOwner::Remote,
            TurnOwner::Remote => TurnOwner::Local,
        }
    }
}

/// A runtime battle instance of a creature, reconstructed identically on
/// both peers from the JSON carried in `BATTLE_SETUP`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creature {
    pub name: String,
    pub max_hp: i64,
    pub hp: i64,
    pub attack: f64,
    pub special_attack: f64,
    pub defense: f64,
    pub special_defense: f64,
    pub types: Vec<String>,
    #[serde(default)]
    pub abilities: Vec<String>,
    pub special_attack_uses: u32,
    pub special_defense_uses: u32,
    pub effectiveness: HashMap<String, f64>,
}

impl Creature {
    /// `true` once `hp` has reached zero or below.
    pub fn is_fainted(&self) -> bool {
        self.hp <= 0
    }

    /// Clamp `hp` back into `[0, max_hp]`. Called after any mutation that
    /// could push it out of range.
    pub fn clamp_hp(&mut self) {
        self.hp = self.hp.clamp(0, self.max_hp);
    }

    pub fn has_ability(&self, name: &str) -> bool {
        self.abilities.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    pub fn effectiveness_against(&self, attack_type: &str) -> f64 {
        self.effectiveness
            .get(attack_type)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Creature always serializes")
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// A move's damage category, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DamageCategory {
    Physical,
    Special,
    Status,
}

/// An immutable catalog move. Effective power (see [`Move::effective_power`])
/// may differ from `power` when `scale_with_hp` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub name: String,
    pub power: f64,
    pub damage_category: DamageCategory,
    #[serde(rename = "type")]
    pub move_type: String,
    #[serde(default)]
    pub scale_with_hp: bool,
    #[serde(default)]
    pub hp_ratio: f64,
    #[serde(default)]
    pub power_min: f64,
    #[serde(default)]
    pub power_max: f64,
}

impl Move {
    /// `clamp(attacker.max_hp * hp_ratio, power_min, power_max)` when
    /// `scale_with_hp`, else the flat `power`.
    pub fn effective_power(&self, attacker: &Creature) -> f64 {
        if self.scale_with_hp {
            let raw = attacker.max_hp as f64 * self.hp_ratio;
            raw.clamp(self.power_min, self.power_max)
        } else {
            self.power
        }
    }
}

/// Looks up moves by name. The CSV-backed implementation lives outside the
/// core (see spec.md §1); core only depends on this trait.
pub trait MoveCatalog: Send + Sync {
    fn get(&self, name: &str) -> Option<Move>;
}

/// A small in-memory catalog, useful for tests and the thin CLI demo.
#[derive(Debug, Default, Clone)]
pub struct InMemoryMoveCatalog(HashMap<String, Move>);

impl InMemoryMoveCatalog {
    pub fn new() -> Self {
        InMemoryMoveCatalog(HashMap::new())
    }

    #[must_use]
    pub fn with_move(mut self, mv: Move) -> Self {
        self.0.insert(mv.name.clone(), mv);
        self
    }
}

impl MoveCatalog for InMemoryMoveCatalog {
    fn get(&self, name: &str) -> Option<Move> {
        self.0.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_creature() -> Creature {
        Creature {
            name: "Charmander".into(),
            max_hp: 39,
            hp: 39,
            attack: 52.0,
            special_attack: 60.0,
            defense: 43.0,
            special_defense: 50.0,
            types: vec!["fire".into()],
            abilities: vec![],
            special_attack_uses: 1,
            special_defense_uses: 1,
            effectiveness: HashMap::new(),
        }
    }

    #[test]
    fn creature_json_round_trips() {
        let creature = sample_creature();
        let json = creature.to_json();
        let back = Creature::from_json(&json).unwrap();
        assert_eq!(creature, back);
    }

    #[test]
    fn clamp_hp_stays_in_bounds() {
        let mut creature = sample_creature();
        creature.hp = -5;
        creature.clamp_hp();
        assert_eq!(creature.hp, 0);

        creature.hp = 1000;
        creature.clamp_hp();
        assert_eq!(creature.hp, creature.max_hp);
    }

    #[test]
    fn effective_power_scales_with_hp() {
        let attacker = sample_creature();
        let mv = Move {
            name: "Endeavor".into(),
            power: 0.0,
            damage_category: DamageCategory::Physical,
            move_type: "normal".into(),
            scale_with_hp: true,
            hp_ratio: 1.0,
            power_min: 1.0,
            power_max: 150.0,
        };
        assert_eq!(mv.effective_power(&attacker), 39.0);
    }
}
