//! Session state: everything the protocol state machine reads and
//! mutates for a single battle, from handshake through `GAME_OVER`.
//! Grounded on the `Session`-shaped state threaded through
//! `original_source/protocol/state_machine.py`, collapsed into one
//! struct instead of the original's scattered instance attributes.

use crate::model::{Creature, PeerAddr, Role, TurnOwner};
use crate::rng::SharedRng;
use hashbrown::HashMap;

/// Protocol state, per spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    WaitingForSetup,
    WaitingForMove,
    WaitingForDefense,
    ProcessingTurn,
    GameOver,
}

/// A `CALCULATION_REPORT`'s payload, held until reconciliation can
/// compare the local and remote copies.
#[derive(Debug, Clone, PartialEq)]
pub struct CalcReport {
    pub attacker: String,
    pub move_used: String,
    pub remaining_health: i64,
    pub damage_dealt: i64,
    pub defender_hp_remaining: i64,
    pub status_message: String,
}

/// All mutable state for one battle. Access must be serialized by a
/// single mutex per spec.md §5; `Session` itself assumes exclusive access
/// to its methods.
pub struct Session {
    pub role: Role,
    pub local_trainer_name: String,
    pub remote_trainer_name: Option<String>,

    pub local: Option<Creature>,
    pub remote: Option<Creature>,

    pub turn_owner: TurnOwner,
    pub phase: Phase,

    pub last_announced_move: Option<String>,
    pub remote_move: Option<String>,

    pub local_calc_report: Option<CalcReport>,
    pub remote_calc_report: Option<CalcReport>,

    pub peer_addr: Option<PeerAddr>,
    /// Host-only: spectator address to an optional display name.
    pub spectators: HashMap<PeerAddr, Option<String>>,

    pub rng: Option<SharedRng>,
    pub running: bool,
}

impl Session {
    pub fn new(role: Role, local_trainer_name: impl Into<String>) -> Self {
        Session {
            role,
            local_trainer_name: local_trainer_name.into(),
            remote_trainer_name: None,
            local: None,
            remote: None,
            turn_owner: TurnOwner::Local,
            phase: Phase::Setup,
            last_announced_move: None,
            remote_move: None,
            local_calc_report: None,
            remote_calc_report: None,
            peer_addr: None,
            spectators: HashMap::new(),
            rng: None,
            running: true,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn both_creatures_present(&self) -> bool {
        self.local.is_some() && self.remote.is_some()
    }

    pub fn both_reports_present(&self) -> bool {
        self.local_calc_report.is_some() && self.remote_calc_report.is_some()
    }

    /// Clear per-turn buffers ahead of the next `ATTACK_ANNOUNCE`.
    pub fn clear_turn_buffers(&mut self) {
        self.last_announced_move = None;
        self.remote_move = None;
        self.local_calc_report = None;
        self.remote_calc_report = None;
    }

    pub fn flip_turn_owner(&mut self) {
        self.turn_owner = self.turn_owner.flipped();
    }

    /// A human-readable label for whoever sent a message from `addr`, for
    /// an external UI to print without reimplementing the spectator/battler
    /// distinction itself. Falls back to the bare address when no name is
    /// on file yet.
    pub fn describe_sender(&self, addr: &PeerAddr) -> String {
        if self.peer_addr.as_ref() == Some(addr) {
            return self
                .remote_trainer_name
                .clone()
                .unwrap_or_else(|| addr.to_string());
        }
        if let Some(name) = self.spectators.get(addr) {
            return name.clone().unwrap_or_else(|| format!("spectator {addr}"));
        }
        addr.to_string()
    }
}
