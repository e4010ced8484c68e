//! The protocol engine: wires transport, reliability, codec, damage and
//! chat together into the turn state machine described in
//! `original_source/protocol/state_machine.py`'s `ProtocolStateMachine`,
//! reorganized around an exhaustive tagged `MessageType` dispatch (the
//! reference used an if/elif chain on the raw string — spec.md §9's
//! "ad-hoc dynamic dispatch" note) and a single mutex guarding all
//! mutable session state (spec.md §5).

use crate::chat::{self, ChatContentType, NoOpStickerPolicy, StickerPolicy};
use crate::codec::{self, Fields, ACK_NUMBER_KEY, MESSAGE_TYPE_KEY, SEQUENCE_NUMBER_KEY};
use crate::damage::{self, Effectiveness};
use crate::error::EngineError;
use crate::model::{Creature, MoveCatalog, PeerAddr, Role, TurnOwner};
use crate::reliability::ReliabilityLayer;
use crate::rng::SharedRng;
use crate::session::{CalcReport, Phase, Session};
use crate::transport::Transport;
use rand::Rng;
use slog::{debug, info, warn, Logger};
use std::sync::Mutex;

/// A tagged, exhaustively-matched message type, replacing the reference's
/// string if/elif chain (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    HandshakeRequest,
    HandshakeResponse,
    SpectatorRequest,
    BattleSetup,
    AttackAnnounce,
    DefenseAnnounce,
    CalculationReport,
    CalculationConfirm,
    ResolutionRequest,
    GameOver,
    ChatMessage,
    Ack,
    Unknown,
}

impl MessageType {
    fn parse(tag: &str) -> Self {
        match tag {
            "HANDSHAKE_REQUEST" => MessageType::HandshakeRequest,
            "HANDSHAKE_RESPONSE" => MessageType::HandshakeResponse,
            "SPECTATOR_REQUEST" => MessageType::SpectatorRequest,
            "BATTLE_SETUP" => MessageType::BattleSetup,
            "ATTACK_ANNOUNCE" => MessageType::AttackAnnounce,
            "DEFENSE_ANNOUNCE" => MessageType::DefenseAnnounce,
            "CALCULATION_REPORT" => MessageType::CalculationReport,
            "CALCULATION_CONFIRM" => MessageType::CalculationConfirm,
            "RESOLUTION_REQUEST" => MessageType::ResolutionRequest,
            "GAME_OVER" => MessageType::GameOver,
            "CHAT_MESSAGE" => MessageType::ChatMessage,
            "ACK" => MessageType::Ack,
            _ => MessageType::Unknown,
        }
    }

    /// Required fields other than `message_type`/`sequence_number`, per
    /// spec.md §6's table.
    fn required_fields(self) -> &'static [&'static str] {
        match self {
            MessageType::HandshakeRequest => &[],
            MessageType::HandshakeResponse => &["seed"],
            MessageType::SpectatorRequest => &[],
            MessageType::BattleSetup => {
                &["communication_mode", "pokemon_name", "pokemon", "stat_boosts", "trainer_name"]
            }
            MessageType::AttackAnnounce => &["move_name"],
            MessageType::DefenseAnnounce => &[],
            MessageType::CalculationReport => &[
                "attacker",
                "move_used",
                "remaining_health",
                "damage_dealt",
                "defender_hp_remaining",
                "status_message",
            ],
            MessageType::CalculationConfirm => &[],
            MessageType::ResolutionRequest => {
                &["attacker", "move_used", "damage_dealt", "defender_hp_remaining"]
            }
            MessageType::GameOver => &["winner", "loser"],
            MessageType::ChatMessage => &["sender_name", "content_type"],
            MessageType::Ack => &["ack_number"],
            MessageType::Unknown => &[],
        }
    }

    /// Events the host forwards verbatim (minus reliability keys) to the
    /// spectator set, per spec.md §4.6's "Host relay (general)".
    fn is_relayable_from_battler(self) -> bool {
        matches!(
            self,
            MessageType::BattleSetup
                | MessageType::AttackAnnounce
                | MessageType::DefenseAnnounce
                | MessageType::CalculationReport
                | MessageType::CalculationConfirm
                | MessageType::ResolutionRequest
                | MessageType::GameOver
                | MessageType::ChatMessage
        )
    }
}

fn sanitize_for_relay(fields: &Fields) -> Fields {
    let mut copy = fields.clone();
    copy.remove(SEQUENCE_NUMBER_KEY);
    copy.remove(ACK_NUMBER_KEY);
    copy
}

struct EngineState {
    session: Session,
    reliability: ReliabilityLayer,
}

/// A read-only view of session state for display/testing, cloned out from
/// behind the mutex so callers never hold the lock across I/O.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub phase_label: &'static str,
    pub turn_owner: Option<TurnOwner>,
    pub running: bool,
    pub local_trainer_name: String,
    pub remote_trainer_name: Option<String>,
    pub local: Option<Creature>,
    pub remote: Option<Creature>,
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Setup => "SETUP",
        Phase::WaitingForSetup => "WAITING_FOR_SETUP",
        Phase::WaitingForMove => "WAITING_FOR_MOVE",
        Phase::WaitingForDefense => "WAITING_FOR_DEFENSE",
        Phase::ProcessingTurn => "PROCESSING_TURN",
        Phase::GameOver => "GAME_OVER",
    }
}

/// Glues transport, reliability, codec and the turn state machine for one
/// session. Every public method locks a single mutex for the duration of
/// its state mutation, per spec.md §5.
pub struct Engine<T: Transport, C: MoveCatalog> {
    transport: T,
    catalog: C,
    sticker_policy: Box<dyn StickerPolicy>,
    state: Mutex<EngineState>,
    logger: Logger,
}

impl<T: Transport, C: MoveCatalog> Engine<T, C> {
    pub fn new(transport: T, catalog: C, role: Role, local_trainer_name: impl Into<String>, logger: Logger) -> Self {
        Engine {
            transport,
            catalog,
            sticker_policy: Box::new(NoOpStickerPolicy),
            state: Mutex::new(EngineState {
                session: Session::new(role, local_trainer_name),
                reliability: ReliabilityLayer::new(),
            }),
            logger,
        }
    }

    #[must_use]
    pub fn with_sticker_policy(mut self, policy: Box<dyn StickerPolicy>) -> Self {
        self.sticker_policy = policy;
        self
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().session.running
    }

    /// Whether a peer address has been established yet — true for a joiner
    /// or spectator as soon as it targets a host, but only true for a host
    /// once a `HANDSHAKE_REQUEST` has actually arrived.
    pub fn has_peer(&self) -> bool {
        self.state.lock().unwrap().session.peer_addr.is_some()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state.lock().unwrap();
        EngineSnapshot {
            phase_label: phase_label(state.session.phase),
            turn_owner: (state.session.local.is_some() && state.session.remote.is_some())
                .then_some(state.session.turn_owner),
            running: state.session.running,
            local_trainer_name: state.session.local_trainer_name.clone(),
            remote_trainer_name: state.session.remote_trainer_name.clone(),
            local: state.session.local.clone(),
            remote: state.session.remote.clone(),
        }
    }

    // ------------------------------------------------------------
    // Outbound: driver-initiated actions
    // ------------------------------------------------------------

    /// Joiner-only: send `HANDSHAKE_REQUEST` to a discovered host address.
    pub fn begin_handshake(&self, host_addr: PeerAddr) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.session.role != Role::Joiner {
            return Err(EngineError::WrongPhase);
        }
        state.session.peer_addr = Some(host_addr.clone());
        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "HANDSHAKE_REQUEST".to_string());
        state.reliability.send_reliable(&self.transport, &mut fields, &host_addr);
        Ok(())
    }

    /// Spectator-only: send `SPECTATOR_REQUEST` to the host.
    pub fn send_spectator_request(&self, host_addr: PeerAddr, sender_name: Option<String>) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.session.role != Role::Spectator {
            return Err(EngineError::WrongPhase);
        }
        state.session.peer_addr = Some(host_addr.clone());
        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "SPECTATOR_REQUEST".to_string());
        if let Some(name) = sender_name {
            fields.insert("sender_name".to_string(), name);
        }
        state.reliability.send_reliable(&self.transport, &mut fields, &host_addr);
        Ok(())
    }

    /// Send this peer's `BATTLE_SETUP`, supplying the creature the driver
    /// loaded from its catalog.
    pub fn submit_battle_setup(&self, pokemon: Creature, stat_boosts: impl Into<String>) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.session.role == Role::Spectator {
            return Err(EngineError::WrongPhase);
        }
        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;

        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "BATTLE_SETUP".to_string());
        fields.insert("communication_mode".to_string(), "P2P".to_string());
        fields.insert("pokemon_name".to_string(), pokemon.name.clone());
        fields.insert("pokemon".to_string(), pokemon.to_json());
        fields.insert("stat_boosts".to_string(), stat_boosts.into());
        fields.insert("trainer_name".to_string(), state.session.local_trainer_name.clone());

        state.session.local = Some(pokemon);
        state.reliability.send_reliable(&self.transport, &mut fields, &peer);
        maybe_complete_setup(&mut state.session);
        Ok(())
    }

    /// Attacker-only: announce a move on the local peer's turn.
    pub fn submit_move(&self, move_name: impl Into<String>) -> Result<(), EngineError> {
        let move_name = move_name.into();
        let mut state = self.state.lock().unwrap();
        if state.session.role == Role::Spectator {
            return Err(EngineError::WrongPhase);
        }
        if state.session.phase != Phase::WaitingForMove || state.session.turn_owner != TurnOwner::Local {
            return Err(EngineError::WrongPhase);
        }
        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;

        state.session.last_announced_move = Some(move_name.clone());
        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "ATTACK_ANNOUNCE".to_string());
        fields.insert("move_name".to_string(), move_name);
        state.reliability.send_reliable(&self.transport, &mut fields, &peer);
        state.session.phase = Phase::WaitingForDefense;
        Ok(())
    }

    pub fn submit_chat_text(&self, text: impl Into<String>) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;
        let sender = state.session.local_trainer_name.clone();
        let mut fields = chat::make_text_message(&sender, &text.into());
        state.reliability.send_reliable(&self.transport, &mut fields, &peer);
        Ok(())
    }

    pub fn submit_chat_sticker(&self, sticker_data_base64: impl Into<String>) -> Result<(), EngineError> {
        let sticker_data_base64 = sticker_data_base64.into();
        let mut state = self.state.lock().unwrap();
        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;
        let sender = state.session.local_trainer_name.clone();
        if !self.sticker_policy.accept(&sender, &sticker_data_base64) {
            warn!(self.logger, "local sticker rejected by policy"; "sender" => %sender);
            return Ok(());
        }
        if sticker_data_base64.len() > chat::CHAT_FRAGMENTATION_WARN_BYTES {
            warn!(self.logger, "sticker payload risks datagram fragmentation";
                "sender" => %sender, "bytes" => sticker_data_base64.len());
        }
        let mut fields = chat::make_sticker_message(&sender, &sticker_data_base64);
        state.reliability.send_reliable(&self.transport, &mut fields, &peer);
        Ok(())
    }

    // ------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------

    /// One iteration of the network task: poll the transport for a
    /// datagram (bounded by [`crate::transport::RECEIVE_TIMEOUT`]),
    /// process it if present, then run the reliability tick. Returns
    /// whether a datagram was processed.
    pub fn poll_once(&self) -> Result<bool, EngineError> {
        let processed = if let Some((bytes, from_addr)) = self.transport.receive() {
            self.handle_inbound(&bytes, from_addr);
            true
        } else {
            false
        };

        let mut state = self.state.lock().unwrap();
        if let Err(err) = state.reliability.tick(&self.transport) {
            warn!(self.logger, "peer unresponsive, ending session"; "error" => %err);
            state.session.running = false;
            state.session.phase = Phase::GameOver;
            return Err(EngineError::Reliability(err));
        }
        Ok(processed)
    }

    fn handle_inbound(&self, bytes: &[u8], from_addr: PeerAddr) {
        let fields = match codec::decode_message(bytes) {
            Ok(f) => f,
            Err(err) => {
                warn!(self.logger, "dropping malformed datagram"; "from" => %from_addr, "error" => %err);
                return;
            }
        };

        let tag = fields.get(MESSAGE_TYPE_KEY).map(String::as_str).unwrap_or("");
        let message_type = MessageType::parse(tag);

        if message_type == MessageType::Ack {
            if let Ok(ack_number) = codec::parse_int_field(&fields, ACK_NUMBER_KEY) {
                let mut state = self.state.lock().unwrap();
                state.reliability.handle_ack(ack_number as u64, &from_addr);
            }
            return;
        }

        let (ok, missing) = codec::require_fields(&fields, message_type.required_fields());
        if !ok {
            debug!(self.logger, "withholding ack, message missing required field";
                "message_type" => tag, "missing" => missing.unwrap_or_default());
            return;
        }

        let mut state = self.state.lock().unwrap();

        if let Some(seq) = state.reliability.align_sequence(&fields) {
            state.reliability.send_ack(&self.transport, seq, &from_addr);
        }

        self.relay_if_host(&mut state, message_type, &fields, &from_addr);

        if let Err(err) = self.dispatch(&mut state, message_type, &fields, &from_addr) {
            warn!(self.logger, "handler error"; "message_type" => tag, "error" => %err);
        }
    }

    fn relay_if_host(&self, state: &mut EngineState, message_type: MessageType, fields: &Fields, from_addr: &PeerAddr) {
        if !state.session.is_host() {
            return;
        }

        let from_battler = state.session.peer_addr.as_ref() == Some(from_addr);

        if from_battler && message_type.is_relayable_from_battler() {
            let spectators: Vec<PeerAddr> = state.session.spectators.keys().cloned().collect();
            if !spectators.is_empty() {
                let mut forwarded = sanitize_for_relay(fields);
                state.reliability.send_reliable_to_many(&self.transport, &mut forwarded, &spectators);
            }
            return;
        }

        if message_type == MessageType::ChatMessage && state.session.spectators.contains_key(from_addr) {
            if let Some(peer) = state.session.peer_addr.clone() {
                let mut forwarded = sanitize_for_relay(fields);
                state.reliability.send_reliable(&self.transport, &mut forwarded, &peer);
            }
        }
    }

    fn dispatch(
        &self,
        state: &mut EngineState,
        message_type: MessageType,
        fields: &Fields,
        from_addr: &PeerAddr,
    ) -> Result<(), EngineError> {
        match message_type {
            MessageType::HandshakeRequest => self.on_handshake_request(state, from_addr),
            MessageType::HandshakeResponse => self.on_handshake_response(state, fields),
            MessageType::SpectatorRequest => self.on_spectator_request(state, fields, from_addr),
            MessageType::BattleSetup => self.on_battle_setup(state, fields),
            MessageType::AttackAnnounce => self.on_attack_announce(state, fields),
            MessageType::DefenseAnnounce => self.on_defense_announce(state),
            MessageType::CalculationReport => self.on_calculation_report(state, fields),
            MessageType::CalculationConfirm => self.on_calculation_confirm(state),
            MessageType::ResolutionRequest => self.on_resolution_request(state, fields),
            MessageType::GameOver => self.on_game_over(state),
            MessageType::ChatMessage => self.on_chat_message(state, fields, from_addr),
            MessageType::Ack | MessageType::Unknown => Ok(()),
        }
    }

    fn on_handshake_request(&self, state: &mut EngineState, from_addr: &PeerAddr) -> Result<(), EngineError> {
        if state.session.role != Role::Host {
            return Ok(());
        }
        let seed: u64 = rand::thread_rng().gen_range(1..=999_999);
        state.session.peer_addr = Some(from_addr.clone());
        state.session.rng = Some(SharedRng::from_seed(seed));

        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "HANDSHAKE_RESPONSE".to_string());
        fields.insert("seed".to_string(), seed.to_string());
        state.reliability.send_reliable(&self.transport, &mut fields, from_addr);

        state.session.phase = Phase::WaitingForSetup;
        info!(self.logger, "handshake complete"; "role" => "HOST", "seed" => seed);
        Ok(())
    }

    fn on_handshake_response(&self, state: &mut EngineState, fields: &Fields) -> Result<(), EngineError> {
        if state.session.role != Role::Joiner {
            return Ok(());
        }
        let seed = codec::parse_int_field(fields, "seed").unwrap_or(0) as u64;
        state.session.rng = Some(SharedRng::from_seed(seed));
        state.session.phase = Phase::WaitingForSetup;
        info!(self.logger, "handshake complete"; "role" => "JOINER", "seed" => seed);
        Ok(())
    }

    fn on_spectator_request(&self, state: &mut EngineState, fields: &Fields, from_addr: &PeerAddr) -> Result<(), EngineError> {
        if state.session.role != Role::Host {
            return Ok(());
        }
        let sender_name = fields.get("sender_name").or_else(|| fields.get("trainer_name")).cloned();
        state.session.spectators.insert(from_addr.clone(), sender_name);
        Ok(())
    }

    fn on_battle_setup(&self, state: &mut EngineState, fields: &Fields) -> Result<(), EngineError> {
        let creature = Creature::from_json(&fields["pokemon"])
            .map_err(|_| EngineError::MissingCreature)?;
        state.session.remote_trainer_name = fields.get("trainer_name").cloned();
        state.session.remote = Some(creature);

        // Spectators have no battler of their own; the relayed BATTLE_SETUP
        // is a read-only view update, not a setup-completion signal
        // (spec.md §4.6).
        if state.session.role != Role::Spectator {
            maybe_complete_setup(&mut state.session);
        }
        Ok(())
    }

    fn on_attack_announce(&self, state: &mut EngineState, fields: &Fields) -> Result<(), EngineError> {
        if state.session.role == Role::Spectator {
            return Ok(());
        }
        if state.session.phase != Phase::WaitingForMove {
            // A retransmitted duplicate (the ACK we already sent was lost in
            // transit): already handled once, so ACK-and-ignore instead of
            // recalculating damage a second time (spec.md §8).
            return Ok(());
        }
        let move_name = fields["move_name"].clone();
        state.session.remote_move = Some(move_name.clone());
        state.session.phase = Phase::ProcessingTurn;

        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;
        let mut defense = Fields::new();
        defense.insert(MESSAGE_TYPE_KEY.to_string(), "DEFENSE_ANNOUNCE".to_string());
        state.reliability.send_reliable(&self.transport, &mut defense, &peer);

        self.send_calculation_report(state, move_name)
    }

    fn on_defense_announce(&self, state: &mut EngineState) -> Result<(), EngineError> {
        if state.session.role == Role::Spectator {
            return Ok(());
        }
        if state.session.phase != Phase::WaitingForDefense {
            // Duplicate delivery of an already-processed DEFENSE_ANNOUNCE.
            return Ok(());
        }
        state.session.phase = Phase::ProcessingTurn;
        if let Some(move_name) = state.session.last_announced_move.clone() {
            self.send_calculation_report(state, move_name)?;
        }
        Ok(())
    }

    /// Compute damage as whichever side the local peer currently is
    /// (attacker if `turn_owner == Local`, else defender), send the
    /// resulting `CALCULATION_REPORT`, and raise `GAME_OVER` if this
    /// mutation just fainted the defender. Mirrors
    /// `send_calculation_report` in the Python reference.
    fn send_calculation_report(&self, state: &mut EngineState, move_name: String) -> Result<(), EngineError> {
        if state.session.local.is_none() || state.session.remote.is_none() {
            return Err(EngineError::MissingCreature);
        }
        let mv = self
            .catalog
            .get(&move_name)
            .ok_or_else(|| EngineError::UnknownMove(move_name.clone()))?;

        let local_is_attacker = state.session.turn_owner == TurnOwner::Local;

        let (attacker_name, loser_name, attacker_remaining, damage_dealt, defender_remaining, effectiveness) = {
            let (attacker, defender) = if local_is_attacker {
                (
                    state.session.local.as_mut().ok_or(EngineError::MissingCreature)?,
                    state.session.remote.as_mut().ok_or(EngineError::MissingCreature)?,
                )
            } else {
                (
                    state.session.remote.as_mut().ok_or(EngineError::MissingCreature)?,
                    state.session.local.as_mut().ok_or(EngineError::MissingCreature)?,
                )
            };

            let attacker_name = attacker.name.clone();
            let outcome = damage::damage(attacker, defender, &mv);
            defender.hp -= outcome.damage;
            defender.clamp_hp();

            (
                attacker_name,
                defender.name.clone(),
                attacker.hp,
                outcome.damage,
                defender.hp,
                outcome.effectiveness,
            )
        };

        let suffix = match Effectiveness::from_multiplier(effectiveness) {
            Effectiveness::NoEffect => " It had no effect.".to_string(),
            Effectiveness::SuperEffective => " It was super effective!".to_string(),
            Effectiveness::NotVeryEffective => " It was not very effective.".to_string(),
            Effectiveness::Normal => String::new(),
        };
        let status_message = format!("{attacker_name} used {move_name}!{suffix}");

        let report = CalcReport {
            attacker: attacker_name.clone(),
            move_used: move_name.clone(),
            remaining_health: attacker_remaining,
            damage_dealt,
            defender_hp_remaining: defender_remaining,
            status_message: status_message.clone(),
        };
        state.session.local_calc_report = Some(report);

        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;
        let mut fields = Fields::new();
        fields.insert(MESSAGE_TYPE_KEY.to_string(), "CALCULATION_REPORT".to_string());
        fields.insert("attacker".to_string(), attacker_name.clone());
        fields.insert("move_used".to_string(), move_name);
        fields.insert("remaining_health".to_string(), attacker_remaining.to_string());
        fields.insert("damage_dealt".to_string(), damage_dealt.to_string());
        fields.insert("defender_hp_remaining".to_string(), defender_remaining.to_string());
        fields.insert("status_message".to_string(), status_message);
        state.reliability.send_reliable(&self.transport, &mut fields, &peer);

        if defender_remaining <= 0 {
            let mut game_over = Fields::new();
            game_over.insert(MESSAGE_TYPE_KEY.to_string(), "GAME_OVER".to_string());
            game_over.insert("winner".to_string(), attacker_name);
            game_over.insert("loser".to_string(), loser_name);
            state.reliability.send_reliable(&self.transport, &mut game_over, &peer);
            state.session.phase = Phase::GameOver;
            state.session.running = false;
        }

        self.try_reconcile(state)
    }

    fn on_calculation_report(&self, state: &mut EngineState, fields: &Fields) -> Result<(), EngineError> {
        if state.session.role == Role::Spectator {
            return Ok(());
        }
        let report = CalcReport {
            attacker: fields["attacker"].clone(),
            move_used: fields["move_used"].clone(),
            remaining_health: codec::parse_int_field(fields, "remaining_health").unwrap_or(0),
            damage_dealt: codec::parse_int_field(fields, "damage_dealt").unwrap_or(0),
            defender_hp_remaining: codec::parse_int_field(fields, "defender_hp_remaining").unwrap_or(0),
            status_message: fields.get("status_message").cloned().unwrap_or_default(),
        };
        state.session.remote_calc_report = Some(report);

        if state.session.local_calc_report.is_none() {
            return Ok(());
        }
        self.try_reconcile(state)
    }

    /// Compare the local and remote `CALCULATION_REPORT`s once both are
    /// present, per spec.md §4.6's "Reconciliation". On disagreement only
    /// the attacker sends `RESOLUTION_REQUEST` (spec.md §9's tie-break
    /// redesign).
    fn try_reconcile(&self, state: &mut EngineState) -> Result<(), EngineError> {
        if !state.session.both_reports_present() {
            return Ok(());
        }
        let local = state.session.local_calc_report.clone().unwrap();
        let remote = state.session.remote_calc_report.clone().unwrap();
        let peer = state.session.peer_addr.clone().ok_or(EngineError::NoPeer)?;

        if local.damage_dealt == remote.damage_dealt && local.defender_hp_remaining == remote.defender_hp_remaining {
            let mut fields = Fields::new();
            fields.insert(MESSAGE_TYPE_KEY.to_string(), "CALCULATION_CONFIRM".to_string());
            state.reliability.send_reliable(&self.transport, &mut fields, &peer);
        } else if state.session.turn_owner == TurnOwner::Local {
            let mut fields = Fields::new();
            fields.insert(MESSAGE_TYPE_KEY.to_string(), "RESOLUTION_REQUEST".to_string());
            fields.insert("attacker".to_string(), local.attacker.clone());
            fields.insert("move_used".to_string(), local.move_used.clone());
            fields.insert("damage_dealt".to_string(), local.damage_dealt.to_string());
            fields.insert("defender_hp_remaining".to_string(), local.defender_hp_remaining.to_string());
            state.reliability.send_reliable(&self.transport, &mut fields, &peer);

            // We are the sole authority on this turn's numbers (spec.md §9):
            // nobody sends us back a RESOLUTION_REQUEST to react to, so we
            // advance our own turn state immediately instead of waiting on a
            // round trip the redesign no longer has.
            state.session.flip_turn_owner();
            state.session.clear_turn_buffers();
            state.session.phase = Phase::WaitingForMove;
        }
        Ok(())
    }

    fn on_calculation_confirm(&self, state: &mut EngineState) -> Result<(), EngineError> {
        if state.session.role == Role::Spectator {
            return Ok(());
        }
        state.session.flip_turn_owner();
        state.session.clear_turn_buffers();
        state.session.phase = Phase::WaitingForMove;
        Ok(())
    }

    /// Only the defender accepts a `RESOLUTION_REQUEST` — spec.md §9's
    /// redesign over the reference, which let either side's request win
    /// whichever arrived last.
    fn on_resolution_request(&self, state: &mut EngineState, fields: &Fields) -> Result<(), EngineError> {
        if state.session.role == Role::Spectator {
            return Ok(());
        }
        if state.session.turn_owner == TurnOwner::Local {
            // We issued this turn's ATTACK_ANNOUNCE; we are the authority, not the acceptor.
            return Ok(());
        }

        let attacker_name = fields.get("attacker").cloned().unwrap_or_default();
        let defender_hp_remaining = codec::parse_int_field(fields, "defender_hp_remaining").unwrap_or(0);

        let remote_is_attacker = state
            .session
            .remote
            .as_ref()
            .map(|c| c.name == attacker_name)
            .unwrap_or(false);

        if remote_is_attacker {
            if let Some(local) = state.session.local.as_mut() {
                local.hp = defender_hp_remaining;
                local.clamp_hp();
            }
        } else if let Some(remote) = state.session.remote.as_mut() {
            remote.hp = defender_hp_remaining;
            remote.clamp_hp();
        }

        state.session.flip_turn_owner();
        state.session.clear_turn_buffers();
        state.session.phase = Phase::WaitingForMove;
        Ok(())
    }

    fn on_game_over(&self, state: &mut EngineState) -> Result<(), EngineError> {
        state.session.phase = Phase::GameOver;
        state.session.running = false;
        Ok(())
    }

    fn on_chat_message(&self, state: &mut EngineState, fields: &Fields, from_addr: &PeerAddr) -> Result<(), EngineError> {
        let Some(parsed) = chat::parse_chat_message(fields) else {
            return Ok(());
        };

        if state.session.is_host() {
            let from_battler = state.session.peer_addr.as_ref() == Some(from_addr);
            if from_battler {
                if state.session.remote_trainer_name.is_none() {
                    state.session.remote_trainer_name = Some(parsed.sender_name.clone());
                }
            } else {
                state.session.spectators.entry(from_addr.clone()).or_insert_with(|| Some(parsed.sender_name.clone()));
            }
        }

        if parsed.content_type == ChatContentType::Sticker {
            if let Some(data) = &parsed.sticker_data {
                if !self.sticker_policy.accept(&parsed.sender_name, data) {
                    warn!(self.logger, "sticker rejected by policy"; "sender" => %parsed.sender_name);
                }
            }
        }
        Ok(())
    }
}

fn maybe_complete_setup(session: &mut Session) {
    if session.both_creatures_present() && session.phase != Phase::WaitingForMove {
        session.phase = Phase::WaitingForMove;
        session.turn_owner = if session.is_host() { TurnOwner::Local } else { TurnOwner::Remote };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DamageCategory, InMemoryMoveCatalog, Move};
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::types::Severity;
    use sloggers::Build;
    use std::collections::{HashMap as StdHashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn test_logger() -> Logger {
        let mut builder = TerminalLoggerBuilder::new();
        builder.level(Severity::Critical);
        builder.destination(Destination::Stderr);
        builder.build().unwrap()
    }

    /// An in-memory transport shared between two or three engines under
    /// test via `VecDeque` mailboxes keyed by address, standing in for
    /// the external UDP socket (spec.md §8's end-to-end scenarios).
    #[derive(Clone)]
    struct ChannelTransport {
        self_addr: PeerAddr,
        mailboxes: std::sync::Arc<StdMutex<StdHashMap<PeerAddr, VecDeque<(Vec<u8>, PeerAddr)>>>>,
        drop_next: std::sync::Arc<StdMutex<u32>>,
    }

    impl ChannelTransport {
        fn new_network() -> std::sync::Arc<StdMutex<StdHashMap<PeerAddr, VecDeque<(Vec<u8>, PeerAddr)>>>> {
            std::sync::Arc::new(StdMutex::new(StdHashMap::new()))
        }

        fn endpoint(
            addr: PeerAddr,
            network: std::sync::Arc<StdMutex<StdHashMap<PeerAddr, VecDeque<(Vec<u8>, PeerAddr)>>>>,
        ) -> Self {
            network.lock().unwrap().entry(addr.clone()).or_default();
            ChannelTransport {
                self_addr: addr,
                mailboxes: network,
                drop_next: std::sync::Arc::new(StdMutex::new(0)),
            }
        }

        fn drop_next_n(&self, n: u32) {
            *self.drop_next.lock().unwrap() = n;
        }
    }

    impl Transport for ChannelTransport {
        fn send(&self, bytes: &[u8], addr: &PeerAddr) -> bool {
            let mut drop_count = self.drop_next.lock().unwrap();
            if *drop_count > 0 {
                *drop_count -= 1;
                return true;
            }
            let mut net = self.mailboxes.lock().unwrap();
            net.entry(addr.clone())
                .or_default()
                .push_back((bytes.to_vec(), self.self_addr.clone()));
            true
        }

        fn receive(&self) -> Option<(Vec<u8>, PeerAddr)> {
            let mut net = self.mailboxes.lock().unwrap();
            net.get_mut(&self.self_addr).and_then(|q| q.pop_front())
        }
    }

    fn sample_creature(name: &str, max_hp: i64, special_attack: f64, special_defense: f64) -> Creature {
        let mut effectiveness = StdHashMap::new();
        effectiveness.insert("fire".to_string(), 2.0);
        Creature {
            name: name.to_string(),
            max_hp,
            hp: max_hp,
            attack: 50.0,
            special_attack,
            defense: 50.0,
            special_defense,
            types: vec!["normal".into()],
            abilities: vec![],
            special_attack_uses: 0,
            special_defense_uses: 0,
            effectiveness,
        }
    }

    fn catalog_with_fire_blast() -> InMemoryMoveCatalog {
        InMemoryMoveCatalog::new().with_move(Move {
            name: "Fire Blast".into(),
            power: 50.0,
            damage_category: DamageCategory::Special,
            move_type: "fire".into(),
            scale_with_hp: false,
            hp_ratio: 0.0,
            power_min: 0.0,
            power_max: 0.0,
        })
    }

    fn pump(engines: &[&Engine<ChannelTransport, InMemoryMoveCatalog>], rounds: usize) {
        for _ in 0..rounds {
            for engine in engines {
                let _ = engine.poll_once();
            }
        }
    }

    #[test]
    fn handshake_completes_and_seeds_both_rngs() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5001);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5002);

        let host = Engine::new(
            ChannelTransport::endpoint(host_addr.clone(), network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Host,
            "Red",
            test_logger(),
        );
        let joiner = Engine::new(
            ChannelTransport::endpoint(joiner_addr.clone(), network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Joiner,
            "Blue",
            test_logger(),
        );

        joiner.begin_handshake(host_addr).unwrap();
        pump(&[&host, &joiner], 4);

        assert_eq!(host.snapshot().phase_label, "WAITING_FOR_SETUP");
        assert_eq!(joiner.snapshot().phase_label, "WAITING_FOR_SETUP");
    }

    #[test]
    fn one_hit_ko_ends_in_game_over() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5101);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5102);

        let host = Engine::new(
            ChannelTransport::endpoint(host_addr.clone(), network.clone()),
            catalog_with_fire_blast(),
            Role::Host,
            "Red",
            test_logger(),
        );
        let joiner = Engine::new(
            ChannelTransport::endpoint(joiner_addr.clone(), network.clone()),
            catalog_with_fire_blast(),
            Role::Joiner,
            "Blue",
            test_logger(),
        );

        joiner.begin_handshake(host_addr).unwrap();
        pump(&[&host, &joiner], 4);

        host.submit_battle_setup(sample_creature("Charizard", 10, 200.0, 1.0), "{}").unwrap();
        joiner.submit_battle_setup(sample_creature("Blastoise", 10, 200.0, 1.0), "{}").unwrap();
        pump(&[&host, &joiner], 6);

        assert_eq!(host.snapshot().phase_label, "WAITING_FOR_MOVE");

        host.submit_move("Fire Blast").unwrap();
        pump(&[&host, &joiner], 20);

        assert!(!host.is_running());
        assert!(!joiner.is_running());
        assert_eq!(host.snapshot().phase_label, "GAME_OVER");
    }

    #[test]
    fn retransmission_recovers_a_dropped_battle_setup() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5201);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5202);

        let host_transport = ChannelTransport::endpoint(host_addr.clone(), network.clone());
        let host = Engine::new(host_transport.clone(), InMemoryMoveCatalog::new(), Role::Host, "Red", test_logger());
        let joiner = Engine::new(
            ChannelTransport::endpoint(joiner_addr.clone(), network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Joiner,
            "Blue",
            test_logger(),
        );

        joiner.begin_handshake(host_addr).unwrap();
        pump(&[&host, &joiner], 4);

        host_transport.drop_next_n(1);
        host.submit_battle_setup(sample_creature("Charizard", 100, 50.0, 50.0), "{}").unwrap();

        // Without a retransmission the joiner would never see BATTLE_SETUP.
        pump(&[&host, &joiner], 1);
        assert!(joiner.snapshot().remote.is_none());

        pump(&[&host, &joiner], 20);
        assert!(joiner.snapshot().remote.is_some());
    }

    #[test]
    fn spectator_receives_sanitized_relay_of_battle_events() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5301);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5302);
        let spectator_addr = PeerAddr::new("127.0.0.1", 5303);

        let host = Engine::new(
            ChannelTransport::endpoint(host_addr.clone(), network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Host,
            "Red",
            test_logger(),
        );
        let joiner = Engine::new(
            ChannelTransport::endpoint(joiner_addr.clone(), network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Joiner,
            "Blue",
            test_logger(),
        );
        let spectator = Engine::new(
            ChannelTransport::endpoint(spectator_addr, network.clone()),
            InMemoryMoveCatalog::new(),
            Role::Spectator,
            "Gary",
            test_logger(),
        );

        joiner.begin_handshake(host_addr.clone()).unwrap();
        pump(&[&host, &joiner, &spectator], 3);

        spectator.send_spectator_request(host_addr, Some("Gary".to_string())).unwrap();
        pump(&[&host, &joiner, &spectator], 6);

        joiner.submit_battle_setup(sample_creature("Squirtle", 30, 40.0, 40.0), "{}").unwrap();
        pump(&[&host, &joiner, &spectator], 12);

        assert!(spectator.snapshot().remote.is_some());
    }

    #[test]
    fn discrepancy_is_resolved_by_attacker_authority() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5401);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5402);

        let host = Engine::new(
            ChannelTransport::endpoint(host_addr.clone(), network.clone()),
            catalog_with_fire_blast(),
            Role::Host,
            "Red",
            test_logger(),
        );
        let joiner = Engine::new(
            ChannelTransport::endpoint(joiner_addr.clone(), network.clone()),
            catalog_with_fire_blast(),
            Role::Joiner,
            "Blue",
            test_logger(),
        );

        joiner.begin_handshake(host_addr).unwrap();
        pump(&[&host, &joiner], 4);

        host.submit_battle_setup(sample_creature("Charizard", 200, 60.0, 50.0), "{}").unwrap();
        joiner.submit_battle_setup(sample_creature("Blastoise", 200, 60.0, 50.0), "{}").unwrap();
        pump(&[&host, &joiner], 6);

        host.submit_move("Fire Blast").unwrap();
        // Let the joiner (defender) process ATTACK_ANNOUNCE and compute its
        // own CALCULATION_REPORT, then inject a one-time off-by-one into it
        // before the report is exchanged — the test hook spec.md §8's
        // scenario 3 calls for.
        joiner.poll_once().unwrap();
        {
            let mut state = joiner.state.lock().unwrap();
            let report = state.session.local_calc_report.as_mut().expect("defender already calculated");
            report.damage_dealt += 1;
            report.defender_hp_remaining -= 1;
        }

        pump(&[&host, &joiner], 20);

        // No GAME_OVER: the corrected hp (80) is well above zero.
        assert!(host.is_running());
        assert!(joiner.is_running());
        assert_eq!(host.snapshot().phase_label, "WAITING_FOR_MOVE");
        assert_eq!(joiner.snapshot().phase_label, "WAITING_FOR_MOVE");
        // The attacker is sole authority: the defender's corrupted hp was
        // overwritten to match the attacker's number, not the other way
        // round, and both sides' turn owner advanced together.
        let joiner_hp = joiner.snapshot().local.unwrap().hp;
        let host_view_of_joiner_hp = host.snapshot().remote.unwrap().hp;
        assert_eq!(joiner_hp, host_view_of_joiner_hp);
        assert_eq!(joiner_hp, 80);
    }

    #[test]
    fn retry_exhaustion_terminates_the_stalled_side() {
        let network = ChannelTransport::new_network();
        let host_addr = PeerAddr::new("127.0.0.1", 5501);
        let joiner_addr = PeerAddr::new("127.0.0.1", 5502);

        let host = Engine::new(
            ChannelTransport::endpoint(host_addr.clone(), network.clone()),
            catalog_with_fire_blast(),
            Role::Host,
            "Red",
            test_logger(),
        );
        let joiner_transport = ChannelTransport::endpoint(joiner_addr, network.clone());
        let joiner = Engine::new(joiner_transport.clone(), catalog_with_fire_blast(), Role::Joiner, "Blue", test_logger());

        joiner.begin_handshake(host_addr).unwrap();
        pump(&[&host, &joiner], 4);

        host.submit_battle_setup(sample_creature("Charizard", 200, 60.0, 50.0), "{}").unwrap();
        joiner.submit_battle_setup(sample_creature("Blastoise", 200, 60.0, 50.0), "{}").unwrap();
        pump(&[&host, &joiner], 6);

        // Drop every copy of the joiner's outbound datagrams from this
        // point on, simulating a peer that never answers ATTACK_ANNOUNCE.
        joiner_transport.drop_next_n(u32::MAX);
        host.submit_move("Fire Blast").unwrap();

        // The default timeout is 500ms with 3 retries; advance real time
        // past each retransmission window until exhaustion fires (spec.md
        // §8's scenario 5: "~2s total").
        let mut reliability_error = false;
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(550));
            if host.poll_once().is_err() {
                reliability_error = true;
                break;
            }
        }

        assert!(reliability_error, "expected reliability exhaustion to surface as an error");
        assert!(!host.is_running());
        assert_eq!(host.snapshot().phase_label, "GAME_OVER");
    }
}
