//! Thin driver binary for `pokeproto-core`.
//!
//! Wires a [`UdpTransport`] and an in-memory move catalog to an [`Engine`],
//! runs the network tick on the main thread and a blocking stdin reader on
//! a second thread, and prints state transitions to the terminal. CSV
//! ingestion of a real creature/move database, LAN broadcast discovery and
//! sticker persistence are deliberately left external: this binary only
//! demonstrates the wiring, using a couple of built-in moves and a
//! `--peer` flag in place of a discovery side-channel.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use pokeproto_core::prelude::*;
use slog::{info, o, Logger};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Host,
    Joiner,
    Spectator,
}

/// A PokeProtocol battle peer.
#[derive(Parser, Debug)]
#[command(name = "pokeproto", about = "Peer-to-peer turn-based battle protocol driver")]
struct Args {
    /// Role this process plays in the session.
    #[arg(long, value_enum)]
    role: RoleArg,

    /// Trainer (or spectator) display name.
    #[arg(long, default_value = "Trainer")]
    name: String,

    /// Local UDP port to bind.
    #[arg(long, default_value_t = 5555)]
    port: u16,

    /// Host address to connect to, as `ip:port`. Required for joiner and
    /// spectator roles; stands in for the out-of-scope LAN discovery
    /// side-channel (spec.md §1).
    #[arg(long)]
    peer: Option<String>,

    /// Creature to bring into battle, as `name,max_hp,attack,special_attack,defense,special_defense`.
    #[arg(long, default_value = "Charizard,78,84,109,78,85")]
    creature: String,

    /// Log verbosity.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_logger(level: &str) -> Result<Logger> {
    let severity = level.parse::<Severity>().unwrap_or(Severity::Info);
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stderr);
    Ok(builder.build().context("failed to build logger")?)
}

fn parse_peer_addr(raw: &str) -> Result<PeerAddr> {
    let (ip, port) = raw.rsplit_once(':').context("peer address must be ip:port")?;
    let port: u16 = port.parse().context("peer port must be a number")?;
    Ok(PeerAddr::new(ip.to_string(), port))
}

fn parse_creature(spec: &str) -> Result<Creature> {
    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() != 6 {
        bail!("--creature must have 6 comma-separated fields, got {}", parts.len());
    }
    let max_hp: i64 = parts[1].trim().parse().context("max_hp")?;
    Ok(Creature {
        name: parts[0].trim().to_string(),
        max_hp,
        hp: max_hp,
        attack: parts[2].trim().parse().context("attack")?,
        special_attack: parts[3].trim().parse().context("special_attack")?,
        defense: parts[4].trim().parse().context("defense")?,
        special_defense: parts[5].trim().parse().context("special_defense")?,
        types: vec!["normal".to_string()],
        abilities: vec![],
        special_attack_uses: 3,
        special_defense_uses: 3,
        effectiveness: Default::default(),
    })
}

/// A handful of built-in moves, standing in for the out-of-scope CSV move
/// database (spec.md §1).
fn demo_move_catalog() -> InMemoryMoveCatalog {
    InMemoryMoveCatalog::new()
        .with_move(Move {
            name: "Tackle".to_string(),
            power: 40.0,
            damage_category: DamageCategory::Physical,
            move_type: "normal".to_string(),
            scale_with_hp: false,
            hp_ratio: 0.0,
            power_min: 0.0,
            power_max: 0.0,
        })
        .with_move(Move {
            name: "Ember".to_string(),
            power: 40.0,
            damage_category: DamageCategory::Special,
            move_type: "fire".to_string(),
            scale_with_hp: false,
            hp_ratio: 0.0,
            power_min: 0.0,
            power_max: 0.0,
        })
        .with_move(Move {
            name: "Endeavor".to_string(),
            power: 0.0,
            damage_category: DamageCategory::Physical,
            move_type: "normal".to_string(),
            scale_with_hp: true,
            hp_ratio: 1.0,
            power_min: 1.0,
            power_max: 150.0,
        })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let logger = build_logger(&args.log_level)?;

    let role = match args.role {
        RoleArg::Host => Role::Host,
        RoleArg::Joiner => Role::Joiner,
        RoleArg::Spectator => Role::Spectator,
    };

    let transport = UdpTransport::bind("0.0.0.0", args.port, logger.new(o!("component" => "transport")))
        .with_context(|| format!("failed to bind UDP port {}", args.port))?;
    info!(logger, "bound local endpoint"; "port" => args.port, "role" => format!("{:?}", role));

    let engine = Arc::new(Engine::new(
        transport,
        demo_move_catalog(),
        role,
        args.name.clone(),
        logger.new(o!("component" => "engine")),
    ));

    let creature = if role != Role::Spectator {
        Some(parse_creature(&args.creature)?)
    } else {
        None
    };

    match role {
        Role::Joiner => {
            let peer = args.peer.as_deref().context("--peer is required for the joiner role")?;
            let host_addr = parse_peer_addr(peer)?;
            let locator = StaticPeerLocator::new(host_addr);
            let host_addr = locator.locate().context("no host address available")?;
            engine.begin_handshake(host_addr)?;
            engine.submit_battle_setup(creature.clone().unwrap(), "{}")?;
        }
        Role::Spectator => {
            let peer = args.peer.as_deref().context("--peer is required for the spectator role")?;
            let host_addr = parse_peer_addr(peer)?;
            engine.send_spectator_request(host_addr, Some(args.name.clone()))?;
        }
        Role::Host => {
            // The host has no peer address to send BATTLE_SETUP to until a
            // joiner's HANDSHAKE_REQUEST arrives, so wait for that before
            // submitting (mirrors the original's post-handshake,
            // UI-invoked send_battle_setup).
            info!(logger, "waiting for a joiner to connect");
            while !engine.has_peer() && engine.is_running() {
                engine.poll_once()?;
            }
            if engine.is_running() {
                engine.submit_battle_setup(creature.clone().unwrap(), "{}")?;
            }
        }
    }

    spawn_input_thread(engine.clone());

    while engine.is_running() {
        match engine.poll_once() {
            Ok(true) => {
                let snapshot = engine.snapshot();
                info!(logger, "session state";
                    "phase" => snapshot.phase_label,
                    "running" => snapshot.running);
            }
            Ok(false) => {}
            Err(err) => {
                eprintln!("session ended: {err}");
                break;
            }
        }
    }

    Ok(())
}

/// Reads whitespace-separated driver commands from stdin on a background
/// thread: `move <name>`, `chat <text...>`, `quit`. This stands in for the
/// out-of-scope interactive text UI (spec.md §1); it only demonstrates
/// which `Engine` methods a real UI would call.
fn spawn_input_thread<T, C>(engine: Arc<Engine<T, C>>)
where
    T: Transport + 'static,
    C: MoveCatalog + 'static,
{
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !engine.is_running() {
                break;
            }

            let mut parts = line.splitn(2, ' ');
            match parts.next() {
                Some("move") => {
                    if let Some(move_name) = parts.next() {
                        if let Err(err) = engine.submit_move(move_name.to_string()) {
                            eprintln!("move rejected: {err}");
                        }
                    }
                }
                Some("chat") => {
                    if let Some(text) = parts.next() {
                        if let Err(err) = engine.submit_chat_text(text.to_string()) {
                            eprintln!("chat failed: {err}");
                        }
                    }
                }
                Some("quit") => break,
                _ => eprintln!("unrecognized command: {line}"),
            }
        }
        // Give the network loop a moment to notice before the process exits.
        std::thread::sleep(Duration::from_millis(50));
    });
}
