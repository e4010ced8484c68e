//! Reliability layer: monotonic sequencing, per-destination retransmission
//! with bounded retries, and automatic ACK emission. Grounded on
//! `original_source/protocol/reliability.py`'s `ReliabilityLayer`, carried
//! over line-for-line in spirit — pending keyed by `(sequence, dest)` per
//! spec.md §9's fix for host fan-out.

use crate::codec::{self, Fields, ACK_NUMBER_KEY, MESSAGE_TYPE_KEY, SEQUENCE_NUMBER_KEY};
use crate::error::ReliabilityError;
use crate::model::PeerAddr;
use crate::transport::Transport;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_MAX_RETRIES: u32 = 3;

/// `(encoded bytes, last send time, retry count)` for one destination of
/// one sequence number.
struct PendingRecord {
    bytes: Vec<u8>,
    last_sent: Instant,
    retries: u32,
}

pub struct ReliabilityLayer {
    seq: u64,
    pending: HashMap<(u64, PeerAddr), PendingRecord>,
    timeout: Duration,
    max_retries: u32,
}

impl Default for ReliabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityLayer {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_TIMEOUT, DEFAULT_MAX_RETRIES)
    }

    pub fn with_params(timeout: Duration, max_retries: u32) -> Self {
        ReliabilityLayer {
            seq: 0,
            pending: HashMap::new(),
            timeout,
            max_retries,
        }
    }

    /// Number of un-ACKed datagrams currently tracked. Exposed for tests
    /// asserting invariant 3 (every pending record is either ACKed or
    /// under the retry ceiling).
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn next_sequence(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Stamp `fields` with the next sequence number, encode, send, and
    /// track the datagram for retransmission. Returns whether the initial
    /// send succeeded and the sequence number used.
    pub fn send_reliable(
        &mut self,
        transport: &dyn Transport,
        fields: &mut Fields,
        addr: &PeerAddr,
    ) -> (bool, u64) {
        let seq = self.next_sequence();
        fields.insert(SEQUENCE_NUMBER_KEY.to_string(), seq.to_string());
        let bytes = codec::encode_message(fields);

        let ok = transport.send(&bytes, addr);
        self.pending.insert(
            (seq, addr.clone()),
            PendingRecord {
                bytes,
                last_sent: Instant::now(),
                retries: 0,
            },
        );
        (ok, seq)
    }

    /// Assign a single sequence number and send the same encoding to
    /// multiple destinations, tracking a separate pending record per
    /// destination under that shared sequence number — the mechanism the
    /// host relay relies on to fan out one logical message to every
    /// spectator.
    pub fn send_reliable_to_many(
        &mut self,
        transport: &dyn Transport,
        fields: &mut Fields,
        addrs: &[PeerAddr],
    ) -> (bool, u64) {
        let seq = self.next_sequence();
        fields.insert(SEQUENCE_NUMBER_KEY.to_string(), seq.to_string());
        let bytes = codec::encode_message(fields);
        let now = Instant::now();

        let mut aggregate_ok = true;
        for addr in addrs {
            let ok = transport.send(&bytes, addr);
            aggregate_ok &= ok;
            self.pending.insert(
                (seq, addr.clone()),
                PendingRecord {
                    bytes: bytes.clone(),
                    last_sent: now,
                    retries: 0,
                },
            );
        }
        (aggregate_ok, seq)
    }

    /// Remove the pending record for `(ack_number, addr)`, if any.
    pub fn handle_ack(&mut self, ack_number: u64, addr: &PeerAddr) {
        self.pending.remove(&(ack_number, addr.clone()));
    }

    /// Send `{message_type: ACK, ack_number: seq}` to `addr`. ACKs are
    /// never themselves tracked for retransmission.
    pub fn send_ack(&self, transport: &dyn Transport, seq: u64, addr: &PeerAddr) {
        let mut ack_fields = Fields::new();
        ack_fields.insert(MESSAGE_TYPE_KEY.to_string(), "ACK".to_string());
        ack_fields.insert(ACK_NUMBER_KEY.to_string(), seq.to_string());
        let bytes = codec::encode_message(&ack_fields);
        transport.send(&bytes, addr);
    }

    /// Align the local sequence counter to any larger inbound sequence
    /// number, returning the parsed sequence if the field was present and
    /// a valid integer. Does not itself emit an ACK — callers decide
    /// whether the message is well-formed enough to ACK (spec.md §7's
    /// open question; this implementation withholds the ACK on malformed
    /// messages, see [`crate::engine`]).
    pub fn align_sequence(&mut self, fields: &Fields) -> Option<u64> {
        let seq: u64 = fields.get(SEQUENCE_NUMBER_KEY)?.parse().ok()?;
        if seq > self.seq {
            self.seq = seq;
        }
        Some(seq)
    }

    /// Scan all pending records; retransmit anything past `timeout` since
    /// its last send, or raise [`ReliabilityError`] once a destination has
    /// exhausted `max_retries`. Non-blocking; ordering across entries is
    /// irrelevant (spec.md §4.3).
    pub fn tick(&mut self, transport: &dyn Transport) -> Result<(), ReliabilityError> {
        let now = Instant::now();
        let mut expired = Vec::new();

        for (key, record) in &mut self.pending {
            if now.duration_since(record.last_sent) <= self.timeout {
                continue;
            }
            if record.retries >= self.max_retries {
                expired.push(key.clone());
                continue;
            }
            transport.send(&record.bytes, &key.1);
            record.retries += 1;
            record.last_sent = now;
        }

        if let Some((seq, dest)) = expired.into_iter().next() {
            return Err(ReliabilityError {
                sequence: seq,
                dest,
                max_retries: self.max_retries,
            });
        }
        Ok(())
    }
}
