//! Outbound note messages.
//!
//! Live batches go out as OSC bundles carrying three messages, `/note`,
//! `/velocity` and `/duration`, each holding one argument per note in the
//! same order.

use std::{
    io::ErrorKind,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex, MutexGuard},
};

use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use serde::{Deserialize, Serialize};

use crate::{mapping::NoteEvent, Result, SonifierError};

pub const NOTE_ADDRESS: &str = "/note";
pub const VELOCITY_ADDRESS: &str = "/velocity";
pub const DURATION_ADDRESS: &str = "/duration";

/// OSC timetag meaning "process on receipt".
const IMMEDIATELY: OscTime = OscTime {
    seconds: 0,
    fractional: 1,
};

/// One cycle's notes as three parallel sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteBatch {
    pub notes: Vec<u8>,
    pub velocities: Vec<u8>,
    pub durations: Vec<f32>,
}

impl NoteBatch {
    /// Returns `None` for an empty cycle, which must not be sent.
    pub fn from_events(events: &[NoteEvent]) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self {
            notes: events.iter().map(|event| event.pitch).collect(),
            velocities: events.iter().map(|event| event.velocity).collect(),
            durations: events.iter().map(|event| event.duration).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// The batch as one immediate OSC bundle.
    pub fn to_osc(&self) -> OscPacket {
        let message = |addr: &str, args: Vec<OscType>| {
            OscPacket::Message(OscMessage {
                addr: addr.to_string(),
                args,
            })
        };
        OscPacket::Bundle(OscBundle {
            timetag: IMMEDIATELY,
            content: vec![
                message(NOTE_ADDRESS, self.notes.iter().map(|&note| OscType::Int(i32::from(note))).collect()),
                message(
                    VELOCITY_ADDRESS,
                    self.velocities
                        .iter()
                        .map(|&velocity| OscType::Int(i32::from(velocity)))
                        .collect(),
                ),
                message(DURATION_ADDRESS, self.durations.iter().map(|&duration| OscType::Float(duration)).collect()),
            ],
        })
    }
}

/// Sink for note batches. Implementations must not block the loop for long.
pub trait Transmitter: Send {
    fn send(&mut self, batch: &NoteBatch) -> Result<()>;
}

/// Sends each batch as a single OSC bundle datagram over a non-blocking
/// socket.
#[derive(Debug)]
pub struct UdpTransmitter {
    socket: UdpSocket,
    target: SocketAddr,
    dropped: u64,
}

impl UdpTransmitter {
    pub fn connect(target: &str) -> Result<Self> {
        let target = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SonifierError::msg(format!("`{target}` did not resolve to an address")))?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        socket.connect(target)?;
        tracing::info!(%target, "UDP transmitter ready");
        Ok(Self {
            socket,
            target,
            dropped: 0,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Batches skipped because the socket buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Transmitter for UdpTransmitter {
    fn send(&mut self, batch: &NoteBatch) -> Result<()> {
        let payload = encoder::encode(&batch.to_osc())
            .map_err(|err| SonifierError::msg(format!("failed to encode OSC bundle: {err}")))?;
        match self.socket.send(&payload) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                self.dropped += 1;
                tracing::debug!(dropped = self.dropped, "socket busy, batch dropped");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps every batch in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransmitter {
    log: Arc<Mutex<Vec<NoteBatch>>>,
}

impl MemoryTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Result<Vec<NoteBatch>> {
        Ok(self.lock()?.clone())
    }

    pub fn clear(&self) -> Result<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<NoteBatch>>> {
        self.log
            .lock()
            .map_err(|_| SonifierError::msg("transmit log has been poisoned"))
    }
}

impl Transmitter for MemoryTransmitter {
    fn send(&mut self, batch: &NoteBatch) -> Result<()> {
        self.lock()?.push(batch.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(pitch: u8, velocity: u8) -> NoteEvent {
        NoteEvent {
            pitch,
            velocity,
            duration: 1.5,
            timestamp: 0.0,
        }
    }

    #[test]
    fn empty_cycles_produce_no_batch() {
        assert!(NoteBatch::from_events(&[]).is_none());
        let batch = NoteBatch::from_events(&[event(60, 100), event(64, 80)]).unwrap();
        assert_eq!(batch.notes, vec![60, 64]);
        assert_eq!(batch.velocities, vec![100, 80]);
        assert_eq!(batch.durations, vec![1.5, 1.5]);
    }

    #[test]
    fn memory_transmitter_shares_its_log() {
        let memory = MemoryTransmitter::new();
        let mut sender: Box<dyn Transmitter> = Box::new(memory.clone());
        sender.send(&NoteBatch::from_events(&[event(60, 1)]).unwrap()).unwrap();
        assert_eq!(memory.batches().unwrap().len(), 1);
    }

    fn message(packet: &OscPacket) -> (&str, &[OscType]) {
        match packet {
            OscPacket::Message(message) => (message.addr.as_str(), message.args.as_slice()),
            OscPacket::Bundle(_) => panic!("nested bundle"),
        }
    }

    #[test]
    fn batches_become_one_bundle_of_three_messages() {
        let batch = NoteBatch::from_events(&[event(60, 100), event(67, 20)]).unwrap();
        let OscPacket::Bundle(bundle) = batch.to_osc() else {
            panic!("expected a bundle");
        };
        assert_eq!(bundle.timetag, IMMEDIATELY);
        let messages: Vec<_> = bundle.content.iter().map(message).collect();
        assert_eq!(
            messages,
            vec![
                (NOTE_ADDRESS, &[OscType::Int(60), OscType::Int(67)][..]),
                (VELOCITY_ADDRESS, &[OscType::Int(100), OscType::Int(20)][..]),
                (DURATION_ADDRESS, &[OscType::Float(1.5), OscType::Float(1.5)][..]),
            ]
        );
    }

    #[test]
    fn udp_transmitter_sends_one_datagram_per_batch() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let address = receiver.local_addr().unwrap().to_string();

        let mut transmitter = UdpTransmitter::connect(&address).unwrap();
        let batch = NoteBatch::from_events(&[event(48, 70), event(55, 90)]).unwrap();
        transmitter.send(&batch).unwrap();

        let mut buffer = [0u8; 1024];
        let received = receiver.recv(&mut buffer).unwrap();
        let (rest, packet) = rosc::decoder::decode_udp(&buffer[..received]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(packet, batch.to_osc());
    }
}
