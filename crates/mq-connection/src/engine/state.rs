//! Per-session MQTT state: in-flight requests and incoming QoS 2 receipts.
//!
//! No I/O happens here. The event loop feeds packets in and writes whatever
//! comes back out, which keeps the QoS flows testable without a socket.

use std::collections::HashSet;

use bytes::BytesMut;
use mq_protocol::{Packet, Publish, QoS, Subscribe, Unsubscribe, codec};

use crate::engine::EngineEvent;
use crate::error::{MqttError, MqttResult};

/// Request queued from the session to its event loop.
#[derive(Debug)]
pub(crate) enum Command {
    /// QoS 0 publishes carry a local id in `pkid`; it is never written.
    Publish(Publish),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Ping,
    Disconnect,
}

/// Request waiting for the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    /// QoS 1 awaiting PUBACK or QoS 2 awaiting PUBREC.
    Publish(Publish),
    /// QoS 2 past PUBREC, awaiting PUBCOMP.
    Release(u16),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

impl Pending {
    fn pkid(&self) -> u16 {
        match self {
            Pending::Publish(p) => p.pkid,
            Pending::Release(id) => *id,
            Pending::Subscribe(s) => s.pkid,
            Pending::Unsubscribe(u) => u.pkid,
        }
    }
}

/// What handling one incoming packet produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Incoming {
    /// Acknowledgement to write back.
    pub reply: Option<Packet>,
    /// Event for the façade.
    pub event: Option<EngineEvent>,
    /// Packet identifier that is free again.
    pub released: Option<u16>,
    pub pong: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MqttState {
    /// Outgoing requests in submission order, for resend on reconnect.
    outbox: Vec<Pending>,
    /// Incoming QoS 2 identifiers delivered but not yet released by PUBREL.
    incoming_qos2: HashSet<u16>,
}

impl MqttState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Encode an outgoing publish into `frame`. A QoS 0 publish returns its
    /// local id: it completes once written. A QoS 1/2 publish enters the
    /// outbox only if it encodes.
    pub(crate) fn outgoing_publish(
        &mut self,
        mut publish: Publish,
        frame: &mut BytesMut,
    ) -> MqttResult<Option<u16>> {
        if publish.qos == QoS::AtMostOnce {
            let local_id = publish.pkid;
            publish.pkid = 0;
            encode_frame(&Packet::Publish(publish), frame)?;
            return Ok(Some(local_id));
        }
        encode_frame(&Packet::Publish(publish.clone()), frame)?;
        self.outbox.push(Pending::Publish(publish));
        Ok(None)
    }

    pub(crate) fn outgoing_subscribe(
        &mut self,
        subscribe: Subscribe,
        frame: &mut BytesMut,
    ) -> MqttResult<()> {
        encode_frame(&Packet::Subscribe(subscribe.clone()), frame)?;
        self.outbox.push(Pending::Subscribe(subscribe));
        Ok(())
    }

    pub(crate) fn outgoing_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
        frame: &mut BytesMut,
    ) -> MqttResult<()> {
        encode_frame(&Packet::Unsubscribe(unsubscribe.clone()), frame)?;
        self.outbox.push(Pending::Unsubscribe(unsubscribe));
        Ok(())
    }

    pub(crate) fn incoming(&mut self, packet: Packet) -> MqttResult<Incoming> {
        let mut out = Incoming::default();
        match packet {
            Packet::Publish(publish) => match publish.qos {
                QoS::AtMostOnce => out.event = Some(EngineEvent::Publish(publish)),
                QoS::AtLeastOnce => {
                    out.reply = Some(Packet::PubAck(publish.pkid));
                    out.event = Some(EngineEvent::Publish(publish));
                }
                QoS::ExactlyOnce => {
                    out.reply = Some(Packet::PubRec(publish.pkid));
                    if self.incoming_qos2.insert(publish.pkid) {
                        out.event = Some(EngineEvent::Publish(publish));
                    } else {
                        tracing::debug!(packet_id = publish.pkid, "duplicate QoS 2 publish");
                    }
                }
            },
            Packet::PubRel(id) => {
                self.incoming_qos2.remove(&id);
                out.reply = Some(Packet::PubComp(id));
            }
            Packet::PubAck(id) => {
                let qos1 = |p: &Pending| matches!(p, Pending::Publish(p) if p.qos == QoS::AtLeastOnce);
                if self.take(id, qos1) {
                    out.event = Some(EngineEvent::PublishComplete { packet_id: id });
                    out.released = Some(id);
                }
            }
            Packet::PubRec(id) => {
                let slot = self.outbox.iter_mut().find(|p| match p {
                    Pending::Publish(publish) => {
                        publish.pkid == id && publish.qos == QoS::ExactlyOnce
                    }
                    Pending::Release(rel) => *rel == id,
                    _ => false,
                });
                match slot {
                    Some(slot) => {
                        *slot = Pending::Release(id);
                        out.reply = Some(Packet::PubRel(id));
                    }
                    None => tracing::debug!(packet_id = id, "PUBREC for unknown packet id"),
                }
            }
            Packet::PubComp(id) => {
                if self.take(id, |p| matches!(p, Pending::Release(_))) {
                    out.event = Some(EngineEvent::PublishComplete { packet_id: id });
                    out.released = Some(id);
                }
            }
            Packet::SubAck(ack) => {
                if self.take(ack.pkid, |p| matches!(p, Pending::Subscribe(_))) {
                    out.event = Some(EngineEvent::SubAck {
                        packet_id: ack.pkid,
                        return_codes: ack.return_codes,
                    });
                    out.released = Some(ack.pkid);
                }
            }
            Packet::UnsubAck(id) => {
                if self.take(id, |p| matches!(p, Pending::Unsubscribe(_))) {
                    out.event = Some(EngineEvent::UnsubAck { packet_id: id });
                    out.released = Some(id);
                }
            }
            Packet::PingResp => out.pong = true,
            other => return Err(MqttError::UnexpectedPacket(other.packet_type().name())),
        }
        Ok(out)
    }

    /// Packets to write after a reconnect, oldest first.
    pub(crate) fn resend(&self) -> Vec<Packet> {
        self.outbox
            .iter()
            .map(|pending| match pending {
                Pending::Publish(publish) => Packet::Publish(Publish {
                    dup: true,
                    ..publish.clone()
                }),
                Pending::Release(id) => Packet::PubRel(*id),
                Pending::Subscribe(s) => Packet::Subscribe(s.clone()),
                Pending::Unsubscribe(u) => Packet::Unsubscribe(u.clone()),
            })
            .collect()
    }

    /// The broker dropped the previous session; incoming QoS 2 receipts
    /// refer to nothing now.
    pub(crate) fn session_lost(&mut self) {
        self.incoming_qos2.clear();
    }

    /// Drop everything. Returns the number of outgoing requests discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.outbox.len();
        self.outbox.clear();
        self.incoming_qos2.clear();
        discarded
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.outbox.len()
    }

    fn take(&mut self, id: u16, kind: impl Fn(&Pending) -> bool) -> bool {
        match self.outbox.iter().position(|p| p.pkid() == id && kind(p)) {
            Some(index) => {
                self.outbox.remove(index);
                true
            }
            None => {
                tracing::debug!(packet_id = id, "acknowledgement for unknown packet id");
                false
            }
        }
    }
}

/// Replace the contents of `frame` with the encoded `packet`.
fn encode_frame(packet: &Packet, frame: &mut BytesMut) -> MqttResult<()> {
    frame.clear();
    codec::encode(packet, frame)?;
    Ok(())
}
