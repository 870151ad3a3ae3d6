//! MQTT 3.1.1 packet encoder/decoder.
//!
//! Frame layout:
//! ```text
//! byte 0      packet type (high nibble) | flags (low nibble)
//! bytes 1..4  remaining length, 7 bits per byte, MSB = continuation
//! ...         variable header + payload (remaining length bytes)
//! ```
//!
//! [`decode`] consumes exactly one frame from the front of a `BytesMut` and
//! leaves partial frames untouched, so it can sit directly behind a socket
//! read buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::*;
use crate::qos::QoS;

/// Largest value the remaining-length field can express.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol name sent in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

// CONNECT flag bits.
const CLEAN_SESSION: u8 = 0b0000_0010;
const WILL_FLAG: u8 = 0b0000_0100;
const WILL_RETAIN: u8 = 0b0010_0000;
const PASSWORD_FLAG: u8 = 0b0100_0000;
const USERNAME_FLAG: u8 = 0b1000_0000;

/// Flags required on SUBSCRIBE, UNSUBSCRIBE and PUBREL headers.
const REQUIRED_FLAGS: u8 = 0b0010;

// ─── Encoding ───

/// Append `packet` to `buf`. Returns the number of bytes written.
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> ProtocolResult<usize> {
    let mut body = BytesMut::new();
    let flags = encode_body(packet, &mut body)?;

    let first = ((packet.packet_type() as u8) << 4) | flags;
    let start = buf.len();
    buf.reserve(body.len() + 5);
    buf.put_u8(first);
    write_remaining_length(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(buf.len() - start)
}

fn encode_body(packet: &Packet, body: &mut BytesMut) -> ProtocolResult<u8> {
    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, body)?;
            0
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code as u8);
            0
        }
        Packet::Publish(publish) => {
            let len = publish_remaining_length(publish);
            if len > MAX_REMAINING_LENGTH {
                return Err(ProtocolError::PayloadTooLong(len));
            }
            write_string(&publish.topic, body)?;
            if publish.qos != QoS::AtMostOnce {
                non_zero(publish.pkid)?;
                body.put_u16(publish.pkid);
            }
            body.extend_from_slice(&publish.payload);
            (u8::from(publish.dup) << 3) | (publish.qos.as_u8() << 1) | u8::from(publish.retain)
        }
        Packet::PubAck(pkid) | Packet::PubRec(pkid) | Packet::PubComp(pkid) => {
            body.put_u16(non_zero(*pkid)?);
            0
        }
        Packet::PubRel(pkid) => {
            body.put_u16(non_zero(*pkid)?);
            REQUIRED_FLAGS
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(ProtocolError::EmptyFilterList);
            }
            body.put_u16(non_zero(subscribe.pkid)?);
            for filter in &subscribe.filters {
                write_string(&filter.path, body)?;
                body.put_u8(filter.qos.as_u8());
            }
            REQUIRED_FLAGS
        }
        Packet::SubAck(ack) => {
            body.put_u16(non_zero(ack.pkid)?);
            for code in &ack.return_codes {
                body.put_u8(code.as_u8());
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(ProtocolError::EmptyFilterList);
            }
            body.put_u16(non_zero(unsubscribe.pkid)?);
            for filter in &unsubscribe.filters {
                write_string(filter, body)?;
            }
            REQUIRED_FLAGS
        }
        Packet::UnsubAck(pkid) => {
            body.put_u16(non_zero(*pkid)?);
            0
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };
    Ok(flags)
}

/// Remaining length of `publish` once encoded: topic, packet id when the
/// QoS carries one, then the payload.
pub fn publish_remaining_length(publish: &Publish) -> usize {
    let pkid = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
    2 + publish.topic.len() + pkid + publish.payload.len()
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> ProtocolResult<()> {
    write_string(PROTOCOL_NAME, body)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= CLEAN_SESSION;
    }
    if let Some(will) = &connect.will {
        flags |= WILL_FLAG | (will.qos.as_u8() << 3);
        if will.retain {
            flags |= WILL_RETAIN;
        }
    }
    if let Some(login) = &connect.login {
        flags |= USERNAME_FLAG;
        if login.password.is_some() {
            flags |= PASSWORD_FLAG;
        }
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    write_string(&connect.client_id, body)?;
    if let Some(will) = &connect.will {
        write_string(&will.topic, body)?;
        write_bytes(&will.payload, body)?;
    }
    if let Some(login) = &connect.login {
        write_string(&login.username, body)?;
        if let Some(password) = &login.password {
            write_string(password, body)?;
        }
    }
    Ok(())
}

fn non_zero(pkid: u16) -> ProtocolResult<u16> {
    if pkid == 0 {
        return Err(ProtocolError::ZeroPacketId);
    }
    Ok(pkid)
}

fn write_string(value: &str, buf: &mut BytesMut) -> ProtocolResult<()> {
    write_bytes(value.as_bytes(), buf)
}

fn write_bytes(value: &[u8], buf: &mut BytesMut) -> ProtocolResult<()> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::StringTooLong(value.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(value);
    Ok(())
}

/// Write `len` as a variable byte integer.
pub fn write_remaining_length(len: usize, buf: &mut BytesMut) -> ProtocolResult<usize> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PayloadTooLong(len));
    }
    let mut value = len;
    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

// ─── Decoding ───

/// Read a variable byte integer from the start of `bytes`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded
/// value and how many bytes it occupied.
pub fn read_remaining_length(bytes: &[u8]) -> ProtocolResult<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in bytes.iter().enumerate() {
        if index == 4 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= 4 {
        return Err(ProtocolError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete frame. Frames
/// larger than `max_packet_size` are rejected before they are buffered.
pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> ProtocolResult<Option<Packet>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let Some((remaining, len_bytes)) = read_remaining_length(&buf[1..])? else {
        return Ok(None);
    };
    let header_len = 1 + len_bytes;
    let total = header_len + remaining;
    if total > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let first = buf[0];
    let mut frame = buf.split_to(total).freeze();
    frame.advance(header_len);
    decode_body(first, frame).map(Some)
}

fn decode_body(first: u8, mut body: Bytes) -> ProtocolResult<Packet> {
    let kind = PacketType::try_from(first >> 4)?;
    let flags = first & 0x0F;
    if kind == PacketType::Publish {
        return decode_publish(flags, body);
    }

    let expected = match kind {
        PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => REQUIRED_FLAGS,
        _ => 0,
    };
    expect_flags(kind, flags, expected)?;

    let packet = match kind {
        PacketType::Connect => Packet::Connect(decode_connect(&mut body)?),
        PacketType::ConnAck => {
            let ack_flags = read_u8(&mut body)?;
            if ack_flags & 0xFE != 0 {
                return Err(ProtocolError::InvalidFlags {
                    packet: kind.name(),
                    flags: ack_flags,
                });
            }
            let code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 == 1,
                code,
            })
        }
        PacketType::Publish => return decode_publish(flags, body),
        PacketType::PubAck => Packet::PubAck(read_pkid(&mut body)?),
        PacketType::PubRec => Packet::PubRec(read_pkid(&mut body)?),
        PacketType::PubRel => Packet::PubRel(read_pkid(&mut body)?),
        PacketType::PubComp => Packet::PubComp(read_pkid(&mut body)?),
        PacketType::Subscribe => decode_subscribe(&mut body)?,
        PacketType::SubAck => {
            let pkid = read_pkid(&mut body)?;
            let mut return_codes = Vec::with_capacity(body.remaining());
            while body.has_remaining() {
                return_codes.push(SubscribeReturnCode::try_from(body.get_u8())?);
            }
            Packet::SubAck(SubAck { pkid, return_codes })
        }
        PacketType::Unsubscribe => decode_unsubscribe(&mut body)?,
        PacketType::UnsubAck => Packet::UnsubAck(read_pkid(&mut body)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if body.has_remaining() {
        return Err(ProtocolError::TrailingBytes(body.remaining()));
    }
    Ok(packet)
}

fn expect_flags(kind: PacketType, flags: u8, expected: u8) -> ProtocolResult<()> {
    if flags != expected {
        return Err(ProtocolError::InvalidFlags {
            packet: kind.name(),
            flags,
        });
    }
    Ok(())
}

fn decode_publish(flags: u8, mut body: Bytes) -> ProtocolResult<Packet> {
    let qos = QoS::try_from((flags >> 1) & 0b11)?;
    let topic = read_string(&mut body)?;
    let pkid = if qos == QoS::AtMostOnce {
        0
    } else {
        read_pkid(&mut body)?
    };
    Ok(Packet::Publish(Publish {
        dup: flags & 0b1000 != 0,
        qos,
        retain: flags & 0b0001 != 0,
        topic,
        pkid,
        payload: body,
    }))
}

fn decode_connect(body: &mut Bytes) -> ProtocolResult<Connect> {
    let name = read_string(body)?;
    let level = read_u8(body)?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(ProtocolError::UnsupportedProtocol { name, level });
    }

    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    let will = if flags & WILL_FLAG != 0 {
        let topic = read_string(body)?;
        let payload = read_bytes(body)?;
        Some(LastWill {
            topic,
            payload,
            qos: QoS::try_from((flags >> 3) & 0b11)?,
            retain: flags & WILL_RETAIN != 0,
        })
    } else {
        if flags & (WILL_RETAIN | 0b0001_1000) != 0 {
            return Err(ProtocolError::InvalidConnectFlags(flags));
        }
        None
    };

    let login = if flags & USERNAME_FLAG != 0 {
        let username = read_string(body)?;
        let password = if flags & PASSWORD_FLAG != 0 {
            Some(read_string(body)?)
        } else {
            None
        };
        Some(Login { username, password })
    } else {
        if flags & PASSWORD_FLAG != 0 {
            return Err(ProtocolError::InvalidConnectFlags(flags));
        }
        None
    };

    Ok(Connect {
        client_id,
        clean_session: flags & CLEAN_SESSION != 0,
        keep_alive,
        will,
        login,
    })
}

fn decode_subscribe(body: &mut Bytes) -> ProtocolResult<Packet> {
    let pkid = read_pkid(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let path = read_string(body)?;
        let options = read_u8(body)?;
        if options & 0xFC != 0 {
            return Err(ProtocolError::InvalidQoS(options));
        }
        filters.push(SubscribeFilter {
            path,
            qos: QoS::try_from(options)?,
        });
    }
    if filters.is_empty() {
        return Err(ProtocolError::EmptyFilterList);
    }
    Ok(Packet::Subscribe(Subscribe { pkid, filters }))
}

fn decode_unsubscribe(body: &mut Bytes) -> ProtocolResult<Packet> {
    let pkid = read_pkid(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        filters.push(read_string(body)?);
    }
    if filters.is_empty() {
        return Err(ProtocolError::EmptyFilterList);
    }
    Ok(Packet::Unsubscribe(Unsubscribe { pkid, filters }))
}

fn read_u8(body: &mut Bytes) -> ProtocolResult<u8> {
    if !body.has_remaining() {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> ProtocolResult<u16> {
    if body.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(body.get_u16())
}

fn read_pkid(body: &mut Bytes) -> ProtocolResult<u16> {
    non_zero(read_u16(body)?)
}

fn read_bytes(body: &mut Bytes) -> ProtocolResult<Bytes> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> ProtocolResult<String> {
    let raw = read_bytes(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}
