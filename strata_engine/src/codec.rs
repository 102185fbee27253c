//! Pure framing codec for engine packets and payloads.
//!
//! Two framings share one packet shape:
//!
//! | Framing | Frame layout |
//! |---------|--------------|
//! | text    | `<decimal length>":"<kind digit><payload>` - binary payloads become `<length>":b"<kind digit><base64>` |
//! | binary  | `<0x00\|0x01><raw length digits><0xFF><kind><payload>` - leading byte 1 means binary payload, 0 means text-in-binary-frame |
//!
//! In the text framing, `length` counts body bytes including the `b` marker
//! and the kind digit. In the binary framing, length digits are raw bytes
//! `0..=9` (not ASCII) and the length counts the kind byte plus the payload.
//! A text-in-binary frame carries its kind as an ASCII digit; a binary frame
//! carries the raw kind byte.
//!
//! A [`Payload`] is a concatenation of frames of one framing, used when the
//! transport batches packets inside one HTTP body. The codec is pure: no I/O,
//! no state.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::{
    error::EngineError,
    packet::{MessageKind, Packet, PacketKind},
};

/// Which of the two framings a buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Length-prefixed text frames (`b64`/XHR1).
    Text,
    /// Byte-length-prefixed binary frames (XHR2).
    Binary,
}

impl Packet {
    /// Append this packet to `out` in the given framing.
    pub fn encode_to(&self, framing: Framing, out: &mut Vec<u8>) {
        match framing {
            Framing::Text => self.encode_text(out),
            Framing::Binary => self.encode_binary(out),
        }
    }

    /// Encode this packet as a standalone frame.
    #[must_use]
    pub fn encode(&self, framing: Framing) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 8);
        self.encode_to(framing, &mut out);
        out
    }

    fn encode_text(&self, out: &mut Vec<u8>) {
        let digit = self.packet_kind.as_u8() + b'0';
        match self.message_kind {
            MessageKind::Text => {
                let length = self.data.len() + 1;
                out.extend_from_slice(length.to_string().as_bytes());
                out.push(b':');
                out.push(digit);
                out.extend_from_slice(&self.data);
            }
            MessageKind::Binary => {
                let encoded = BASE64.encode(&self.data);
                let length = encoded.len() + 2;
                out.extend_from_slice(length.to_string().as_bytes());
                out.push(b':');
                out.push(b'b');
                out.push(digit);
                out.extend_from_slice(encoded.as_bytes());
            }
        }
    }

    fn encode_binary(&self, out: &mut Vec<u8>) {
        let (marker, kind) = match self.message_kind {
            MessageKind::Text => (0, self.packet_kind.as_u8() + b'0'),
            MessageKind::Binary => (1, self.packet_kind.as_u8()),
        };
        out.push(marker);
        let length = self.data.len() + 1;
        out.extend_from_slice(&raw_digits(length));
        out.push(0xFF);
        out.push(kind);
        out.extend_from_slice(&self.data);
    }

    /// Decode one frame from the front of `input`, advancing the slice past
    /// the consumed bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPayload`] when the length prefix holds a
    /// non-digit, the separator is missing, the kind is out of range, or the
    /// body is truncated.
    pub fn decode_from(input: &mut &[u8], framing: Framing) -> Result<Self, EngineError> {
        match framing {
            Framing::Text => Self::decode_text(input),
            Framing::Binary => Self::decode_binary(input),
        }
    }

    fn decode_text(input: &mut &[u8]) -> Result<Self, EngineError> {
        let mut length: usize = 0;
        let mut i = 0;
        loop {
            let Some(&b) = input.get(i) else {
                return Err(EngineError::InvalidPayload);
            };
            i += 1;
            if b == b':' {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(EngineError::InvalidPayload);
            }
            length = length
                .checked_mul(10)
                .and_then(|n| n.checked_add(usize::from(b - b'0')))
                .ok_or(EngineError::InvalidPayload)?;
        }

        let body = input
            .get(i..i + length)
            .ok_or(EngineError::InvalidPayload)?;
        *input = &input[i + length..];

        let (message_kind, kind_byte, payload) = match body.split_first() {
            Some((&b'b', rest)) => {
                let (&kind, encoded) = rest.split_first().ok_or(EngineError::InvalidPayload)?;
                (MessageKind::Binary, kind, encoded)
            }
            Some((&kind, rest)) => (MessageKind::Text, kind, rest),
            None => return Err(EngineError::InvalidPayload),
        };

        let packet_kind = kind_byte
            .checked_sub(b'0')
            .and_then(PacketKind::from_u8)
            .ok_or(EngineError::InvalidPayload)?;

        let data = match message_kind {
            MessageKind::Text => payload.to_vec(),
            MessageKind::Binary => BASE64
                .decode(payload)
                .map_err(|_| EngineError::InvalidPayload)?,
        };

        Ok(Self {
            message_kind,
            packet_kind,
            data,
        })
    }

    fn decode_binary(input: &mut &[u8]) -> Result<Self, EngineError> {
        let (&marker, mut rest) = input.split_first().ok_or(EngineError::InvalidPayload)?;
        let message_kind = match marker {
            0 => MessageKind::Text,
            1 => MessageKind::Binary,
            _ => return Err(EngineError::InvalidPayload),
        };

        let mut length: usize = 0;
        loop {
            let (&b, tail) = rest.split_first().ok_or(EngineError::InvalidPayload)?;
            rest = tail;
            if b == 0xFF {
                break;
            }
            if b > 9 {
                return Err(EngineError::InvalidPayload);
            }
            length = length
                .checked_mul(10)
                .and_then(|n| n.checked_add(usize::from(b)))
                .ok_or(EngineError::InvalidPayload)?;
        }

        let (&kind_byte, tail) = rest.split_first().ok_or(EngineError::InvalidPayload)?;
        let kind_value = match message_kind {
            MessageKind::Text => kind_byte.wrapping_sub(b'0'),
            MessageKind::Binary => kind_byte,
        };
        let packet_kind = PacketKind::from_u8(kind_value).ok_or(EngineError::InvalidPayload)?;

        let payload_len = length.checked_sub(1).ok_or(EngineError::InvalidPayload)?;
        let data = tail
            .get(..payload_len)
            .ok_or(EngineError::InvalidPayload)?
            .to_vec();
        *input = &tail[payload_len..];

        Ok(Self {
            message_kind,
            packet_kind,
            data,
        })
    }
}

/// Decimal digits of `n` as raw byte values, most significant first.
fn raw_digits(mut n: usize) -> Vec<u8> {
    if n == 0 {
        return vec![0];
    }
    let mut digits = Vec::with_capacity(8);
    while n > 0 {
        digits.push((n % 10) as u8);
        n /= 10;
    }
    digits.reverse();
    digits
}

/// An ordered batch of packets, as carried in one request/response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// The packets, in wire order.
    pub packets: Vec<Packet>,
}

impl Payload {
    /// Wrap a list of packets.
    #[must_use]
    pub const fn new(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    /// Encode all packets back-to-back. An empty payload encodes to nothing.
    #[must_use]
    pub fn encode(&self, framing: Framing) -> Vec<u8> {
        let mut out = Vec::new();
        for packet in &self.packets {
            packet.encode_to(framing, &mut out);
        }
        out
    }

    /// Decode a concatenation of frames, consuming the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPayload`] if any frame is malformed,
    /// including a partial frame at the end of the buffer.
    pub fn decode(mut input: &[u8], framing: Framing) -> Result<Self, EngineError> {
        let mut packets = Vec::new();
        while !input.is_empty() {
            packets.push(Packet::decode_from(&mut input, framing)?);
        }
        Ok(Self { packets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: &Packet, framing: Framing) {
        let encoded = packet.encode(framing);
        let mut cursor = encoded.as_slice();
        let decoded = Packet::decode_from(&mut cursor, framing).expect("decode");
        assert!(cursor.is_empty(), "frame fully consumed");
        assert_eq!(&decoded, packet);
    }

    #[test]
    fn text_framing_wire_shape() {
        let packet = Packet::text(PacketKind::Message, b"hello".to_vec());
        assert_eq!(packet.encode(Framing::Text), b"6:4hello");

        let empty = Packet::text(PacketKind::Ping, Vec::new());
        assert_eq!(empty.encode(Framing::Text), b"1:2");
    }

    #[test]
    fn text_framing_base64s_binary_payloads() {
        let packet = Packet::binary(PacketKind::Message, vec![0x01, 0x02, 0x03]);
        // base64([01 02 03]) = "AQID", length counts 'b' + kind digit.
        assert_eq!(packet.encode(Framing::Text), b"6:b4AQID");
        round_trip(&packet, Framing::Text);
    }

    #[test]
    fn binary_framing_wire_shape() {
        let packet = Packet::binary(PacketKind::Message, vec![0xFE, 0xFF]);
        assert_eq!(packet.encode(Framing::Binary), vec![1, 3, 0xFF, 4, 0xFE, 0xFF]);

        let text = Packet::text(PacketKind::Message, b"hi".to_vec());
        assert_eq!(
            text.encode(Framing::Binary),
            vec![0, 3, 0xFF, b'4', b'h', b'i']
        );
    }

    #[test]
    fn every_kind_round_trips_in_both_framings() {
        for value in 0..=6 {
            let kind = PacketKind::from_u8(value).expect("kind");
            for packet in [
                Packet::text(kind, b"payload".to_vec()),
                Packet::text(kind, Vec::new()),
                Packet::binary(kind, vec![0x00, 0x7F, 0xFF]),
                Packet::binary(kind, Vec::new()),
            ] {
                round_trip(&packet, Framing::Text);
                round_trip(&packet, Framing::Binary);
            }
        }
    }

    #[test]
    fn text_decode_rejects_malformed_frames() {
        for input in [
            &b"x:4hi"[..],  // non-digit length
            &b"24hi"[..],   // missing separator
            &b"2:9x"[..],   // kind out of range
            &b"9:4hi"[..],  // truncated body
            &b"1:b"[..],    // binary marker without kind
            &b""[..],       // empty
        ] {
            let mut cursor = input;
            assert!(
                matches!(
                    Packet::decode_from(&mut cursor, Framing::Text),
                    Err(EngineError::InvalidPayload)
                ),
                "expected InvalidPayload for {input:?}"
            );
        }
    }

    #[test]
    fn binary_decode_rejects_malformed_frames() {
        for input in [
            &[2, 1, 0xFF, 4][..],      // bad marker
            &[0, 10, 0xFF, b'4'][..],  // non-digit length byte
            &[1, 5, 0xFF, 4, 0xAA][..], // truncated body
            &[1, 1][..],               // missing terminator
        ] {
            let mut cursor = input;
            assert!(matches!(
                Packet::decode_from(&mut cursor, Framing::Binary),
                Err(EngineError::InvalidPayload)
            ));
        }
    }

    #[test]
    fn payload_batches_round_trip() {
        let payload = Payload::new(vec![
            Packet::text(PacketKind::Message, b"one".to_vec()),
            Packet::binary(PacketKind::Message, vec![1, 2]),
            Packet::text(PacketKind::Ping, Vec::new()),
        ]);
        for framing in [Framing::Text, Framing::Binary] {
            let encoded = payload.encode(framing);
            let decoded = Payload::decode(&encoded, framing).expect("decode");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn payload_rejects_partial_trailing_frame() {
        let mut encoded = Payload::new(vec![Packet::text(PacketKind::Message, b"ok".to_vec())])
            .encode(Framing::Text);
        encoded.extend_from_slice(b"7:4oops"); // claims 7 body bytes, has 5
        assert!(matches!(
            Payload::decode(&encoded, Framing::Text),
            Err(EngineError::InvalidPayload)
        ));
    }

    #[test]
    fn empty_payload_encodes_to_nothing() {
        assert!(Payload::default().encode(Framing::Text).is_empty());
        assert_eq!(
            Payload::decode(b"", Framing::Binary).expect("decode"),
            Payload::default()
        );
    }
}
