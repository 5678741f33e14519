//! RFC 6455 frame codec.
//!
//! [`decode`] works on a borrowed view of the parse buffer and never consumes
//! anything itself: on success it reports how many bytes the frame occupied so
//! the caller can drop exactly that prefix. Bytes are never assumed to line up
//! with socket reads, so any prefix of a valid frame yields
//! [`Decoded::Incomplete`].
//!
//! [`encode`] produces server-to-client frames, which are never masked.
//! [`encode_masked`] exists for the client direction (tests, tooling).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::errors::ProtocolError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

const FIN_BIT: u8 = 0b1000_0000;
const RSV_BITS: u8 = 0b0111_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const MASK_BIT: u8 = 0b1000_0000;
const LEN_BITS: u8 = 0b0111_1111;

const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcode (RFC 6455 §5.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Parse the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value & OPCODE_BITS {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(ProtocolError::ReservedOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, Ping and Pong.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Text => "text",
            Self::Binary => "binary",
            Self::Close => "close",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One wire unit. `payload` is always unmasked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// An unmasked frame, as the server sends it.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>, fin: bool) -> Self {
        Self {
            fin,
            opcode,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Encode this frame, masking the payload if a key is set.
    pub fn to_bytes(&self) -> Bytes {
        match self.mask_key {
            Some(key) => encode_masked(self.opcode, &self.payload, self.fin, key),
            None => encode(self.opcode, &self.payload, self.fin),
        }
    }
}

/// Result of a decode attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered yet; read more and retry.
    Incomplete,
    /// A full frame and the number of buffer bytes it occupied.
    Frame { frame: Frame, consumed: usize },
}

/// Decode the first frame in `buf` with no payload limit beyond the address
/// space.
pub fn decode(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    decode_with_limit(buf, usize::MAX)
}

/// Decode the first frame in `buf`, rejecting payloads over `max_payload`.
///
/// The limit is checked as soon as the length header is available, before
/// the payload itself has arrived.
pub fn decode_with_limit(buf: &[u8], max_payload: usize) -> Result<Decoded, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Decoded::Incomplete);
    }

    let first = buf[0];
    let second = buf[1];

    let rsv = first & RSV_BITS;
    if rsv != 0 {
        return Err(ProtocolError::ReservedBits(rsv >> 4));
    }
    let opcode = Opcode::from_u8(first)?;
    let fin = first & FIN_BIT != 0;
    if opcode.is_control() && !fin {
        return Err(ProtocolError::FragmentedControl(opcode));
    }
    let masked = second & MASK_BIT != 0;

    let (len, header_len): (u64, usize) = match second & LEN_BITS {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(Decoded::Incomplete);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(Decoded::Incomplete);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(ProtocolError::ControlTooLarge { opcode, len });
    }

    let payload_len = usize::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        limit: max_payload,
    })?;
    if payload_len > max_payload {
        return Err(ProtocolError::FrameTooLarge {
            len,
            limit: max_payload,
        });
    }

    let mask_len: usize = if masked { 4 } else { 0 };
    let payload_start = header_len + mask_len;
    let total = payload_start
        .checked_add(payload_len)
        .ok_or(ProtocolError::LengthOverflow)?;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let mask_key = masked.then(|| {
        [
            buf[header_len],
            buf[header_len + 1],
            buf[header_len + 2],
            buf[header_len + 3],
        ]
    });

    let mut payload = buf[payload_start..total].to_vec();
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Decoded::Frame {
        frame: Frame {
            fin,
            opcode,
            masked,
            mask_key,
            payload,
        },
        consumed: total,
    })
}

/// Encode an unmasked frame.
pub fn encode(opcode: Opcode, payload: &[u8], fin: bool) -> Bytes {
    let mut dst = BytesMut::with_capacity(header_len(payload.len(), false) + payload.len());
    encode_into(&mut dst, opcode, payload, fin);
    dst.freeze()
}

/// Append an unmasked frame to `dst`.
pub fn encode_into(dst: &mut BytesMut, opcode: Opcode, payload: &[u8], fin: bool) {
    put_header(dst, opcode, fin, payload.len(), None);
    dst.put_slice(payload);
}

/// Encode a frame the way a client must send it: masked with `key`.
pub fn encode_masked(opcode: Opcode, payload: &[u8], fin: bool, key: [u8; 4]) -> Bytes {
    let mut dst = BytesMut::with_capacity(header_len(payload.len(), true) + payload.len());
    put_header(&mut dst, opcode, fin, payload.len(), Some(key));
    let start = dst.len();
    dst.put_slice(payload);
    apply_mask(&mut dst[start..], key);
    dst.freeze()
}

/// XOR `payload` in place with the 4-byte mask key. Masking is its own
/// inverse.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = match payload_len {
        0..=125 => 2,
        126..=0xFFFF => 4,
        _ => 10,
    };
    len_bytes + if masked { 4 } else { 0 }
}

fn put_header(dst: &mut BytesMut, opcode: Opcode, fin: bool, len: usize, mask: Option<[u8; 4]>) {
    let mut first = opcode.as_u8();
    if fin {
        first |= FIN_BIT;
    }
    dst.put_u8(first);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    match len {
        0..=125 => dst.put_u8(mask_bit | len as u8),
        126..=0xFFFF => {
            dst.put_u8(mask_bit | LEN_16);
            dst.put_u16(len as u16);
        }
        _ => {
            dst.put_u8(mask_bit | LEN_64);
            dst.put_u64(len as u64);
        }
    }

    if let Some(key) = mask {
        dst.put_slice(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

    fn expect_frame(result: Result<Decoded, ProtocolError>) -> (Frame, usize) {
        match result.unwrap() {
            Decoded::Frame { frame, consumed } => (frame, consumed),
            Decoded::Incomplete => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn text_roundtrip_across_length_tiers() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![b'a'; len];
            let wire = encode(Opcode::Text, &payload, true);
            let (frame, consumed) = expect_frame(decode(&wire));
            assert_eq!(consumed, wire.len(), "len {len}");
            assert!(frame.fin);
            assert_eq!(frame.opcode, Opcode::Text);
            assert!(!frame.masked);
            assert_eq!(frame.payload, payload, "len {len}");
        }
    }

    #[test]
    fn header_bytes_per_tier() {
        assert_eq!(&encode(Opcode::Text, &[0; 125], true)[..2], &[0x81, 125]);
        assert_eq!(&encode(Opcode::Text, &[0; 126], true)[..4], &[0x81, 126, 0x00, 126]);
        assert_eq!(
            &encode(Opcode::Binary, &[0; 65535], true)[..4],
            &[0x82, 126, 0xFF, 0xFF]
        );
        assert_eq!(
            &encode(Opcode::Text, &[0; 65536], true)[..10],
            &[0x81, 127, 0, 0, 0, 0, 0, 1, 0, 0]
        );
        assert_eq!(&encode(Opcode::Continuation, b"x", false)[..2], &[0x00, 1]);
    }

    #[test]
    fn server_frames_are_never_masked() {
        for len in [0usize, 10, 300, 70_000] {
            let wire = encode(Opcode::Binary, &vec![7; len], true);
            assert_eq!(wire[1] & MASK_BIT, 0);
        }
    }

    #[test]
    fn every_split_point_is_incomplete_until_whole() {
        for len in [0usize, 1, 5, 125, 126, 200] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let wire = encode_masked(Opcode::Text, &payload, true, KEY);
            for split in 0..wire.len() {
                assert_eq!(
                    decode(&wire[..split]).unwrap(),
                    Decoded::Incomplete,
                    "len {len} split {split}"
                );
                let (frame, consumed) = expect_frame(decode(&wire));
                assert_eq!(consumed, wire.len());
                assert_eq!(frame.payload, payload);
            }
        }
    }

    #[test]
    fn split_inside_64_bit_header() {
        let payload = vec![9u8; 65536];
        let wire = encode_masked(Opcode::Binary, &payload, true, KEY);
        for split in (0..16).chain(wire.len() - 3..wire.len()) {
            assert_eq!(decode(&wire[..split]).unwrap(), Decoded::Incomplete, "split {split}");
        }
        let (frame, _) = expect_frame(decode(&wire));
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn masked_payload_is_unmasked() {
        let masked: Vec<u8> = b"ABCDE"
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ KEY[i % 4])
            .collect();
        let mut wire = vec![0x81, 0x80 | 5];
        wire.extend_from_slice(&KEY);
        wire.extend_from_slice(&masked);
        assert_eq!(wire[6], 0x01 ^ b'A');

        let (frame, consumed) = expect_frame(decode(&wire));
        assert_eq!(consumed, 11);
        assert!(frame.masked);
        assert_eq!(frame.mask_key, Some(KEY));
        assert_eq!(frame.payload, b"ABCDE");
    }

    #[test]
    fn masked_payload_offset_per_length_tier() {
        for (len, header) in [(5usize, 6usize), (300, 8), (70_000, 14)] {
            let payload = vec![b'q'; len];
            let wire = encode_masked(Opcode::Binary, &payload, true, KEY);
            assert_eq!(wire.len(), header + len);

            let (frame, consumed) = expect_frame(decode(&wire));
            assert_eq!(consumed, header + len);
            assert_eq!(frame.payload, payload);
            assert_eq!(
                decode(&wire[..header + len - 1]).unwrap(),
                Decoded::Incomplete
            );
        }
    }

    #[test]
    fn unmasked_inbound_frame_is_left_alone() {
        let wire = encode(Opcode::Text, b"plain", true);
        let (frame, _) = expect_frame(decode(&wire));
        assert!(!frame.masked);
        assert_eq!(frame.mask_key, None);
        assert_eq!(frame.payload, b"plain");
    }

    #[test]
    fn empty_payload_is_valid() {
        let wire = encode_masked(Opcode::Ping, b"", true, KEY);
        let (frame, consumed) = expect_frame(decode(&wire));
        assert_eq!(consumed, 6);
        assert_eq!(frame.opcode, Opcode::Ping);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn several_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_masked(Opcode::Text, b"one", true, KEY));
        buf.extend_from_slice(&encode_masked(Opcode::Ping, b"p", true, KEY));
        buf.extend_from_slice(&encode_masked(Opcode::Binary, b"tw", false, KEY)[..3]);

        let (first, consumed) = expect_frame(decode(&buf));
        assert_eq!(first.payload, b"one");
        let rest = &buf[consumed..];
        let (second, consumed2) = expect_frame(decode(rest));
        assert_eq!(second.opcode, Opcode::Ping);
        assert_eq!(decode(&rest[consumed2..]).unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn reserved_opcodes_rejected() {
        for op in (0x3..=0x7).chain(0xB..=0xF) {
            let wire = [0x80 | op, 0x00];
            assert_eq!(decode(&wire), Err(ProtocolError::ReservedOpcode(op)));
        }
    }

    #[test]
    fn reserved_bits_rejected() {
        assert_eq!(decode(&[0xC1, 0x00]), Err(ProtocolError::ReservedBits(0b100)));
        assert_eq!(decode(&[0x91, 0x00]), Err(ProtocolError::ReservedBits(0b001)));
    }

    #[test]
    fn fragmented_control_rejected() {
        let wire = encode_masked(Opcode::Ping, b"x", false, KEY);
        assert_eq!(decode(&wire), Err(ProtocolError::FragmentedControl(Opcode::Ping)));
    }

    #[test]
    fn oversized_control_rejected() {
        let wire = encode_masked(Opcode::Close, &[0; 126], true, KEY);
        assert_eq!(
            decode(&wire),
            Err(ProtocolError::ControlTooLarge {
                opcode: Opcode::Close,
                len: 126
            })
        );
        let ok = encode_masked(Opcode::Pong, &[0; 125], true, KEY);
        assert!(matches!(decode(&ok), Ok(Decoded::Frame { .. })));
    }

    #[test]
    fn most_significant_length_bit_rejected() {
        let wire = [0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(decode(&wire), Err(ProtocolError::InvalidLength(_))));
    }

    #[test]
    fn limit_checked_before_payload_arrives() {
        let wire = encode_masked(Opcode::Binary, &[0; 2048], true, KEY);
        let header_only = &wire[..8];
        assert_eq!(
            decode_with_limit(header_only, 1024),
            Err(ProtocolError::FrameTooLarge {
                len: 2048,
                limit: 1024
            })
        );
        assert!(matches!(
            decode_with_limit(&wire, 2048),
            Ok(Decoded::Frame { .. })
        ));
    }

    #[test]
    fn huge_declared_length_waits_or_fails_without_allocating() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(u64::MAX >> 1).to_be_bytes());
        assert!(matches!(
            decode(&wire),
            Ok(Decoded::Incomplete) | Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(matches!(
            decode_with_limit(&wire, 1 << 20),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn mask_is_an_involution() {
        let mut data = b"hello world".to_vec();
        apply_mask(&mut data, [0xAA, 0x55, 0x0F, 0xF0]);
        assert_ne!(data, b"hello world");
        apply_mask(&mut data, [0xAA, 0x55, 0x0F, 0xF0]);
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn frame_to_bytes_respects_mask_key() {
        let mut frame = Frame::new(Opcode::Text, "hi", true);
        assert_eq!(&frame.to_bytes()[..], &[0x81, 2, b'h', b'i']);
        frame.mask_key = Some(KEY);
        frame.masked = true;
        let (decoded, _) = expect_frame(decode(&frame.to_bytes()));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn opcode_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
        for op in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_u8(op.as_u8()), Ok(op));
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_inverts_encode(
                payload in proptest::collection::vec(any::<u8>(), 0..70_000),
                fin in any::<bool>(),
            ) {
                let wire = encode(Opcode::Binary, &payload, fin);
                let Decoded::Frame { frame, consumed } = decode(&wire).unwrap() else {
                    panic!("incomplete");
                };
                prop_assert_eq!(consumed, wire.len());
                prop_assert_eq!(frame.fin, fin);
                prop_assert_eq!(frame.payload, payload);
            }

            #[test]
            fn any_strict_prefix_is_incomplete(
                payload in proptest::collection::vec(any::<u8>(), 0..600),
                key in any::<[u8; 4]>(),
                split in any::<proptest::sample::Index>(),
            ) {
                let wire = encode_masked(Opcode::Text, &payload, true, key);
                let at = split.index(wire.len());
                prop_assert_eq!(decode(&wire[..at]).unwrap(), Decoded::Incomplete);
                let Decoded::Frame { frame, .. } = decode(&wire).unwrap() else {
                    panic!("incomplete");
                };
                prop_assert_eq!(frame.payload, payload);
            }
        }
    }
}
