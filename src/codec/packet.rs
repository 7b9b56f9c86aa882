//! The outer wire packet: fixed header, flags, optional recipient,
//! payload, optional signature.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CodecError, CodecResult};

use super::compress;

/// A tiny hand-rolled bitflags macro, avoiding a dependency the corpus
/// doesn't otherwise pull in for a single byte of flag state.
macro_rules! bitflags_style_flags {
    (
        $(#[$meta:meta])*
        struct $name:ident: $repr:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name($repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            const KNOWN_BITS: $repr = 0 $(| $value)*;

            pub fn empty() -> Self {
                $name(0)
            }

            pub fn bits(self) -> $repr {
                self.0
            }

            pub fn from_bits(bits: $repr) -> Option<Self> {
                if bits & !Self::KNOWN_BITS != 0 {
                    None
                } else {
                    Some($name(bits))
                }
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Current (and only supported) wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes of the fixed header preceding the always-present sender id:
/// version + type + ttl + timestamp_ms(8) + flags + payload_len(2).
const FIXED_HEADER_LEN: usize = 14;
const SENDER_ID_LEN: usize = 8;
const RECIPIENT_ID_LEN: usize = 8;
const SIGNATURE_LEN: usize = 64;

/// All-0xFF sentinel used only by legacy encodings; this codec never
/// emits it — absence of a recipient field means broadcast on the
/// wire.
pub const LEGACY_BROADCAST_SENTINEL: [u8; 8] = [0xFF; 8];

/// Applies the compression heuristic to `payload`, returning the exact
/// bytes that belong in the wire payload section and whether they
/// ended up compressed. A signature covers these bytes, not `payload`
/// itself (§3: "the payload bytes exactly as they appear on the
/// wire") — callers that sign a payload before building the packet
/// must sign what this returns, not the pre-compression form.
pub fn prepare_wire_payload(payload: &[u8]) -> (Vec<u8>, bool) {
    match compress::try_compress(payload) {
        Some(compressed) => {
            let original_len = payload.len() as u16;
            let mut framed = Vec::with_capacity(2 + compressed.len());
            framed.extend_from_slice(&original_len.to_be_bytes());
            framed.extend_from_slice(&compressed);
            (framed, true)
        }
        None => (payload.to_vec(), false),
    }
}

/// Reverses [`prepare_wire_payload`]: strips the 2-byte original-length
/// prefix and decompresses when `is_compressed`, otherwise returns
/// `bytes` unchanged.
pub fn decode_wire_payload(bytes: &[u8], is_compressed: bool) -> CodecResult<Vec<u8>> {
    if !is_compressed {
        return Ok(bytes.to_vec());
    }
    if bytes.len() < 2 {
        return Err(CodecError::DecompressFailed);
    }
    let original_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    compress::decompress(&bytes[2..], original_len).ok_or(CodecError::DecompressFailed)
}

/// The canonical packet type registry. Values 1..12, matching the
/// external type table — no legacy 0x01../0x0A.. aliasing.
///
/// `Unknown` carries the raw byte for any type outside that table. §4.7
/// step 4 requires a node to keep relaying a packet type it doesn't
/// recognize (forward-compat with later protocol revisions), so the
/// type registry has to stay open at decode time rather than reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Announce,
    KeyExchange,
    Leave,
    Message,
    FragmentStart,
    FragmentContinue,
    FragmentEnd,
    ChannelAnnounce,
    ChannelRetention,
    DeliveryAck,
    DeliveryStatusRequest,
    ReadReceipt,
    Unknown(u8),
}

impl PacketType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PacketType::Announce,
            2 => PacketType::KeyExchange,
            3 => PacketType::Leave,
            4 => PacketType::Message,
            5 => PacketType::FragmentStart,
            6 => PacketType::FragmentContinue,
            7 => PacketType::FragmentEnd,
            8 => PacketType::ChannelAnnounce,
            9 => PacketType::ChannelRetention,
            10 => PacketType::DeliveryAck,
            11 => PacketType::DeliveryStatusRequest,
            12 => PacketType::ReadReceipt,
            other => PacketType::Unknown(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            PacketType::Announce => 1,
            PacketType::KeyExchange => 2,
            PacketType::Leave => 3,
            PacketType::Message => 4,
            PacketType::FragmentStart => 5,
            PacketType::FragmentContinue => 6,
            PacketType::FragmentEnd => 7,
            PacketType::ChannelAnnounce => 8,
            PacketType::ChannelRetention => 9,
            PacketType::DeliveryAck => 10,
            PacketType::DeliveryStatusRequest => 11,
            PacketType::ReadReceipt => 12,
            PacketType::Unknown(value) => value,
        }
    }

    /// Default TTL a freshly built packet of this type should carry.
    pub fn default_ttl(self) -> u8 {
        match self {
            PacketType::Message | PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => 7,
            _ => 3,
        }
    }
}

bitflags_style_flags! {
    /// Packet-level flag bits. Bits 3..7 are reserved and must be zero
    /// on the wire.
    struct PacketFlags: u8 {
        const HAS_RECIPIENT = 0b0000_0001;
        const HAS_SIGNATURE = 0b0000_0010;
        const IS_COMPRESSED = 0b0000_0100;
    }
}

/// A decoded or to-be-encoded outer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp_ms: u64,
    pub sender_id: [u8; 8],
    pub recipient_id: Option<[u8; 8]>,
    pub is_compressed: bool,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
}

impl Packet {
    /// Builds a new packet with the type's default TTL, stamped with
    /// the current time, uncompressed and unsigned.
    pub fn new(packet_type: PacketType, sender_id: [u8; 8], payload: Vec<u8>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl: packet_type.default_ttl(),
            timestamp_ms,
            sender_id,
            recipient_id: None,
            is_compressed: false,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient_id: [u8; 8]) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    pub fn with_signature(mut self, signature: [u8; 64]) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// The exact bytes the signature (when present) is computed over:
    /// the payload section as it would appear on the wire, compressed
    /// or not, encrypted or not. Equivalent to
    /// `prepare_wire_payload(&self.payload).0` — exposed as a method
    /// for callers that already hold a `Packet`.
    pub fn signable_payload(&self) -> Vec<u8> {
        prepare_wire_payload(&self.payload).0
    }

    /// Returns a copy of this packet with `ttl` decremented by one,
    /// or `None` if `ttl` is already zero (must not relay).
    pub fn decrement_ttl(&self) -> Option<Self> {
        if self.ttl == 0 {
            None
        } else {
            let mut next = self.clone();
            next.ttl -= 1;
            Some(next)
        }
    }

    /// Encodes this packet to its wire representation, optionally
    /// compressing the payload per the compression heuristic.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        if let Some(recipient) = self.recipient_id {
            if recipient == LEGACY_BROADCAST_SENTINEL {
                return Err(CodecError::Encode(
                    "refusing to emit the legacy 0xFF broadcast sentinel as a real recipient".into(),
                ));
            }
        }

        let (wire_payload, is_compressed) = if self.is_compressed {
            // Caller already compressed (e.g. re-encoding a relayed
            // packet, or a packet whose payload was pre-framed to sign
            // the wire-exact bytes); trust the declared payload as-is.
            (self.payload.clone(), true)
        } else {
            prepare_wire_payload(&self.payload)
        };

        let payload_len = wire_payload.len();
        if payload_len > u16::MAX as usize {
            return Err(CodecError::Encode(format!(
                "payload length {payload_len} exceeds u16 budget"
            )));
        }

        let mut flags = PacketFlags::empty();
        if self.recipient_id.is_some() {
            flags |= PacketFlags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= PacketFlags::HAS_SIGNATURE;
        }
        if is_compressed {
            flags |= PacketFlags::IS_COMPRESSED;
        }

        let mut buf = Vec::with_capacity(FIXED_HEADER_LEN + SENDER_ID_LEN + payload_len + SIGNATURE_LEN);
        buf.push(self.version);
        buf.push(self.packet_type.to_u8());
        buf.push(self.ttl);
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.push(flags.bits());
        buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.sender_id);
        if let Some(recipient) = self.recipient_id {
            buf.extend_from_slice(&recipient);
        }
        buf.extend_from_slice(&wire_payload);
        if let Some(signature) = self.signature {
            buf.extend_from_slice(&signature);
        }

        Ok(buf)
    }

    /// Decodes a packet from its wire representation. Never panics on
    /// hostile input: every length is checked against the remaining
    /// bytes before a slice is taken.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(CodecError::Truncated);
        }

        let mut offset = 0usize;
        let version = bytes[offset];
        offset += 1;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::BadVersion(version));
        }

        let packet_type = PacketType::from_u8(bytes[offset]);
        offset += 1;

        let ttl = bytes[offset];
        offset += 1;

        let timestamp_ms = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap());
        offset += 8;

        let raw_flags = bytes[offset];
        offset += 1;
        let flags = PacketFlags::from_bits(raw_flags).ok_or(CodecError::ReservedFlag)?;

        let payload_len = u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap()) as usize;
        offset += 2;

        if bytes.len() < offset + SENDER_ID_LEN {
            return Err(CodecError::Truncated);
        }
        let mut sender_id = [0u8; 8];
        sender_id.copy_from_slice(&bytes[offset..offset + SENDER_ID_LEN]);
        offset += SENDER_ID_LEN;

        let recipient_id = if flags.contains(PacketFlags::HAS_RECIPIENT) {
            if bytes.len() < offset + RECIPIENT_ID_LEN {
                return Err(CodecError::Truncated);
            }
            let mut recipient = [0u8; 8];
            recipient.copy_from_slice(&bytes[offset..offset + RECIPIENT_ID_LEN]);
            offset += RECIPIENT_ID_LEN;
            Some(recipient)
        } else {
            None
        };

        if bytes.len() < offset + payload_len {
            return Err(CodecError::BadLength);
        }
        let wire_payload = &bytes[offset..offset + payload_len];
        offset += payload_len;

        let is_compressed = flags.contains(PacketFlags::IS_COMPRESSED);
        let payload = decode_wire_payload(wire_payload, is_compressed)?;

        let signature = if flags.contains(PacketFlags::HAS_SIGNATURE) {
            if bytes.len() < offset + SIGNATURE_LEN {
                return Err(CodecError::Truncated);
            }
            let mut sig = [0u8; 64];
            sig.copy_from_slice(&bytes[offset..offset + SIGNATURE_LEN]);
            offset += SIGNATURE_LEN;
            Some(sig)
        } else {
            None
        };

        if offset != bytes.len() {
            return Err(CodecError::BadLength);
        }

        Ok(Packet {
            version,
            packet_type,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id,
            is_compressed,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet::new(PacketType::Announce, *b"AAAAAAAA", b"hello".to_vec())
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let packet = sample_packet();
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.packet_type, packet.packet_type);
        assert_eq!(decoded.sender_id, packet.sender_id);
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.ttl, packet.ttl);
        assert_eq!(decoded.recipient_id, None);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        for len in 0..14 {
            let short = vec![0u8; len];
            assert_eq!(Packet::decode(&short), Err(CodecError::Truncated));
        }
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut packet = sample_packet();
        let mut encoded = packet.encode().unwrap();
        encoded[0] = 99;
        assert_eq!(Packet::decode(&encoded), Err(CodecError::BadVersion(99)));
        packet.version = 99; // silence unused-mut warning in some toolchains
        let _ = packet;
    }

    #[test]
    fn decode_never_panics_on_arbitrary_length_prefixes() {
        // payload_len claims far more bytes than are actually present.
        let mut encoded = sample_packet().encode().unwrap();
        let len_offset = 11; // version+type+ttl+timestamp(8)+flags
        encoded[len_offset] = 0xFF;
        encoded[len_offset + 1] = 0xFF;
        assert!(Packet::decode(&encoded).is_err());
    }

    #[test]
    fn with_recipient_round_trips() {
        let packet = sample_packet().with_recipient(*b"BBBBBBBB");
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.recipient_id, Some(*b"BBBBBBBB"));
    }

    #[test]
    fn refuses_to_emit_legacy_broadcast_sentinel() {
        let packet = sample_packet().with_recipient(LEGACY_BROADCAST_SENTINEL);
        assert!(packet.encode().is_err());
    }

    #[test]
    fn ttl_decrements_and_stops_at_zero() {
        let mut packet = sample_packet();
        packet.ttl = 1;
        let relayed = packet.decrement_ttl().unwrap();
        assert_eq!(relayed.ttl, 0);
        assert!(relayed.decrement_ttl().is_none());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
                let _ = Packet::decode(&bytes);
            }

            #[test]
            fn broadcast_round_trips_for_arbitrary_payloads(
                sender in any::<[u8; 8]>(),
                ttl in any::<u8>(),
                payload in proptest::collection::vec(any::<u8>(), 0..1024),
            ) {
                let mut packet = Packet::new(PacketType::Message, sender, payload.clone());
                packet.ttl = ttl;
                let encoded = packet.encode().unwrap();
                let decoded = Packet::decode(&encoded).unwrap();
                prop_assert_eq!(decoded.sender_id, sender);
                prop_assert_eq!(decoded.ttl, ttl);
                prop_assert_eq!(decoded.payload, payload);
                prop_assert_eq!(decoded.recipient_id, None);
            }

            #[test]
            fn private_round_trips_for_arbitrary_recipient(
                sender in any::<[u8; 8]>(),
                recipient in any::<[u8; 8]>(),
                payload in proptest::collection::vec(any::<u8>(), 0..256),
            ) {
                prop_assume!(recipient != LEGACY_BROADCAST_SENTINEL);
                let packet = Packet::new(PacketType::Message, sender, payload.clone())
                    .with_recipient(recipient);
                let encoded = packet.encode().unwrap();
                let decoded = Packet::decode(&encoded).unwrap();
                prop_assert_eq!(decoded.recipient_id, Some(recipient));
                prop_assert_eq!(decoded.payload, payload);
            }
        }
    }
}
