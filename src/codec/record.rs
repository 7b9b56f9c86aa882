//! The inner message record carried inside a `MESSAGE` packet's
//! payload: a flat, length-prefixed binary layout — never JSON.
//!
//! Field order on the wire is fixed: flags, timestamp, id, sender
//! nickname, content, then the optional fields in the order declared
//! below, each gated by its own flag bit.

use crate::error::{CodecError, CodecResult};

macro_rules! record_flags {
    ($(const $flag:ident = $value:expr;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct RecordFlags(u8);

        impl RecordFlags {
            $(pub const $flag: RecordFlags = RecordFlags($value);)*

            pub fn bits(self) -> u8 {
                self.0
            }

            pub fn from_bits(bits: u8) -> RecordFlags {
                RecordFlags(bits)
            }

            pub fn contains(self, other: RecordFlags) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for RecordFlags {
            type Output = RecordFlags;
            fn bitor(self, rhs: RecordFlags) -> RecordFlags {
                RecordFlags(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for RecordFlags {
            fn bitor_assign(&mut self, rhs: RecordFlags) {
                self.0 |= rhs.0;
            }
        }
    };
}

record_flags! {
    const IS_RELAY = 0b0000_0001;
    const IS_PRIVATE = 0b0000_0010;
    const HAS_ORIGINAL_SENDER = 0b0000_0100;
    const HAS_RECIPIENT_NICKNAME = 0b0000_1000;
    const HAS_SENDER_PEER_ID = 0b0001_0000;
    const HAS_MENTIONS = 0b0010_0000;
    const HAS_CHANNEL = 0b0100_0000;
    const IS_ENCRYPTED = 0b1000_0000;
}

/// The inner record carried by a `MESSAGE` packet's payload.
///
/// `is_relay` is carried on the wire for forward-compatibility but is
/// not read by this implementation's dispatch logic — relaying is
/// decided entirely from the outer packet's `ttl` (§4.7 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub is_relay: bool,
    pub is_private: bool,
    pub is_encrypted: bool,
    pub timestamp_ms: u64,
    pub id: String,
    pub sender_nickname: String,
    /// Plaintext UTF-8 bytes, or ciphertext when `is_encrypted`.
    pub content: Vec<u8>,
    pub original_sender: Option<String>,
    pub recipient_nickname: Option<String>,
    pub sender_peer_id: Option<String>,
    pub mentions: Vec<String>,
    pub channel: Option<String>,
}

impl MessageRecord {
    pub fn new(id: String, sender_nickname: String, content: Vec<u8>) -> Self {
        Self {
            is_relay: false,
            is_private: false,
            is_encrypted: false,
            timestamp_ms: 0,
            id,
            sender_nickname,
            content,
            original_sender: None,
            recipient_nickname: None,
            sender_peer_id: None,
            mentions: Vec::new(),
            channel: None,
        }
    }

    fn flags(&self) -> RecordFlags {
        let mut flags = RecordFlags::default();
        if self.is_relay {
            flags |= RecordFlags::IS_RELAY;
        }
        if self.is_private {
            flags |= RecordFlags::IS_PRIVATE;
        }
        if self.original_sender.is_some() {
            flags |= RecordFlags::HAS_ORIGINAL_SENDER;
        }
        if self.recipient_nickname.is_some() {
            flags |= RecordFlags::HAS_RECIPIENT_NICKNAME;
        }
        if self.sender_peer_id.is_some() {
            flags |= RecordFlags::HAS_SENDER_PEER_ID;
        }
        if !self.mentions.is_empty() {
            flags |= RecordFlags::HAS_MENTIONS;
        }
        if self.channel.is_some() {
            flags |= RecordFlags::HAS_CHANNEL;
        }
        if self.is_encrypted {
            flags |= RecordFlags::IS_ENCRYPTED;
        }
        flags
    }

    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.push(self.flags().bits());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        write_short_string(&mut buf, &self.id)?;
        write_short_string(&mut buf, &self.sender_nickname)?;
        write_u16_bytes(&mut buf, &self.content)?;

        if let Some(original_sender) = &self.original_sender {
            write_short_string(&mut buf, original_sender)?;
        }
        if let Some(recipient_nickname) = &self.recipient_nickname {
            write_short_string(&mut buf, recipient_nickname)?;
        }
        if let Some(sender_peer_id) = &self.sender_peer_id {
            write_short_string(&mut buf, sender_peer_id)?;
        }
        if !self.mentions.is_empty() {
            if self.mentions.len() > u8::MAX as usize {
                return Err(CodecError::Encode(format!(
                    "{} mentions exceeds the u8 count prefix",
                    self.mentions.len()
                )));
            }
            buf.push(self.mentions.len() as u8);
            for mention in &self.mentions {
                write_short_string(&mut buf, mention)?;
            }
        }
        if let Some(channel) = &self.channel {
            write_short_string(&mut buf, channel)?;
        }

        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let mut cursor = Cursor::new(bytes);
        let flags = RecordFlags::from_bits(cursor.read_u8()?);
        let timestamp_ms = cursor.read_u64_be()?;
        let id = cursor.read_short_string()?;
        let sender_nickname = cursor.read_short_string()?;
        let content = cursor.read_u16_bytes()?;

        let original_sender = if flags.contains(RecordFlags::HAS_ORIGINAL_SENDER) {
            Some(cursor.read_short_string()?)
        } else {
            None
        };
        let recipient_nickname = if flags.contains(RecordFlags::HAS_RECIPIENT_NICKNAME) {
            Some(cursor.read_short_string()?)
        } else {
            None
        };
        let sender_peer_id = if flags.contains(RecordFlags::HAS_SENDER_PEER_ID) {
            Some(cursor.read_short_string()?)
        } else {
            None
        };
        let mentions = if flags.contains(RecordFlags::HAS_MENTIONS) {
            let count = cursor.read_u8()? as usize;
            let mut mentions = Vec::with_capacity(count);
            for _ in 0..count {
                mentions.push(cursor.read_short_string()?);
            }
            mentions
        } else {
            Vec::new()
        };
        let channel = if flags.contains(RecordFlags::HAS_CHANNEL) {
            Some(cursor.read_short_string()?)
        } else {
            None
        };

        if !cursor.is_exhausted() {
            return Err(CodecError::BadRecord("trailing bytes after record".into()));
        }

        Ok(MessageRecord {
            is_relay: flags.contains(RecordFlags::IS_RELAY),
            is_private: flags.contains(RecordFlags::IS_PRIVATE),
            is_encrypted: flags.contains(RecordFlags::IS_ENCRYPTED),
            timestamp_ms,
            id,
            sender_nickname,
            content,
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
            channel,
        })
    }
}

fn write_short_string(buf: &mut Vec<u8>, s: &str) -> CodecResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(CodecError::Encode(format!(
            "string of {} bytes exceeds the u8 length prefix",
            bytes.len()
        )));
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_u16_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CodecResult<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::Encode(format!(
            "content of {} bytes exceeds the u16 length prefix",
            bytes.len()
        )));
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

/// A small cursor over the record's byte stream, checking every length
/// against the remaining bytes before slicing — an under-run anywhere
/// fails `BadRecord` rather than panicking.
struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_exhausted(&self) -> bool {
        self.offset == self.bytes.len()
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::BadRecord("unexpected end of record".into()));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u64_be(&mut self) -> CodecResult<u64> {
        let slice = self.take(8)?;
        Ok(u64::from_be_bytes(slice.try_into().unwrap()))
    }

    fn read_short_string(&mut self) -> CodecResult<String> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::BadRecord("field is not valid UTF-8".into()))
    }

    fn read_u16_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_record_round_trips() {
        let record = MessageRecord::new("m1".into(), "Alice".into(), b"hi".to_vec());
        let encoded = record.encode().unwrap();
        let decoded = MessageRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn full_record_round_trips() {
        let mut record = MessageRecord::new("m2".into(), "Alice".into(), b"hello @Bob".to_vec());
        record.is_private = true;
        record.is_encrypted = true;
        record.timestamp_ms = 1_700_000_000_000;
        record.original_sender = Some("Carol".into());
        record.recipient_nickname = Some("Bob".into());
        record.sender_peer_id = Some("AAAAAAAA".into());
        record.mentions = vec!["Bob".into()];
        record.channel = Some("#general".into());

        let encoded = record.encode().unwrap();
        let decoded = MessageRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_rejects_truncated_record() {
        let record = MessageRecord::new("m3".into(), "Alice".into(), b"hi".to_vec());
        let mut encoded = record.encode().unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            MessageRecord::decode(&encoded),
            Err(CodecError::BadRecord(_))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let record = MessageRecord::new("m4".into(), "Alice".into(), b"hi".to_vec());
        let mut encoded = record.encode().unwrap();
        encoded.push(0xAA);
        assert!(matches!(
            MessageRecord::decode(&encoded),
            Err(CodecError::BadRecord(_))
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn short_string() -> impl Strategy<Value = String> {
            "[a-zA-Z0-9 ]{0,40}"
        }

        proptest! {
            #[test]
            fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = MessageRecord::decode(&bytes);
            }

            #[test]
            fn round_trips_for_arbitrary_fields(
                id in short_string(),
                sender_nickname in short_string(),
                content in proptest::collection::vec(any::<u8>(), 0..200),
                channel in proptest::option::of(short_string()),
            ) {
                let mut record = MessageRecord::new(id, sender_nickname, content);
                record.channel = channel;
                let encoded = record.encode().unwrap();
                let decoded = MessageRecord::decode(&encoded).unwrap();
                prop_assert_eq!(decoded, record);
            }
        }
    }
}
