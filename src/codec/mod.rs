//! Wire codecs: the outer packet (§4.1), its optional compression and
//! padding helpers (§4.2), and the inner message record (§4.4).

pub mod compress;
pub mod pad;
pub mod packet;
pub mod record;

pub use packet::{Packet, PacketType, PROTOCOL_VERSION};
pub use record::MessageRecord;
