//! BLE advertisement constants and payload shape (§6.2).
//!
//! The wire protocol itself lives in [`crate::codec`]; this module
//! only covers what goes into the BLE advertisement and GATT
//! attribute table that carries it.

/// 128-bit service UUID advertised by every node.
pub const SERVICE_UUID: &str = "F47B5E2D-4A9E-4C5A-9B3F-8E1D2C3A4B5C";

/// Characteristic UUID exposing read / write / write-without-response
/// / notify for packet exchange.
pub const CHARACTERISTIC_UUID: &str = "A1B2C3D4-E5F6-4A5B-8C9D-0E1F2A3B4C5D";

/// Manufacturer id used for the optional combined-public-key digest,
/// on platforms that allow setting manufacturer data.
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Builds the 8-character local name a node advertises, which doubles
/// as its peer id on the wire.
pub fn local_name(peer_id: [u8; 8]) -> String {
    String::from_utf8_lossy(&peer_id).into_owned()
}

/// Parses an advertised local name back into a peer id. Fails if the
/// name isn't exactly 8 bytes, since a peer id is always 8 bytes.
pub fn parse_peer_id(local_name: &str) -> Option<[u8; 8]> {
    let bytes = local_name.as_bytes();
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_name_round_trips_through_parse_peer_id() {
        let peer_id = *b"AAAAAAAA";
        assert_eq!(parse_peer_id(&local_name(peer_id)), Some(peer_id));
    }

    #[test]
    fn wrong_length_name_does_not_parse() {
        assert_eq!(parse_peer_id("short"), None);
    }
}
