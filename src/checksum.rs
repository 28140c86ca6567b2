//! Checksums used on the wire and in hex files

/// Checksum for a single-byte frame (command or count), the complement of the byte
pub fn frame_checksum(byte: u8) -> u8 {
    byte ^ 0xFF
}

/// Device-side check of a single-byte frame
pub fn frame_valid(byte: u8, checksum: u8) -> bool {
    frame_checksum(byte) == checksum
}

/// XOR over a block (address bytes, or count followed by data)
pub fn block_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |c, b| c ^ b)
}

/// Motorola S-record line checksum over count, address and data bytes
pub fn s19_line_checksum(fields: &[u8]) -> u8 {
    sum(fields) ^ 0xFF
}

/// Intel-HEX line checksum over count, address, type and data bytes
pub fn hex_line_checksum(fields: &[u8]) -> u8 {
    sum(fields).wrapping_neg()
}

fn sum(fields: &[u8]) -> u8 {
    fields.iter().fold(0u8, |s, b| s.wrapping_add(*b))
}
