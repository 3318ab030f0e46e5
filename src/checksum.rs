/// Initial state for the checksum routine
pub const CHECKSUM_INIT: u8 = 0xEF;

/// XOR checksum of a blob, as it is defined by the ROM
///
/// Chaining is equivalent to checksumming the concatenation, so
/// `checksum(b, checksum(a, seed)) == checksum(a ++ b, seed)`.
pub fn checksum(data: &[u8], seed: u8) -> u8 {
    data.iter().fold(seed, |state, byte| state ^ byte)
}
