//! Key to hash-slot routing.
//!
//! Every participant (clients, the migration coordinator, the store and the
//! checker) must agree on slot placement without coordinating, so this module
//! is a pure function of the key bytes: CRC16/XMODEM over either the whole key
//! or its hash tag, reduced modulo [`SLOT_COUNT`].

/// Hash slot identifier in `[0, SLOT_COUNT)`.
pub type Slot = u16;

/// Number of hash slots in one logical keyspace.
pub const SLOT_COUNT: u16 = 16_384;

/// Highest valid slot.
pub const MAX_SLOT: Slot = SLOT_COUNT - 1;

const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16/XMODEM (polynomial 0x1021, zero init), as used by Redis Cluster.
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, b| {
        let idx = ((crc >> 8) ^ u16::from(*b)) & 0xff;
        (crc << 8) ^ CRC16_TABLE[idx as usize]
    })
}

/// Return the hash tag of `key`, if it has a non-empty one.
///
/// The tag is the content between the first `{` and the first `}` after it.
/// `foo{}{bar}` has no tag (the first pair is empty), so the whole key hashes.
pub fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|b| *b == b'{')?;
    let rest = &key[open + 1..];
    let close = rest.iter().position(|b| *b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

/// Map a key to its hash slot.
pub fn slot_of(key: &[u8]) -> Slot {
    let hashed = hash_tag(key).unwrap_or(key);
    crc16(hashed) % SLOT_COUNT
}
