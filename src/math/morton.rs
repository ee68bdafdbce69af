//! Morton encoding (Z-order curve) for spatial sorting

/// Spread bits of a 10-bit integer into every third bit of a 32-bit integer
fn spread_bits(x: u32) -> u32 {
    let mut x = x & 0x3ff; // 10 bits max
    x = (x | (x << 16)) & 0x030000ff;
    x = (x | (x << 8)) & 0x0300f00f;
    x = (x | (x << 4)) & 0x030c30c3;
    x = (x | (x << 2)) & 0x09249249;
    x
}

/// Compact every third bit of a 32-bit integer into a 10-bit integer
fn compact_bits(x: u32) -> u32 {
    let mut x = x & 0x09249249;
    x = (x | (x >> 2)) & 0x030c30c3;
    x = (x | (x >> 4)) & 0x0300f00f;
    x = (x | (x >> 8)) & 0xff0000ff;
    x = (x | (x >> 16)) & 0x3ff;
    x
}

/// Encode 3D coordinates into a Morton code (Z-order curve)
/// Each coordinate can be up to 10 bits (0..1023)
pub fn encode_morton_3d(x: u32, y: u32, z: u32) -> u32 {
    spread_bits(x) | (spread_bits(y) << 1) | (spread_bits(z) << 2)
}

/// Decode a Morton code back to 3D coordinates
pub fn decode_morton_3d(code: u32) -> (u32, u32, u32) {
    (
        compact_bits(code),
        compact_bits(code >> 1),
        compact_bits(code >> 2),
    )
}
