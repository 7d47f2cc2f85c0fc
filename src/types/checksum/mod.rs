#![forbid(unsafe_code)]

use crc32fast::Hasher;

/// Checksum of a page image bound to the page it belongs to and the WAL salt,
/// so an image copied to the wrong slot or left over from an older log fails
/// verification.
pub fn frame_crc32(page_id: u32, salt: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page_id.to_be_bytes());
    hasher.update(&salt.to_be_bytes());
    hasher.update(payload);
    hasher.finalize()
}
