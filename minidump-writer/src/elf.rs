//! Module identifiers from ELF files.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectSection};
use tracing::debug;

/// How many bytes of `.text` the fallback identifier hashes.
const TEXT_HASH_LEN: usize = 4096;

/// The identifier Breakpad gives ELF files without a build id note: the
/// first page of `.text` XORed together in 16-byte blocks.
pub fn text_hash(text: &[u8]) -> Vec<u8> {
    let mut id = vec![0u8; 16];
    for chunk in text[..text.len().min(TEXT_HASH_LEN)].chunks(16) {
        for (out, byte) in id.iter_mut().zip(chunk) {
            *out ^= byte;
        }
    }
    id
}

/// The build id of an in-memory ELF image.
pub fn build_id_from_elf(bytes: &[u8]) -> Option<Vec<u8>> {
    let file = object::File::parse(bytes).ok()?;
    if let Ok(Some(build_id)) = file.build_id() {
        if !build_id.is_empty() {
            return Some(build_id.to_vec());
        }
    }
    let text = file.section_by_name(".text")?.data().ok()?;
    if text.is_empty() {
        return None;
    }
    Some(text_hash(text))
}

/// The build id of the ELF file at `path`.
pub fn build_id_from_path(path: &Path) -> Option<Vec<u8>> {
    let file = File::open(path)
        .map_err(|e| debug!("can't open {} for its build id: {}", path.display(), e))
        .ok()?;
    // SAFETY: the mapping is read-only and dropped before returning.
    let mmap = unsafe { Mmap::map(&file) }.ok()?;
    build_id_from_elf(&mmap)
}
