use minidump::format::{MINIDUMP_DIRECTORY, MINIDUMP_MEMORY_DESCRIPTOR, MINIDUMP_STREAM_TYPE};
use minidump::MemoryMap;

use crate::dump_buf::DumpBuf;

/// Copy the bytes of every captured region into the dump.
pub(super) fn write_regions(
    buf: &mut DumpBuf,
    memory: &MemoryMap,
) -> Result<Vec<MINIDUMP_MEMORY_DESCRIPTOR>, scroll::Error> {
    memory
        .iter()
        .map(|region| {
            Ok(MINIDUMP_MEMORY_DESCRIPTOR {
                start_of_memory_range: region.base_address,
                memory: buf.write_all(&region.bytes)?,
            })
        })
        .collect()
}

/// The descriptor for `start..start + len` inside the already written
/// `regions`, if one of them covers it.
pub(super) fn descriptor_for(
    regions: &[MINIDUMP_MEMORY_DESCRIPTOR],
    start: u64,
    len: u64,
) -> Option<MINIDUMP_MEMORY_DESCRIPTOR> {
    let region = regions.iter().find(|r| {
        let end = r.start_of_memory_range + u64::from(r.memory.data_size);
        start >= r.start_of_memory_range && start.checked_add(len).is_some_and(|e| e <= end)
    })?;
    let mut desc = *region;
    desc.start_of_memory_range = start;
    desc.memory.rva += (start - region.start_of_memory_range) as u32;
    desc.memory.data_size = len as u32;
    Some(desc)
}

pub(super) fn write(
    buf: &mut DumpBuf,
    regions: &[MINIDUMP_MEMORY_DESCRIPTOR],
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::MemoryListStream.into(),
        location: buf.write_list(regions)?,
    })
}
