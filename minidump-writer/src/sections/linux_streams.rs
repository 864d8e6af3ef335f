use std::collections::BTreeMap;

use minidump::format::MINIDUMP_DIRECTORY;

use crate::dump_buf::DumpBuf;

/// Linux system files, copied in byte for byte.
pub(super) fn write(
    buf: &mut DumpBuf,
    streams: &BTreeMap<u32, Vec<u8>>,
) -> Result<Vec<MINIDUMP_DIRECTORY>, scroll::Error> {
    streams
        .iter()
        .map(|(&stream_type, bytes)| {
            buf.align(4);
            Ok(MINIDUMP_DIRECTORY {
                stream_type,
                location: buf.write_all(bytes)?,
            })
        })
        .collect()
}
