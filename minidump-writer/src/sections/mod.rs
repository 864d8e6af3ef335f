//! Serializing a [`ProcessSnapshot`] into minidump bytes.
//!
//! The layout is the header, then the stream directory, then captured memory
//! and the stream payloads. Each submodule writes one stream and returns its
//! directory entry.

mod breakpad_info;
mod exception;
mod linux_streams;
mod memory_list;
mod misc_info;
mod module_list;
mod system_info;
mod thread_list;

use minidump::format::{
    self as md, MINIDUMP_DIRECTORY, MINIDUMP_HEADER, MINIDUMP_SIGNATURE, MINIDUMP_VERSION,
};
use minidump::ProcessSnapshot;

use crate::dump_buf::DumpBuf;

/// Fixed-size streams every dump carries: thread list, module list, memory
/// list, system info and misc info.
const REQUIRED_STREAMS: usize = 5;

/// How big the serialized `snapshot` is going to be, give or take.
pub(crate) fn estimate_size(snapshot: &ProcessSnapshot) -> usize {
    let memory: usize = snapshot.memory.iter().map(|r| r.bytes.len()).sum();
    let linux: usize = snapshot.linux_streams.values().map(Vec::len).sum();
    let threads = snapshot.threads.len()
        * (md::size_of::<md::MINIDUMP_THREAD>() + md::size_of::<md::CONTEXT_AMD64>());
    let modules = snapshot.modules.len() * (md::size_of::<md::MINIDUMP_MODULE>() + 512);
    memory + linux + threads + modules + 4096
}

pub(crate) fn write_minidump(
    snapshot: &ProcessSnapshot,
    time_date_stamp: u32,
) -> Result<Vec<u8>, scroll::Error> {
    let mut buf = DumpBuf::with_capacity(estimate_size(snapshot));

    let stream_count = REQUIRED_STREAMS
        + usize::from(snapshot.exception.is_some())
        + usize::from(breakpad_info::present(snapshot))
        + snapshot.linux_streams.len();
    let header = buf.reserve(md::size_of::<MINIDUMP_HEADER>())?;
    let directory_start = buf.position();
    buf.reserve(stream_count * md::size_of::<MINIDUMP_DIRECTORY>())?;

    let regions = memory_list::write_regions(&mut buf, &snapshot.memory)?;

    let mut directory = Vec::with_capacity(stream_count);
    buf.align(8);
    directory.push(thread_list::write(&mut buf, snapshot, &regions)?);
    buf.align(8);
    directory.push(module_list::write(&mut buf, &snapshot.modules)?);
    buf.align(8);
    directory.push(memory_list::write(&mut buf, &regions)?);
    if let Some(exception) = &snapshot.exception {
        buf.align(8);
        directory.push(exception::write(&mut buf, exception)?);
    }
    buf.align(8);
    directory.push(system_info::write(&mut buf, &snapshot.system)?);
    buf.align(8);
    directory.push(misc_info::write(&mut buf, snapshot.process_id)?);
    if let Some(entry) = breakpad_info::write(&mut buf, snapshot)? {
        directory.push(entry);
    }
    directory.extend(linux_streams::write(&mut buf, &snapshot.linux_streams)?);
    debug_assert_eq!(directory.len(), stream_count);

    for (i, entry) in directory.iter().enumerate() {
        let rva = directory_start + i * md::size_of::<MINIDUMP_DIRECTORY>();
        buf.write_at(rva as md::RVA, entry)?;
    }
    let header_value = MINIDUMP_HEADER {
        signature: MINIDUMP_SIGNATURE,
        version: MINIDUMP_VERSION,
        stream_count: directory.len() as u32,
        stream_directory_rva: directory_start as md::RVA,
        checksum: 0,
        time_date_stamp,
        flags: 0,
    };
    buf.write_at(header.rva, &header_value)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;
    use minidump::format::MINIDUMP_STREAM_TYPE;
    use minidump::{Minidump, MinidumpRawContext, SystemRecord, ThreadRecord};

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ProcessSnapshot {
            system: SystemRecord {
                os: minidump::Os::Linux,
                cpu: minidump::Cpu::X86_64,
                ..SystemRecord::default()
            },
            ..ProcessSnapshot::default()
        };
        let bytes = write_minidump(&snapshot, 1234).unwrap();
        let dump = Minidump::read(bytes.as_slice()).unwrap();
        assert_eq!(dump.header.time_date_stamp, 1234);
        assert_eq!(dump.header.stream_count as usize, REQUIRED_STREAMS);
        assert!(dump
            .get_raw_stream(MINIDUMP_STREAM_TYPE::ExceptionStream.into())
            .is_err());

        let parsed = minidump::parse(&bytes).unwrap();
        assert!(parsed.threads.is_empty());
        assert_eq!(parsed.system.cpu, minidump::Cpu::X86_64);
    }

    #[test]
    fn test_thread_context_round_trip() {
        let mut snapshot = ProcessSnapshot {
            system: SystemRecord {
                os: minidump::Os::Linux,
                cpu: minidump::Cpu::X86,
                ..SystemRecord::default()
            },
            ..ProcessSnapshot::default()
        };
        let context = md::CONTEXT_X86 {
            context_flags: md::ContextFlagsCpu::CONTEXT_X86.bits(),
            eip: 0x8048123,
            esp: 0xbfff0010,
            ebp: 0xbfff0040,
            ..Default::default()
        };
        snapshot.memory.insert(0xbfff0000, vec![0xab; 0x100]);
        snapshot.threads.push(ThreadRecord {
            thread_id: 7,
            context: MinidumpRawContext::X86(context),
            stack: Some((0xbfff0000, 0x100)),
        });

        let bytes = write_minidump(&snapshot, 0).unwrap();
        assert!(bytes.len() < estimate_size(&snapshot));
        let parsed = minidump::parse(&bytes).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
