use minidump::format::{
    CPU_INFORMATION, MINIDUMP_DIRECTORY, MINIDUMP_STREAM_TYPE, MINIDUMP_SYSTEM_INFO, X86CpuInfo,
};
use minidump::{Cpu, SystemRecord};
use scroll::{Pwrite, LE};

use crate::dump_buf::DumpBuf;

/// `(major, minor, build)` of the kernel release in a `uname` string like
/// "Linux 5.15.0-91-generic #101-Ubuntu SMP x86_64".
fn kernel_version(os_version: &str) -> (u32, u32, u32) {
    let Some(release) = os_version
        .split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))
    else {
        return (0, 0, 0);
    };
    let mut parts = release
        .split(|c: char| !c.is_ascii_digit())
        .map(|part| part.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn cpu_information(system: &SystemRecord) -> Result<CPU_INFORMATION, scroll::Error> {
    let mut cpu = CPU_INFORMATION::default();
    let Some(vendor) = &system.cpu_vendor else {
        return Ok(cpu);
    };
    if !matches!(system.cpu, Cpu::X86 | Cpu::X86_64) {
        return Ok(cpu);
    }
    let mut vendor_bytes = [0u8; 12];
    for (out, byte) in vendor_bytes.iter_mut().zip(vendor.bytes()) {
        *out = byte;
    }
    let mut info = X86CpuInfo::default();
    for (word, chunk) in info.vendor_id.iter_mut().zip(vendor_bytes.chunks(4)) {
        *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    cpu.data.pwrite_with(&info, 0, LE)?;
    Ok(cpu)
}

pub(super) fn write(
    buf: &mut DumpBuf,
    system: &SystemRecord,
) -> Result<MINIDUMP_DIRECTORY, scroll::Error> {
    let (csd_version_rva, (major_version, minor_version, build_number)) =
        match &system.os_version {
            Some(version) => (buf.write_string(version)?.rva, kernel_version(version)),
            None => (0, (0, 0, 0)),
        };
    buf.align(4);
    let info = MINIDUMP_SYSTEM_INFO {
        processor_architecture: system.cpu.processor_architecture(),
        processor_level: system.processor_level,
        processor_revision: system.processor_revision,
        number_of_processors: system.cpu_count,
        major_version,
        minor_version,
        build_number,
        platform_id: system.os.platform_id(),
        csd_version_rva,
        cpu: cpu_information(system)?,
        ..MINIDUMP_SYSTEM_INFO::default()
    };
    Ok(MINIDUMP_DIRECTORY {
        stream_type: MINIDUMP_STREAM_TYPE::SystemInfoStream.into(),
        location: buf.write(&info)?,
    })
}
