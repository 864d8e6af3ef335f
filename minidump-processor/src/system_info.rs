use minidump::system_info::{Cpu, Os};
use minidump::{MinidumpSystemInfo, MinidumpThreadList};

/// Information about the system that produced a `Minidump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    /// The operating system that produced the minidump
    pub os: Os,
    /// A string identifying the version of the operating system
    ///
    /// On Linux this is the kernel version followed by the `uname` build
    /// string, like "5.15.0 #1 SMP Debian", if present.
    pub os_version: Option<String>,
    /// The CPU on which the dump was produced
    pub cpu: Cpu,
    /// A string further identifying the specific CPU
    ///
    /// For example, "GenuineIntel family 6 model 158 stepping 10", if present.
    pub cpu_info: Option<String>,
    /// The number of processors in the system
    ///
    /// Will be greater than one for multi-core systems.
    pub cpu_count: usize,
}

impl SystemInfo {
    pub fn from_minidump(info: &MinidumpSystemInfo) -> SystemInfo {
        let has_version = info.raw.major_version != 0
            || info.raw.minor_version != 0
            || info.raw.build_number != 0
            || info.csd_version.is_some();
        SystemInfo {
            os: info.os,
            os_version: has_version.then(|| info.os_version()),
            cpu: info.cpu,
            cpu_info: info.cpu_info.clone(),
            cpu_count: info.cpu_count(),
        }
    }

    /// What can be said about the system of a dump with no system info
    /// stream: the CPU of the first readable thread context.
    pub fn from_thread_list(threads: &MinidumpThreadList) -> SystemInfo {
        let cpu = threads
            .threads
            .iter()
            .find_map(|thread| thread.context(None))
            .map_or(Cpu::Unknown(0xffff), |context| context.raw.cpu());
        SystemInfo {
            os: Os::Unknown(0),
            os_version: None,
            cpu,
            cpu_info: None,
            cpu_count: 0,
        }
    }
}
