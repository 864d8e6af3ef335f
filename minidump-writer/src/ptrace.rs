//! Capturing live Linux processes with `ptrace`.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::ptr;

use minidump::format as md;
use minidump::{Cpu, MemoryReadError, MemoryReader, MinidumpRawContext, Os, SystemRecord};
use procfs_core::process::{MMPermissions, MMapPath, MemoryMaps, Stat};
use procfs_core::{CpuInfo, FromRead};
use tracing::{debug, warn};

use crate::elf;
use crate::source::{AuxStream, Mapping, ProcessSource, SourceError};

/// A live process, stopped with `PTRACE_ATTACH` for the duration of the
/// capture.
///
/// Threads are detached again by [`ProcessSource::resume`] or on drop.
#[derive(Debug)]
pub struct PtraceProcess {
    pid: u32,
    attached: Vec<u32>,
    mem: Option<File>,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl PtraceProcess {
    pub fn new(pid: u32) -> PtraceProcess {
        PtraceProcess {
            pid,
            attached: vec![],
            mem: None,
        }
    }

    /// Whether the target still exists and hasn't become a zombie.
    fn alive(&self) -> bool {
        match Stat::from_file(format!("/proc/{}/stat", self.pid)) {
            Ok(stat) => !matches!(stat.state, 'Z' | 'X' | 'x'),
            Err(_) => false,
        }
    }

    fn gone_or(&self, err: SourceError) -> SourceError {
        if self.alive() {
            err
        } else {
            SourceError::Vanished
        }
    }

    fn attach(&self, tid: u32) -> Result<(), SourceError> {
        let null = ptr::null_mut::<libc::c_void>();
        // SAFETY: PTRACE_ATTACH takes no pointer arguments.
        let ret = unsafe { libc::ptrace(libc::PTRACE_ATTACH, tid as libc::pid_t, null, null) };
        if ret == -1 {
            return Err(match last_errno() {
                libc::EPERM => SourceError::PermissionDenied,
                libc::ESRCH if tid == self.pid => SourceError::NoSuchProcess,
                libc::ESRCH => SourceError::ThreadGone(tid),
                _ => SourceError::Io(io::Error::last_os_error()),
            });
        }
        loop {
            // SAFETY: a null status pointer is allowed.
            let ret = unsafe { libc::waitpid(tid as libc::pid_t, ptr::null_mut(), libc::__WALL) };
            if ret >= 0 {
                return Ok(());
            }
            if last_errno() != libc::EINTR {
                let err = io::Error::last_os_error();
                detach(tid);
                return Err(SourceError::Io(err));
            }
        }
    }

    fn get_regs(&self, tid: u32) -> Result<libc::user_regs_struct, SourceError> {
        // SAFETY: user_regs_struct is plain old data.
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        // SAFETY: PTRACE_GETREGS fills exactly one user_regs_struct.
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                tid as libc::pid_t,
                ptr::null_mut::<libc::c_void>(),
                &mut regs as *mut libc::user_regs_struct as *mut libc::c_void,
            )
        };
        if ret == -1 {
            let err = match last_errno() {
                libc::ESRCH => SourceError::ThreadGone(tid),
                _ => SourceError::Io(io::Error::last_os_error()),
            };
            return Err(self.gone_or(err));
        }
        Ok(regs)
    }
}

fn detach(tid: u32) {
    let null = ptr::null_mut::<libc::c_void>();
    // SAFETY: PTRACE_DETACH with a zero signal takes no pointer arguments.
    unsafe {
        libc::ptrace(libc::PTRACE_DETACH, tid as libc::pid_t, null, null);
    }
}

#[cfg(target_arch = "x86_64")]
fn context_from_regs(regs: &libc::user_regs_struct) -> MinidumpRawContext {
    let flags = md::ContextFlagsCpu::CONTEXT_AMD64.bits() | md::ContextFlagsX86::CONTEXT_FULL.bits();
    md::CONTEXT_AMD64 {
        context_flags: flags,
        cs: regs.cs as u16,
        ds: regs.ds as u16,
        es: regs.es as u16,
        fs: regs.fs as u16,
        gs: regs.gs as u16,
        ss: regs.ss as u16,
        eflags: regs.eflags as u32,
        rax: regs.rax,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rbx: regs.rbx,
        rsp: regs.rsp,
        rbp: regs.rbp,
        rsi: regs.rsi,
        rdi: regs.rdi,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rip: regs.rip,
        ..Default::default()
    }
    .into()
}

#[cfg(target_arch = "x86")]
fn context_from_regs(regs: &libc::user_regs_struct) -> MinidumpRawContext {
    let flags = md::ContextFlagsCpu::CONTEXT_X86.bits() | md::ContextFlagsX86::CONTEXT_FULL.bits();
    md::CONTEXT_X86 {
        context_flags: flags,
        gs: regs.xgs as u32,
        fs: regs.xfs as u32,
        es: regs.xes as u32,
        ds: regs.xds as u32,
        edi: regs.edi as u32,
        esi: regs.esi as u32,
        ebx: regs.ebx as u32,
        edx: regs.edx as u32,
        ecx: regs.ecx as u32,
        eax: regs.eax as u32,
        ebp: regs.ebp as u32,
        eip: regs.eip as u32,
        cs: regs.xcs as u32,
        eflags: regs.eflags as u32,
        esp: regs.esp as u32,
        ss: regs.xss as u32,
        ..Default::default()
    }
    .into()
}

fn mapping_name(path: MMapPath) -> Option<String> {
    match path {
        MMapPath::Path(path) => Some(path.to_string_lossy().into_owned()),
        MMapPath::Heap => Some("[heap]".to_owned()),
        MMapPath::Stack => Some("[stack]".to_owned()),
        MMapPath::TStack(tid) => Some(format!("[stack:{tid}]")),
        MMapPath::Vdso => Some("[vdso]".to_owned()),
        MMapPath::Vvar => Some("[vvar]".to_owned()),
        MMapPath::Vsyscall => Some("[vsyscall]".to_owned()),
        MMapPath::Other(name) => Some(name),
        _ => None,
    }
}

impl MemoryReader for PtraceProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        let Some(mem) = &self.mem else {
            return Err(MemoryReadError::ProcessGone);
        };
        let len = buf.len();
        mem.read_exact_at(buf, address).map_err(|e| {
            if !self.alive() {
                MemoryReadError::ProcessGone
            } else if e.kind() == io::ErrorKind::PermissionDenied {
                MemoryReadError::PermissionDenied { address }
            } else {
                MemoryReadError::NotMapped { address, len }
            }
        })
    }
}

impl ProcessSource for PtraceProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn suspend(&mut self) -> Result<(), SourceError> {
        let tasks = match fs::read_dir(format!("/proc/{}/task", self.pid)) {
            Ok(tasks) => tasks,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SourceError::NoSuchProcess),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(SourceError::PermissionDenied)
            }
            Err(e) => return Err(e.into()),
        };
        let mut tids: Vec<u32> = tasks
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
        tids.sort_unstable();
        // The main thread goes first; its failure decides the outcome.
        if let Some(pos) = tids.iter().position(|&tid| tid == self.pid) {
            tids[..=pos].rotate_right(1);
        }

        for tid in tids {
            match self.attach(tid) {
                Ok(()) => self.attached.push(tid),
                Err(SourceError::ThreadGone(tid)) => debug!("thread {} exited before attach", tid),
                Err(e) => {
                    self.resume();
                    return Err(e);
                }
            }
        }
        if self.attached.is_empty() {
            return Err(SourceError::NoSuchProcess);
        }

        self.mem = Some(File::open(format!("/proc/{}/mem", self.pid)).map_err(|e| {
            self.gone_or(match e.kind() {
                io::ErrorKind::PermissionDenied => SourceError::PermissionDenied,
                _ => e.into(),
            })
        })?);
        Ok(())
    }

    fn resume(&mut self) {
        self.mem = None;
        for tid in self.attached.drain(..) {
            detach(tid);
        }
    }

    fn threads(&mut self) -> Result<Vec<u32>, SourceError> {
        Ok(self.attached.clone())
    }

    fn thread_context(&mut self, tid: u32) -> Result<MinidumpRawContext, SourceError> {
        let regs = self.get_regs(tid)?;
        Ok(context_from_regs(&regs))
    }

    fn mappings(&mut self) -> Result<Vec<Mapping>, SourceError> {
        let maps = MemoryMaps::from_file(format!("/proc/{}/maps", self.pid)).map_err(|e| {
            self.gone_or(SourceError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                e.to_string(),
            )))
        })?;
        Ok(maps
            .into_iter()
            .map(|map| Mapping {
                start: map.address.0,
                end: map.address.1,
                offset: map.offset,
                readable: map.perms.contains(MMPermissions::READ),
                executable: map.perms.contains(MMPermissions::EXECUTE),
                name: mapping_name(map.pathname),
            })
            .collect())
    }

    fn build_id(&mut self, mapping: &Mapping) -> Option<Vec<u8>> {
        let name = mapping.name.as_deref()?;
        if name == "[vdso]" {
            // The vdso has no file; its image is right there in memory.
            let mut image = vec![0; mapping.size() as usize];
            self.read_memory(mapping.start, &mut image).ok()?;
            return elf::build_id_from_elf(&image);
        }
        let path = Path::new(name);
        if !path.is_absolute() {
            return None;
        }
        // Files may live in another mount namespace; look through the
        // target's root first.
        let rooted = Path::new("/proc")
            .join(self.pid.to_string())
            .join("root")
            .join(path.strip_prefix("/").ok()?);
        elf::build_id_from_path(&rooted).or_else(|| elf::build_id_from_path(path))
    }

    fn system(&mut self) -> SystemRecord {
        let mut system = SystemRecord {
            os: Os::Linux,
            cpu: if cfg!(target_arch = "x86_64") {
                Cpu::X86_64
            } else {
                Cpu::X86
            },
            ..SystemRecord::default()
        };

        // SAFETY: utsname is plain old data filled in by uname.
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: uts is a valid utsname.
        if unsafe { libc::uname(&mut uts) } == 0 {
            let field = |chars: &[libc::c_char]| {
                let bytes: Vec<u8> = chars
                    .iter()
                    .take_while(|&&c| c != 0)
                    .map(|&c| c as u8)
                    .collect();
                String::from_utf8_lossy(&bytes).into_owned()
            };
            system.os_version = Some(format!(
                "{} {} {} {}",
                field(&uts.sysname[..]),
                field(&uts.release[..]),
                field(&uts.version[..]),
                field(&uts.machine[..])
            ));
        }

        match CpuInfo::from_file("/proc/cpuinfo") {
            Ok(info) => {
                let number = |key: &str| {
                    info.get_field(0, key)
                        .and_then(|value| value.trim().parse::<u16>().ok())
                        .unwrap_or(0)
                };
                system.cpu_count = u8::try_from(info.num_cores()).unwrap_or(u8::MAX);
                system.processor_level = number("cpu family");
                system.processor_revision = (number("model") << 8) | (number("stepping") & 0xff);
                system.cpu_vendor = info.get_field(0, "vendor_id").map(str::to_owned);
            }
            Err(e) => warn!("failed to read /proc/cpuinfo: {}", e),
        }
        system
    }

    fn aux_stream(&mut self, stream: AuxStream) -> Option<Vec<u8>> {
        let path = stream.path(self.pid);
        fs::read(&path)
            .map_err(|e| debug!("not copying {}: {}", path, e))
            .ok()
    }

    fn dump_thread(&self) -> Option<u32> {
        // SAFETY: gettid has no arguments and can't fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        u32::try_from(tid).ok()
    }
}

impl Drop for PtraceProcess {
    fn drop(&mut self) {
        self.resume();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mapping_names() {
        assert_eq!(
            mapping_name(MMapPath::Path(PathBuf::from("/usr/lib/libc.so.6"))).as_deref(),
            Some("/usr/lib/libc.so.6")
        );
        assert_eq!(mapping_name(MMapPath::Stack).as_deref(), Some("[stack]"));
        assert_eq!(mapping_name(MMapPath::Anonymous), None);
    }

    #[test]
    fn test_missing_process() {
        // Pids are bounded by /proc/sys/kernel/pid_max, at most 2^22.
        let mut process = PtraceProcess::new(u32::MAX - 1);
        assert!(matches!(process.suspend(), Err(SourceError::NoSuchProcess)));
        assert!(!process.alive());
    }

    #[test]
    fn test_own_mappings() {
        let mut process = PtraceProcess::new(std::process::id());
        let mappings = process.mappings().unwrap();
        assert!(!mappings.is_empty());
        assert!(mappings.windows(2).all(|w| w[0].start < w[1].start));
        assert!(mappings.iter().any(|m| m.executable));
    }
}
