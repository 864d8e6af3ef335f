// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::ops::Deref;
use std::time::{Duration, SystemTime};

use minidump::*;
use tracing::{debug, info, warn};

use crate::process_state::{CallStack, CallStackInfo, LinuxStandardBase, ProcessState};
use crate::stackwalker;
use crate::symbols::SymbolProvider;
use crate::system_info::SystemInfo;

/// Configuration of the processing pipeline.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProcessorOptions {
    /// The most frames any one thread's stack walk may produce.
    pub max_frames: usize,
}

impl ProcessorOptions {
    /// The default options with a different frame limit.
    pub fn with_max_frames(max_frames: usize) -> Self {
        ProcessorOptions { max_frames }
    }
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        ProcessorOptions { max_frames: 1024 }
    }
}

/// An error encountered during minidump processing.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to read minidump")]
    MinidumpReadError(#[from] minidump::Error),
    #[error("The thread list stream was not found")]
    MissingThreadList,
}

impl ProcessError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            ProcessError::MinidumpReadError(_) => "MinidumpReadError",
            ProcessError::MissingThreadList => "MissingThreadList",
        }
    }
}

/// Unwind all threads in `dump` and return a report as a `ProcessState`.
///
/// Equivalent to [`process_minidump_with_options`] with default options.
pub fn process_minidump<'a, T, P>(
    dump: &'a Minidump<'a, T>,
    symbol_provider: &P,
) -> Result<ProcessState, ProcessError>
where
    T: Deref<Target = [u8]> + 'a,
    P: SymbolProvider,
{
    process_minidump_with_options(dump, symbol_provider, ProcessorOptions::default())
}

/// Unwind all threads in `dump` and return a report as a `ProcessState`.
///
/// Only the thread list stream is required. Everything else is optional
/// and only makes the report less complete when missing. Without a system
/// info stream the CPU is taken from the thread contexts and the OS is
/// unknown.
pub fn process_minidump_with_options<'a, T, P>(
    dump: &'a Minidump<'a, T>,
    symbol_provider: &P,
    options: ProcessorOptions,
) -> Result<ProcessState, ProcessError>
where
    T: Deref<Target = [u8]> + 'a,
    P: SymbolProvider,
{
    let thread_list = dump
        .get_stream::<MinidumpThreadList>()
        .map_err(|e| match e {
            Error::StreamNotFound => ProcessError::MissingThreadList,
            e => ProcessError::MinidumpReadError(e),
        })?;
    let dump_system_info = dump.system_info();
    let system_info = match dump_system_info {
        Some(info) => SystemInfo::from_minidump(info),
        None => {
            warn!("no system info stream, guessing the CPU from the thread contexts");
            SystemInfo::from_thread_list(&thread_list)
        }
    };

    let misc_info = dump.get_stream::<MinidumpMiscInfo>().ok();
    let process_id = misc_info.as_ref().and_then(|info| info.process_id());
    let process_create_time = misc_info
        .as_ref()
        .and_then(|info| info.process_create_time())
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64));
    let time = SystemTime::UNIX_EPOCH + Duration::from_secs(dump.header.time_date_stamp as u64);

    // Breakpad info says which thread wrote the dump and which asked for it.
    let (dump_thread_id, mut requesting_thread_id) =
        match dump.get_stream::<MinidumpBreakpadInfo>() {
            Ok(info) => (info.dump_thread_id, info.requesting_thread_id),
            Err(_) => (None, None),
        };

    let exception = dump.get_stream::<MinidumpException>().ok();
    let (crash_reason, crash_address) = match exception {
        Some(ref exception) => {
            if requesting_thread_id.is_none() {
                requesting_thread_id = Some(exception.get_crashing_thread_id());
            }
            (
                Some(exception.get_crash_reason(system_info.os)),
                Some(exception.get_crash_address(system_info.cpu)),
            )
        }
        None => (None, None),
    };
    let exception_context = exception
        .as_ref()
        .and_then(|e| e.context(dump_system_info));

    let modules = dump
        .get_stream::<MinidumpModuleList>()
        .unwrap_or_default();
    let memory_list = dump
        .get_stream::<MinidumpMemoryList>()
        .unwrap_or_default();
    let linux_standard_base = dump
        .get_stream::<MinidumpLinuxLsbRelease>()
        .ok()
        .map(|lsb| LinuxStandardBase::from_lsb_release(&lsb));

    info!(
        "processing {} threads, {} modules",
        thread_list.threads.len(),
        modules.iter().count()
    );

    let mut threads = vec![];
    let mut requesting_thread = None;
    for (i, thread) in thread_list.threads.iter().enumerate() {
        let id = thread.thread_id();
        // The thread that wrote the dump is only ever in the dump writer.
        if dump_thread_id == Some(id) {
            debug!("skipping dump thread {}", id);
            threads.push(CallStack::with_info(id, CallStackInfo::DumpThreadSkipped));
            continue;
        }

        let thread_context = thread.context(dump_system_info);
        // The requesting thread's own context is wherever the crash
        // handler was running. The exception context is where it crashed.
        let context = if requesting_thread_id == Some(id) {
            requesting_thread = Some(i);
            exception_context.as_ref().or(thread_context.as_ref())
        } else {
            thread_context.as_ref()
        };

        let stack_memory = thread
            .stack_memory(&memory_list)
            .map(|memory| memory as &dyn MemoryReader);
        debug!("walking thread {}", id);
        let stack = stackwalker::walk_stack(
            id,
            context,
            stack_memory,
            &modules,
            symbol_provider,
            &options,
        );
        threads.push(stack);
    }

    Ok(ProcessState {
        process_id,
        time,
        process_create_time,
        crash_reason,
        crash_address,
        requesting_thread,
        threads,
        system_info,
        linux_standard_base,
        modules,
        symbol_stats: symbol_provider.stats(),
    })
}
