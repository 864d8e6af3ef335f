// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::env;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use minidump::*;

const USAGE: &str = "Usage: minidump_dump <minidump>";

fn print_minidump_dump<T: Write>(path: &Path, stdout: &mut T) -> Result<(), Error> {
    let dump = Minidump::read_path(path)?;
    let io_err = |_| Error::IoError;
    dump.print(stdout).map_err(io_err)?;

    // Other streams depend on these, so load them upfront.
    let system_info = dump.system_info();
    let memory_list = dump.get_stream::<MinidumpMemoryList<'_>>().ok();

    if let Ok(thread_list) = dump.get_stream::<MinidumpThreadList<'_>>() {
        thread_list
            .print(stdout, memory_list.as_ref(), system_info)
            .map_err(io_err)?;
    }
    if let Ok(module_list) = dump.get_stream::<MinidumpModuleList>() {
        module_list.print(stdout).map_err(io_err)?;
    }
    if let Some(memory_list) = memory_list.as_ref() {
        memory_list.print(stdout).map_err(io_err)?;
    }
    if let Ok(exception) = dump.get_stream::<MinidumpException>() {
        exception.print(stdout, system_info).map_err(io_err)?;
    }
    if let Some(system_info) = system_info {
        system_info.print(stdout).map_err(io_err)?;
    }
    if let Ok(misc_info) = dump.get_stream::<MinidumpMiscInfo>() {
        misc_info.print(stdout).map_err(io_err)?;
    }
    if let Ok(breakpad_info) = dump.get_stream::<MinidumpBreakpadInfo>() {
        breakpad_info.print(stdout).map_err(io_err)?;
    }
    for stream_type in MinidumpLinuxStream::STREAM_TYPES {
        if let Ok(data) = dump.get_raw_stream(stream_type as u32) {
            MinidumpLinuxStream { stream_type, data }
                .print(stdout)
                .map_err(io_err)?;
        }
    }
    Ok(())
}

fn main() {
    let Some(dump_arg) = env::args().nth(1) else {
        eprintln!("{USAGE}");
        process::exit(1);
    };
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    if let Err(err) = print_minidump_dump(Path::new(&dump_arg), &mut stdout) {
        eprintln!("Error reading dump: {err}");
        process::exit(1);
    }
}
