use std::ops::Deref;
use std::panic;
use std::path::Path;
use std::process;

use clap::{AppSettings, Arg, Command};
use log::error;
use minidump_writer::{MinidumpWriter, WriteError, MAX_STACK_LEN};
use simplelog::{ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode};

fn make_app() -> Command<'static> {
    Command::new("write_minidump")
        .version(clap::crate_version!())
        .about("Writes a minidump of a running process.")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .arg(
            Arg::new("crashing-thread")
                .long("crashing-thread")
                .takes_value(true)
                .help("The thread to blame in the dump (defaults to the main thread)"),
        )
        .arg(
            Arg::new("max-stack-len")
                .long("max-stack-len")
                .takes_value(true)
                .help("The most bytes of stack to capture per thread"),
        )
        .arg(
            Arg::new("size-limit")
                .long("size-limit")
                .takes_value(true)
                .help("Truncate the stacks of extra threads if the dump would exceed this many bytes"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("warn")
                .takes_value(true)
                .help("Set the logging level"),
        )
        .arg(
            Arg::new("pid")
                .required(true)
                .takes_value(true)
                .help("The process to dump"),
        )
        .arg(
            Arg::new("output")
                .required(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the minidump"),
        )
}

fn parse_number(matches: &clap::ArgMatches, name: &str) -> Option<u64> {
    let value = matches.value_of(name)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            error!("--{} expects a number, got {:?}", name, value);
            process::exit(2);
        }
    }
}

#[cfg(all(
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
))]
fn write(writer: &mut MinidumpWriter, output: &Path) -> Result<(), WriteError> {
    writer.write(output)
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86", target_arch = "x86_64")
)))]
fn write(_writer: &mut MinidumpWriter, _output: &Path) -> Result<(), WriteError> {
    error!("capturing live processes is only supported on x86 Linux");
    process::exit(1);
}

fn main() {
    let matches = make_app().get_matches();

    let verbosity = match matches.value_of("verbose") {
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    };
    let _ = TermLogger::init(
        verbosity,
        ConfigBuilder::new()
            .set_location_level(LevelFilter::Off)
            .set_time_level(LevelFilter::Off)
            .set_thread_level(LevelFilter::Off)
            .set_target_level(LevelFilter::Off)
            .set_level_color(Level::Trace, None)
            .build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    panic::set_hook(Box::new(|panic_info| {
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .or_else(|| panic_info.payload().downcast_ref::<&str>().copied())
            .unwrap_or("<cause unknown>");
        error!("Panic - {}", cause);
    }));

    let Some(pid) = matches.value_of("pid").and_then(|pid| pid.parse::<u32>().ok()) else {
        error!("<pid> must be a process id");
        process::exit(2);
    };
    let output = matches
        .value_of_os("output")
        .map(Path::new)
        .unwrap_or_else(|| Path::new("minidump.dmp"));
    let crashing_thread = parse_number(&matches, "crashing-thread")
        .and_then(|tid| u32::try_from(tid).ok())
        .unwrap_or(pid);

    let mut writer = MinidumpWriter::new(pid, crashing_thread);
    writer.set_max_stack_len(parse_number(&matches, "max-stack-len").unwrap_or(MAX_STACK_LEN));
    if let Some(limit) = parse_number(&matches, "size-limit") {
        writer.set_minidump_size_limit(limit);
    }

    match write(&mut writer, output) {
        Ok(()) => {}
        Err(WriteError::TargetVanished) => {
            eprintln!(
                "process {} exited during the capture; {} is incomplete",
                pid,
                output.display()
            );
            process::exit(1);
        }
        Err(e) => {
            eprintln!("failed to write {}: {}", output.display(), e);
            process::exit(1);
        }
    }
    for gap in writer.gaps() {
        eprintln!("note: {} bytes at {:#x} could not be read", gap.len, gap.start);
    }
}
