// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::boxed::Box;
use std::fs::File;
use std::io::{self, Write};
use std::ops::Deref;
use std::panic;
use std::path::{Path, PathBuf};
use std::process;

use minidump::Minidump;
use minidump_processor::{ProcessorOptions, SimpleSymbolSupplier, Symbolizer};

use clap::{AppSettings, Arg, Command};
use log::error;
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

fn make_app() -> Command<'static> {
    Command::new("minidump-stackwalk")
        .version(clap::crate_version!())
        .about("Analyzes minidumps and produces a human-readable report.")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .override_usage("minidump-stackwalk [FLAGS] [OPTIONS] <minidump> [--] [symbols-path]...")
        .arg(Arg::new("brief").long("brief").help(
            "Provide a briefer report.

Only provides the top-level summary and a backtrace of the crashing thread.",
        ))
        .arg(
            Arg::new("max-frames")
                .long("max-frames")
                .takes_value(true)
                .help("The most frames to unwind for any one thread"),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .long_help(
                    "Set the logging level.

The unwinder is instrumented with `trace` logging, so if you want to debug why \
an unwind happened the way it did, --verbose=trace is very useful (all unwinder logging will \
be prefixed with `unwind:`).",
                ),
        )
        .arg(
            Arg::new("minidump")
                .required(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to the minidump file to analyze."),
        )
        .arg(
            Arg::new("symbols-path")
                .multiple_values(true)
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "Path to a directory of symbol files.

Symbol files are looked up as <symbols-path>/<debug file>/<debug id>/<debug file>.sym. \
If multiple paths are provided, they are searched in order.",
                ),
        )
        .after_help(
            "
NOTES:

  Symbols fill in function names and source lines for each frame, and their \
call frame information (CFI) makes the backtraces more accurate. Only Breakpad \
text symbol files are supported.
",
        )
}

fn init_logging(verbosity: LevelFilter, log_file: Option<&Path>) -> io::Result<()> {
    let config = ConfigBuilder::new()
        .set_location_level(LevelFilter::Off)
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_level_color(Level::Trace, None)
        .build();
    if let Some(log_path) = log_file {
        let _ = WriteLogger::init(verbosity, config, File::create(log_path)?);
    } else {
        let _ = TermLogger::init(verbosity, config, TerminalMode::Stderr, ColorChoice::Auto);
    }
    Ok(())
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("minidump-stackwalk: {}", message);
    process::exit(1);
}

#[cfg_attr(test, allow(dead_code))]
fn main() {
    let matches = make_app().get_matches();

    let output_file = matches.value_of_os("output-file").map(PathBuf::from);
    let log_file = matches.value_of_os("log-file").map(PathBuf::from);

    let verbosity = match matches.value_of("verbose") {
        Some("off") => LevelFilter::Off,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };
    if let Err(e) = init_logging(verbosity, log_file.as_deref()) {
        fail(format!("can't create the log file: {}", e));
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    let mut options = ProcessorOptions::default();
    if let Some(max_frames) = matches.value_of("max-frames") {
        match max_frames.parse::<usize>() {
            Ok(n) if n > 0 => options.max_frames = n,
            _ => fail(format!(
                "--max-frames expects a positive number, got {:?}",
                max_frames
            )),
        }
    }

    let symbols_paths = matches
        .values_of_os("symbols-path")
        .map(|v| v.map(PathBuf::from).collect::<Vec<_>>())
        .unwrap_or_default();
    let brief = matches.is_present("brief");

    let Some(minidump_path) = matches.value_of_os("minidump").map(Path::new) else {
        fail("no minidump given");
    };

    let dump = match Minidump::read_path(minidump_path) {
        Ok(dump) => dump,
        Err(err) => fail(format!("{} - Error reading dump: {}", err.name(), err)),
    };
    let provider = Symbolizer::new(SimpleSymbolSupplier::new(symbols_paths));
    let state =
        match minidump_processor::process_minidump_with_options(&dump, &provider, options) {
            Ok(state) => state,
            Err(err) => fail(format!("{} - Error processing dump: {}", err.name(), err)),
        };

    let mut stdout;
    let mut output_f;
    let mut output: &mut dyn Write = if let Some(output_path) = output_file {
        output_f = match File::create(&output_path) {
            Ok(f) => f,
            Err(e) => fail(format!("can't create {}: {}", output_path.display(), e)),
        };
        &mut output_f
    } else {
        stdout = io::stdout();
        &mut stdout
    };

    let printed = if brief {
        state.print_brief(&mut output)
    } else {
        state.print(&mut output)
    };
    if let Err(e) = printed.and_then(|()| output.flush()) {
        fail(format!("can't write the report: {}", e));
    }
}
