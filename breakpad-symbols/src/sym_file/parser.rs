// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::collections::HashMap;
use std::str;

use debugid::DebugId;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::combinator::{all_consuming, map, map_res, opt, rest, verify};
use nom::multi::many1;
use nom::sequence::{preceded, separated_pair, tuple};
use nom::IResult;
use range_map::{Range, RangeMap};
use tracing::{trace, warn};

use minidump_common::traits::IntoRangeMapSafe;

use crate::sym_file::types::*;
use crate::SymbolError;

#[derive(Debug)]
enum Info {
    Url(String),
    Unknown,
}

#[derive(Debug)]
enum Line {
    Module(ModuleInfo),
    Info(Info),
    File(u32, String),
    InlineOrigin(u32, String),
    Public(PublicSymbol),
    Function(Function, Vec<SourceLine>, Vec<Inlinee>),
    StackWin,
    StackCfi(StackInfoCfi),
}

// Match a hex string, parse it to a u64.
fn hex_str_u64(input: &str) -> IResult<&str, u64> {
    map_res(hex_digit1, |s| u64::from_str_radix(s, 16))(input)
}

// Match a hex string, parse it to a u32.
fn hex_str_u32(input: &str) -> IResult<&str, u32> {
    map_res(hex_digit1, |s| u32::from_str_radix(s, 16))(input)
}

// Match a decimal string, parse it to a u32.
fn decimal_u32(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>)(input)
}

// A run of non-whitespace.
fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(input)
}

// The rest of the line, which must not be empty.
fn non_empty_rest(input: &str) -> IResult<&str, &str> {
    verify(rest, |s: &str| !s.is_empty())(input)
}

// An optional trailing name. Some toolchains emit nameless symbols.
fn trailing_name(input: &str) -> IResult<&str, String> {
    map(opt(preceded(space1, rest)), |name: Option<&str>| {
        name.unwrap_or_default().to_string()
    })(input)
}

// The `m` marker on FUNC and PUBLIC records, meaning "multiple symbols
// folded to this address". We don't care about it beyond accepting it.
fn multiple_marker(input: &str) -> IResult<&str, Option<&str>> {
    opt(preceded(space1, tag("m")))(input)
}

// Matches a MODULE record.
fn module_line(input: &str) -> IResult<&str, ModuleInfo> {
    let (input, (_, _, os, _, cpu, _, debug_id, _, name)) = tuple((
        tag("MODULE"),
        space1,
        token,
        space1,
        token,
        space1,
        map_res(hex_digit1, DebugId::from_breakpad),
        space1,
        non_empty_rest,
    ))(input)?;
    Ok((
        input,
        ModuleInfo {
            os: os.to_string(),
            cpu: cpu.to_string(),
            debug_id,
            name: name.to_string(),
        },
    ))
}

// Matches INFO records, only INFO URL is interesting.
fn info_line(input: &str) -> IResult<&str, Info> {
    alt((
        map(
            preceded(tag("INFO URL"), preceded(space1, non_empty_rest)),
            |url| Info::Url(url.to_string()),
        ),
        map(preceded(tag("INFO"), opt(preceded(space1, rest))), |_| {
            Info::Unknown
        }),
    ))(input)
}

// Matches a FILE record.
fn file_line(input: &str) -> IResult<&str, (u32, String)> {
    let (input, (_, _, id, _, filename)) =
        tuple((tag("FILE"), space1, decimal_u32, space1, non_empty_rest))(input)?;
    Ok((input, (id, filename.to_string())))
}

// Matches an INLINE_ORIGIN record.
fn inline_origin_line(input: &str) -> IResult<&str, (u32, String)> {
    let (input, (_, _, id, _, name)) = tuple((
        tag("INLINE_ORIGIN"),
        space1,
        decimal_u32,
        space1,
        non_empty_rest,
    ))(input)?;
    Ok((input, (id, name.to_string())))
}

// Matches a PUBLIC record.
fn public_line(input: &str) -> IResult<&str, PublicSymbol> {
    let (input, (_, _, _, address, _, parameter_size, name)) = tuple((
        tag("PUBLIC"),
        multiple_marker,
        space1,
        hex_str_u64,
        space1,
        hex_str_u32,
        trailing_name,
    ))(input)?;
    Ok((
        input,
        PublicSymbol {
            address,
            parameter_size,
            name,
        },
    ))
}

// Matches a FUNC record.
fn func_line(input: &str) -> IResult<&str, Function> {
    let (input, (_, _, _, address, _, size, _, parameter_size, name)) = tuple((
        tag("FUNC"),
        multiple_marker,
        space1,
        hex_str_u64,
        space1,
        hex_str_u32,
        space1,
        hex_str_u32,
        trailing_name,
    ))(input)?;
    Ok((
        input,
        Function {
            address,
            size,
            parameter_size,
            name,
            lines: RangeMap::new(),
            inlinees: Vec::new(),
        },
    ))
}

// Matches line data after a FUNC record.
fn func_line_data(input: &str) -> IResult<&str, SourceLine> {
    let (input, (address, _, size, _, line, _, file)) = tuple((
        hex_str_u64,
        space1,
        hex_str_u32,
        space1,
        decimal_u32,
        space1,
        decimal_u32,
    ))(input)?;
    Ok((
        input,
        SourceLine {
            address,
            size,
            file,
            line,
        },
    ))
}

// Matches an INLINE record, which also follows a FUNC record.
//
// INLINE <depth> <call line> <call file> <origin id> [<address> <size>]+
fn inline_line(input: &str) -> IResult<&str, Vec<Inlinee>> {
    let (input, (_, _, depth, _, call_line, _, call_file, _, origin_id, ranges)) = tuple((
        tag("INLINE"),
        space1,
        decimal_u32,
        space1,
        decimal_u32,
        space1,
        decimal_u32,
        space1,
        decimal_u32,
        many1(preceded(
            space1,
            separated_pair(hex_str_u64, space1, hex_str_u32),
        )),
    ))(input)?;
    let inlinees = ranges
        .into_iter()
        .map(|(address, size)| Inlinee {
            depth,
            address,
            size,
            call_file,
            call_line,
            origin_id,
        })
        .collect();
    Ok((input, inlinees))
}

// Matches a STACK WIN record. Windows x86 frame data is not used for
// unwinding, the record is accepted so it doesn't count as malformed.
fn stack_win_line(input: &str) -> IResult<&str, ()> {
    map(preceded(tag("STACK WIN"), preceded(space1, rest)), |_| ())(input)
}

// Matches a STACK CFI INIT record.
fn stack_cfi_init(input: &str) -> IResult<&str, StackInfoCfi> {
    let (input, (_, _, address, _, size, _, rules)) = tuple((
        tag("STACK CFI INIT"),
        space1,
        hex_str_u64,
        space1,
        hex_str_u32,
        space1,
        non_empty_rest,
    ))(input)?;
    Ok((
        input,
        StackInfoCfi {
            init: CfiRules {
                address,
                rules: rules.to_string(),
            },
            size,
            add_rules: Vec::new(),
        },
    ))
}

// Matches a STACK CFI record.
fn stack_cfi(input: &str) -> IResult<&str, CfiRules> {
    let (input, (_, _, address, _, rules)) = tuple((
        tag("STACK CFI"),
        space1,
        hex_str_u64,
        space1,
        non_empty_rest,
    ))(input)?;
    Ok((
        input,
        CfiRules {
            address,
            rules: rules.to_string(),
        },
    ))
}

// Parse any of the line data that can occur at the top level of a symbol file.
fn line(input: &str) -> IResult<&str, Line> {
    alt((
        map(info_line, Line::Info),
        map(file_line, |(id, name)| Line::File(id, name)),
        map(inline_origin_line, |(id, name)| Line::InlineOrigin(id, name)),
        map(public_line, Line::Public),
        map(func_line, |f| Line::Function(f, Vec::new(), Vec::new())),
        map(stack_win_line, |_| Line::StackWin),
        map(stack_cfi_init, Line::StackCfi),
        map(module_line, Line::Module),
    ))(input)
}

/// A parser for SymbolFiles.
///
/// Feed it one line at a time with [`parse_line`][SymbolParser::parse_line]
/// and call [`finish`][SymbolParser::finish] at the end. Lines that don't
/// parse are logged, counted and otherwise ignored.
#[derive(Debug, Default)]
pub struct SymbolParser {
    module: Option<ModuleInfo>,
    files: HashMap<u32, String>,
    inline_origins: HashMap<u32, String>,
    publics: Vec<PublicSymbol>,
    functions: Vec<(Option<Range<u64>>, Function)>,
    cfi_stack_info: Vec<(Option<Range<u64>>, StackInfoCfi)>,
    url: Option<String>,
    /// Lines seen so far, for diagnostics.
    pub lines: u64,
    /// Lines that were skipped because they didn't parse.
    pub skipped_lines: u64,
    records: u64,
    cur_item: Option<Line>,
}

impl SymbolParser {
    /// Creates a new SymbolParser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line of raw input. Invalid UTF-8 makes the line malformed.
    pub fn parse_line_bytes(&mut self, input: &[u8]) {
        match str::from_utf8(input) {
            Ok(text) => self.parse_line(text),
            Err(_) => {
                self.lines += 1;
                self.skip_line("<invalid utf-8>");
            }
        }
    }

    /// Parse one line of input, without its trailing newline.
    pub fn parse_line(&mut self, input: &str) {
        self.lines += 1;
        let input = input.trim_end_matches('\r');
        if input.trim().is_empty() {
            return;
        }

        // First check if we're currently processing sublines of a
        // multi-line item like `FUNC` and `STACK CFI INIT`. If the line
        // doesn't fit, the item is complete and the line goes to the
        // top-level parser.
        match self.cur_item.take() {
            Some(Line::Function(cur, mut lines, mut inlinees)) => {
                if let Ok((_, line)) = all_consuming(func_line_data)(input) {
                    lines.push(line);
                    self.cur_item = Some(Line::Function(cur, lines, inlinees));
                    return;
                }
                if let Ok((_, mut new_inlinees)) = all_consuming(inline_line)(input) {
                    inlinees.append(&mut new_inlinees);
                    self.cur_item = Some(Line::Function(cur, lines, inlinees));
                    return;
                }
                self.finish_item(Line::Function(cur, lines, inlinees));
            }
            Some(Line::StackCfi(mut cur)) => {
                if let Ok((_, rules)) = all_consuming(stack_cfi)(input) {
                    cur.add_rules.push(rules);
                    self.cur_item = Some(Line::StackCfi(cur));
                    return;
                }
                self.finish_item(Line::StackCfi(cur));
            }
            _ => {}
        }

        let line = match all_consuming(line)(input) {
            Ok((_, line)) => line,
            Err(_) => {
                self.skip_line(input);
                return;
            }
        };

        match line {
            Line::Module(module) => {
                // MODULE must be the first record of the file.
                if self.records != 0 {
                    warn!(
                        "MODULE record found after the start of the file, line {}",
                        self.lines
                    );
                    self.skipped_lines += 1;
                    return;
                }
                self.module = Some(module);
            }
            Line::Info(Info::Url(url)) => {
                self.url = Some(url);
            }
            Line::Info(Info::Unknown) => {}
            Line::File(id, filename) => {
                self.files.insert(id, filename);
            }
            Line::InlineOrigin(id, name) => {
                self.inline_origins.insert(id, name);
            }
            Line::Public(p) => {
                self.publics.push(p);
            }
            Line::StackWin => {}
            item @ (Line::Function(..) | Line::StackCfi(_)) => {
                // More sublines to parse
                self.cur_item = Some(item);
            }
        }
        self.records += 1;
    }

    fn skip_line(&mut self, input: &str) {
        warn!("skipped malformed line {}: {:?}", self.lines, input);
        self.skipped_lines += 1;
    }

    /// Finish processing an item (cur_item) which had sublines.
    fn finish_item(&mut self, item: Line) {
        match item {
            Line::Function(mut cur, lines, mut inlinees) => {
                // Line data from PDB files often has zero-size entries, those
                // have no range and are dropped here.
                cur.lines = lines
                    .into_iter()
                    .map(|line| (line.memory_range(), line))
                    .into_rangemap_safe();
                inlinees.sort();
                cur.inlinees = inlinees;
                trace!("parsed FUNC {} at {:#x}", cur.name, cur.address);
                self.functions.push((cur.memory_range(), cur));
            }
            Line::StackCfi(mut cur) => {
                cur.add_rules.sort();
                self.cfi_stack_info.push((cur.memory_range(), cur));
            }
            other => {
                warn!("unexpected multi-line item {:?}", other);
            }
        }
    }

    /// Finish the parse and create the final SymbolFile.
    ///
    /// Fails if the input never had a usable `MODULE` record.
    pub fn finish(mut self) -> Result<SymbolFile, SymbolError> {
        if let Some(item) = self.cur_item.take() {
            self.finish_item(item);
        }

        let module = self
            .module
            .ok_or(SymbolError::MalformedFile("missing MODULE record"))?;

        self.publics.sort();

        Ok(SymbolFile {
            module,
            files: self.files,
            inline_origins: self.inline_origins,
            publics: self.publics,
            functions: self.functions.into_rangemap_safe(),
            cfi_stack_info: self.cfi_stack_info.into_rangemap_safe(),
            url: self.url,
            skipped_lines: self.skipped_lines,
        })
    }
}

/// Parse a whole symbol file held in memory.
pub fn parse_symbol_bytes(data: &[u8]) -> Result<SymbolFile, SymbolError> {
    let mut parser = SymbolParser::new();
    for line in data.split(|&b| b == b'\n') {
        parser.parse_line_bytes(line);
    }
    parser.finish()
}
