//! Evaluation of Breakpad `STACK CFI` unwinding rules.
//!
//! A `STACK CFI INIT` record covers an address range and gives the rules
//! for recovering the caller's registers at its first address. `STACK CFI`
//! records that follow it update some of those rules from their address
//! onward. The rules in effect at an address are the INIT rules with every
//! applicable update applied in order, later rules for a register replacing
//! earlier ones.
//!
//! Rules have the form `REG: EXPR REG: EXPR ...`:
//!
//! * `.cfa` is the canonical frame address, the caller's stack pointer
//!   before the call. It is evaluated first and can't refer to itself.
//! * `.ra` is the return address, the caller's instruction pointer.
//! * `$name` (or a bare `name`) is a general purpose register of the caller.
//!
//! `.cfa` and `.ra` must both have rules.
//!
//! Expressions are postfix. `$name` reads a register from the callee's
//! frame, `.cfa` reads the value computed above, integers are signed
//! decimal. The operators are `+ - * / %`, `@` (align the left operand down
//! to a multiple of the right one) and `^` (read a pointer from memory).
//! `.undef` makes the register explicitly unknown.
//!
//! For example, on x86 a function that has pushed `%ebp` looks like:
//!
//! ```text
//! STACK CFI INIT 804c4b0 40 .cfa: $esp 4 + $eip: .cfa 4 - ^
//! STACK CFI 804c4b1 .cfa: $esp 8 + $ebp: .cfa 8 - ^
//! ```

use std::collections::HashMap;

use tracing::trace;

use super::CfiRules;
use crate::FrameWalker;

/// Why a set of CFI rules could not be evaluated.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CfiError {
    #[error("invalid register name {0:?}")]
    BadRegister(String),
    #[error("rule for {0} has no expression")]
    EmptyExpression(String),
    #[error("no rule for .cfa")]
    MissingCfa,
    #[error("no rule for .ra")]
    MissingRa,
    #[error("division by zero")]
    DivisionByZero,
    #[error("register {0} is undefined")]
    UndefinedRegister(String),
    #[error("value is explicitly undefined")]
    Undefined,
    #[error("couldn't read memory at {0:#x}")]
    UnreadableMemory(u64),
    #[error("unknown token {0:?}")]
    UnknownToken(String),
    #[error("not enough operands")]
    StackUnderflow,
    #[error("expression left {0} values on the stack")]
    Unbalanced(usize),
    #[error("the caller's {0} was rejected")]
    Rejected(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CfiReg<'a> {
    Cfa,
    Ra,
    Other(&'a str),
}

/// Recover the caller's registers using `init` and the `additional` rules
/// in effect at the walker's instruction.
///
/// Results are written with the walker's `set_*` methods. Failing to
/// recover a general purpose register is not an error, that register is
/// just left unknown in the caller.
pub fn walk_with_stack_cfi(
    init: &CfiRules,
    additional: &[CfiRules],
    walker: &mut dyn FrameWalker,
) -> Result<(), CfiError> {
    trace!("unwind: using STACK CFI {}", init.rules);

    let mut exprs = HashMap::new();
    parse_cfi_rules(&init.rules, &mut exprs)?;
    for line in additional {
        trace!("unwind:   + {}", line.rules);
        parse_cfi_rules(&line.rules, &mut exprs)?;
    }

    let cfa_expr = exprs.remove(&CfiReg::Cfa).ok_or(CfiError::MissingCfa)?;
    let ra_expr = exprs.remove(&CfiReg::Ra).ok_or(CfiError::MissingRa)?;

    let cfa = eval_cfi_expr(&cfa_expr, walker, None)?;
    let ra = eval_cfi_expr(&ra_expr, walker, Some(cfa))?;
    trace!("unwind: cfa = {:#x}, ra = {:#x}", cfa, ra);

    walker.set_cfa(cfa).ok_or(CfiError::Rejected(".cfa"))?;
    walker.set_ra(ra).ok_or(CfiError::Rejected(".ra"))?;

    for (reg, expr) in exprs {
        let CfiReg::Other(name) = reg else { continue };
        match eval_cfi_expr(&expr, walker, Some(cfa)) {
            Ok(val) => {
                if walker.set_caller_register(name, val).is_none() {
                    trace!("unwind: walker doesn't know register {}", name);
                }
            }
            Err(err) => {
                trace!("unwind: couldn't recover {}: {}", name, err);
                walker.clear_caller_register(name);
            }
        }
    }

    Ok(())
}

/// Split `REG: EXPR REG: EXPR ...` into `output`, replacing earlier rules.
fn parse_cfi_rules<'a>(
    input: &'a str,
    output: &mut HashMap<CfiReg<'a>, Vec<&'a str>>,
) -> Result<(), CfiError> {
    let mut current: Option<(CfiReg<'a>, Vec<&'a str>)> = None;

    let mut commit = |rule: Option<(CfiReg<'a>, Vec<&'a str>)>| match rule {
        Some((reg, tokens)) if tokens.is_empty() => Err(CfiError::EmptyExpression(format!(
            "{reg:?}"
        ))),
        Some((reg, tokens)) => {
            output.insert(reg, tokens);
            Ok(())
        }
        None => Ok(()),
    };

    for token in input.split_ascii_whitespace() {
        if let Some(name) = token.strip_suffix(':') {
            commit(current.take())?;
            let reg = match name {
                ".cfa" => CfiReg::Cfa,
                ".ra" => CfiReg::Ra,
                _ => {
                    let name = name.strip_prefix('$').unwrap_or(name);
                    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric()) {
                        return Err(CfiError::BadRegister(token.to_string()));
                    }
                    CfiReg::Other(name)
                }
            };
            current = Some((reg, Vec::new()));
        } else {
            match current {
                Some((_, ref mut tokens)) => tokens.push(token),
                // An expression with no register to assign it to.
                None => return Err(CfiError::BadRegister(token.to_string())),
            }
        }
    }
    commit(current)
}

fn eval_cfi_expr(
    expr: &[&str],
    walker: &dyn FrameWalker,
    cfa: Option<u64>,
) -> Result<u64, CfiError> {
    let mut stack: Vec<u64> = Vec::new();
    let pop = |stack: &mut Vec<u64>| stack.pop().ok_or(CfiError::StackUnderflow);

    for &token in expr {
        match token {
            "+" | "-" | "*" | "/" | "%" | "@" => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                let val = match token {
                    "+" => lhs.wrapping_add(rhs),
                    "-" => lhs.wrapping_sub(rhs),
                    "*" => lhs.wrapping_mul(rhs),
                    _ if rhs == 0 => return Err(CfiError::DivisionByZero),
                    "/" => lhs / rhs,
                    "%" => lhs % rhs,
                    _ => (lhs / rhs).wrapping_mul(rhs),
                };
                stack.push(val);
            }
            "^" => {
                let ptr = pop(&mut stack)?;
                let val = walker
                    .get_register_at_address(ptr)
                    .ok_or(CfiError::UnreadableMemory(ptr))?;
                stack.push(val);
            }
            ".cfa" => {
                stack.push(cfa.ok_or_else(|| CfiError::UndefinedRegister(".cfa".into()))?);
            }
            ".undef" => return Err(CfiError::Undefined),
            _ => {
                if let Some(reg) = token.strip_prefix('$') {
                    let val = walker
                        .get_callee_register(reg)
                        .ok_or_else(|| CfiError::UndefinedRegister(reg.to_string()))?;
                    stack.push(val);
                } else if let Ok(val) = token.parse::<i64>() {
                    stack.push(val as u64);
                } else if let Some(val) = walker.get_callee_register(token) {
                    stack.push(val);
                } else {
                    return Err(CfiError::UnknownToken(token.to_string()));
                }
            }
        }
    }

    match stack.len() {
        1 => pop(&mut stack),
        n => Err(CfiError::Unbalanced(n)),
    }
}
