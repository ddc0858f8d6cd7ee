use crate::{*, error::*, dwarf::*, symbols::*};
use regex::Regex;

// Expression evaluation for the debug protocol. Deliberately small: a prefix
// picks the lookup, everything else is an error.
//
//   re:REGEX   all symbol names matching REGEX
//   addr:SYM   hex entry address of function SYM
//   val:EXPR   EXPR formatted by the printer
//   src:ADDR   file:line for the numeric address ADDR
//   <number>   name of the function containing that address

// Value formatting belongs to the printer, which needs the process image and
// type information we don't keep here.
pub trait Printer {
    fn sprint(&self, expr: &str) -> Result<String>;
    fn sprint_entry(&self, entry: &DieEntry, addr: u64) -> Result<String>;
}

pub fn eval(symbols: &dyn SymbolSource, dwarf: &dyn DwarfData, printer: &dyn Printer, expr: &str) -> Result<Vec<String>> {
    if let Some(rest) = expr.strip_prefix("re:") {
        let re = match Regex::new(rest) {
            Ok(re) => re,
            Err(e) => return err!(Syntax, "{}", e),
        };
        return Ok(symbols.functions_matching(&re));
    }
    if let Some(rest) = expr.strip_prefix("addr:") {
        let addr = symbols.function_pc(rest)?;
        return Ok(vec![format!("{:#x}", addr)]);
    }
    if let Some(rest) = expr.strip_prefix("val:") {
        let value = printer.sprint(rest)?;
        return Ok(vec![value]);
    }
    if let Some(rest) = expr.strip_prefix("src:") {
        let addr = parse_address(rest)?;
        let (file, line) = dwarf.pc_to_line(addr)?;
        return Ok(vec![format!("{}:{}", file, line)]);
    }
    if expr.as_bytes().first().is_some_and(|c| c.is_ascii_digit()) {
        let addr = parse_address(expr)?;
        let name = symbols.function_at(addr)?;
        return Ok(vec![name]);
    }
    err!(Syntax, "bad expression syntax: {:?}", expr)
}

// A simple expression that must denote one address: a symbol, or failing
// that a base-prefixed integer.
pub fn eval_address(symbols: &dyn SymbolSource, expr: &str) -> Result<u64> {
    if let Ok(pc) = symbols.function_pc(expr) {
        return Ok(pc);
    }
    match parse_address(expr) {
        Ok(addr) => Ok(addr),
        Err(_) => err!(Usage, "eval: {:?} is neither symbol nor number", expr),
    }
}

// Integer with optional base prefix: 0x/0X hex, 0b/0B binary, 0o/0O or a
// leading 0 octal, otherwise decimal.
pub fn parse_address(s: &str) -> Result<u64> {
    let (digits, radix) = if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (h, 16)
    } else if let Some(b) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        (b, 2)
    } else if let Some(o) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        (o, 8)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    Ok(u64::from_str_radix(digits, radix)?)
}
