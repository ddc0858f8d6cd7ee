use crate::error::*;
use gimli::{DwAt, DwTag};

// Interface to the DWARF side of the world. Parsing .debug_* sections is the
// loader's job; the server consumes line lookups, the SP-offset table the Go
// toolchain emits in place of full CFI, and a flattened view of the function
// DIE covering a PC.

#[derive(Clone, Debug)]
pub enum DieValue {
    Bytes(Vec<u8>),
    Str(String),
    Addr(u64),
    Int(i64),
}

#[derive(Clone, Debug)]
pub struct DieField {
    pub attr: DwAt,
    pub value: DieValue,
}

#[derive(Clone, Debug)]
pub struct DieEntry {
    pub tag: DwTag,
    pub has_children: bool,
    pub fields: Vec<DieField>,
}

// The function DIE enclosing a PC: its entry address and its immediate
// children (formal parameters, variables, lexical blocks...).
#[derive(Clone, Debug)]
pub struct FunctionEntry {
    pub entry_pc: u64,
    pub children: Vec<DieEntry>,
}

pub trait DwarfData {
    fn pc_to_line(&self, pc: u64) -> Result<(String, u64)>;
    // Offset from SP to the canonical frame address for code at pc.
    fn pc_to_sp_offset(&self, pc: u64) -> Result<i64>;
    fn function_for_pc(&self, pc: u64) -> Result<FunctionEntry>;
}

// Decode the location expression attached to a formal parameter. The Go
// compiler only ever emits DW_OP_call_frame_cfa, optionally followed by
// DW_OP_consts <sleb128> DW_OP_plus; anything else decodes as offset 0.
pub fn eval_location(v: &[u8]) -> i64 {
    if v.is_empty() || v[0] != gimli::DW_OP_call_frame_cfa.0 {
        return 0;
    }
    let v = &v[1..];
    if v.is_empty() || v[0] != gimli::DW_OP_consts.0 {
        return 0;
    }
    let (offset, consumed) = sleb128(&v[1..]);
    if v.get(1 + consumed) != Some(&gimli::DW_OP_plus.0) {
        return 0;
    }
    offset
}

// Returns the decoded value and the number of bytes consumed.
fn sleb128(buf: &[u8]) -> (i64, usize) {
    let mut result = 0i64;
    let mut shift = 0u32;
    let mut consumed = 0;
    for &b in buf {
        if shift >= 64 {
            break;
        }
        consumed += 1;
        result |= ((b & 0x7f) as i64) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            if shift < 64 && b & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            break;
        }
    }
    (result, consumed)
}

#[cfg(test)]
mod tests {
    use crate::dwarf::*;

    #[test]
    fn location_shapes() {
        // Bare CFA: offset 0.
        assert_eq!(eval_location(&[0x9c]), 0);
        // CFA + consts 8 + plus.
        assert_eq!(eval_location(&[0x9c, 0x11, 0x08, 0x22]), 8);
        // CFA + consts -1 + plus.
        assert_eq!(eval_location(&[0x9c, 0x11, 0x7f, 0x22]), -1);
        // Multi-byte sleb: 200 = 0xc8, 0x01.
        assert_eq!(eval_location(&[0x9c, 0x11, 0xc8, 0x01, 0x22]), 200);
        // Not CFA-based: decodes as 0.
        assert_eq!(eval_location(&[0x91, 0x10]), 0);
        assert_eq!(eval_location(&[]), 0);
        // The trailing plus is part of the shape: missing or replaced, the
        // whole expression decodes as 0.
        assert_eq!(eval_location(&[0x9c, 0x11, 0x08]), 0);
        assert_eq!(eval_location(&[0x9c, 0x11, 0x08, 0x99]), 0);
        assert_eq!(eval_location(&[0x9c, 0x11, 0xc8, 0x01]), 0);
    }
}
