use crate::{*, error::*};
use regex::Regex;
use std::collections::HashMap;

// The symbol table is produced by the binary loader, which is not this
// crate's business; the server only needs these three lookups.
pub trait SymbolSource {
    // Entry PC of the function with this exact (mangled) name.
    fn function_pc(&self, name: &str) -> Result<u64>;
    // Name of the function containing this PC.
    fn function_at(&self, pc: u64) -> Result<String>;
    // All function names matching the regex, in address order.
    fn functions_matching(&self, re: &Regex) -> Vec<String>;
}

// A flat name<->address table, enough for tests and for loaders that hand us
// a plain symbol list.
pub struct FlatSymbolTable {
    by_addr: Vec<(u64, String)>, // sorted by address
    by_name: HashMap<String, u64>,
}

impl FlatSymbolTable {
    pub fn new() -> Self {
        FlatSymbolTable {by_addr: Vec::new(), by_name: HashMap::new()}
    }

    pub fn insert(&mut self, name: &str, pc: u64) {
        let idx = self.by_addr.partition_point(|(a, _)| *a < pc);
        self.by_addr.insert(idx, (pc, name.to_string()));
        self.by_name.insert(name.to_string(), pc);
    }
}

impl SymbolSource for FlatSymbolTable {
    fn function_pc(&self, name: &str) -> Result<u64> {
        match self.by_name.get(name) {
            Some(&pc) => Ok(pc),
            None => err!(MissingSymbols, "no function {:?}", name),
        }
    }

    fn function_at(&self, pc: u64) -> Result<String> {
        let idx = self.by_addr.partition_point(|(a, _)| *a <= pc);
        if idx == 0 {
            return err!(MissingSymbols, "no function at {:#x}", pc);
        }
        Ok(self.by_addr[idx - 1].1.clone())
    }

    fn functions_matching(&self, re: &Regex) -> Vec<String> {
        self.by_addr.iter().filter(|(_, n)| re.is_match(n)).map(|(_, n)| n.clone()).collect()
    }
}
