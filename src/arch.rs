// Target architecture descriptions. The debug server only needs the handful of
// facts that differ between targets: pointer width, and the instruction pattern
// patched in for software breakpoints.

pub const MAX_BREAKPOINT_SIZE: usize = 4;

#[derive(Clone, Copy)]
pub struct Arch {
    pub pointer_size: usize,
    pub breakpoint_size: usize,
    pub breakpoint_instr: [u8; MAX_BREAKPOINT_SIZE],
}

// int3
pub const AMD64: Arch = Arch {pointer_size: 8, breakpoint_size: 1, breakpoint_instr: [0xcc, 0, 0, 0]};
pub const X86: Arch = Arch {pointer_size: 4, breakpoint_size: 1, breakpoint_instr: [0xcc, 0, 0, 0]};
// BKPT; actually the permanently-undefined instruction, which older kernels trap more reliably.
pub const ARM: Arch = Arch {pointer_size: 4, breakpoint_size: 4, breakpoint_instr: [0xfe, 0xde, 0xff, 0xe7]};

impl Arch {
    pub fn breakpoint_bytes(&self) -> &[u8] {
        &self.breakpoint_instr[..self.breakpoint_size]
    }

    // Decode a little-endian pointer-sized value read from target memory.
    pub fn uintptr(&self, buf: &[u8]) -> u64 {
        assert!(buf.len() >= self.pointer_size);
        let mut v = 0u64;
        for i in (0..self.pointer_size).rev() {
            v = v << 8 | buf[i] as u64;
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use crate::arch::*;

    #[test]
    fn uintptr_decoding() {
        assert_eq!(AMD64.uintptr(&[0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]), 0x12345678);
        assert_eq!(X86.uintptr(&[0x78, 0x56, 0x34, 0x12]), 0x12345678);
        assert_eq!(AMD64.uintptr(&[0xff; 8]), u64::MAX);
    }

    #[test]
    fn breakpoint_bytes_length() {
        assert_eq!(AMD64.breakpoint_bytes(), &[0xcc]);
        assert_eq!(ARM.breakpoint_bytes().len(), 4);
        assert!(AMD64.breakpoint_size <= MAX_BREAKPOINT_SIZE);
        assert!(ARM.breakpoint_size <= MAX_BREAKPOINT_SIZE);
    }
}
