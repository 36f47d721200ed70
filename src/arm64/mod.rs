// This module holds the AArch64 specific parts of the back end. The register table mirrors
// the x86-64 one: X0-X17 are caller-saved with X0 as return register, X18 is the platform
// register and never allocated, X19-X28 are callee-saved, X29 is the frame pointer and X30
// the link register. XZR and SP share encoding 31 in hardware; they get distinct ids here so
// that the zero register can appear as an operand of folded stores. V0-V31 form the media
// bank with V8-V15 callee-saved (the low 64 bits, which is all decimals use).

//! AArch64 architecture-specific components.

pub mod calling_convention;

pub use calling_convention::Aapcs64Assigner;

use crate::core::register_file::{AsmReg, Register, RegisterFile, RegisterFlags};

pub const X0: AsmReg = AsmReg::standard(0);
pub const X18: AsmReg = AsmReg::standard(18);
pub const FP: AsmReg = AsmReg::standard(29);
pub const LR: AsmReg = AsmReg::standard(30);
pub const XZR: AsmReg = AsmReg::standard(31);
pub const SP: AsmReg = AsmReg::standard(32);

const X_NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30",
];

const W_NAMES: [&str; 31] = [
    "w0", "w1", "w2", "w3", "w4", "w5", "w6", "w7", "w8", "w9", "w10", "w11", "w12", "w13", "w14",
    "w15", "w16", "w17", "w18", "w19", "w20", "w21", "w22", "w23", "w24", "w25", "w26", "w27",
    "w28", "w29", "w30",
];

const D_NAMES: [&str; 32] = [
    "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "d8", "d9", "d10", "d11", "d12", "d13", "d14",
    "d15", "d16", "d17", "d18", "d19", "d20", "d21", "d22", "d23", "d24", "d25", "d26", "d27",
    "d28", "d29", "d30", "d31",
];

/// Register pool of one AArch64 function.
pub fn register_file() -> RegisterFile {
    use RegisterFlags as F;

    let mut registers = Vec::with_capacity(65);
    for id in 0..31u8 {
        let flags = match id {
            0 => F::VOLATILE | F::RETURN,
            1..=17 => F::VOLATILE,
            18 => F::RESERVED,
            19..=28 => F::NONE,
            29 => F::RESERVED | F::BASE_POINTER,
            _ => F::RESERVED | F::RETURN_ADDRESS,
        };
        let (x, w) = (X_NAMES[id as usize], W_NAMES[id as usize]);
        registers.push(Register::new(AsmReg::standard(id), [x, w, w, w], flags));
    }
    registers.push(Register::new(XZR, ["xzr", "wzr", "wzr", "wzr"], F::ZERO | F::RESERVED));
    registers.push(Register::new(SP, ["sp", "wsp", "wsp", "wsp"], F::STACK_POINTER | F::RESERVED));

    for (id, &name) in D_NAMES.iter().enumerate() {
        let mut flags = F::MEDIA;
        if !(8..=15).contains(&id) {
            flags = flags | F::VOLATILE;
        }
        if id == 0 {
            flags = flags | F::DECIMAL_RETURN;
        }
        registers.push(Register::new(AsmReg::media(id as u8), [name; 4], flags));
    }

    RegisterFile::new(registers)
}
