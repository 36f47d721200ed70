// This module holds the x86-64 specific parts of the back end: the physical register table
// with its classification and the System V calling convention. The register table order is
// the allocation preference order used by the register pool. RSP and RBP are reserved as the
// stack and frame pointer; RAX doubles as return and numerator register, RDX as remainder
// register and RCX as the shift count register, which the instruction builders consult when
// they need a specific register.

//! x86-64 architecture-specific components.

pub mod calling_convention;

pub use calling_convention::SysVAssigner;

use crate::core::register_file::{AsmReg, Register, RegisterFile, RegisterFlags};

pub const RAX: AsmReg = AsmReg::standard(0);
pub const RCX: AsmReg = AsmReg::standard(1);
pub const RDX: AsmReg = AsmReg::standard(2);
pub const RBX: AsmReg = AsmReg::standard(3);
pub const RSP: AsmReg = AsmReg::standard(4);
pub const RBP: AsmReg = AsmReg::standard(5);
pub const RSI: AsmReg = AsmReg::standard(6);
pub const RDI: AsmReg = AsmReg::standard(7);
pub const R8: AsmReg = AsmReg::standard(8);
pub const R9: AsmReg = AsmReg::standard(9);
pub const R10: AsmReg = AsmReg::standard(10);
pub const R11: AsmReg = AsmReg::standard(11);
pub const R12: AsmReg = AsmReg::standard(12);
pub const R13: AsmReg = AsmReg::standard(13);
pub const R14: AsmReg = AsmReg::standard(14);
pub const R15: AsmReg = AsmReg::standard(15);

const XMM_NAMES: [&str; 16] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

/// Register pool of one x86-64 function.
pub fn register_file() -> RegisterFile {
    use RegisterFlags as F;

    let mut registers = vec![
        Register::new(RAX, ["rax", "eax", "ax", "al"], F::VOLATILE | F::RETURN | F::NUMERATOR),
        Register::new(RBX, ["rbx", "ebx", "bx", "bl"], F::NONE),
        Register::new(RCX, ["rcx", "ecx", "cx", "cl"], F::VOLATILE | F::SHIFT),
        Register::new(RDX, ["rdx", "edx", "dx", "dl"], F::VOLATILE | F::REMAINDER),
        Register::new(RSI, ["rsi", "esi", "si", "sil"], F::VOLATILE),
        Register::new(RDI, ["rdi", "edi", "di", "dil"], F::VOLATILE),
        Register::new(RBP, ["rbp", "ebp", "bp", "bpl"], F::RESERVED | F::BASE_POINTER),
        Register::new(RSP, ["rsp", "esp", "sp", "spl"], F::RESERVED | F::STACK_POINTER),
    ];

    for (id, &name) in XMM_NAMES.iter().enumerate() {
        let mut flags = F::MEDIA | F::VOLATILE;
        if id == 0 {
            flags = flags | F::DECIMAL_RETURN;
        }
        registers.push(Register::new(AsmReg::media(id as u8), [name; 4], flags));
    }

    let extended = [
        (R8, ["r8", "r8d", "r8w", "r8b"], F::VOLATILE),
        (R9, ["r9", "r9d", "r9w", "r9b"], F::VOLATILE),
        (R10, ["r10", "r10d", "r10w", "r10b"], F::VOLATILE),
        (R11, ["r11", "r11d", "r11w", "r11b"], F::VOLATILE),
        (R12, ["r12", "r12d", "r12w", "r12b"], F::NONE),
        (R13, ["r13", "r13d", "r13w", "r13b"], F::NONE),
        (R14, ["r14", "r14d", "r14w", "r14b"], F::NONE),
        (R15, ["r15", "r15d", "r15w", "r15b"], F::NONE),
    ];
    registers.extend(
        extended
            .into_iter()
            .map(|(reg, names, flags)| Register::new(reg, names, flags)),
    );

    RegisterFile::new(registers)
}
