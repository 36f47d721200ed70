// This module selects the target architecture. Target is a small copyable enum consulted by
// every phase that needs architecture knowledge: which register table and calling convention
// to instantiate, whether instructions take two or three operands, whether arithmetic may
// read memory directly, how wide immediates may be and which addressing forms are legal.
// Keeping these rules in one place lets the builder and the peephole optimizer validate
// operands against the same constraints.

//! Target architecture selection and operand rules.

use crate::arm64::{self, Aapcs64Assigner};
use crate::core::calling_convention::CCAssigner;
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::value::{Constant, Size};
use crate::x64::{self, SysVAssigner};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Target {
    /// x86-64 with the System V ABI.
    #[default]
    X64,
    /// AArch64 with the AAPCS64 ABI.
    Arm64,
}

impl Target {
    pub fn register_file(self) -> RegisterFile {
        match self {
            Target::X64 => x64::register_file(),
            Target::Arm64 => arm64::register_file(),
        }
    }

    pub fn assigner(self) -> Box<dyn CCAssigner> {
        match self {
            Target::X64 => Box::new(SysVAssigner::new()),
            Target::Arm64 => Box::new(Aapcs64Assigner::new()),
        }
    }

    /// Only loads and stores may access memory.
    pub fn is_load_store(self) -> bool {
        self == Target::Arm64
    }

    /// Arithmetic writes a separate destination instead of its first source.
    pub fn has_three_operands(self) -> bool {
        self == Target::Arm64
    }

    /// Signed bits available to arithmetic and compare immediates.
    pub fn immediate_bits(self) -> u32 {
        match self {
            Target::X64 => 32,
            // add/sub/cmp take 12 bits, negative values flip the operation.
            Target::Arm64 => 12,
        }
    }

    /// Whether a constant can be written to memory without a register.
    pub fn accepts_store_immediate(self, constant: &Constant) -> bool {
        match (self, constant) {
            (Target::X64, Constant::Integer(_)) => constant.bits() <= 32,
            (Target::Arm64, Constant::Integer(0)) => true,
            _ => false,
        }
    }

    /// Whether a memory operand can be encoded directly.
    pub fn accepts_address(self, has_index: bool, stride: u8, offset: i64, size: Size) -> bool {
        match self {
            Target::X64 => matches!(stride, 1 | 2 | 4 | 8) && i32::try_from(offset).is_ok(),
            Target::Arm64 => {
                if has_index {
                    offset == 0 && (stride == 1 || u32::from(stride) == size.bytes())
                } else {
                    let scale = i64::from(size.bytes());
                    (-256..256).contains(&offset)
                        || (offset >= 0 && offset % scale == 0 && offset / scale < 4096)
                }
            }
        }
    }

    /// Registers implicitly used by division.
    pub fn division_registers(self) -> &'static [AsmReg] {
        match self {
            Target::X64 => &[x64::RAX, x64::RDX],
            Target::Arm64 => &[],
        }
    }

    /// Register receiving the shift count, when the count is not an immediate.
    pub fn shift_register(self) -> Option<AsmReg> {
        match self {
            Target::X64 => Some(x64::RCX),
            Target::Arm64 => None,
        }
    }

    /// Access sizes that adjacent loads and stores can be paired at.
    pub fn pair_sizes(self) -> &'static [u32] {
        match self {
            Target::X64 => &[],
            Target::Arm64 => &[4, 8],
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::X64 => f.write_str("x86-64"),
            Target::Arm64 => f.write_str("aarch64"),
        }
    }
}
