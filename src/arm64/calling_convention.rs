// This module implements the AAPCS64 procedure call standard. Standard arguments pass in
// X0-X7 and decimal arguments in V0-V7, each class counted independently; once a class runs
// out of registers its arguments go to the stack in 8-byte slots. Return values use X0/X1 and
// V0/V1. X19-X28 and the low halves of V8-V15 are callee-saved.

//! AArch64 AAPCS64 calling convention implementation.

use crate::core::calling_convention::{align_up, ArgClass, CCAssigner, CCAssignment, CCInfo};
use crate::core::register_file::{AsmReg, RegBitSet};

/// AAPCS64 calling convention assigner.
pub struct Aapcs64Assigner {
    cc_info: CCInfo,
    ngrn: usize,
    nsrn: usize,
    stack: u32,
    ret_gp_cnt: usize,
    ret_fp_cnt: usize,
}

impl Default for Aapcs64Assigner {
    fn default() -> Self {
        let mut callee_saved = RegBitSet::new();
        for id in 19..=28 {
            callee_saved.set(AsmReg::standard(id));
        }
        for id in 8..=15 {
            callee_saved.set(AsmReg::media(id));
        }

        let mut arg_regs = RegBitSet::new();
        for id in 0..8 {
            arg_regs.set(AsmReg::standard(id));
            arg_regs.set(AsmReg::media(id));
        }

        Self {
            cc_info: CCInfo {
                callee_saved_regs: callee_saved,
                arg_regs,
            },
            ngrn: 0,
            nsrn: 0,
            stack: 0,
            ret_gp_cnt: 0,
            ret_fp_cnt: 0,
        }
    }
}

impl Aapcs64Assigner {
    /// Number of registers of each class used for arguments.
    pub const ARG_REGS_PER_CLASS: usize = 8;

    const RET_REGS_PER_CLASS: usize = 2;

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for Aapcs64Assigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        let (counter, reg) = match arg.class {
            ArgClass::Standard => (&mut self.ngrn, AsmReg::standard as fn(u8) -> AsmReg),
            ArgClass::Media => (&mut self.nsrn, AsmReg::media as fn(u8) -> AsmReg),
        };
        if *counter < Self::ARG_REGS_PER_CLASS {
            arg.reg = Some(reg(*counter as u8));
            *counter += 1;
            return;
        }

        self.stack = align_up(self.stack, arg.align.max(8));
        arg.stack_off = Some(self.stack as i32);
        self.stack += align_up(arg.size, 8);
    }

    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        let (counter, reg) = match arg.class {
            ArgClass::Standard => (&mut self.ret_gp_cnt, AsmReg::standard as fn(u8) -> AsmReg),
            ArgClass::Media => (&mut self.ret_fp_cnt, AsmReg::media as fn(u8) -> AsmReg),
        };
        if *counter < Self::RET_REGS_PER_CLASS {
            arg.reg = Some(reg(*counter as u8));
            *counter += 1;
        }
    }

    fn reset(&mut self) {
        self.ngrn = 0;
        self.nsrn = 0;
        self.stack = 0;
        self.ret_gp_cnt = 0;
        self.ret_fp_cnt = 0;
    }

    fn get_stack_size(&self) -> u32 {
        align_up(self.stack, 16)
    }
}
