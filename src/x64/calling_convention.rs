// This module implements the System V AMD64 calling convention. Standard arguments pass in
// RDI, RSI, RDX, RCX, R8 and R9, decimal arguments in XMM0-XMM7, and every argument that
// does not fit goes to the stack area in 8-byte slots addressed upwards from the stack
// pointer at the call. Return values use RAX/RDX for standard values and XMM0/XMM1 for
// decimals; RBX and R12-R15 are callee-saved. The same assigner places arguments at call
// sites, binds incoming parameters at function entry and drives the call-argument hints of
// the register-usage simulator.

//! System V x86-64 calling convention implementation.

use crate::core::calling_convention::{align_up, ArgClass, CCAssigner, CCAssignment, CCInfo};
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::x64::{R12, R13, R14, R15, R8, R9, RAX, RBX, RCX, RDI, RDX, RSI};

/// System V x86-64 calling convention assigner.
pub struct SysVAssigner {
    cc_info: CCInfo,
    /// Current GP argument register index.
    gp_cnt: usize,
    /// Current XMM argument register index.
    xmm_cnt: usize,
    /// Current stack offset for arguments.
    stack: u32,
    ret_gp_cnt: usize,
    ret_xmm_cnt: usize,
}

impl Default for SysVAssigner {
    fn default() -> Self {
        let mut callee_saved = RegBitSet::new();
        for reg in [RBX, R12, R13, R14, R15] {
            callee_saved.set(reg);
        }

        let mut arg_regs = RegBitSet::new();
        for &reg in Self::GP_ARG_REGS.iter().chain(&Self::XMM_ARG_REGS) {
            arg_regs.set(reg);
        }

        Self {
            cc_info: CCInfo {
                callee_saved_regs: callee_saved,
                arg_regs,
            },
            gp_cnt: 0,
            xmm_cnt: 0,
            stack: 0,
            ret_gp_cnt: 0,
            ret_xmm_cnt: 0,
        }
    }
}

impl SysVAssigner {
    pub const GP_ARG_REGS: [AsmReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];

    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::media(0),
        AsmReg::media(1),
        AsmReg::media(2),
        AsmReg::media(3),
        AsmReg::media(4),
        AsmReg::media(5),
        AsmReg::media(6),
        AsmReg::media(7),
    ];

    const RET_GP_REGS: [AsmReg; 2] = [RAX, RDX];

    const RET_XMM_REGS: [AsmReg; 2] = [AsmReg::media(0), AsmReg::media(1)];

    pub fn new() -> Self {
        Self::default()
    }

    fn assign_stack(&mut self, arg: &mut CCAssignment) {
        let align = arg.align.max(8);
        self.stack = align_up(self.stack, align);
        arg.stack_off = Some(self.stack as i32);
        self.stack += align_up(arg.size, 8);
    }
}

/// Next register of `list`, advancing `used` when one is left.
fn take(list: &[AsmReg], used: &mut usize) -> Option<AsmReg> {
    let reg = list.get(*used).copied();
    if reg.is_some() {
        *used += 1;
    }
    reg
}

impl CCAssigner for SysVAssigner {
    fn get_ccinfo(&self) -> &CCInfo {
        &self.cc_info
    }

    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        arg.reg = match arg.class {
            ArgClass::Standard => take(&Self::GP_ARG_REGS, &mut self.gp_cnt),
            ArgClass::Media => take(&Self::XMM_ARG_REGS, &mut self.xmm_cnt),
        };
        if arg.reg.is_none() {
            self.assign_stack(arg);
        }
    }

    /// Values beyond two registers per class have no return location.
    fn assign_ret(&mut self, arg: &mut CCAssignment) {
        arg.reg = match arg.class {
            ArgClass::Standard => take(&Self::RET_GP_REGS, &mut self.ret_gp_cnt),
            ArgClass::Media => take(&Self::RET_XMM_REGS, &mut self.ret_xmm_cnt),
        };
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
        self.stack = 0;
        self.ret_gp_cnt = 0;
        self.ret_xmm_cnt = 0;
    }

    fn get_stack_size(&self) -> u32 {
        // The stack must stay 16-byte aligned at the call.
        align_up(self.stack, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysv_gp_argument_assignment() {
        let mut assigner = SysVAssigner::new();

        for i in 0..6 {
            let mut arg = CCAssignment::new(ArgClass::Standard, 8, 8);
            assigner.assign_arg(&mut arg);

            assert_eq!(arg.reg, Some(SysVAssigner::GP_ARG_REGS[i]));
            assert!(arg.stack_off.is_none());
        }

        // 7th argument should go to stack
        let mut arg7 = CCAssignment::new(ArgClass::Standard, 8, 8);
        assigner.assign_arg(&mut arg7);

        assert!(arg7.reg.is_none());
        assert_eq!(arg7.stack_off, Some(0));

        let mut arg8 = CCAssignment::new(ArgClass::Standard, 4, 4);
        assigner.assign_arg(&mut arg8);
        assert_eq!(arg8.stack_off, Some(8));
        assert_eq!(assigner.get_stack_size(), 16);
    }

    #[test]
    fn test_sysv_xmm_argument_assignment() {
        let mut assigner = SysVAssigner::new();

        for i in 0..8 {
            let mut arg = CCAssignment::new(ArgClass::Media, 8, 8);
            assigner.assign_arg(&mut arg);
            assert_eq!(arg.reg, Some(SysVAssigner::XMM_ARG_REGS[i]));
        }

        // 9th XMM argument should go to stack
        let mut arg9 = CCAssignment::new(ArgClass::Media, 8, 8);
        assigner.assign_arg(&mut arg9);

        assert!(arg9.reg.is_none());
        assert!(arg9.stack_off.is_some());
    }

    #[test]
    fn test_classes_count_independently() {
        let mut assigner = SysVAssigner::new();
        let mut first = CCAssignment::new(ArgClass::Media, 8, 8);
        let mut second = CCAssignment::new(ArgClass::Standard, 8, 8);
        assigner.assign_arg(&mut first);
        assigner.assign_arg(&mut second);

        assert_eq!(first.reg, Some(AsmReg::media(0)));
        assert_eq!(second.reg, Some(RDI));
    }

    #[test]
    fn test_sysv_return_value_assignment() {
        let mut assigner = SysVAssigner::new();

        let mut ret_gp = CCAssignment::new(ArgClass::Standard, 8, 8);
        assigner.assign_ret(&mut ret_gp);
        assert_eq!(ret_gp.reg, Some(RAX));

        let mut ret_xmm = CCAssignment::new(ArgClass::Media, 8, 8);
        assigner.assign_ret(&mut ret_xmm);
        assert_eq!(ret_xmm.reg, Some(AsmReg::media(0)));

        assigner.reset();
        let mut again = CCAssignment::new(ArgClass::Standard, 8, 8);
        assigner.assign_ret(&mut again);
        assert_eq!(again.reg, Some(RAX));
        assert!(assigner.get_ccinfo().callee_saved_regs.contains(RBX));
    }
}
