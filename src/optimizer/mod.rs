// This module is the peephole optimizer that runs over the finalized machine instructions of
// one function. Each pass proposes a rewrite on a copy of the affected instructions, checks
// the data-flow facts that make it safe and re-validates every rewritten operand against the
// handle kinds its instruction accepts before committing. A rewrite that fails any check is
// abandoned with a short reason logged at trace level; an aborted rewrite never fails the
// compilation. The passes repeat until none of them changes the list or a round cap is hit.
//
// Passes:
// - self moves are removed
// - a register move is inlined into the instruction that produced its source
// - moves whose destination is never read again are removed, and so is a reload of the slot
//   just stored from the same register
// - instructions without flag effects are hoisted above flag-using work to shorten
//   dependency chains and group memory traffic
// - adjacent constant and store sequences are combined, including arm64 load/store pairs
// - a call directly followed by a return becomes an epilogue and a tail jump
// - labels without incoming jumps and jumps to the next instruction are removed

//! Peephole optimization over finalized instructions.

pub mod analysis;

use crate::assembler::instruction::ParameterFlags;
use crate::assembler::machine::{MachineInstruction, MachineOperand, Opcode};
use crate::core::register_file::RegisterFile;
use crate::core::value::{Constant, Format, HandleKind, MemoryOperand, Operand, Size};
use crate::flow::graph::LabelId;
use crate::target::Target;
use analysis::{access_of, Analysis};
use hashbrown::HashSet;
use log::{debug, trace};

const MAX_ROUNDS: usize = 16;

/// Reason a rewrite was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Abort(&'static str);

type Rewrite<T> = Result<T, Abort>;

/// Summary of one optimizer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationReport {
    pub removed: usize,
    pub tail_calls: usize,
    pub rounds: usize,
}

pub struct Optimizer<'r> {
    target: Target,
    analysis: Analysis<'r>,
}

impl<'r> Optimizer<'r> {
    pub fn new(target: Target, registers: &'r RegisterFile) -> Self {
        Self {
            target,
            analysis: Analysis::new(registers),
        }
    }

    pub fn optimize(&self, code: &mut Vec<MachineInstruction>) -> OptimizationReport {
        let before = code.len();
        let mut report = OptimizationReport::default();

        for round in 0..MAX_ROUNDS {
            let mut changed = false;
            changed |= self.remove_self_moves(code);
            changed |= self.inline_moves(code);
            changed |= self.remove_redundant_moves(code);
            changed |= self.combine(code);
            changed |= self.hoist(code);
            let tail_calls = self.convert_tail_calls(code);
            report.tail_calls += tail_calls;
            changed |= tail_calls > 0;
            changed |= self.clean_labels(code);

            report.rounds = round + 1;
            if !changed {
                break;
            }
        }

        report.removed = before.saturating_sub(code.len());
        debug!(
            "peephole: {} -> {} instructions in {} rounds, {} tail calls",
            before,
            code.len(),
            report.rounds,
            report.tail_calls
        );
        report
    }

    /// Drops `mov r, r`. A 32-bit self move clears the upper half of the register and stays.
    fn remove_self_moves(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let before = code.len();
        code.retain(|instruction| {
            !(instruction.is_move()
                && instruction.operands[0].value.register().is_some()
                && instruction.operands[0].value == instruction.operands[1].value
                && instruction.operands[0].size() == instruction.operands[1].size()
                && instruction.operands[0].size() != Size::Dword)
        });
        before != code.len()
    }

    fn inline_moves(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let mut changed = false;
        let mut at = 0;
        while at < code.len() {
            match self.inline_move(code, at) {
                // The move is gone; whatever followed it now sits at `at`.
                Ok(()) => changed = true,
                Err(Abort(reason)) => {
                    if code[at].is_move() {
                        trace!("move inlining at {at}: {reason}");
                    }
                    at += 1;
                }
            }
        }
        changed
    }

    /// Rewrites the last writer of a move's source to produce the value in the move's
    /// destination.
    fn inline_move(&self, code: &mut Vec<MachineInstruction>, at: usize) -> Rewrite<()> {
        let instruction = &code[at];
        if !instruction.is_move() {
            return Err(Abort("not a move"));
        }
        let (destination, source) = (&instruction.operands[0], &instruction.operands[1]);
        let (Some(d), Some(s)) = (destination.value.register(), source.value.register()) else {
            return Err(Abort("not a register move"));
        };
        if d == s {
            return Err(Abort("self move"));
        }
        if d.is_media() != s.is_media() {
            return Err(Abort("register banks differ"));
        }
        let size = destination.size();
        if source.size() != size {
            return Err(Abort("sizes differ"));
        }
        if let Some(fixed) = self.target.shift_register() {
            if fixed == s || fixed == d {
                return Err(Abort("shift count register"));
            }
        }

        let mut root = None;
        for index in (0..at).rev() {
            let candidate = &code[index];
            if candidate.is_control() || candidate.is_call() || candidate.is_division_step() {
                return Err(Abort("barrier before the producer"));
            }
            if candidate.writes_register(s) {
                if candidate.writes_register(d) {
                    return Err(Abort("producer writes both registers"));
                }
                root = Some(index);
                break;
            }
            if candidate.mentions(d) {
                return Err(Abort("destination used in between"));
            }
        }
        let root = root.ok_or(Abort("no producer"))?;

        let producer = &code[root];
        let written = producer
            .operands
            .iter()
            .position(|operand| operand.writes() && operand.value.register() == Some(s))
            .ok_or(Abort("producer writes the source implicitly"))?;
        let operand = &producer.operands[written];
        if operand.reads() {
            return Err(Abort("producer reads its destination"));
        }
        if operand.is_hidden() {
            return Err(Abort("producer has a fixed destination"));
        }
        if operand.size() != size {
            return Err(Abort("producer writes a different size"));
        }
        if producer.operands.iter().any(|operand| operand.is_hidden()) {
            return Err(Abort("producer has implicit operands"));
        }
        if !self.analysis.register_is_dead(code, at + 1, s) {
            return Err(Abort("source is read after the move"));
        }

        let mut window: Vec<MachineInstruction> = code[root..at].to_vec();
        window[0].operands[written].value.substitute(s, d);
        for instruction in window.iter_mut().skip(1) {
            for operand in &mut instruction.operands {
                operand.value.substitute(s, d);
            }
        }
        for instruction in &window {
            self.validate(instruction)?;
        }

        trace!("inlined move into instruction {root}");
        code.splice(root..=at, window);
        Ok(())
    }

    fn remove_redundant_moves(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let mut changed = false;
        let mut at = 0;
        while at < code.len() {
            if self.is_redundant(code, at) {
                code.remove(at);
                changed = true;
            } else {
                at += 1;
            }
        }
        changed
    }

    fn is_redundant(&self, code: &[MachineInstruction], at: usize) -> bool {
        let instruction = &code[at];
        if !instruction.is_move() {
            return false;
        }
        let destination = &instruction.operands[0];
        match &destination.value {
            Operand::Register(reg) | Operand::MediaRegister(reg) => {
                (!self.analysis.is_return_register(*reg) && self.analysis.register_is_dead(code, at + 1, *reg))
                    || reloads_stored_value(code, at)
            }
            Operand::Memory(_) => {
                let access = access_of(instruction, destination);
                self.analysis.memory_is_dead(code, at + 1, &access)
            }
            _ => false,
        }
    }

    fn hoist(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let mut changed = false;
        for at in 1..code.len() {
            if !is_movable(&code[at]) {
                continue;
            }
            let mut to = at;
            while to > 0 && self.can_pass(&code[to - 1], &code[at]) {
                to -= 1;
            }
            if to < at {
                let instruction = code.remove(at);
                code.insert(to, instruction);
                trace!("hoisted instruction from {at} to {to}");
                changed = true;
            }
        }
        changed
    }

    /// Whether `instruction` may move above `previous`. Movable instructions keep their order
    /// among themselves.
    fn can_pass(&self, previous: &MachineInstruction, instruction: &MachineInstruction) -> bool {
        if previous.is_control() || previous.is_call() || previous.is_division_step() || is_movable(previous) {
            return false;
        }
        if instruction
            .written_registers()
            .into_iter()
            .any(|reg| previous.mentions(reg))
        {
            return false;
        }
        if instruction
            .read_registers()
            .into_iter()
            .any(|reg| previous.writes_register(reg))
        {
            return false;
        }
        instruction
            .operands
            .iter()
            .filter(|operand| operand.value.is_memory())
            .all(|operand| {
                let access = access_of(instruction, operand);
                let conflicts = if operand.writes() {
                    self.analysis.reads_memory(previous, &access) || self.analysis.writes_memory(previous, &access)
                } else {
                    self.analysis.writes_memory(previous, &access)
                };
                !conflicts
            })
    }

    fn combine(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let mut changed = false;
        let mut at = 0;
        while at + 1 < code.len() {
            let combined = self
                .fold_constant_store(code, at)
                .or_else(|_| self.pair(code, at))
                .or_else(|_| self.merge_constant_stores(code, at));
            match combined {
                Ok(instruction) => {
                    code.splice(at..at + 2, [instruction]);
                    changed = true;
                }
                Err(Abort(reason)) => {
                    if code[at].is_move() && code[at + 1].is_move() {
                        trace!("combining at {at}: {reason}");
                    }
                    at += 1;
                }
            }
        }
        changed
    }

    /// `mov R, C; mov [M], R` with R dead afterwards becomes `mov [M], C`.
    fn fold_constant_store(&self, code: &[MachineInstruction], at: usize) -> Rewrite<MachineInstruction> {
        let (first, second) = (&code[at], &code[at + 1]);
        if !first.is_move() || !second.is_move() {
            return Err(Abort("not two moves"));
        }
        let Operand::Constant(constant) = &first.operands[1].value else {
            return Err(Abort("first move does not load a constant"));
        };
        let Some(reg) = first.operands[0].value.register() else {
            return Err(Abort("constant not loaded into a register"));
        };
        if !second.operands[0].value.is_memory() || second.operands[1].value.register() != Some(reg) {
            return Err(Abort("second move does not store the register"));
        }
        if second.operands[0].value.mentions(reg) {
            return Err(Abort("register forms the address"));
        }
        if second.operands[1].size() != first.operands[0].size() {
            return Err(Abort("sizes differ"));
        }
        if !self.target.accepts_store_immediate(constant) {
            return Err(Abort("constant cannot be stored directly"));
        }
        if !self.analysis.register_is_dead(code, at + 2, reg) {
            return Err(Abort("register read after the store"));
        }

        let mut store = second.clone();
        let source = &mut store.operands[1];
        source.value = Operand::Constant(*constant);
        if !source.types.contains(&HandleKind::Constant) {
            source.types.push(HandleKind::Constant);
        }
        self.validate(&store)?;
        Ok(store)
    }

    /// Two adjacent arm64 loads or stores of neighboring slots become one pair instruction.
    fn pair(&self, code: &[MachineInstruction], at: usize) -> Rewrite<MachineInstruction> {
        let sizes = self.target.pair_sizes();
        if sizes.is_empty() {
            return Err(Abort("target has no pair instructions"));
        }
        let (first, second) = (&code[at], &code[at + 1]);
        if !first.is_move() || !second.is_move() {
            return Err(Abort("not two moves"));
        }
        let store = if is_store(first) && is_store(second) {
            true
        } else if is_load(first) && is_load(second) {
            false
        } else {
            return Err(Abort("not two loads or two stores"));
        };
        let (memory_index, register_index) = if store { (0, 1) } else { (1, 0) };

        let memory = |instruction: &MachineInstruction| match &instruction.operands[memory_index].value {
            Operand::Memory(memory @ MemoryOperand { index: None, .. }) => Some(*memory),
            _ => None,
        };
        let (Some(a), Some(b)) = (memory(first), memory(second)) else {
            return Err(Abort("addresses are not base plus offset"));
        };
        let (Some(ra), Some(rb)) = (
            first.operands[register_index].value.register(),
            second.operands[register_index].value.register(),
        ) else {
            return Err(Abort("pair operands are not registers"));
        };
        if a.base != b.base {
            return Err(Abort("different bases"));
        }
        if ra.is_media() != rb.is_media() {
            return Err(Abort("register banks differ"));
        }
        let size = first.operands[memory_index].size();
        if second.operands[memory_index].size() != size || !sizes.contains(&size.bytes()) {
            return Err(Abort("unpairable sizes"));
        }
        if !store && (ra == rb || ra == a.base) {
            return Err(Abort("first load clobbers the second"));
        }

        let bytes = i64::from(size.bytes());
        let (low, high, base) = if b.offset == a.offset + bytes {
            (at, at + 1, a)
        } else if a.offset == b.offset + bytes {
            (at + 1, at, b)
        } else {
            return Err(Abort("slots are not adjacent"));
        };
        if base.offset % bytes != 0 || !(-64..64).contains(&(base.offset / bytes)) {
            return Err(Abort("pair offset out of range"));
        }

        let registers: Vec<MachineOperand> = [low, high]
            .iter()
            .map(|&index| code[index].operands[register_index].clone())
            .collect();
        let mut address = code[low].operands[memory_index].clone();
        address.value = Operand::Memory(base);
        let mut operands = registers;
        operands.push(address);
        let instruction = MachineInstruction::new(
            if store { Opcode::StorePair } else { Opcode::LoadPair },
            operands,
        );
        self.validate(&instruction)?;
        Ok(instruction)
    }

    /// Two adjacent dword constant stores become one qword store when the value still fits
    /// a sign-extended immediate.
    fn merge_constant_stores(&self, code: &[MachineInstruction], at: usize) -> Rewrite<MachineInstruction> {
        if self.target != Target::X64 {
            return Err(Abort("target has no wide immediate stores"));
        }
        let (first, second) = (&code[at], &code[at + 1]);
        let constant_store = |instruction: &MachineInstruction| {
            if !instruction.is_move() || instruction.operands[0].size() != Size::Dword {
                return None;
            }
            match (&instruction.operands[0].value, &instruction.operands[1].value) {
                (Operand::Memory(memory), Operand::Constant(Constant::Integer(value))) => Some((*memory, *value)),
                _ => None,
            }
        };
        let (Some((a, va)), Some((b, vb))) = (constant_store(first), constant_store(second)) else {
            return Err(Abort("not two dword constant stores"));
        };
        if a.base != b.base || a.index != b.index || a.stride != b.stride {
            return Err(Abort("different address registers"));
        }
        let (low, low_value, high_value) = if b.offset == a.offset + 4 {
            (a, va, vb)
        } else if a.offset == b.offset + 4 {
            (b, vb, va)
        } else {
            return Err(Abort("slots are not adjacent"));
        };
        let combined = (((high_value as u32 as u64) << 32) | (low_value as u32 as u64)) as i64;
        if i32::try_from(combined).is_err() {
            return Err(Abort("combined value needs more than 32 bits"));
        }

        let mut store = first.clone();
        store.operands[0].value = Operand::Memory(low);
        store.operands[0].format = Format::I64;
        store.operands[1].value = Operand::Constant(Constant::Integer(combined));
        store.operands[1].format = Format::I64;
        self.validate(&store)?;
        Ok(store)
    }

    /// A call immediately followed by the return becomes an epilogue and a jump.
    fn convert_tail_calls(&self, code: &mut Vec<MachineInstruction>) -> usize {
        let calls = code.iter().filter(|instruction| instruction.is_call()).count();
        if calls != 1 {
            return 0;
        }
        let Some(at) = code.iter().position(|instruction| instruction.is_call()) else {
            return 0;
        };
        let Opcode::Call {
            function,
            stack_arguments,
        } = &code[at].opcode
        else {
            return 0;
        };
        if *stack_arguments != 0 {
            trace!("tail call at {at}: stack arguments");
            return 0;
        }
        if code.get(at + 1).map(|next| &next.opcode) != Some(&Opcode::Return) {
            trace!("tail call at {at}: call is not followed by the return");
            return 0;
        }

        let jump = MachineInstruction::new(Opcode::TailJump(function.clone()), code[at].operands.clone());
        code.splice(at..at + 2, [MachineInstruction::new(Opcode::Epilogue, Vec::new()), jump]);
        trace!("converted call at {at} into a tail jump");
        1
    }

    fn clean_labels(&self, code: &mut Vec<MachineInstruction>) -> bool {
        let mut changed = false;

        let mut at = 0;
        while at < code.len() {
            if let Opcode::Jump { label, .. } = code[at].opcode {
                let falls_through = code[at + 1..]
                    .iter()
                    .take_while(|instruction| instruction.is_label())
                    .any(|instruction| instruction.opcode == Opcode::Label(label));
                if falls_through {
                    trace!("removed jump to the next instruction at {at}");
                    code.remove(at);
                    changed = true;
                    continue;
                }
            }
            at += 1;
        }

        let targets: HashSet<LabelId> = code
            .iter()
            .filter_map(|instruction| match instruction.opcode {
                Opcode::Jump { label, .. } => Some(label),
                _ => None,
            })
            .collect();
        let before = code.len();
        code.retain(|instruction| match instruction.opcode {
            Opcode::Label(label) => targets.contains(&label),
            _ => true,
        });
        changed || before != code.len()
    }

    /// Operand kinds and addressing forms of a rewritten instruction.
    fn validate(&self, instruction: &MachineInstruction) -> Rewrite<()> {
        if instruction.operands.iter().any(|operand| !operand.is_valid()) {
            return Err(Abort("operand kind not accepted"));
        }
        let memory: Vec<&MachineOperand> = instruction
            .operands
            .iter()
            .filter(|operand| !operand.is_hidden() && operand.value.is_memory())
            .collect();
        match self.target {
            Target::X64 if memory.len() > 1 => return Err(Abort("two memory operands")),
            Target::Arm64
                if !memory.is_empty()
                    && !matches!(instruction.opcode, Opcode::Move | Opcode::StorePair | Opcode::LoadPair) =>
            {
                return Err(Abort("memory operand outside a load or store"))
            }
            _ => {}
        }
        for operand in &memory {
            if let Operand::Memory(address) = &operand.value {
                let paired = matches!(instruction.opcode, Opcode::StorePair | Opcode::LoadPair);
                if !paired
                    && !self
                        .target
                        .accepts_address(address.index.is_some(), address.stride, address.offset, operand.size())
                {
                    return Err(Abort("address cannot be encoded"));
                }
            }
        }
        if instruction.is_move() && instruction.operands[0].value.is_memory() {
            if let Operand::Constant(constant) = &instruction.operands[1].value {
                if !self.target.accepts_store_immediate(constant) {
                    return Err(Abort("constant cannot be stored directly"));
                }
            }
        }
        Ok(())
    }
}

/// Instructions that neither set nor consume the condition flags and carry no implicit effects.
fn is_movable(instruction: &MachineInstruction) -> bool {
    !instruction.operands.is_empty()
        && !instruction.is_control()
        && !instruction.is_call()
        && !instruction.is_division_step()
        && !instruction.writes_flags()
        && !instruction.reads_flags()
        && instruction.operands.iter().all(|operand| !operand.is_hidden())
}

/// `mov [M], R; mov R, [M]` of one full register: the load reads back what is already there.
fn reloads_stored_value(code: &[MachineInstruction], at: usize) -> bool {
    let Some(previous) = at.checked_sub(1).map(|index| &code[index]) else {
        return false;
    };
    let load = &code[at];
    if !is_load(load) || !is_store(previous) {
        return false;
    }
    let (register, slot) = (&load.operands[0], &load.operands[1]);
    previous.operands[0].value == slot.value
        && previous.operands[1].value == register.value
        && register.size() == Size::Qword
        && slot.size() == Size::Qword
        && previous.operands[0].size() == Size::Qword
}

fn is_load(instruction: &MachineInstruction) -> bool {
    instruction.is_move()
        && instruction.operands[0].value.register().is_some()
        && matches!(instruction.operands[1].value, Operand::Memory(_))
        && instruction.operands[1].flags.contains(ParameterFlags::READS)
}

fn is_store(instruction: &MachineInstruction) -> bool {
    instruction.is_move()
        && matches!(instruction.operands[0].value, Operand::Memory(_))
        && instruction.operands[1].value.register().is_some()
}
