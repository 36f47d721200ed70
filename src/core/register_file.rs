// This module implements the physical register pool of a function. Registers are grouped in
// banks (standard and media) and identified by AsmReg. Every Register carries its sub-width
// names, a RegisterFlags set that classifies it (volatile, reserved, media, return, decimal
// return, numerator, remainder, shift, stack pointer, base pointer, zero, return address),
// the Result it currently holds and a lock count that keeps it out of allocation while an
// instruction is being built. The RegisterFile answers class queries in table order (which
// is the allocation preference order), tracks which non-volatile registers were written so
// the prologue and epilogue know what to preserve, and supports the resets performed at
// control-flow merge points. Availability decisions that depend on value lifetimes take the
// ResultTable and the current position as input.

//! Register pool and bookkeeping.

use crate::core::results::{ResultId, ResultTable};
use crate::core::value::{Handle, Size};
use hashbrown::HashMap;
use std::ops::BitOr;

/// Maximum number of register banks supported.
pub const MAX_REGISTER_BANKS: usize = 2;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Bank of general purpose registers.
pub const STANDARD_BANK: RegBank = 0;

/// Bank of floating point and vector registers.
pub const MEDIA_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn standard(id: RegId) -> Self {
        Self::new(STANDARD_BANK, id)
    }

    pub const fn media(id: RegId) -> Self {
        Self::new(MEDIA_BANK, id)
    }

    pub fn is_media(&self) -> bool {
        self.bank == MEDIA_BANK
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        if reg.bank as usize >= MAX_REGISTER_BANKS || reg.id >= 64 {
            return false;
        }
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] |= 1u64 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS && reg.id < 64 {
            self.banks[reg.bank as usize] &= !(1u64 << reg.id);
        }
    }

    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    pub fn count(&self) -> u32 {
        self.banks.iter().map(|bank| bank.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Registers in ascending bank and id order.
    pub fn iter(&self) -> impl Iterator<Item = AsmReg> + '_ {
        (0..MAX_REGISTER_BANKS).flat_map(move |bank| {
            let mask = self.banks[bank];
            (0..64u8)
                .filter(move |id| mask & (1u64 << id) != 0)
                .map(move |id| AsmReg::new(bank as RegBank, id))
        })
    }
}

/// Classification of a physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegisterFlags(u16);

impl RegisterFlags {
    pub const NONE: Self = Self(0);
    pub const VOLATILE: Self = Self(1);
    pub const RESERVED: Self = Self(1 << 1);
    pub const RETURN: Self = Self(1 << 2);
    pub const STACK_POINTER: Self = Self(1 << 3);
    pub const NUMERATOR: Self = Self(1 << 4);
    pub const REMAINDER: Self = Self(1 << 5);
    pub const MEDIA: Self = Self(1 << 6);
    pub const DECIMAL_RETURN: Self = Self(1 << 7);
    pub const SHIFT: Self = Self(1 << 8);
    pub const BASE_POINTER: Self = Self(1 << 9);
    pub const ZERO: Self = Self(1 << 10);
    pub const RETURN_ADDRESS: Self = Self(1 << 11);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for RegisterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Physical register with its current bookkeeping.
#[derive(Debug, Clone)]
pub struct Register {
    pub reg: AsmReg,
    /// Names for the 8, 4, 2 and 1 byte views.
    pub names: [&'static str; 4],
    pub flags: RegisterFlags,
    /// Result the register currently holds.
    pub value: Option<ResultId>,
    lock_count: u8,
}

impl Register {
    pub fn new(reg: AsmReg, names: [&'static str; 4], flags: RegisterFlags) -> Self {
        Self {
            reg,
            names,
            flags,
            value: None,
            lock_count: 0,
        }
    }

    pub fn is_volatile(&self) -> bool {
        self.flags.contains(RegisterFlags::VOLATILE)
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.contains(RegisterFlags::RESERVED)
    }

    pub fn is_media(&self) -> bool {
        self.flags.contains(RegisterFlags::MEDIA)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn name(&self, size: Size) -> &'static str {
        match size {
            Size::Qword => self.names[0],
            Size::Dword => self.names[1],
            Size::Word => self.names[2],
            Size::Byte => self.names[3],
        }
    }

    /// The register holds `value` as its actual location, not a stale copy.
    pub fn holds(&self, results: &ResultTable) -> Option<ResultId> {
        let value = self.value?;
        match results.handle(value) {
            Handle::Register(reg) | Handle::MediaRegister(reg) if *reg == self.reg => Some(value),
            _ => None,
        }
    }

    /// Not locked and not holding a value that is live at `position`.
    pub fn is_available(&self, results: &ResultTable, position: usize) -> bool {
        !self.is_locked()
            && self
                .holds(results)
                .map_or(true, |value| !results.lifetime(value).is_active(position))
    }

    /// Like [`Register::is_available`] but accepts values dying at `position`.
    pub fn is_available_for_destination(&self, results: &ResultTable, position: usize) -> bool {
        !self.is_locked()
            && self
                .holds(results)
                .map_or(true, |value| results.lifetime(value).is_expiring(position))
    }
}

/// Register pool of one function.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    registers: Vec<Register>,
    lookup: HashMap<AsmReg, usize>,
    /// Non-volatile registers written so far.
    written: RegBitSet,
}

impl RegisterFile {
    /// Creates the pool; the table order is the allocation preference order.
    pub fn new(registers: Vec<Register>) -> Self {
        let lookup = registers
            .iter()
            .enumerate()
            .map(|(i, register)| (register.reg, i))
            .collect();
        Self {
            registers,
            lookup,
            written: RegBitSet::new(),
        }
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn get(&self, reg: AsmReg) -> Option<&Register> {
        self.lookup.get(&reg).map(|&i| &self.registers[i])
    }

    pub fn get_mut(&mut self, reg: AsmReg) -> Option<&mut Register> {
        let index = *self.lookup.get(&reg)?;
        Some(&mut self.registers[index])
    }

    pub fn flags(&self, reg: AsmReg) -> RegisterFlags {
        self.get(reg).map_or(RegisterFlags::NONE, |register| register.flags)
    }

    pub fn is_volatile(&self, reg: AsmReg) -> bool {
        self.flags(reg).contains(RegisterFlags::VOLATILE)
    }

    /// First register carrying all of `flags`.
    pub fn find_flag(&self, flags: RegisterFlags) -> Option<AsmReg> {
        self.registers
            .iter()
            .find(|register| register.flags.contains(flags))
            .map(|register| register.reg)
    }

    /// Standard or media return register.
    pub fn return_register(&self, media: bool) -> Option<AsmReg> {
        if media {
            self.find_flag(RegisterFlags::DECIMAL_RETURN)
        } else {
            self.find_flag(RegisterFlags::RETURN)
        }
    }

    pub fn stack_pointer(&self) -> Option<AsmReg> {
        self.find_flag(RegisterFlags::STACK_POINTER)
    }

    pub fn base_pointer(&self) -> Option<AsmReg> {
        self.find_flag(RegisterFlags::BASE_POINTER)
    }

    /// Allocatable registers of one class in preference order.
    pub fn class(&self, media: bool, volatile: bool) -> Vec<AsmReg> {
        self.registers
            .iter()
            .filter(|register| {
                !register.is_reserved()
                    && register.is_media() == media
                    && register.is_volatile() == volatile
            })
            .map(|register| register.reg)
            .collect()
    }

    /// Every allocatable register of a bank.
    pub fn allocatable(&self, media: bool) -> Vec<AsmReg> {
        self.registers
            .iter()
            .filter(|register| !register.is_reserved() && register.is_media() == media)
            .map(|register| register.reg)
            .collect()
    }

    pub fn lock(&mut self, reg: AsmReg) {
        if let Some(register) = self.get_mut(reg) {
            register.lock_count = register.lock_count.saturating_add(1);
        }
    }

    pub fn unlock(&mut self, reg: AsmReg) {
        if let Some(register) = self.get_mut(reg) {
            register.lock_count = register.lock_count.saturating_sub(1);
        }
    }

    pub fn is_locked(&self, reg: AsmReg) -> bool {
        self.get(reg).is_some_and(Register::is_locked)
    }

    pub fn value(&self, reg: AsmReg) -> Option<ResultId> {
        self.get(reg).and_then(|register| register.value)
    }

    pub fn attach(&mut self, reg: AsmReg, value: ResultId) {
        if let Some(register) = self.get_mut(reg) {
            register.value = Some(value);
        }
    }

    pub fn reset(&mut self, reg: AsmReg) {
        if let Some(register) = self.get_mut(reg) {
            register.value = None;
        }
    }

    /// Forgets every value, used at merge points before the snapshot is restored.
    pub fn reset_all(&mut self) {
        for register in &mut self.registers {
            if !register.is_reserved() {
                register.value = None;
            }
        }
    }

    /// Forgets the values of volatile registers, used after calls.
    pub fn reset_volatile(&mut self) {
        for register in &mut self.registers {
            if register.is_volatile() {
                register.value = None;
            }
        }
    }

    pub fn mark_written(&mut self, reg: AsmReg) {
        if let Some(register) = self.get(reg) {
            if !register.is_volatile() && !register.is_reserved() {
                self.written.set(reg);
            }
        }
    }

    /// Non-volatile registers the function writes.
    pub fn written_non_volatile(&self) -> &RegBitSet {
        &self.written
    }

    /// Register currently holding `value`.
    pub fn find_value(&self, results: &ResultTable, value: ResultId) -> Option<AsmReg> {
        self.registers
            .iter()
            .find(|register| {
                register
                    .holds(results)
                    .is_some_and(|held| results.is_connected(held, value))
            })
            .map(|register| register.reg)
    }
}
