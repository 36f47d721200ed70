// This module implements the Result model: a logical program value with a handle describing
// where it lives, a format, a lifetime over instruction positions and a list of allocation
// hints. Results are stored in a per-function ResultTable and addressed by ResultId. The table
// doubles as a union-find structure for connection sets: connecting two Results merges their
// classes so that every member shares one handle, format, lifetime and hint list stored at the
// class root. Relocating a value therefore updates every instruction operand that refers to
// any member of its set. Lifetimes are recomputed by a two-pass simulation (reset every
// lifetime, then extend them over every use) whenever instructions are inserted or reordered.

//! Results, lifetimes and connection sets.

use crate::assembler::instruction::InstructionId;
use crate::core::register_file::AsmReg;
use crate::core::value::{Format, Handle};

/// Inclusive range of instruction positions over which a value is live.
///
/// `None` bounds are unresolved: a value nobody uses is never active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifetime {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl Lifetime {
    pub fn reset(&mut self) {
        self.start = None;
        self.end = None;
    }

    /// Extends the lifetime so that it covers `position`.
    pub fn use_at(&mut self, position: usize) {
        self.start = Some(self.start.map_or(position, |start| start.min(position)));
        self.end = Some(self.end.map_or(position, |end| end.max(position)));
    }

    pub fn is_active(&self, position: usize) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= position && position <= end,
            _ => false,
        }
    }

    /// Active strictly inside the lifetime, not at its edges.
    pub fn is_only_active(&self, position: usize) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start < position && position < end,
            _ => false,
        }
    }

    /// The value dies at `position`.
    pub fn is_expiring(&self, position: usize) -> bool {
        !self.is_active(position + 1)
    }

    pub fn merge(&mut self, other: &Lifetime) {
        if let Some(start) = other.start {
            self.use_at(start);
        }
        if let Some(end) = other.end {
            self.use_at(end);
        }
    }
}

/// Allocation directive attached by the register usage simulator.
///
/// Every hint is anchored to the instruction it serves and is ignored once the
/// build has moved past that instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Hint {
    SpecificRegister { register: AsmReg, until: InstructionId },
    NonVolatile { until: InstructionId },
    AvoidRegisters { registers: Vec<AsmReg>, until: InstructionId },
}

impl Hint {
    pub fn anchor(&self) -> InstructionId {
        match self {
            Hint::SpecificRegister { until, .. }
            | Hint::NonVolatile { until }
            | Hint::AvoidRegisters { until, .. } => *until,
        }
    }
}

/// Identifier of a Result in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResultId(u32);

impl ResultId {
    pub const fn new(index: u32) -> Self {
        ResultId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Data shared by all members of a connection set.
#[derive(Debug, Clone)]
pub struct ResultData {
    pub handle: Handle,
    pub format: Format,
    pub lifetime: Lifetime,
    pub hints: Vec<Hint>,
}

/// Arena of Results with union-find connection sets.
#[derive(Debug, Default)]
pub struct ResultTable {
    parents: Vec<u32>,
    data: Vec<ResultData>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, handle: Handle, format: Format) -> ResultId {
        let id = self.data.len() as u32;
        self.parents.push(id);
        self.data.push(ResultData {
            handle,
            format,
            lifetime: Lifetime::default(),
            hints: Vec::new(),
        });
        ResultId(id)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Representative of the connection set containing `id`.
    pub fn root(&self, id: ResultId) -> ResultId {
        let mut current = id.0;
        while self.parents[current as usize] != current {
            current = self.parents[current as usize];
        }
        ResultId(current)
    }

    /// Connects two Results so that they share all data from now on.
    pub fn connect(&mut self, a: ResultId, b: ResultId) -> ResultId {
        let ra = self.root(a);
        let rb = self.root(b);
        if ra == rb {
            return ra;
        }
        let absorbed = self.data[rb.index()].clone();
        self.parents[rb.index()] = ra.0;
        let target = &mut self.data[ra.index()];
        if matches!(target.handle, Handle::None) {
            target.handle = absorbed.handle;
        }
        target.lifetime.merge(&absorbed.lifetime);
        target.hints.extend(absorbed.hints);
        // Path compression keeps later lookups short.
        self.parents[a.index()] = ra.0;
        self.parents[b.index()] = ra.0;
        ra
    }

    pub fn is_connected(&self, a: ResultId, b: ResultId) -> bool {
        self.root(a) == self.root(b)
    }

    pub fn get(&self, id: ResultId) -> &ResultData {
        &self.data[self.root(id).index()]
    }

    pub fn get_mut(&mut self, id: ResultId) -> &mut ResultData {
        let root = self.root(id);
        &mut self.data[root.index()]
    }

    pub fn handle(&self, id: ResultId) -> &Handle {
        &self.get(id).handle
    }

    pub fn set_handle(&mut self, id: ResultId, handle: Handle) {
        self.get_mut(id).handle = handle;
    }

    pub fn format(&self, id: ResultId) -> Format {
        self.get(id).format
    }

    pub fn lifetime(&self, id: ResultId) -> Lifetime {
        self.get(id).lifetime
    }

    pub fn add_hint(&mut self, id: ResultId, hint: Hint) {
        let hints = &mut self.get_mut(id).hints;
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }

    /// First pass of the lifetime simulation.
    pub fn reset_lifetimes(&mut self) {
        for data in &mut self.data {
            data.lifetime.reset();
        }
    }

    /// Marks `id` and everything its handle depends on as used at `position`.
    pub fn use_at(&mut self, id: ResultId, position: usize) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let data = self.get_mut(current);
            data.lifetime.use_at(position);
            pending.extend(data.handle.dependencies());
        }
    }

    /// All set representatives.
    pub fn roots(&self) -> impl Iterator<Item = ResultId> + '_ {
        (0..self.parents.len() as u32)
            .filter(move |&i| self.parents[i as usize] == i)
            .map(ResultId)
    }
}
