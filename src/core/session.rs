// The compilation session ties the arena to the statistics of one compilation run. Every
// function frame allocates its slot and saved-register lists from the session's bump arena,
// so the whole run is released at once when the arena is dropped. Statistics are kept behind
// a RefCell and updated by the driver through a shared reference after each function: the
// instructions it produced, the spills the build inserted, and what the peephole pass removed
// or turned into tail jumps. A session is not shared between threads.

//! Arena and statistics of one compilation run.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Records a finished function and the length of its final instruction list.
    pub fn record_function_compiled(&self, name: &str, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.instructions_emitted += instructions;
        if stats.largest.as_ref().map_or(true, |(_, size)| *size < instructions) {
            stats.largest = Some((name.to_string(), instructions));
        }
    }

    pub fn record_spills(&self, count: usize) {
        self.stats.borrow_mut().spills_generated += count;
    }

    pub fn record_optimization(&self, removed: usize, tail_calls: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_removed += removed;
        stats.tail_calls += tail_calls;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub functions_compiled: usize,
    /// Final instructions across all functions.
    pub instructions_emitted: usize,
    /// Register values written to a slot to free their register.
    pub spills_generated: usize,
    /// Instructions dropped by the peephole optimizer.
    pub instructions_removed: usize,
    pub tail_calls: usize,
    /// Longest function so far with its instruction count.
    pub largest: Option<(String, usize)>,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} functions, {} instructions",
            self.functions_compiled, self.instructions_emitted
        )?;
        writeln!(
            f,
            "spills: {}, removed: {}, tail calls: {}",
            self.spills_generated, self.instructions_removed, self.tail_calls
        )?;
        if let Some((name, size)) = &self.largest {
            writeln!(f, "largest: {name} ({size} instructions)")?;
        }
        Ok(())
    }
}
