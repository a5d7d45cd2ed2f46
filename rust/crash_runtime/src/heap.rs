//! Heap release validation.

use crate::memory::{Cell, Registers};

/// Live heap range `[low, high)`: from the heap low-water mark up to the
/// stack pointer. Anything a caller releases must come from inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBounds {
    pub low: Cell,
    pub high: Cell,
}

impl HeapBounds {
    pub fn new(low: Cell, high: Cell) -> Self {
        Self { low, high }
    }

    pub fn live(registers: &Registers) -> Self {
        Self::new(registers.hlw, registers.stk)
    }

    pub fn contains(&self, address: Cell) -> bool {
        address >= self.low && address < self.high
    }
}
