//! Read-only view over a script VM's memory image.
//!
//! The VM owns its memory; diagnostics only ever read it, usually while the
//! VM is in a broken state.  Every access therefore goes through validated
//! offset arithmetic on a byte slice: an address that falls outside the
//! image, or a frame pointer outside the stack, produces `None` instead of a
//! panic or an out-of-bounds read.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Signed VM cell.
pub type Cell = i32;
/// Unsigned VM cell, used for code addresses and hex dumps.
pub type UCell = u32;

/// Size of one cell in bytes.
pub const CELL_SIZE: Cell = 4;

/// Segment offsets taken from the image header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// Byte offset of the code segment from the image base.
    pub code_offset: usize,
    /// Byte offset of the data segment (data, heap and stack) from the base.
    pub data_offset: usize,
}

/// Snapshot of the VM registers relevant to diagnostics.
///
/// Code addresses (`cip`) are relative to the code segment, all other
/// pointers are relative to the data segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// Instruction pointer.
    pub cip: Cell,
    /// Frame pointer.
    pub frm: Cell,
    /// Stack pointer.
    pub stk: Cell,
    /// Heap pointer.
    pub hea: Cell,
    /// Heap low-water mark (bottom of the heap).
    pub hlw: Cell,
    /// Stack top.
    pub stp: Cell,
    /// Primary register.
    pub pri: Cell,
}

impl Registers {
    /// Region in which frames of the current call chain may live.
    pub fn stack_region(&self) -> StackRegion {
        StackRegion {
            low: self.stk,
            high: self.stp,
        }
    }
}

/// Live stack bounds `[low, high)`; the stack grows toward `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub low: Cell,
    pub high: Cell,
}

impl StackRegion {
    /// A frame needs room for the saved frame pointer and the return address.
    pub fn holds_frame(&self, frame: Cell) -> bool {
        match frame.checked_add(2 * CELL_SIZE) {
            Some(end) => frame >= self.low && end <= self.high,
            None => false,
        }
    }
}

/// Borrowed memory image of one VM instance.
#[derive(Debug, Clone, Copy)]
pub struct MemoryImage<'a> {
    bytes: &'a [u8],
    header: ImageHeader,
}

impl<'a> MemoryImage<'a> {
    pub fn new(bytes: &'a [u8], header: ImageHeader) -> Self {
        Self { bytes, header }
    }

    pub fn header(&self) -> ImageHeader {
        self.header
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Bytes of the code segment, or an empty slice for a malformed header.
    pub fn code_segment(&self) -> &'a [u8] {
        self.bytes.get(self.code_range()).unwrap_or(&[])
    }

    /// Read the cell at `address` in the code segment.
    pub fn code_cell(&self, address: Cell) -> Option<Cell> {
        let range = self.code_range();
        let offset = range.start.checked_add(usize::try_from(address).ok()?)?;
        if offset.checked_add(CELL_SIZE as usize)? > range.end {
            return None;
        }
        self.read_cell(offset)
    }

    /// Read the cell at `address` in the data segment (data, heap or stack).
    pub fn data_cell(&self, address: Cell) -> Option<Cell> {
        let offset = self
            .header
            .data_offset
            .checked_add(usize::try_from(address).ok()?)?;
        self.read_cell(offset)
    }

    fn code_range(&self) -> Range<usize> {
        let start = self.header.code_offset.min(self.bytes.len());
        let end = self.header.data_offset.clamp(start, self.bytes.len());
        start..end
    }

    fn read_cell(&self, offset: usize) -> Option<Cell> {
        let end = offset.checked_add(CELL_SIZE as usize)?;
        let raw: [u8; 4] = self.bytes.get(offset..end)?.try_into().ok()?;
        Some(Cell::from_le_bytes(raw))
    }
}
