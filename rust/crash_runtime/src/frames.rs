//! Script call-chain reconstruction from the frame-pointer chain.
//!
//! A frame at `fp` stores the caller's frame pointer at `fp` and the return
//! address into the caller at `fp + 4`.  A return address of zero marks a
//! frame entered directly from the host.  The walk starts from the live
//! `(cip, frm)` pair and follows saved frame pointers toward the stack top.

use std::fmt;

use crate::memory::{Cell, MemoryImage, StackRegion, UCell, CELL_SIZE};
use crate::symbols::{SourceLocation, SymbolTable};

/// Hard cap on frames yielded by a single walk.
pub const MAX_FRAMES: usize = 4096;

/// Symbol information attached to a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSymbol {
    pub function: String,
    pub location: Option<SourceLocation>,
}

/// One reconstructed script frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmFrame {
    pub frame_address: Cell,
    /// Resume point inside the function that owns this frame.
    pub return_address: Cell,
    /// Start of the function, when known.
    pub entry_address: Option<UCell>,
    pub symbol: Option<FrameSymbol>,
}

impl VmFrame {
    pub fn new(frame_address: Cell, return_address: Cell, symbols: Option<&dyn SymbolTable>) -> Self {
        let mut frame = Self {
            frame_address,
            return_address,
            entry_address: None,
            symbol: None,
        };
        if let Some(table) = symbols {
            let address = return_address as UCell;
            frame.entry_address = Some(table.entry_address_of(address));
            frame.symbol = table.function_name_at(address).map(|function| FrameSymbol {
                function,
                location: table.line_at(address),
            });
        }
        frame
    }

    /// Frame standing for an entrypoint that had not set up its own frame
    /// yet when the fault hit.
    pub fn at_entry(frame_address: Cell, entry: Option<UCell>, symbols: Option<&dyn SymbolTable>) -> Self {
        let mut frame = Self {
            frame_address,
            return_address: entry.map_or(0, |address| address as Cell),
            entry_address: entry,
            symbol: None,
        };
        if let (Some(table), Some(address)) = (symbols, entry) {
            frame.symbol = table.function_name_at(address).map(|function| FrameSymbol {
                function,
                location: table.line_at(address),
            });
        }
        frame
    }
}

/// Renders `<ret> in <function> ()`. Without symbols the function is the
/// hex entry address taken from the calling instruction, or from the
/// entrypoint for a segment's outermost frame; `??` when neither is known.
impl fmt::Display for VmFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x} in ", self.return_address as UCell)?;
        match (&self.symbol, self.entry_address) {
            (Some(symbol), _) => {
                write!(f, "{} ()", symbol.function)?;
                if let Some(location) = &symbol.location {
                    write!(f, " at {}:{}", location.file, location.line)?;
                }
                Ok(())
            }
            (None, Some(entry)) => write!(f, "{entry:08x} ()"),
            (None, None) => write!(f, "?? ()"),
        }
    }
}

/// Lazy walk over one instance's frame chain.
///
/// Each walker is consumed by iteration; create a new one to walk again.
pub struct FrameWalker<'a> {
    memory: MemoryImage<'a>,
    stack: StackRegion,
    symbols: Option<&'a dyn SymbolTable>,
    bound: Option<Cell>,
    next: Option<(Cell, Cell)>,
    yielded: usize,
}

impl<'a> FrameWalker<'a> {
    pub fn new(memory: MemoryImage<'a>, stack: StackRegion, ip: Cell, fp: Cell) -> Self {
        let next = (fp != 0 && stack.holds_frame(fp)).then_some((fp, ip));
        Self {
            memory,
            stack,
            symbols: None,
            bound: None,
            next,
            yielded: 0,
        }
    }

    pub fn with_symbols(mut self, symbols: Option<&'a dyn SymbolTable>) -> Self {
        self.symbols = symbols;
        self
    }

    /// Stop before reaching frames at or above `fp`, which belong to an
    /// enclosing script segment. Zero means unbounded.
    pub fn bounded_by(mut self, fp: Cell) -> Self {
        if fp != 0 {
            self.bound = Some(fp);
            if matches!(self.next, Some((current, _)) if current >= fp) {
                self.next = None;
            }
        }
        self
    }

    fn hop(&self, fp: Cell) -> Option<(Cell, Cell)> {
        let caller_fp = self.memory.data_cell(fp)?;
        let return_address = self.memory.data_cell(fp.checked_add(CELL_SIZE)?)?;
        if return_address == 0 || caller_fp == 0 || caller_fp <= fp {
            return None;
        }
        if !self.stack.holds_frame(caller_fp) {
            return None;
        }
        if self.bound.is_some_and(|bound| caller_fp >= bound) {
            return None;
        }
        Some((caller_fp, return_address))
    }

    /// Function entered by the CALL that created the frame at `fp`: the
    /// operand cell sits just below the saved return address.
    fn call_target(&self, fp: Cell) -> Option<UCell> {
        let return_address = self.memory.data_cell(fp.checked_add(CELL_SIZE)?)?;
        if return_address < 2 * CELL_SIZE {
            return None;
        }
        let target = self.memory.code_cell(return_address - CELL_SIZE)?;
        // Address zero holds the halt stub, never a callable function.
        let valid = target > 0 && target % CELL_SIZE == 0 && self.memory.code_cell(target).is_some();
        valid.then_some(target as UCell)
    }
}

impl Iterator for FrameWalker<'_> {
    type Item = VmFrame;

    fn next(&mut self) -> Option<VmFrame> {
        let (fp, ip) = self.next.take()?;
        if self.yielded >= MAX_FRAMES {
            return None;
        }
        self.yielded += 1;
        self.next = self.hop(fp);
        let mut frame = VmFrame::new(fp, ip, self.symbols);
        if frame.entry_address.is_none() {
            frame.entry_address = self.call_target(fp);
        }
        Some(frame)
    }
}
