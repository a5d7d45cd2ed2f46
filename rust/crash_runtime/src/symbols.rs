//! Debug symbol lookup for script code addresses.
//!
//! Symbol files are produced by the script compiler; this crate only consumes
//! them through [`SymbolTable`].  [`SymbolMap`] is the in-memory table used by
//! the default [`SidecarSymbolLoader`], which reads a JSON document stored
//! next to the script file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::ScriptVm;
use crate::memory::UCell;

/// Source position of a code address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Lookup service answering symbol queries for one script.
pub trait SymbolTable {
    fn function_name_at(&self, address: UCell) -> Option<String>;

    fn line_at(&self, address: UCell) -> Option<SourceLocation>;

    /// Start of the tightest function enclosing `address`; `address` itself
    /// when no function covers it.
    fn entry_address_of(&self, address: UCell) -> UCell;
}

/// Loads symbol tables for script files.
pub trait SymbolLoader {
    fn is_debug_info_present(&self, vm: &dyn ScriptVm) -> bool {
        vm.has_debug_info()
    }

    fn load(&self, script: &Path) -> Result<Box<dyn SymbolTable>, SymbolError>;
}

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("failed to read symbol file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse symbol file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Function covering the code range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    pub name: String,
    pub start: UCell,
    pub end: UCell,
}

impl FunctionSymbol {
    fn contains(&self, address: UCell) -> bool {
        self.start <= address && address < self.end
    }
}

/// Line-table row: code at `address` and above belongs to `file:line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub address: UCell,
    pub file: String,
    pub line: u32,
}

/// Serialisable symbol table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMap {
    #[serde(default)]
    functions: Vec<FunctionSymbol>,
    #[serde(default)]
    lines: Vec<LineEntry>,
}

impl SymbolMap {
    pub fn new(functions: Vec<FunctionSymbol>, mut lines: Vec<LineEntry>) -> Self {
        lines.sort_by_key(|entry| entry.address);
        Self { functions, lines }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let map: SymbolMap = serde_json::from_str(text)?;
        Ok(Self::new(map.functions, map.lines))
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    /// Nested ranges are legal (local blocks, inlined helpers); the
    /// narrowest one wins.
    fn enclosing(&self, address: UCell) -> Option<&FunctionSymbol> {
        self.functions
            .iter()
            .filter(|function| function.contains(address))
            .min_by_key(|function| function.end - function.start)
    }
}

impl SymbolTable for SymbolMap {
    fn function_name_at(&self, address: UCell) -> Option<String> {
        self.enclosing(address).map(|function| function.name.clone())
    }

    fn line_at(&self, address: UCell) -> Option<SourceLocation> {
        let upper = self.lines.partition_point(|entry| entry.address <= address);
        let entry = self.lines.get(upper.checked_sub(1)?)?;
        Some(SourceLocation {
            file: entry.file.clone(),
            line: entry.line,
        })
    }

    fn entry_address_of(&self, address: UCell) -> UCell {
        self.enclosing(address)
            .map(|function| function.start)
            .unwrap_or(address)
    }
}

/// Reads `<script stem>.sym.json` from the script's directory.
#[derive(Debug, Clone)]
pub struct SidecarSymbolLoader {
    extension: String,
}

impl SidecarSymbolLoader {
    pub const DEFAULT_EXTENSION: &'static str = "sym.json";

    pub fn new() -> Self {
        Self::with_extension(Self::DEFAULT_EXTENSION)
    }

    pub fn with_extension(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    pub fn sidecar_path(&self, script: &Path) -> PathBuf {
        script.with_extension(&self.extension)
    }
}

impl Default for SidecarSymbolLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolLoader for SidecarSymbolLoader {
    fn load(&self, script: &Path) -> Result<Box<dyn SymbolTable>, SymbolError> {
        let path = self.sidecar_path(script);
        let text = fs::read_to_string(&path).map_err(|source| SymbolError::Io {
            path: path.clone(),
            source,
        })?;
        let map = SymbolMap::from_json(&text).map_err(|source| SymbolError::Parse { path, source })?;
        Ok(Box::new(map))
    }
}
