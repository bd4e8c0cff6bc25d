use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Kernel text symbols sorted by address, for "which function contains this
/// address" queries.
///
/// All names live in one arena; `spans` indexes into it in the same order as
/// `addrs`.
#[derive(Debug, Default)]
pub struct SymbolTable {
    addrs: Vec<u64>,
    spans: Vec<(u32, u32)>,
    names: String,
}

/// Collects symbols while the listing is scanned. The map only exists to
/// drop aliases; it is thrown away by [`SymbolTableBuilder::finish`].
#[derive(Default)]
pub struct SymbolTableBuilder {
    by_addr: BTreeMap<u64, (u32, u32)>,
    names: String,
}

#[inline]
fn is_text_symbol(kind: char) -> bool {
    kind == 't' || kind == 'T'
}

impl SymbolTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one listing record. Non-text symbols and later aliases of an
    /// already known address are ignored. Returns whether the symbol was kept.
    pub fn add(&mut self, addr: u64, kind: char, name: &str) -> bool {
        if !is_text_symbol(kind) || self.by_addr.contains_key(&addr) {
            return false;
        }
        let start = self.names.len() as u32;
        self.names.push_str(name);
        self.by_addr.insert(addr, (start, name.len() as u32));
        true
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn finish(self) -> SymbolTable {
        let mut addrs = Vec::with_capacity(self.by_addr.len());
        let mut spans = Vec::with_capacity(self.by_addr.len());
        for (addr, span) in self.by_addr {
            addrs.push(addr);
            spans.push(span);
        }
        let mut names = self.names;
        names.shrink_to_fit();
        SymbolTable {
            addrs,
            spans,
            names,
        }
    }
}

/// Parse a single `<hex address> <type> <name> [module]` line.
fn parse_kallsyms_line(line: &str) -> Option<(u64, char, &str)> {
    let mut fields = line.split_whitespace();
    let addr = u64::from_str_radix(fields.next()?, 16).ok()?;
    let mut kind = fields.next()?.chars();
    let ty = kind.next()?;
    if kind.next().is_some() {
        return None;
    }
    let name = fields.next()?;
    Some((addr, ty, name))
}

impl SymbolTable {
    /// Build a table from `(address, type, name)` records.
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = (u64, char, &'a str)>,
    {
        let mut builder = SymbolTableBuilder::new();
        for (addr, kind, name) in records {
            builder.add(addr, kind, name);
        }
        builder.finish()
    }

    /// Build a table from a kallsyms style listing. Unparsable lines are
    /// skipped.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut builder = SymbolTableBuilder::new();
        for line in reader.lines() {
            let line = line.context("Failed to read symbol listing")?;
            match parse_kallsyms_line(&line) {
                Some((addr, kind, name)) => {
                    builder.add(addr, kind, name);
                }
                None => tracing::warn!("Failed to parse symbol line: {}", line),
            }
        }
        Ok(builder.finish())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    fn name_at(&self, idx: usize) -> &str {
        let (start, len) = self.spans[idx];
        &self.names[start as usize..(start + len) as usize]
    }

    /// Find the symbol with the greatest address not above `addr`, returning
    /// its start address and name.
    pub fn lookup_entry(&self, addr: u64) -> Option<(u64, &str)> {
        // Index of the first symbol strictly above addr.
        let idx = self.addrs.partition_point(|&a| a <= addr);
        if idx == 0 {
            return None;
        }
        Some((self.addrs[idx - 1], self.name_at(idx - 1)))
    }

    pub fn lookup(&self, addr: u64) -> Option<&str> {
        self.lookup_entry(addr).map(|(_, name)| name)
    }
}
