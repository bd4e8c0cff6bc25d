use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

pub const LATENCYTOP_TRANS_PATH: &str = "/usr/share/latencytop/latencytop.trans";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub prio: i32,
    pub text: String,
}

/// Friendly names for well known kernel functions, in latencytop.trans format:
/// `<prio> <symbol> <translation...>`.
#[derive(Debug, Default)]
pub struct LatTranslator {
    symbols: HashMap<String, Translation>,
}

fn parse_trans_line(line: &str) -> Option<(i32, &str, &str)> {
    let line = line.trim_start();
    let (prio, rest) = line.split_once(char::is_whitespace)?;
    let prio = prio.parse().ok()?;
    let rest = rest.trim_start();
    let (symbol, text) = rest.split_once(char::is_whitespace)?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some((prio, symbol, text))
}

impl LatTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut translator = LatTranslator::new();
        for line in reader.lines() {
            let line = line.context("Failed to read translations")?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            match parse_trans_line(&line) {
                Some((prio, symbol, text)) => translator.insert(prio, symbol, text),
                None => tracing::warn!("Failed to parse line, ignoring: {}", line),
            }
        }
        Ok(translator)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Add a translation. The first definition of a symbol is kept.
    pub fn insert(&mut self, prio: i32, symbol: &str, text: &str) {
        self.symbols
            .entry(symbol.to_string())
            .or_insert_with(|| Translation {
                prio,
                text: text.to_string(),
            });
    }

    pub fn lookup(&self, symbol: &str) -> Option<&Translation> {
        self.symbols.get(symbol)
    }

    /// Translation of the highest priority symbol in a rendered stack
    /// (space separated function names). Ties go to the innermost frame.
    pub fn translate_stack(&self, rendered: &str) -> Option<&str> {
        let mut best: Option<&Translation> = None;
        for symbol in rendered.split(' ') {
            if let Some(trans) = self.lookup(symbol) {
                if best.map_or(true, |b| trans.prio > b.prio) {
                    best = Some(trans);
                }
            }
        }
        best.map(|t| t.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const TRANS: &str = "\
# comment line

1\tvfs_read\t\tReading from file
1\tvfs_write\t\tWriting to file
3\tfsync_buffers_list\tFsync
5\text4_sync_file\t\text4 fsync
2 vfs_read Duplicate reading
bogus line here
";

    #[test]
    fn test_parse() {
        let t = LatTranslator::from_reader(Cursor::new(TRANS)).unwrap();
        assert_eq!(t.len(), 4);
        assert_eq!(
            t.lookup("vfs_read"),
            Some(&Translation {
                prio: 1,
                text: "Reading from file".to_string()
            })
        );
    }

    #[test]
    fn test_translate_picks_highest_prio() {
        let t = LatTranslator::from_reader(Cursor::new(TRANS)).unwrap();
        assert_eq!(
            t.translate_stack("schedule vfs_write ext4_sync_file sys_fsync"),
            Some("ext4 fsync")
        );
        assert_eq!(t.translate_stack("schedule vfs_read"), Some("Reading from file"));
        assert_eq!(t.translate_stack("schedule do_nanosleep"), None);
        assert_eq!(t.translate_stack(""), None);
    }

    #[test]
    fn test_ties_keep_first() {
        let t = LatTranslator::from_reader(Cursor::new(TRANS)).unwrap();
        assert_eq!(t.translate_stack("vfs_write vfs_read"), Some("Writing to file"));
    }
}
