//! Common test utilities for lattop integration tests.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use lattop::lat_translator::LatTranslator;
use lattop::{ReportOptions, Session, SymbolTable};

/// Report sink that can be read back after the session consumed it.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub const KALLSYMS: &str = "\
ffffffff81000000 T _stext
ffffffff810a1000 t schedule
ffffffff810a2000 T io_schedule
ffffffff810b0000 T ext4_sync_file
ffffffff810c0000 d some_data
ffffffff810d0000 T do_nanosleep
";

#[allow(dead_code)]
pub const TRANSLATIONS: &str = "\
# prio symbol translation
1\tio_schedule\t\tWaiting for IO
5\text4_sync_file\t\text4 fsync
";

pub fn session_with(symbols: SymbolTable, translator: LatTranslator) -> (Session, SharedBuf) {
    let buf = SharedBuf::default();
    let session = Session::with_output(
        symbols,
        translator,
        ReportOptions::default(),
        Box::new(buf.clone()),
    );
    (session, buf)
}

#[allow(dead_code)]
pub fn empty_session() -> (Session, SharedBuf) {
    session_with(SymbolTable::default(), LatTranslator::new())
}
