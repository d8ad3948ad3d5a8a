//! Append-only trace sink.
//!
//! Fixed-column text, one line per event, flushed as it goes:
//!
//! ```text
//! ACTION    :                 SYMBOL / ADDRESS : FREEFORM
//! ```
//!
//! Addresses are symbolicated against the loaded image plus any extra
//! symbol files. Categories toggle individually at runtime.

use std::io::Write;

use format_elf::SymbolStore;

use crate::cpu::AccessWidth;

/// Which categories are currently being cut.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceCategories {
    pub memory: bool,
    pub instructions: bool,
    pub jumps: bool,
    pub exceptions: bool,
    pub io: bool,
}

pub struct Trace {
    out: Box<dyn Write>,
    categories: TraceCategories,
    symbols: SymbolStore,
}

impl Trace {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            categories: TraceCategories::default(),
            symbols: SymbolStore::new(),
        }
    }

    /// Fold in symbols for address annotation.
    pub fn add_symbols(&mut self, symbols: SymbolStore) {
        self.symbols.merge(symbols);
    }

    #[must_use]
    pub fn categories(&self) -> TraceCategories {
        self.categories
    }

    pub fn categories_mut(&mut self) -> &mut TraceCategories {
        &mut self.categories
    }

    /// Toggle a category by name. Returns false for an unknown name.
    pub fn enable(&mut self, what: &str, on: bool) -> bool {
        match what {
            "memory" => self.categories.memory = on,
            "instructions" => self.categories.instructions = on,
            "jumps" => self.categories.jumps = on,
            "exceptions" => self.categories.exceptions = on,
            "io" => self.categories.io = on,
            "everything" => {
                self.categories = TraceCategories {
                    memory: on,
                    instructions: on,
                    jumps: on,
                    exceptions: on,
                    io: on,
                };
            }
            _ => return false,
        }
        true
    }

    /// Cut one trace line. Output failures are best-effort ignored.
    pub fn line(&mut self, action: &str, address: Option<u32>, info: &str) {
        let afield = match address {
            Some(addr) => match self.symbols.lookup(addr) {
                Some(name) => format!("{name} / {addr:#010x}"),
                None => format!("{addr:#010x}"),
            },
            None => String::new(),
        };
        let _ = writeln!(self.out, "{action:<10}: {afield:>40} : {}", info.trim());
        let _ = self.out.flush();
    }

    /// Diagnostic line, also mirrored to stdout.
    pub fn log(&mut self, msg: &str) {
        println!("{msg}");
        self.line("LOG", None, msg);
    }

    #[must_use]
    pub fn symbols(&self) -> &SymbolStore {
        &self.symbols
    }
}

/// Format a bus value to its access width.
#[must_use]
pub fn format_value(width: AccessWidth, value: u32) -> String {
    match width {
        AccessWidth::Byte => format!("{value:#04x}"),
        AccessWidth::Word => format!("{value:#06x}"),
        AccessWidth::Long => format!("{value:#010x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use format_elf::Symbol;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Trace, SharedBuf) {
        let buf = SharedBuf::default();
        (Trace::new(Box::new(buf.clone())), buf)
    }

    #[test]
    fn line_format_columns() {
        let (mut trace, buf) = capture();
        trace.line("DEV_READ", Some(0xFF0001), "uart.SR -> 0x02");
        let text = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
        assert!(text.starts_with("DEV_READ  : "), "action padded to 10: {text}");
        assert!(text.ends_with("0x00ff0001 : uart.SR -> 0x02\n"), "got: {text}");
        let afield = text.split(':').nth(1).expect("address column");
        assert_eq!(afield.len(), 42, "address column is 40 wide plus separators");
    }

    #[test]
    fn addresses_symbolicate() {
        let (mut trace, buf) = capture();
        let mut store = SymbolStore::new();
        store.insert(Symbol { name: "main".into(), address: 0x400, size: 0x10 });
        trace.add_symbols(store);
        trace.line("JUMP", Some(0x404), "");
        let text = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
        assert!(text.contains("main+0x4 / 0x00000404"), "got: {text}");
    }

    #[test]
    fn category_toggles() {
        let (mut trace, _) = capture();
        assert!(trace.enable("memory", true));
        assert!(trace.categories().memory);
        assert!(trace.enable("everything", true));
        assert!(trace.categories().instructions && trace.categories().io);
        assert!(trace.enable("everything", false));
        assert!(!trace.categories().memory);
        assert!(!trace.enable("bogus", true));
    }

    #[test]
    fn log_cuts_a_trace_line() {
        let (mut trace, buf) = capture();
        trace.log("8000 cycles in 0.001 seconds, 8000000 cps");
        let text = String::from_utf8(buf.0.borrow().clone()).expect("utf8");
        assert!(text.starts_with("LOG"), "got: {text}");
        assert!(text.ends_with("8000 cycles in 0.001 seconds, 8000000 cps\n"), "got: {text}");
    }

    #[test]
    fn value_formats_follow_width() {
        assert_eq!(format_value(AccessWidth::Byte, 0x5), "0x05");
        assert_eq!(format_value(AccessWidth::Word, 0x5), "0x0005");
        assert_eq!(format_value(AccessWidth::Long, 0x5), "0x00000005");
    }
}
