//! Symbol store with exact-name and address→best-match lookup.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
    pub size: u32,
}

/// Symbols keyed both by unique name and by (multi-valued) address.
///
/// The same address can bear several aliases; lookups report them
/// comma-joined. Address lookups inside a sized symbol report
/// `name+0xoffset`.
#[derive(Default)]
pub struct SymbolStore {
    by_name: HashMap<String, (u32, u32)>,
    by_addr: BTreeMap<u32, Vec<(String, u32)>>,
}

impl SymbolStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: Symbol) {
        self.by_name
            .insert(symbol.name.clone(), (symbol.address, symbol.size));
        self.by_addr
            .entry(symbol.address)
            .or_default()
            .push((symbol.name, symbol.size));
    }

    /// Fold another store into this one (extra `--symbols` files).
    pub fn merge(&mut self, other: SymbolStore) {
        for (address, entries) in other.by_addr {
            for (name, size) in entries {
                self.insert(Symbol { name, address, size });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    /// Exact name lookup: `(address, size)`.
    pub fn address_of(&self, name: &str) -> Option<(u32, u32)> {
        self.by_name.get(name).copied()
    }

    /// Best name(s) for an address.
    ///
    /// An exact hit returns the comma-joined aliases at that address.
    /// Otherwise the greatest symbol address `s <= addr` is found and every
    /// symbol there whose size covers `addr` is reported as `name+0xoff`.
    pub fn lookup(&self, addr: u32) -> Option<String> {
        if let Some(entries) = self.by_addr.get(&addr) {
            let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
            return Some(names.join(","));
        }
        let (&base, entries) = self.by_addr.range(..=addr).next_back()?;
        let delta = addr - base;
        let names: Vec<String> = entries
            .iter()
            .filter(|(_, size)| delta < *size)
            .map(|(name, _)| format!("{name}+{delta:#x}"))
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SymbolStore {
        let mut s = SymbolStore::new();
        s.insert(Symbol { name: "_start".into(), address: 0x400, size: 0x20 });
        s.insert(Symbol { name: "main".into(), address: 0x420, size: 0x100 });
        s.insert(Symbol { name: "buffer".into(), address: 0x1000, size: 0 });
        s
    }

    #[test]
    fn exact_lookup() {
        assert_eq!(store().lookup(0x420).as_deref(), Some("main"));
    }

    #[test]
    fn offset_lookup_within_size() {
        assert_eq!(store().lookup(0x421).as_deref(), Some("main+0x1"));
        assert_eq!(store().lookup(0x51F).as_deref(), Some("main+0xff"));
    }

    #[test]
    fn lookup_past_symbol_end_misses() {
        assert_eq!(store().lookup(0x520), None);
    }

    #[test]
    fn lookup_below_everything_misses() {
        assert_eq!(store().lookup(0x100), None);
    }

    #[test]
    fn zero_sized_symbol_matches_exactly_only() {
        let s = store();
        assert_eq!(s.lookup(0x1000).as_deref(), Some("buffer"));
        assert_eq!(s.lookup(0x1001), None);
    }

    #[test]
    fn aliases_join_with_commas() {
        let mut s = store();
        s.insert(Symbol { name: "start_alias".into(), address: 0x400, size: 0x20 });
        let joined = s.lookup(0x400).expect("hit");
        assert!(joined.contains("_start") && joined.contains("start_alias"));
        assert!(joined.contains(','));
    }

    #[test]
    fn name_lookup() {
        assert_eq!(store().address_of("main"), Some((0x420, 0x100)));
        assert_eq!(store().address_of("nope"), None);
    }

    #[test]
    fn merge_combines_stores() {
        let mut a = store();
        let mut b = SymbolStore::new();
        b.insert(Symbol { name: "extra".into(), address: 0x2000, size: 4 });
        a.merge(b);
        assert_eq!(a.lookup(0x2000).as_deref(), Some("extra"));
        assert_eq!(a.lookup(0x420).as_deref(), Some("main"));
    }
}
