//! The string catalog: selects the Global String Table from the analyzer's
//! counters and assigns proto-string codes used by the sort, validate and
//! compile phases.

use ahash::AHashMap;

use super::stats::{StringStats, MIN_PROTO_STRING_USAGE};
use crate::build::settings::IndexedKey;

/// The reserved head of every Global String Table. Code 0 must be the
/// empty string; the rest are wired into the tag encoding.
pub const CORE_STRINGS: [&str; 5] = ["", "no", "yes", "outer", "inner"];

/// Global string codes above this cannot be used for keys.
pub const MAX_COMMON_KEY: u32 = 8191;
/// Global string codes above this cannot be used for roles.
pub const MAX_COMMON_ROLE: u32 = 32767;
/// Highest global string code overall (16-bit, minus reserved values).
pub const MAX_GLOBAL_STRING_CODE: u32 = (1 << 16) - 3;

const MAX_MIXED_STRINGS: usize = 512;
const MAX_KEY_STRINGS: usize = 1 << 13;

/// A resolved proto-string: either a global-string code or one of the
/// catalog's own literal strings.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StringRef {
    Global(u16),
    Literal(u32),
}

/// Per-string pair of proto codes, `None` when the string is too rare to
/// have earned a code in the respective table.
#[derive(Copy, Clone, Default, Debug)]
pub struct ProtoStringPair {
    pub key: Option<u32>,
    pub value: Option<u32>,
}

#[derive(Default)]
struct Entry {
    string: String,
    total: u64,
    keys: u64,
    values: u64,
    global_code: Option<u16>,
    key_code: Option<u32>,
    value_code: Option<u32>,
}

#[derive(Default)]
pub struct StringCatalog {
    entries: Vec<Entry>,
    lookup: AHashMap<String, u32>,
    /// entry index per global code
    global: Vec<u32>,
    /// proto code -> StringRef, for keys and values respectively
    key_refs: Vec<StringRef>,
    value_refs: Vec<StringRef>,
}

impl StringCatalog {
    /// Build from the aggregated counters. Counter order decides ties, so
    /// a fixed worker count and block schedule reproduces the same table.
    pub fn build(
        &mut self,
        stats: &StringStats,
        indexed_keys: &[IndexedKey],
        max_strings: usize,
        min_string_usage: u64,
    ) {
        debug_assert!(self.entries.is_empty());
        let min_key_value_usage = MIN_PROTO_STRING_USAGE / 2;

        for c in stats.iter() {
            if c.total < MIN_PROTO_STRING_USAGE && !c.required {
                continue;
            }
            let idx = self.entries.len() as u32;
            self.lookup.insert(c.string.to_string(), idx);
            self.entries.push(Entry {
                string: c.string.to_string(),
                total: c.total,
                keys: c.keys,
                values: c.values(),
                ..Default::default()
            });
        }

        let mut sorted_total: Vec<u32> = (0..self.entries.len() as u32).collect();
        sorted_total.sort_by_key(|&i| std::cmp::Reverse(self.entries[i as usize].total));
        let mut sorted_keys: Vec<u32> = (0..self.entries.len() as u32)
            .filter(|&i| self.entries[i as usize].keys >= min_key_value_usage)
            .collect();
        sorted_keys.sort_by_key(|&i| std::cmp::Reverse(self.entries[i as usize].keys));
        let mut sorted_values: Vec<u32> = (0..self.entries.len() as u32)
            .filter(|&i| self.entries[i as usize].values >= min_key_value_usage)
            .collect();
        sorted_values.sort_by_key(|&i| std::cmp::Reverse(self.entries[i as usize].values));

        // Global string table: core strings, then indexed keys, then the
        // most-used strings (mixed, then keys only, then the rest).
        // `max_strings` budgets the tail beyond the reserved head.
        let max_strings = (CORE_STRINGS.len() + indexed_keys.len() + max_strings)
            .min(MAX_GLOBAL_STRING_CODE as usize + 1);
        for s in CORE_STRINGS {
            let idx = self.ensure_entry(s);
            self.add_global(idx, true);
        }
        for key in indexed_keys {
            let idx = self.ensure_entry(&key.key);
            self.add_global(idx, true);
        }

        let max_mixed = MAX_MIXED_STRINGS.min(max_strings);
        let mut it = sorted_total.iter().copied().peekable();
        while let Some(&idx) = it.peek() {
            if self.global.len() >= max_mixed
                || self.entries[idx as usize].total < min_string_usage
            {
                break;
            }
            self.add_global(idx, false);
            it.next();
        }

        let max_keys = MAX_KEY_STRINGS.min(max_strings);
        for &idx in &sorted_keys {
            if self.global.len() >= max_keys {
                break;
            }
            if self.entries[idx as usize].keys >= min_string_usage {
                self.add_global(idx, false);
            }
        }

        for idx in it {
            if self.global.len() >= max_strings {
                break;
            }
            if self.entries[idx as usize].total >= min_string_usage {
                self.add_global(idx, false);
            }
        }

        // Proto-string codes, in descending frequency so the most common
        // strings get the shortest varints.
        self.key_refs = Vec::with_capacity(sorted_keys.len());
        for (pos, &idx) in sorted_keys.iter().enumerate() {
            self.entries[idx as usize].key_code = Some(pos as u32);
            self.key_refs.push(self.make_ref(idx, MAX_COMMON_KEY));
        }
        self.value_refs = Vec::with_capacity(sorted_values.len());
        for (pos, &idx) in sorted_values.iter().enumerate() {
            self.entries[idx as usize].value_code = Some(pos as u32);
            self.value_refs.push(self.make_ref(idx, MAX_GLOBAL_STRING_CODE));
        }
    }

    fn ensure_entry(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.lookup.get(s) {
            return idx;
        }
        let idx = self.entries.len() as u32;
        self.lookup.insert(s.to_string(), idx);
        self.entries.push(Entry { string: s.to_string(), ..Default::default() });
        idx
    }

    fn add_global(&mut self, idx: u32, force: bool) {
        let entry = &self.entries[idx as usize];
        if entry.global_code.is_some() {
            return;
        }
        // Narrow numbers encode in two bytes as numeric tag values; giving
        // them a global code would waste table space.
        if !force && is_narrow_number(&entry.string) {
            return;
        }
        let code = self.global.len() as u16;
        self.entries[idx as usize].global_code = Some(code);
        self.global.push(idx);
    }

    fn make_ref(&self, idx: u32, max_global: u32) -> StringRef {
        match self.entries[idx as usize].global_code {
            Some(code) if (code as u32) <= max_global => StringRef::Global(code),
            _ => StringRef::Literal(idx),
        }
    }

    /// Number of strings in the Global String Table.
    pub fn global_count(&self) -> usize {
        self.global.len()
    }

    pub fn global_string(&self, code: u16) -> &str {
        &self.entries[self.global[code as usize] as usize].string
    }

    pub fn global_code_of(&self, s: &str) -> Option<u16> {
        self.lookup.get(s).and_then(|&idx| self.entries[idx as usize].global_code)
    }

    /// Proto codes for a literal string (used by the sorter to encode tags).
    pub fn proto_pair(&self, s: &str) -> ProtoStringPair {
        match self.lookup.get(s) {
            None => ProtoStringPair::default(),
            Some(&idx) => {
                let e = &self.entries[idx as usize];
                ProtoStringPair { key: e.key_code, value: e.value_code }
            }
        }
    }

    /// Resolve a key proto code (used by the compiler).
    pub fn key_ref(&self, proto_code: u32) -> StringRef {
        self.key_refs[proto_code as usize]
    }

    /// Resolve a value proto code.
    pub fn value_ref(&self, proto_code: u32) -> StringRef {
        self.value_refs[proto_code as usize]
    }

    /// Resolve a role: roles share the value table, but only low global
    /// codes are usable as roles, so high ones fall back to literals.
    pub fn role_ref(&self, proto_code: u32) -> StringRef {
        match self.value_refs[proto_code as usize] {
            StringRef::Global(code) if code as u32 > MAX_COMMON_ROLE => {
                StringRef::Literal(self.global[code as usize])
            }
            r => r,
        }
    }

    pub fn resolve(&self, r: StringRef) -> &str {
        match r {
            StringRef::Global(code) => self.global_string(code),
            StringRef::Literal(idx) => &self.entries[idx as usize].string,
        }
    }

    /// Serialize the GST: `u16` count, then varint-length-prefixed strings.
    pub fn serialize_global_table(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.global.len() as u16).to_le_bytes());
        for &idx in &self.global {
            let s = &self.entries[idx as usize].string;
            crate::common::varint::write_varint(&mut out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        out
    }
}

/// True for strings that are canonical decimal integers within the
/// two-byte narrow numeric tag range.
fn is_narrow_number(s: &str) -> bool {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || digits.len() > 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return false;
    }
    let v: i64 = digits.parse().unwrap();
    let v = if neg { -v } else { v };
    (-256..=65279).contains(&v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(keys: &[&str]) -> Vec<IndexedKey> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| IndexedKey { key: k.to_string(), category: i as u32 + 1 })
            .collect()
    }

    fn stats_with(counts: &[(&str, u64, u64)]) -> StringStats {
        let mut stats = StringStats::new(1 << 14, 1 << 22);
        for s in CORE_STRINGS {
            stats.add_required(s);
        }
        for &(s, keys, values) in counts {
            let ofs = stats.counter(s).unwrap();
            stats.add(ofs, keys, values);
        }
        stats
    }

    #[test]
    fn core_strings_come_first_then_indexed_keys() {
        let stats = stats_with(&[("highway", 5000, 0), ("residential", 0, 4000)]);
        let mut cat = StringCatalog::default();
        let keys = indexed(&["highway", "building"]);
        cat.build(&stats, &keys, 1000, 300);
        for (i, s) in CORE_STRINGS.iter().enumerate() {
            assert_eq!(cat.global_string(i as u16), *s);
        }
        assert_eq!(cat.global_string(5), "highway");
        assert_eq!(cat.global_string(6), "building");
        assert_eq!(cat.global_code_of("residential"), Some(7));
    }

    #[test]
    fn rare_strings_get_no_proto_code() {
        let stats = stats_with(&[("highway", 5000, 0), ("scarce", 30, 30)]);
        let mut cat = StringCatalog::default();
        cat.build(&stats, &[], 1000, 300);
        assert!(cat.proto_pair("highway").key.is_some());
        assert!(cat.proto_pair("highway").value.is_none()); // never used as value
        assert!(cat.proto_pair("scarce").key.is_none());
        assert!(cat.proto_pair("nonexistent").key.is_none());
    }

    #[test]
    fn proto_codes_resolve_back_to_strings() {
        let stats = stats_with(&[
            ("highway", 9000, 0),
            ("name", 8000, 0),
            ("unclassified", 0, 7000),
        ]);
        let mut cat = StringCatalog::default();
        cat.build(&stats, &[], 1000, 300);
        let hw = cat.proto_pair("highway").key.unwrap();
        assert_eq!(cat.resolve(cat.key_ref(hw)), "highway");
        let un = cat.proto_pair("unclassified").value.unwrap();
        assert_eq!(cat.resolve(cat.value_ref(un)), "unclassified");
        // most frequent key gets code 0
        assert_eq!(hw, 0);
        assert_eq!(cat.proto_pair("name").key.unwrap(), 1);
    }

    #[test]
    fn narrow_numbers_stay_out_of_the_table() {
        let stats = stats_with(&[("42", 0, 90_000), ("-300", 0, 80_000), ("70000", 0, 70_000)]);
        let mut cat = StringCatalog::default();
        cat.build(&stats, &[], 1000, 300);
        assert_eq!(cat.global_code_of("42"), None);
        // out-of-range numbers are regular strings
        assert!(cat.global_code_of("-300").is_some());
        assert!(cat.global_code_of("70000").is_some());
        // a narrow number still gets a value proto code, as a literal
        let code = cat.proto_pair("42").value.unwrap();
        assert_eq!(cat.value_ref(code), StringRef::Literal(cat.lookup["42"]));
    }

    #[test]
    fn narrow_number_detection() {
        for s in ["0", "1", "42", "65279", "-1", "-256"] {
            assert!(is_narrow_number(s), "{s}");
        }
        for s in ["", "007", "-0", "65280", "-257", "4.5", "1e3", "+1", "abc"] {
            assert!(!is_narrow_number(s), "{s}");
        }
    }

    #[test]
    fn table_size_is_capped() {
        let counts: Vec<(String, u64, u64)> =
            (0..500).map(|i| (format!("key-{i:03}"), 1000 + (500 - i), 0)).collect();
        let borrowed: Vec<(&str, u64, u64)> =
            counts.iter().map(|(s, k, v)| (s.as_str(), *k, *v)).collect();
        let stats = stats_with(&borrowed);
        let mut cat = StringCatalog::default();
        cat.build(&stats, &[], 300, 2);
        // the cap budgets the strings beyond the reserved head
        assert_eq!(cat.global_count(), CORE_STRINGS.len() + 300);
        // the most frequent keys made it in
        assert!(cat.global_code_of("key-000").is_some());
        assert!(cat.global_code_of("key-299").is_some());
        assert_eq!(cat.global_code_of("key-400"), None);
        // keys pushed out of the GST still carry proto codes
        assert!(cat.proto_pair("key-499").key.is_some());
    }
}
