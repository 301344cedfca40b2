//! Decides whether a closed way or a relation is an area, from
//! user-configurable rules of the form `key`, `key(v1,v2)` or
//! `key(except v1,v2)`.
//!
//! `area=` is definite for ways and `type=` is definite for relations:
//! when a definite tag is present, it alone decides for that feature
//! type, so `area=no` suppresses any general rule match on a way.

use ahash::AHashMap;
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Core GST code for "no"; a value of `no` never makes an area.
const GLOBAL_NO: u16 = 1;

pub const DEFAULT_AREA_RULES: &str = "\
    aeroway (except taxiway), \
    amenity, \
    area, \
    area:highway, \
    barrier (city_wall, ditch, hedge, retaining_wall, wall, spikes), \
    boundary, \
    building, \
    building:part, \
    craft, \
    golf, \
    highway (services, rest_area, escape, elevator), \
    historic, \
    indoor, \
    natural (except coastline, cliff, ridge, arete, tree_row), \
    landuse, \
    leisure, \
    man_made (except cutline, embankment, pipeline), \
    military, \
    office, \
    place, \
    power (plant, substation, generator, transformer), \
    public_transport, \
    railway (station, turntable, roundhouse, platform), \
    ruins, \
    shop, \
    tourism, \
    type (multipolygon, boundary), \
    waterway (riverbank, dock, boatyard, dam)";

/// One parsed rule, before string codes are known.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct AreaRule {
    pub key: String,
    pub mode: RuleMode,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum RuleMode {
    /// any value except `no`
    AcceptAll,
    /// only the listed values
    Only(Vec<String>),
    /// any value except `no` and the listed values
    Except(Vec<String>),
}

pub fn parse_area_rules(s: &str) -> Result<Vec<AreaRule>> {
    let mut rules = Vec::new();
    let mut p = Parser { rest: s };
    loop {
        p.skip_ws();
        if p.rest.is_empty() {
            break;
        }
        let key = p.identifier()?;
        ensure!(!key.is_empty(), "Expected tag key in area rules");
        p.skip_ws();
        let mode = if p.accept('(') {
            let mut values = Vec::new();
            let mut except = false;
            loop {
                p.skip_ws();
                let v = p.identifier()?;
                ensure!(!v.is_empty(), "Expected tag value in area rule for '{key}'");
                if v == "except" && values.is_empty() && !except {
                    except = true;
                    continue;
                }
                values.push(v);
                p.skip_ws();
                if !p.accept(',') {
                    break;
                }
            }
            p.skip_ws();
            ensure!(p.accept(')'), "Expected ')' in area rule for '{key}'");
            if except {
                RuleMode::Except(values)
            } else {
                RuleMode::Only(values)
            }
        } else {
            RuleMode::AcceptAll
        };
        rules.push(AreaRule { key, mode });
        p.skip_ws();
        if !p.accept(',') {
            break;
        }
    }
    p.skip_ws();
    ensure!(p.rest.is_empty(), "Trailing input in area rules: '{}'", p.rest);
    Ok(rules)
}

struct Parser<'a> {
    rest: &'a str,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn accept(&mut self, c: char) -> bool {
        if let Some(rest) = self.rest.strip_prefix(c) {
            self.rest = rest;
            true
        } else {
            false
        }
    }

    fn identifier(&mut self) -> Result<String> {
        let end = self
            .rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')))
            .unwrap_or(self.rest.len());
        if end == 0 && !self.rest.is_empty() {
            bail!("Unexpected character '{}' in area rules", &self.rest[..1]);
        }
        let (id, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(id.to_string())
    }
}

/// A tag key or value as the compiler sees it: a global-string code or a
/// local string.
#[derive(Copy, Clone, Debug)]
pub enum TagStr<'a> {
    Global(u16),
    Local(&'a str),
    /// numeric tag values never match area rules
    Number,
}

#[derive(Copy, Clone, Default, Debug, Eq, PartialEq)]
pub struct AreaFlags {
    pub way: bool,
    pub relation: bool,
}

struct CompiledRule {
    accept_all: bool,
    except: bool,
    definite_for_way: bool,
    definite_for_relation: bool,
    /// sorted ascending
    global_values: Vec<u16>,
    /// sorted reverse-alphabetically, the tag-table ordering
    local_values: Vec<String>,
}

impl CompiledRule {
    fn matches(&self, value: TagStr) -> bool {
        match value {
            TagStr::Global(GLOBAL_NO) => return false,
            TagStr::Local("no") => return false,
            TagStr::Number => return false,
            _ => {}
        }
        if self.accept_all {
            return true;
        }
        let listed = match value {
            TagStr::Global(code) => self.global_values.binary_search(&code).is_ok(),
            TagStr::Local(s) => self
                .local_values
                .binary_search_by(|v| v.as_str().cmp(s).reverse())
                .is_ok(),
            TagStr::Number => false,
        };
        listed != self.except
    }
}

/// The compiled classifier. Built once per build from the parsed rules
/// and the global-string lookup.
pub struct AreaClassifier {
    global_key_rules: AHashMap<u16, u32>,
    local_key_rules: AHashMap<String, u32>,
    rules: Vec<CompiledRule>,
}

impl AreaClassifier {
    pub fn compile(
        rules: &[AreaRule],
        global_code_of: impl Fn(&str) -> Option<u16>,
    ) -> AreaClassifier {
        let mut out = AreaClassifier {
            global_key_rules: AHashMap::new(),
            local_key_rules: AHashMap::new(),
            rules: Vec::with_capacity(rules.len()),
        };
        for rule in rules {
            let (accept_all, except, values) = match &rule.mode {
                RuleMode::AcceptAll => (true, false, &[][..]),
                RuleMode::Only(v) => (false, false, &v[..]),
                RuleMode::Except(v) => (false, true, &v[..]),
            };
            let mut compiled = CompiledRule {
                accept_all,
                except,
                definite_for_way: rule.key == "area",
                definite_for_relation: rule.key == "type",
                global_values: Vec::new(),
                local_values: Vec::new(),
            };
            for v in values {
                match global_code_of(v) {
                    Some(code) => compiled.global_values.push(code),
                    None => compiled.local_values.push(v.clone()),
                }
            }
            compiled.global_values.sort_unstable();
            compiled.local_values.sort_unstable_by(|a, b| b.cmp(a));
            let idx = out.rules.len() as u32;
            out.rules.push(compiled);
            match global_code_of(&rule.key) {
                Some(code) => {
                    out.global_key_rules.insert(code, idx);
                }
                None => {
                    out.local_key_rules.insert(rule.key.clone(), idx);
                }
            }
        }
        out
    }

    /// Classify one feature's tags, for ways and relations at once.
    pub fn classify<'a>(&self, tags: impl Iterator<Item = (TagStr<'a>, TagStr<'a>)>) -> AreaFlags {
        let mut general = false;
        let mut definite_way = false;
        let mut definite_relation = false;
        let mut seen_definite_way = false;
        let mut seen_definite_relation = false;
        for (key, value) in tags {
            let rule = match key {
                TagStr::Global(code) => self.global_key_rules.get(&code),
                TagStr::Local(s) => self.local_key_rules.get(s),
                TagStr::Number => None,
            };
            let Some(&idx) = rule else { continue };
            let rule = &self.rules[idx as usize];
            let matched = rule.matches(value);
            if rule.definite_for_way {
                seen_definite_way = true;
                definite_way |= matched;
            }
            if rule.definite_for_relation {
                seen_definite_relation = true;
                definite_relation |= matched;
            }
            general |= matched;
        }
        AreaFlags {
            way: if seen_definite_way { definite_way } else { general },
            relation: if seen_definite_relation { definite_relation } else { general },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_all_three_rule_forms() {
        let rules = parse_area_rules("building, waterway (riverbank, dock), natural (except coastline)")
            .unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], AreaRule { key: "building".into(), mode: RuleMode::AcceptAll });
        assert_eq!(
            rules[1],
            AreaRule {
                key: "waterway".into(),
                mode: RuleMode::Only(vec!["riverbank".into(), "dock".into()]),
            }
        );
        assert_eq!(
            rules[2],
            AreaRule {
                key: "natural".into(),
                mode: RuleMode::Except(vec!["coastline".into()]),
            }
        );
    }

    #[test]
    fn parser_accepts_the_default_rules() {
        let rules = parse_area_rules(DEFAULT_AREA_RULES).unwrap();
        assert_eq!(rules.len(), 28);
        assert!(rules.iter().any(|r| r.key == "type"));
    }

    #[test]
    fn parser_rejects_garbage() {
        assert!(parse_area_rules("building (").is_err());
        assert!(parse_area_rules("building ()").is_err());
        assert!(parse_area_rules("=x").is_err());
    }

    fn classifier(rules: &str) -> AreaClassifier {
        // no global strings: every key and value is local
        AreaClassifier::compile(&parse_area_rules(rules).unwrap(), |_| None)
    }

    fn tags<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Iterator<Item = (TagStr<'a>, TagStr<'a>)> {
        pairs.iter().map(|&(k, v)| (TagStr::Local(k), TagStr::Local(v)))
    }

    #[test]
    fn accept_all_and_value_lists() {
        let c = classifier("building, waterway (riverbank, dock), natural (except coastline)");
        assert_eq!(c.classify(tags(&[("building", "hut")])), AreaFlags { way: true, relation: true });
        assert_eq!(c.classify(tags(&[("building", "no")])), AreaFlags::default());
        assert_eq!(
            c.classify(tags(&[("waterway", "riverbank")])),
            AreaFlags { way: true, relation: true }
        );
        assert_eq!(c.classify(tags(&[("waterway", "river")])), AreaFlags::default());
        assert_eq!(c.classify(tags(&[("natural", "water")])), AreaFlags { way: true, relation: true });
        assert_eq!(c.classify(tags(&[("natural", "coastline")])), AreaFlags::default());
        assert_eq!(c.classify(tags(&[("highway", "primary")])), AreaFlags::default());
    }

    #[test]
    fn definite_keys_override_general_rules_per_type() {
        let c = classifier("building, area, type (multipolygon, boundary)");
        // area=no suppresses the building match, but only for ways
        let flags = c.classify(tags(&[("building", "yes"), ("area", "no")]));
        assert_eq!(flags, AreaFlags { way: false, relation: true });
        // area=yes alone makes a way an area
        let flags = c.classify(tags(&[("highway", "pedestrian"), ("area", "yes")]));
        assert_eq!(flags, AreaFlags { way: true, relation: true });
        // type=route is not an area relation, even with an area tag present
        let flags = c.classify(tags(&[("building", "yes"), ("type", "route")]));
        assert_eq!(flags, AreaFlags { way: true, relation: false });
        // type=multipolygon is, regardless of other tags
        let flags = c.classify(tags(&[("type", "multipolygon")]));
        assert_eq!(flags, AreaFlags { way: true, relation: true });
    }

    #[test]
    fn global_codes_match_like_strings() {
        let lookup = |s: &str| match s {
            "building" => Some(10u16),
            "yes" => Some(2),
            "no" => Some(1),
            _ => None,
        };
        let c = AreaClassifier::compile(&parse_area_rules("building").unwrap(), lookup);
        let t = [(TagStr::Global(10), TagStr::Global(2))];
        assert_eq!(
            c.classify(t.iter().copied()),
            AreaFlags { way: true, relation: true }
        );
        let t = [(TagStr::Global(10), TagStr::Global(1))]; // building=no
        assert_eq!(c.classify(t.iter().copied()), AreaFlags::default());
    }

    #[test]
    fn reverse_sorted_local_values_are_searchable() {
        let c = classifier("waterway (riverbank, dock, boatyard, dam)");
        for v in ["riverbank", "dock", "boatyard", "dam"] {
            assert!(
                c.classify(tags(&[("waterway", v)])).way,
                "{v} should classify as area"
            );
        }
        assert!(!c.classify(tags(&[("waterway", "canal")])).way);
    }
}
