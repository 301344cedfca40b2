use std::fmt;

/// The three OSM feature kinds, in their on-disk encoding order.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FeatureType {
    Node = 0,
    Way = 1,
    Relation = 2,
}

impl FeatureType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => FeatureType::Node,
            1 => FeatureType::Way,
            2 => FeatureType::Relation,
            _ => unreachable!("bad feature type"),
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureType::Node => "node",
            FeatureType::Way => "way",
            FeatureType::Relation => "relation",
        }
    }
}

/// A feature id tagged with its type: `(id << 2) | type`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TypedFeatureId(u64);

impl TypedFeatureId {
    pub fn new(ftype: FeatureType, id: u64) -> Self {
        TypedFeatureId((id << 2) | ftype.code() as u64)
    }

    pub fn of_node(id: u64) -> Self {
        Self::new(FeatureType::Node, id)
    }

    pub fn of_way(id: u64) -> Self {
        Self::new(FeatureType::Way, id)
    }

    pub fn of_relation(id: u64) -> Self {
        Self::new(FeatureType::Relation, id)
    }

    pub fn from_raw(raw: u64) -> Self {
        debug_assert!(raw & 3 != 3, "bad typed feature id");
        TypedFeatureId(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn id(self) -> u64 {
        self.0 >> 2
    }

    #[inline]
    pub fn ftype(self) -> FeatureType {
        FeatureType::from_code((self.0 & 3) as u32)
    }
}

impl fmt::Debug for TypedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ftype().name(), self.id())
    }
}

impl fmt::Display for TypedFeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ftype().name(), self.id())
    }
}
