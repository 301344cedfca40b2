#![doc = "GOL builder public API"]

mod build;
mod common;
mod feature;
mod geom;
mod osm;
mod store;

pub mod cli;
pub mod commands;

#[doc(inline)]
pub use build::{BuildSummary, GolBuilder};

#[doc(inline)]
pub use build::settings::{BuildSettings, IndexedKey};

#[doc(inline)]
pub use build::compile::area::{AreaRule, RuleMode};

#[doc(inline)]
pub use build::stats::{OsmStats, SortStats};

#[doc(inline)]
pub use feature::{FeatureType, TypedFeatureId};

#[doc(inline)]
pub use geom::ZoomLevels;

#[doc(inline)]
pub use common::{CancelFlag, Verbosity};

#[doc(inline)]
pub use store::{GolMetadata, GolReader};

#[doc(inline)]
pub use osm::{Block, BlockSource, MemSource, PbfSource, RawMember, RawNode, RawRelation, RawWay};

#[cfg(test)]
mod pipeline_tests;
