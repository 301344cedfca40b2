mod catalog;
mod grid;
mod layout;

pub use catalog::TileCatalog;
pub use grid::NodeCountGrid;
pub use layout::TileLayout;
