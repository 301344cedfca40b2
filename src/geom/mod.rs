mod bbox;
mod coordinate;
mod hilbert;
mod tile;
mod tile_pair;
mod zoom;

pub use bbox::Bbox;
pub use coordinate::Coordinate;
pub use hilbert::hilbert_distance;
pub use tile::{
    Tile, TwinCode, MAX_ZOOM, TWIN_EAST, TWIN_NONE, TWIN_NORTH, TWIN_SOUTH, TWIN_WEST,
};
pub use tile_pair::{PairDir, TilePair};
pub use zoom::ZoomLevels;
