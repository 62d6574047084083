//! Tile grid geometry over a [`TileSource`].
//!
//! Converts `(level, column, row)` tile coordinates into source rectangles.
//! Level 0 is native resolution; each level halves both dimensions, so a
//! tile at level `n` covers `tile_size << n` native pixels per axis. Edge
//! tiles are clipped to the raster, and tiles outside the grid map to an
//! empty region.

use crate::source::{ReadRegion, TileSource};

/// Shifts `size` left by `level`, saturating instead of overflowing.
fn scaled(size: u32, level: u32) -> u64 {
    let size = u64::from(size);
    if level >= u64::BITS || size.leading_zeros() < level {
        u64::MAX
    } else {
        size << level
    }
}

/// Clips a span of `size` starting at `index * size` to `limit`.
fn clipped_span(size: u64, index: u64, limit: u64) -> u64 {
    let start = size.saturating_mul(index);
    if start >= limit {
        0
    } else {
        size.min(limit - start)
    }
}

/// Raster width at `level` (never below one pixel).
pub fn level_width<S: TileSource + ?Sized>(source: &S, level: u32) -> u64 {
    source.native_width().checked_shr(level).unwrap_or(0).max(1)
}

/// Raster height at `level` (never below one pixel).
pub fn level_height<S: TileSource + ?Sized>(source: &S, level: u32) -> u64 {
    source.native_height().checked_shr(level).unwrap_or(0).max(1)
}

/// Number of tile columns at `level`.
pub fn num_tiles_x<S: TileSource + ?Sized>(source: &S, level: u32) -> u64 {
    level_width(source, level).div_ceil(u64::from(source.tile_width().max(1)))
}

/// Number of tile rows at `level`.
pub fn num_tiles_y<S: TileSource + ?Sized>(source: &S, level: u32) -> u64 {
    level_height(source, level).div_ceil(u64::from(source.tile_height().max(1)))
}

/// Number of resolution levels down to the first level that fits in a
/// single tile. Always at least one.
///
/// Valid tile levels for the source are `0..num_resolution_levels(source)`.
pub fn num_resolution_levels<S: TileSource + ?Sized>(source: &S) -> u32 {
    let mut levels = 1;
    while num_tiles_x(source, levels - 1) > 1 || num_tiles_y(source, levels - 1) > 1 {
        levels += 1;
    }
    levels
}

/// Native x-coordinate of a tile column's left edge.
pub fn tile_source_x<S: TileSource + ?Sized>(source: &S, level: u32, column: u64) -> u64 {
    column.saturating_mul(scaled(source.tile_width(), level))
}

/// Native y-coordinate of a tile row's top edge.
pub fn tile_source_y<S: TileSource + ?Sized>(source: &S, level: u32, row: u64) -> u64 {
    row.saturating_mul(scaled(source.tile_height(), level))
}

/// Native width covered by a tile column, clipped at the raster edge.
pub fn tile_source_width<S: TileSource + ?Sized>(source: &S, level: u32, column: u64) -> u64 {
    clipped_span(scaled(source.tile_width(), level), column, source.native_width())
}

/// Native height covered by a tile row, clipped at the raster edge.
pub fn tile_source_height<S: TileSource + ?Sized>(source: &S, level: u32, row: u64) -> u64 {
    clipped_span(scaled(source.tile_height(), level), row, source.native_height())
}

/// Output width of a tile column at `level`, clipped at the level edge.
pub fn tile_dst_width<S: TileSource + ?Sized>(source: &S, level: u32, column: u64) -> u32 {
    let width = clipped_span(u64::from(source.tile_width()), column, level_width(source, level));
    // Never exceeds tile_width, which is a u32
    width as u32
}

/// Output height of a tile row at `level`, clipped at the level edge.
pub fn tile_dst_height<S: TileSource + ?Sized>(source: &S, level: u32, row: u64) -> u32 {
    let height = clipped_span(u64::from(source.tile_height()), row, level_height(source, level));
    height as u32
}

/// Tile column containing native x-coordinate `src_x` at `level`.
pub fn tile_column<S: TileSource + ?Sized>(source: &S, level: u32, src_x: u64) -> u64 {
    src_x / scaled(source.tile_width(), level).max(1)
}

/// Tile row containing native y-coordinate `src_y` at `level`.
pub fn tile_row<S: TileSource + ?Sized>(source: &S, level: u32, src_y: u64) -> u64 {
    src_y / scaled(source.tile_height(), level).max(1)
}

/// The source rectangle and output size of tile `(level, column, row)`.
pub fn tile_region<S: TileSource + ?Sized>(source: &S, level: u32, column: u64, row: u64) -> ReadRegion {
    ReadRegion {
        src_x: tile_source_x(source, level, column),
        src_y: tile_source_y(source, level, row),
        src_width: tile_source_width(source, level, column),
        src_height: tile_source_height(source, level, row),
        dst_width: tile_dst_width(source, level, column),
        dst_height: tile_dst_height(source, level, row),
    }
}
