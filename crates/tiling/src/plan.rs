use crate::error::{ErrorKind, Result};
use crate::{Dimensions, Rect, Tile};
use std::num::NonZeroU32;

/// One tile's extent along a single axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    interior_start: u32,
    interior_len: u32,
    region_start: u32,
    region_len: u32,
}

/// Split an axis of `len` pixels into interiors of `step` pixels, each grown
/// by `overlap` on both sides and clamped to the axis.
fn spans(len: u32, tile_size: u32, overlap: u32) -> Vec<Span> {
    if len <= tile_size {
        return vec![Span { interior_start: 0, interior_len: len, region_start: 0, region_len: len }];
    }
    let step = tile_size - 2 * overlap;
    let mut spans = Vec::with_capacity(len.div_ceil(step) as usize);
    let mut start = 0;
    while start < len {
        let end = start.saturating_add(step).min(len);
        let region_start = start.saturating_sub(overlap);
        let region_end = end.saturating_add(overlap).min(len);
        spans.push(Span {
            interior_start: start,
            interior_len: end - start,
            region_start,
            region_len: region_end - region_start,
        });
        start = end;
    }
    spans
}

/// Plan the tiles for an image of the given dimensions.
///
/// Without a `tile_size` the whole image is a single tile. Otherwise no tile
/// region is larger than `tile_size` on either side, neighbouring regions
/// overlap by `2 * overlap` pixels, and an image that fits inside one tile
/// is still a single tile. Tiles are ordered row by row, left to right.
///
/// # Errors
/// - [`EmptyImage`](ErrorKind::EmptyImage) for zero-sized images,
/// - [`InvalidTileSize`](ErrorKind::InvalidTileSize) when `tile_size` is not
///   larger than `2 * overlap`; such a tile would have no interior.
pub fn plan(dimensions: Dimensions, tile_size: Option<NonZeroU32>, overlap: u32) -> Result<Vec<Tile>> {
    if dimensions.is_empty() {
        exn::bail!(ErrorKind::EmptyImage);
    }
    let Some(tile_size) = tile_size.map(NonZeroU32::get) else {
        let whole = Rect::new(0, 0, dimensions.width, dimensions.height);
        return Ok(vec![Tile { index: 0, region: whole, interior: whole }]);
    };
    if u64::from(tile_size) <= 2 * u64::from(overlap) {
        exn::bail!(ErrorKind::InvalidTileSize { tile_size, overlap });
    }

    let columns = spans(dimensions.width, tile_size, overlap);
    let rows = spans(dimensions.height, tile_size, overlap);
    let mut tiles = Vec::with_capacity(columns.len() * rows.len());
    for row in &rows {
        for column in &columns {
            tiles.push(Tile {
                index: tiles.len(),
                region: Rect::new(column.region_start, row.region_start, column.region_len, row.region_len),
                interior: Rect::new(column.interior_start, row.interior_start, column.interior_len, row.interior_len),
            });
        }
    }
    tracing::trace!(%dimensions, tile_size, overlap, tiles = tiles.len(), "Planned tiles");
    Ok(tiles)
}
