use crate::error::{ErrorKind, Result};
use crate::{Dimensions, Rect, Tile};
use image::RgbaImage;

/// Copy `source` pixels of `from` (in `from`'s coordinates) into `into` at
/// (`x`, `y`).
fn blit(into: &mut RgbaImage, from: &RgbaImage, source: Rect, x: u32, y: u32) {
    for dy in 0..source.height {
        for dx in 0..source.width {
            into.put_pixel(x + dx, y + dy, *from.get_pixel(source.x + dx, source.y + dy));
        }
    }
}

/// Assemble upscaled tiles into the final image.
///
/// `dimensions` are those of the source image the tiles were planned for;
/// the result is `dimensions * scale`. Every tile's upscaled image must be
/// exactly `region * scale` in size. Each output pixel comes from the tile
/// whose interior contains it. Where the given tiles do not partition the
/// image by their interiors, pixels covered only by some tile's overlap
/// margin are filled from the last such tile in sequence order.
///
/// # Errors
/// - [`InvalidScale`](ErrorKind::InvalidScale) when `scale` is zero or the
///   output dimensions overflow,
/// - [`OutOfBounds`](ErrorKind::OutOfBounds) for a tile outside the image,
/// - [`TileSizeMismatch`](ErrorKind::TileSizeMismatch) for a wrongly sized
///   upscaled tile,
/// - [`IncompleteCoverage`](ErrorKind::IncompleteCoverage) when some source
///   pixel is covered by no tile at all.
pub fn recompose(
    dimensions: Dimensions,
    scale: u32,
    tiles: impl IntoIterator<Item = (Tile, RgbaImage)>,
) -> Result<RgbaImage> {
    if dimensions.is_empty() {
        exn::bail!(ErrorKind::EmptyImage);
    }
    let output = match dimensions.scaled(scale) {
        Some(output) if scale > 0 => output,
        _ => exn::bail!(ErrorKind::InvalidScale(scale)),
    };
    let bounds = Rect::new(0, 0, dimensions.width, dimensions.height);

    let mut tiles = tiles.into_iter().collect::<Vec<_>>();
    for (tile, upscaled) in &tiles {
        if !bounds.contains(&tile.region) || !tile.region.contains(&tile.interior) {
            exn::bail!(ErrorKind::OutOfBounds(tile.index));
        }
        let expected = tile.region.dimensions().scaled(scale).unwrap_or(output);
        let actual = Dimensions::of(upscaled);
        if actual != expected {
            exn::bail!(ErrorKind::TileSizeMismatch { index: tile.index, expected, actual });
        }
    }
    tiles.sort_by_key(|(tile, _)| tile.index);

    let mut covered = vec![false; dimensions.width as usize * dimensions.height as usize];
    let mut assembled = RgbaImage::new(output.width, output.height);
    // Whole regions first, then interiors on top, so interiors always win.
    for (tile, upscaled) in &tiles {
        let Rect { x, y, width, height } = tile.region;
        blit(&mut assembled, upscaled, Rect::new(0, 0, width * scale, height * scale), x * scale, y * scale);
        for row in y..y + height {
            let start = row as usize * dimensions.width as usize + x as usize;
            covered[start..start + width as usize].fill(true);
        }
    }
    if let Some(missing) = covered.iter().position(|covered| !covered) {
        let width = dimensions.width as usize;
        exn::bail!(ErrorKind::IncompleteCoverage { x: (missing % width) as u32, y: (missing / width) as u32 });
    }
    for (tile, upscaled) in &tiles {
        let offset_x = (tile.interior.x - tile.region.x) * scale;
        let offset_y = (tile.interior.y - tile.region.y) * scale;
        let source = Rect::new(offset_x, offset_y, tile.interior.width * scale, tile.interior.height * scale);
        blit(&mut assembled, upscaled, source, tile.interior.x * scale, tile.interior.y * scale);
    }
    Ok(assembled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use image::Rgba;
    use rstest::rstest;
    use std::num::NonZeroU32;

    fn page(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| Rgba([(x % 251) as u8, (y % 241) as u8, ((x * y) % 239) as u8, 255]))
    }

    fn upscale_nearest(image: &RgbaImage, scale: u32) -> RgbaImage {
        RgbaImage::from_fn(image.width() * scale, image.height() * scale, |x, y| *image.get_pixel(x / scale, y / scale))
    }

    fn tiled(image: &RgbaImage, tile_size: u32, overlap: u32, scale: u32) -> Vec<(Tile, RgbaImage)> {
        plan(Dimensions::of(image), NonZeroU32::new(tile_size), overlap)
            .unwrap()
            .into_iter()
            .map(|tile| (tile, upscale_nearest(&tile.extract(image), scale)))
            .collect()
    }

    #[rstest]
    #[case(1, 1, 0, 0)]
    #[case(37, 53, 0, 0)]
    #[case(300, 200, 128, 16)]
    #[case(301, 199, 64, 31)]
    #[case(128, 128, 128, 32)]
    #[case(513, 257, 100, 0)]
    fn test_identity_round_trip(#[case] width: u32, #[case] height: u32, #[case] size: u32, #[case] overlap: u32) {
        let image = page(width, height);
        let result = recompose(Dimensions::of(&image), 1, tiled(&image, size, overlap, 1)).unwrap();
        assert_eq!(result, image);
    }

    #[rstest]
    #[case(2)]
    #[case(4)]
    fn test_tiled_upscale_matches_whole_upscale(#[case] scale: u32) {
        let image = page(250, 170);
        let result = recompose(Dimensions::of(&image), scale, tiled(&image, 64, 8, scale)).unwrap();
        assert_eq!(result, upscale_nearest(&image, scale));
    }

    #[test]
    fn test_tile_order_does_not_matter() {
        let image = page(200, 90);
        let mut tiles = tiled(&image, 50, 5, 2);
        tiles.reverse();
        let result = recompose(Dimensions::of(&image), 2, tiles).unwrap();
        assert_eq!(result, upscale_nearest(&image, 2));
    }

    #[test]
    fn test_missing_tile_is_incomplete_coverage() {
        let image = page(200, 200);
        let mut tiles = tiled(&image, 64, 0, 1);
        tiles.remove(0);
        let err = recompose(Dimensions::of(&image), 1, tiles).unwrap_err();
        assert_eq!(*err, ErrorKind::IncompleteCoverage { x: 0, y: 0 });
    }

    #[test]
    fn test_overlap_covers_missing_interior() {
        // A pixel inside a missing interior is still covered by a neighbour's
        // overlap margin, which is used in its place.
        let image = page(100, 10);
        let mut tiles = tiled(&image, 60, 20, 1);
        assert_eq!(tiles.len(), 5);
        tiles.remove(1);
        let result = recompose(Dimensions::of(&image), 1, tiles).unwrap();
        assert_eq!(result, image);
    }

    #[test]
    fn test_wrong_tile_size_is_rejected() {
        let image = page(100, 100);
        let mut tiles = tiled(&image, 60, 10, 2);
        tiles[1].1 = RgbaImage::new(3, 3);
        let err = recompose(Dimensions::of(&image), 2, tiles).unwrap_err();
        assert!(matches!(&*err, ErrorKind::TileSizeMismatch { index: 1, .. }));
    }

    #[test]
    fn test_invalid_scale() {
        let image = page(10, 10);
        let err = recompose(Dimensions::of(&image), 0, tiled(&image, 5, 1, 1)).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidScale(0));
        let err = recompose(Dimensions::new(u32::MAX, 1), 2, Vec::new()).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidScale(2));
    }

    #[test]
    fn test_tile_outside_image() {
        let tile = Tile { index: 0, region: Rect::new(5, 5, 10, 10), interior: Rect::new(5, 5, 10, 10) };
        let err = recompose(Dimensions::new(10, 10), 1, vec![(tile, RgbaImage::new(10, 10))]).unwrap_err();
        assert_eq!(*err, ErrorKind::OutOfBounds(0));
    }
}
