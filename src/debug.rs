//! Supplemental on-disk debug dumping.
//!
//! The in-region `debug.images`/`debug.absolute_errors` arrays (written
//! directly by [`crate::optimizer::Optimizer`] through
//! [`crate::shared_memory::OutputView`]) are the authoritative debug
//! channel. This module mirrors the reference implementation's
//! `DEBUG_SAVE_IMAGE` macros (`debug.h`), which additionally wrote
//! intermediate canvases to disk in debug builds — restated here as a
//! runtime-conditional dump gated by an environment variable rather than a
//! compile-time `#ifdef DEBUG`, since it is strictly additive.

use std::path::PathBuf;

use crate::color::Color;
use crate::shared_memory::DEBUG_STORE_IMAGES;

/// Returns the configured dump directory, if on-disk dumping is enabled for
/// this run (`debug_flags` carries `DEBUG_STORE_IMAGES` and
/// `THREADLOOM_DEBUG_DIR` is set).
pub fn dump_dir(debug_flags: u8) -> Option<PathBuf> {
    if debug_flags & DEBUG_STORE_IMAGES == 0 {
        return None;
    }
    std::env::var_os("THREADLOOM_DEBUG_DIR").map(PathBuf::from)
}

/// Writes `image` (CMY, `image_width` square) as a JPEG at
/// `<dir>/last_best_image_<iteration>.jpg`.
pub fn save_iteration_image(
    dir: &std::path::Path,
    iteration: u64,
    image_width: u32,
    image: &[Color],
) -> Result<(), image::ImageError> {
    std::fs::create_dir_all(dir).map_err(image::ImageError::IoError)?;

    let mut buffer = image::RgbImage::new(image_width, image_width);
    for (idx, pixel) in image.iter().enumerate() {
        let x = (idx as u32) % image_width;
        let y = (idx as u32) / image_width;
        // CMY -> RGB via simple complement; debug visualization only.
        buffer.put_pixel(
            x,
            y,
            image::Rgb([255u8.saturating_sub(pixel.c), 255u8.saturating_sub(pixel.m), 255u8.saturating_sub(pixel.y)]),
        );
    }

    let path = dir.join(format!("last_best_image_{iteration}.jpg"));
    buffer.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_dir_is_none_without_flag() {
        assert_eq!(dump_dir(0), None);
    }
}
