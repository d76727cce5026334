use anyhow::{bail, Result};
use image::{imageops, DynamicImage, GenericImageView, Rgb, RgbImage};

/// Composes several images into one grid image.
pub trait GridBuilder {
    fn build(&self, images: &[DynamicImage], rows: u32) -> Result<DynamicImage>;
}

/// Row-major grid with cells sized to the largest input.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageGrid {
    pub background: [u8; 3],
}

impl GridBuilder for ImageGrid {
    fn build(&self, images: &[DynamicImage], rows: u32) -> Result<DynamicImage> {
        if images.is_empty() {
            bail!("cannot build a grid from zero images");
        }
        let count = images.len() as u32;
        let rows = rows.clamp(1, count);
        let cols = count.div_ceil(rows);
        let (cell_w, cell_h) = images
            .iter()
            .map(|image| image.dimensions())
            .fold((0, 0), |(w, h), (iw, ih)| (w.max(iw), h.max(ih)));

        let mut canvas = RgbImage::from_pixel(cell_w * cols, cell_h * rows, Rgb(self.background));
        for (idx, image) in images.iter().enumerate() {
            let idx = idx as u32;
            let x = (idx % cols) * cell_w;
            let y = (idx / cols) * cell_h;
            imageops::overlay(&mut canvas, &image.to_rgb8(), i64::from(x), i64::from(y));
        }
        Ok(DynamicImage::ImageRgb8(canvas))
    }
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

    use super::{GridBuilder, ImageGrid};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn single_row_places_images_left_to_right() -> anyhow::Result<()> {
        let images = vec![
            solid(4, 3, [255, 0, 0]),
            solid(4, 3, [0, 255, 0]),
            solid(4, 3, [0, 0, 255]),
        ];
        let grid = ImageGrid::default().build(&images, 1)?;
        assert_eq!(grid.dimensions(), (12, 3));
        let rgb = grid.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(rgb.get_pixel(5, 1).0, [0, 255, 0]);
        assert_eq!(rgb.get_pixel(11, 2).0, [0, 0, 255]);
        Ok(())
    }

    #[test]
    fn multiple_rows_wrap() -> anyhow::Result<()> {
        let images: Vec<DynamicImage> = (0..3).map(|_| solid(2, 2, [9, 9, 9])).collect();
        let grid = ImageGrid::default().build(&images, 2)?;
        assert_eq!(grid.dimensions(), (4, 4));
        assert_eq!(grid.to_rgb8().get_pixel(3, 3).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(ImageGrid::default().build(&[], 1).is_err());
    }
}
