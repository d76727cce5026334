use std::path::PathBuf;

use anyhow::{Context, Result};
use image::DynamicImage;
use loopback_contracts::GridOptions;

use crate::grid::GridBuilder;
use crate::sink::{ImageSink, SaveRequest};

/// Final ordered output of a run.
#[derive(Debug, Clone, Default)]
pub struct AssembledImages {
    /// Grid first when it was requested in the output, then the history in iteration order.
    pub images: Vec<DynamicImage>,
    pub grid_built: bool,
    pub grid_returned: bool,
    pub grid_path: Option<PathBuf>,
}

/// Turns the loop history into the returned images, building a one-row grid
/// when there is more than one image.
pub struct ResultAssembler<'a> {
    grid: &'a dyn GridBuilder,
    sink: &'a dyn ImageSink,
    options: &'a GridOptions,
    destination: PathBuf,
}

impl<'a> ResultAssembler<'a> {
    pub fn new(
        grid: &'a dyn GridBuilder,
        sink: &'a dyn ImageSink,
        options: &'a GridOptions,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            grid,
            sink,
            options,
            destination: destination.into(),
        }
    }

    pub fn assemble(
        &self,
        history: Vec<DynamicImage>,
        seed: Option<i64>,
        info: Option<&str>,
        prompt: &str,
    ) -> Result<AssembledImages> {
        if history.len() <= 1 {
            return Ok(AssembledImages {
                images: history,
                ..AssembledImages::default()
            });
        }

        let grid = self
            .grid
            .build(&history, self.options.rows.max(1))
            .context("grid composition failed")?;
        let grid_path = if self.options.save {
            let request = SaveRequest {
                destination: &self.destination,
                label: "grid",
                seed,
                prompt,
                format: &self.options.format,
                info,
                is_grid: true,
            };
            Some(self.sink.save(&grid, &request).context("grid save failed")?)
        } else {
            None
        };

        let mut images = Vec::with_capacity(history.len() + 1);
        let grid_returned = self.options.return_grid;
        if grid_returned {
            images.push(grid);
        }
        images.extend(history);
        Ok(AssembledImages {
            images,
            grid_built: true,
            grid_returned,
            grid_path,
        })
    }
}
