//! Layouts: how consolidated containers are tiled and packed.

use serde::{Deserialize, Serialize};

use super::geometry::BBox;
use crate::error::{CatalogError, Result};

/// Parameters of a regular grid anchored at `(origin_x, origin_y)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParameters {
    pub crs: String,
    pub origin_x: f64,
    pub origin_y: f64,
    /// Ground size of a pixel, in CRS units.
    pub resolution: f64,
    /// Width and height of a cell, in pixels.
    pub cell_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    pub grid: GridParameters,
    pub block_x: u32,
    pub block_y: u32,
    /// Maximum number of records packed in one container.
    pub max_records: u32,
}

impl Layout {
    pub fn new(
        name: impl Into<String>,
        grid: GridParameters,
        block_x: u32,
        block_y: u32,
        max_records: u32,
    ) -> Result<Self> {
        let layout = Self {
            name: name.into(),
            grid,
            block_x,
            block_y,
            max_records,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::validation("layout name must not be empty"));
        }
        if self.max_records == 0 {
            return Err(CatalogError::validation(format!(
                "layout {}: max_records must be positive",
                self.name
            )));
        }
        if self.block_x == 0 || self.block_y == 0 {
            return Err(CatalogError::validation(format!(
                "layout {}: block size must be positive",
                self.name
            )));
        }
        if !(self.grid.resolution > 0.0) || self.grid.cell_size == 0 {
            return Err(CatalogError::validation(format!(
                "layout {}: grid resolution and cell size must be positive",
                self.name
            )));
        }
        Ok(())
    }

    pub fn grid(&self) -> RegularGrid {
        RegularGrid {
            params: self.grid.clone(),
        }
    }
}

/// One tile of the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub crs: String,
    pub bbox: BBox,
    /// GDAL-style geotransform of the cell (north-up).
    pub geotransform: [f64; 6],
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RegularGrid {
    params: GridParameters,
}

impl RegularGrid {
    fn cell_extent(&self) -> f64 {
        self.params.resolution * f64::from(self.params.cell_size)
    }

    pub fn cell(&self, i: i64, j: i64) -> Cell {
        let extent = self.cell_extent();
        let min_x = self.params.origin_x + i as f64 * extent;
        let min_y = self.params.origin_y + j as f64 * extent;
        let bbox = BBox::new(min_x, min_y, min_x + extent, min_y + extent);
        Cell {
            id: format!("{i}/{j}"),
            crs: self.params.crs.clone(),
            geotransform: [
                bbox.min_x,
                self.params.resolution,
                0.0,
                bbox.max_y,
                0.0,
                -self.params.resolution,
            ],
            bbox,
            width: self.params.cell_size,
            height: self.params.cell_size,
        }
    }

    /// Lazily enumerates the cells whose interior overlaps `area`.
    pub fn cover(&self, area: &BBox) -> CellIter {
        let extent = self.cell_extent();
        let first_i = ((area.min_x - self.params.origin_x) / extent).floor() as i64;
        let last_i = ((area.max_x - self.params.origin_x) / extent).ceil() as i64;
        let first_j = ((area.min_y - self.params.origin_y) / extent).floor() as i64;
        let last_j = ((area.max_y - self.params.origin_y) / extent).ceil() as i64;
        CellIter {
            grid: self.clone(),
            area: *area,
            first_i,
            last_i,
            first_j,
            last_j,
            i: first_i,
            j: first_j,
        }
    }
}

/// Restartable cell sequence: clone it or call [`CellIter::restart`].
#[derive(Debug, Clone)]
pub struct CellIter {
    grid: RegularGrid,
    area: BBox,
    first_i: i64,
    last_i: i64,
    first_j: i64,
    last_j: i64,
    i: i64,
    j: i64,
}

impl CellIter {
    pub fn restart(&mut self) {
        self.i = self.first_i;
        self.j = self.first_j;
    }
}

impl Iterator for CellIter {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        while self.j < self.last_j {
            if self.i >= self.last_i {
                self.i = self.first_i;
                self.j += 1;
                continue;
            }
            let cell = self.grid.cell(self.i, self.j);
            self.i += 1;
            if cell.bbox.intersects(&self.area) {
                return Some(cell);
            }
        }
        None
    }
}
