//! Cell cropping on a template-aligned sheet.

use image::imageops;
use image::GrayImage;

use super::marks::{detect_grid_marks, GridMarks};
use crate::config::{CodeRegion, SheetLayout};
use crate::errors::GradingError;

/// A rectangular crop of the warped sheet.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Left edge in warped-image pixels
    pub x: u32,
    /// Top edge in warped-image pixels
    pub y: u32,
    pub image: GrayImage,
}

impl Cell {
    fn crop(image: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        let width = x1.saturating_sub(x0);
        let height = y1.saturating_sub(y0);
        Self {
            x: x0,
            y: y0,
            image: imageops::crop_imm(image, x0, y0, width, height).to_image(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

/// Everything the analyzer needs from one sheet.
#[derive(Debug, Clone)]
pub struct ExtractedCells {
    /// Answer grid indexed `[row][col]`
    pub answer_cells: Vec<Vec<Cell>>,
    /// Student code cells, digit-row major: index `digit * columns + column`
    pub student_code_cells: Vec<Cell>,
    /// Exam code cells, same layout as the student code
    pub exam_code_cells: Vec<Cell>,
    pub marks: GridMarks,
}

/// Square crops of side `2 * half_size` centered on every (row, col) pair,
/// clamped to the image, in row-major order.
pub fn extract_answer_cells(
    image: &GrayImage,
    rows: &[u32],
    cols: &[u32],
    half_size: u32,
) -> Vec<Cell> {
    let (width, height) = image.dimensions();
    let mut cells = Vec::with_capacity(rows.len() * cols.len());
    for &y in rows {
        for &x in cols {
            let x0 = x.saturating_sub(half_size);
            let y0 = y.saturating_sub(half_size);
            let x1 = (x + half_size).min(width);
            let y1 = (y + half_size).min(height);
            cells.push(Cell::crop(image, x0, y0, x1, y1));
        }
    }
    cells
}

/// Folds a row-major cell list into `n_rows` rows of `n_cols` cells.
///
/// A list shorter than `n_rows * n_cols` is a grid-detection failure; extra
/// cells are ignored.
pub fn map_cells_to_grid(
    cells: Vec<Cell>,
    n_rows: usize,
    n_cols: usize,
) -> Result<Vec<Vec<Cell>>, GradingError> {
    let required = n_rows * n_cols;
    if cells.len() < required {
        return Err(GradingError::GridDetection(format!(
            "Insufficient cells: got {}, need {}. Image may be blurry or timing marks not detected properly",
            cells.len(),
            required
        )));
    }

    let mut iter = cells.into_iter();
    let grid = (0..n_rows)
        .map(|_| iter.by_ref().take(n_cols).collect())
        .collect();
    Ok(grid)
}

/// Crops a code region: `columns` equal-width columns starting at `region.x`,
/// one row of cells per selected row mark.
pub fn extract_code_region_cells(
    image: &GrayImage,
    row_marks: &[u32],
    region: &CodeRegion,
    row_height: u32,
) -> Vec<Cell> {
    let (width, height) = image.dimensions();
    let half_height = row_height / 2;
    let cell_width = region.width as f32 / region.columns as f32;

    let mut cells = Vec::with_capacity(row_marks.len() * region.columns);
    for &y in row_marks {
        let y0 = y.saturating_sub(half_height);
        let y1 = (y + half_height).min(height);
        for col in 0..region.columns {
            let x0 = ((region.x as f32 + col as f32 * cell_width) as u32).min(width);
            let x1 = ((region.x as f32 + (col + 1) as f32 * cell_width) as u32).min(width);
            // Empty crops keep their slot so digit indexing stays aligned
            cells.push(Cell::crop(image, x0, y0, x1.max(x0), y1.max(y0)));
        }
    }
    cells
}

/// Locates timing marks on a warped sheet and crops every cell.
#[derive(Debug, Clone)]
pub struct CellExtractor {
    layout: SheetLayout,
}

impl CellExtractor {
    pub fn new(layout: SheetLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &SheetLayout {
        &self.layout
    }

    /// Fails with [`GradingError::GridDetection`] when the strips yield fewer
    /// marks than the layout minimums or than the grid needs.
    pub fn extract_all(&self, warped: &GrayImage) -> Result<ExtractedCells, GradingError> {
        let layout = &self.layout;
        let marks = detect_grid_marks(
            warped,
            layout.right_strip_ratio,
            layout.bottom_strip_ratio,
            &layout.marks,
        )?;

        if marks.rows.len() < layout.min_row_marks || marks.cols.len() < layout.min_col_marks {
            return Err(GradingError::GridDetection(format!(
                "Insufficient timing marks: {} rows, {} cols. Need at least {} rows and {} columns",
                marks.rows.len(),
                marks.cols.len(),
                layout.min_row_marks,
                layout.min_col_marks
            )));
        }
        if marks.rows.len() < layout.code_row_end {
            return Err(GradingError::GridDetection(format!(
                "Code regions need {} row marks, found {}",
                layout.code_row_end,
                marks.rows.len()
            )));
        }

        let rows = &marks.rows[..marks.rows.len().min(layout.n_rows)];
        let cols = &marks.cols[..marks.cols.len().min(layout.n_cols)];
        let flat = extract_answer_cells(warped, rows, cols, layout.cell_size);
        let answer_cells = map_cells_to_grid(flat, layout.n_rows, layout.n_cols)?;

        let code_rows = &marks.rows[layout.code_row_start..layout.code_row_end];
        let student_code_cells = extract_code_region_cells(
            warped,
            code_rows,
            &layout.student_code,
            layout.code_row_height,
        );
        let exam_code_cells =
            extract_code_region_cells(warped, code_rows, &layout.exam_code, layout.code_row_height);

        tracing::debug!(
            target: "omr_pipeline",
            "Extracted {}x{} answer cells, {} student code cells, {} exam code cells",
            answer_cells.len(),
            layout.n_cols,
            student_code_cells.len(),
            exam_code_cells.len()
        );

        Ok(ExtractedCells {
            answer_cells,
            student_code_cells,
            exam_code_cells,
            marks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn blank(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    #[test]
    fn test_answer_cells_are_clamped_to_image() {
        let img = blank(100, 80);
        let cells = extract_answer_cells(&img, &[5, 40], &[10, 95], 15);

        assert_eq!(cells.len(), 4);
        assert_eq!((cells[0].x, cells[0].y), (0, 0));
        assert_eq!(cells[0].image.dimensions(), (25, 20));
        assert_eq!(cells[3].image.dimensions(), (20, 30));
    }

    #[test]
    fn test_short_cell_list_is_a_grid_detection_error() {
        let img = blank(50, 50);
        let cells = extract_answer_cells(&img, &[10, 20], &[10, 20, 30], 5);

        let err = map_cells_to_grid(cells, 3, 3).unwrap_err();
        assert!(matches!(err, GradingError::GridDetection(_)));
        assert!(err.to_string().contains("got 6, need 9"));
    }

    #[test]
    fn test_map_cells_to_grid_row_major() {
        let img = blank(60, 60);
        let cells = extract_answer_cells(&img, &[10, 30], &[10, 30, 50], 5);
        let grid = map_cells_to_grid(cells, 2, 3).expect("grid should be complete");

        assert_eq!(grid.len(), 2);
        assert_eq!(grid[1].len(), 3);
        assert_eq!((grid[1][2].x, grid[1][2].y), (45, 25));
    }

    #[test]
    fn test_code_region_cells_keep_digit_major_order() {
        let img = blank(200, 400);
        let region = CodeRegion {
            x: 20,
            width: 60,
            columns: 3,
        };
        let rows: Vec<u32> = (0..10).map(|r| 30 + 35 * r).collect();
        let cells = extract_code_region_cells(&img, &rows, &region, 35);

        assert_eq!(cells.len(), 30);
        // digit 2, column 1
        assert_eq!((cells[2 * 3 + 1].x, cells[2 * 3 + 1].y), (40, 83));
        assert_eq!(cells[0].image.dimensions(), (20, 34));
    }

    #[test]
    fn test_code_region_outside_image_keeps_slots() {
        let img = blank(50, 400);
        let region = CodeRegion {
            x: 40,
            width: 30,
            columns: 3,
        };
        let rows: Vec<u32> = (0..10).map(|r| 30 + 35 * r).collect();
        let cells = extract_code_region_cells(&img, &rows, &region, 35);

        assert_eq!(cells.len(), 30);
        assert!(cells[2].is_empty());
        assert!(!cells[0].is_empty());
    }

    #[test]
    fn test_blank_sheet_fails_grid_detection() {
        let extractor = CellExtractor::new(SheetLayout::default());
        let err = extractor.extract_all(&blank(400, 500)).unwrap_err();
        assert!(matches!(err, GradingError::GridDetection(_)));
    }
}
