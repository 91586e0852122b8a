//! Deterministic QR-like rendering.
//!
//! The grid is not a scannable symbol. It only has to look like one and to
//! change whenever the payload changes, so a rotated token is visible on screen.
//! The same payload and grid size always produce the same grid.

pub const DEFAULT_GRID_SIZE: usize = 25;
pub const DEFAULT_CANVAS_PX: u32 = 260;

/// Side of a corner finder block, in cells
pub const FINDER_SIZE: usize = 7;
/// Largest grid a caller may ask for (the size of a version 40 QR symbol)
pub const MAX_GRID_SIZE: usize = 177;
pub const MAX_CANVAS_PX: u32 = 4096;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;
const BACKGROUND_RADIUS_PX: f64 = 12.0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Grid size {0} is smaller than a finder block (7)")]
    GridTooSmall(usize),
    #[error("Grid size {0} is larger than the maximum (177)")]
    GridTooLarge(usize),
    #[error("Canvas size must be positive")]
    EmptyCanvas,
    #[error("Canvas size {0}px is larger than the maximum (4096px)")]
    CanvasTooLarge(u32),
}

/// One vector drawing step, in canvas pixels
#[derive(Debug, Clone, PartialEq)]
pub enum DrawInstruction {
    /// White background behind the grid
    RoundedRect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        radius: f64,
    },
    /// A dark cell
    Cell { x: f64, y: f64, size: f64 },
}

/// A rendered grid and the instructions to draw it
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoQr {
    pub grid_size: usize,
    pub canvas_px: u32,
    pub cell_px: f64,
    /// Row-major
    pub cells: Vec<Vec<bool>>,
    pub instructions: Vec<DrawInstruction>,
}

impl PseudoQr {
    pub fn is_on(&self, row: usize, col: usize) -> bool {
        self.cells
            .get(row)
            .and_then(|r| r.get(col))
            .copied()
            .unwrap_or(false)
    }

    /// Serialise the drawing instructions as an SVG document
    pub fn to_svg(&self) -> String {
        let size = self.canvas_px;
        let mut svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{size}\" height=\"{size}\" viewBox=\"0 0 {size} {size}\">"
        );
        for instruction in &self.instructions {
            let element = match instruction {
                DrawInstruction::RoundedRect { x, y, width, height, radius } => format!(
                    "<rect x=\"{x}\" y=\"{y}\" width=\"{width}\" height=\"{height}\" rx=\"{radius}\" fill=\"#ffffff\"/>"
                ),
                DrawInstruction::Cell { x, y, size } => format!(
                    "<rect x=\"{x}\" y=\"{y}\" width=\"{size}\" height=\"{size}\" fill=\"#111111\"/>"
                ),
            };
            svg.push_str(&element);
        }
        svg.push_str("</svg>");
        svg
    }
}

/// 32-bit FNV-1a over UTF-16 code units, read back as a signed integer and made non-negative
pub fn payload_seed(payload: &str) -> u32 {
    let hash = payload
        .encode_utf16()
        .fold(FNV_OFFSET_BASIS, |h, unit| (h ^ u32::from(unit)).wrapping_mul(FNV_PRIME));
    (hash as i32).unsigned_abs()
}

/// Whether a cell belongs to one of the three corner finder blocks, and if so
/// its position inside that block
fn finder_local(row: usize, col: usize, grid_size: usize) -> Option<(usize, usize)> {
    let far = grid_size - FINDER_SIZE;
    if row < FINDER_SIZE && col < FINDER_SIZE {
        Some((row, col))
    } else if row < FINDER_SIZE && col >= far {
        Some((row, col - far))
    } else if row >= far && col < FINDER_SIZE {
        Some((row - far, col))
    } else {
        None
    }
}

fn finder_cell_on(local_row: usize, local_col: usize) -> bool {
    let edge = FINDER_SIZE - 1;
    let ring = local_row == 0 || local_row == edge || local_col == 0 || local_col == edge;
    let core = (2..=4).contains(&local_row) && (2..=4).contains(&local_col);
    ring || core
}

fn data_cell_on(seed: u32, row: usize, col: usize) -> bool {
    let n = (u64::from(seed) + row as u64 * 97 + col as u64 * 193) % 11;
    matches!(n, 0 | 2 | 7)
}

/// Render with the default 25×25 grid on a 260px canvas
pub fn render_default(payload: &str) -> PseudoQr {
    // Defaults always satisfy the size checks
    build(payload, DEFAULT_GRID_SIZE, DEFAULT_CANVAS_PX)
}

pub fn render(payload: &str, grid_size: usize, canvas_px: u32) -> Result<PseudoQr, RenderError> {
    if grid_size < FINDER_SIZE {
        return Err(RenderError::GridTooSmall(grid_size));
    }
    if grid_size > MAX_GRID_SIZE {
        return Err(RenderError::GridTooLarge(grid_size));
    }
    if canvas_px == 0 {
        return Err(RenderError::EmptyCanvas);
    }
    if canvas_px > MAX_CANVAS_PX {
        return Err(RenderError::CanvasTooLarge(canvas_px));
    }
    Ok(build(payload, grid_size, canvas_px))
}

fn build(payload: &str, grid_size: usize, canvas_px: u32) -> PseudoQr {
    let seed = payload_seed(payload);
    let cell_px = f64::from(canvas_px) / grid_size as f64;

    let cells: Vec<Vec<bool>> = (0..grid_size)
        .map(|row| {
            (0..grid_size)
                .map(|col| match finder_local(row, col, grid_size) {
                    Some((r, c)) => finder_cell_on(r, c),
                    None => data_cell_on(seed, row, col),
                })
                .collect()
        })
        .collect();

    let mut instructions = vec![DrawInstruction::RoundedRect {
        x: 0.0,
        y: 0.0,
        width: f64::from(canvas_px),
        height: f64::from(canvas_px),
        radius: BACKGROUND_RADIUS_PX,
    }];
    for (row, line) in cells.iter().enumerate() {
        for (col, on) in line.iter().enumerate() {
            if *on {
                instructions.push(DrawInstruction::Cell {
                    x: col as f64 * cell_px,
                    y: row as f64 * cell_px,
                    size: cell_px,
                });
            }
        }
    }

    PseudoQr {
        grid_size,
        canvas_px,
        cell_px,
        cells,
        instructions,
    }
}
