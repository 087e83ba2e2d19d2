//! Frame-shape catalog.
//!
//! Rows and columns are listed in hardware index order: the position of a
//! value is what goes into the frame-control register. Row encoding 15 is
//! reserved and never appears in the catalog.

use log::warn;
use once_cell::sync::Lazy;

/// Bits of every frame taken by the control word.
pub const FRAME_CTRL_BITS: u32 = 48;

/// Row counts by register encoding; `0` marks the reserved encoding.
pub const ROWS: [u32; 24] = [
    48, 50, 60, 64, 75, 80, 125, 147, 96, 100, 120, 128, 150, 160, 250, 0, 192, 200, 240, 256, 72,
    144, 90, 180,
];

/// Column counts by register encoding.
pub const COLS: [u32; 8] = [2, 4, 6, 8, 10, 12, 14, 16];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowColPair {
    pub row: u32,
    pub col: u32,
    pub control_bits: u32,
    pub data_bits: u32,
}

impl RowColPair {
    pub fn frame_interval(&self) -> u32 {
        self.row * self.col
    }
}

static CATALOG: Lazy<Vec<RowColPair>> = Lazy::new(build_catalog);

/// Enumerates every legal shape, columns outer and rows inner. The solver
/// takes the first feasible entry, so this order is significant.
pub fn build_catalog() -> Vec<RowColPair> {
    let mut pairs = Vec::with_capacity(ROWS.len() * COLS.len());
    for &col in &COLS {
        for &row in ROWS.iter().filter(|&&row| row != 0) {
            pairs.push(RowColPair {
                row,
                col,
                control_bits: FRAME_CTRL_BITS,
                data_bits: row * col - FRAME_CTRL_BITS,
            });
        }
    }
    pairs
}

/// Process-wide catalog.
pub fn catalog() -> &'static [RowColPair] {
    &CATALOG
}

pub fn try_row_index(row: u32) -> Option<u8> {
    if row == 0 {
        return None;
    }
    ROWS.iter().position(|&r| r == row).map(|idx| idx as u8)
}

pub fn try_col_index(col: u32) -> Option<u8> {
    COLS.iter().position(|&c| c == col).map(|idx| idx as u8)
}

/// Register encoding for `row`, falling back to index 0 on a miss.
pub fn row_index(row: u32) -> u8 {
    try_row_index(row).unwrap_or_else(|| {
        warn!("row count {row} not in catalog, using encoding 0");
        0
    })
}

/// Register encoding for `col`, falling back to index 0 on a miss.
pub fn col_index(col: u32) -> u8 {
    try_col_index(col).unwrap_or_else(|| {
        warn!("column count {col} not in catalog, using encoding 0");
        0
    })
}

/// Frame-control byte for a catalog shape: `col_index | row_index << 3`.
pub fn frame_ctrl(row: u32, col: u32) -> Option<u8> {
    let r = try_row_index(row)?;
    let c = try_col_index(col)?;
    Some(c | (r << 3))
}

/// Bits per second left for payload after the control word.
pub fn headroom(freq: u32, pair: &RowColPair) -> u64 {
    let frame_freq = freq / pair.frame_interval();
    u64::from(freq).saturating_sub(u64::from(frame_freq) * u64::from(pair.control_bits))
}
