// The image file is a flat little-endian array of cells. The compiler fills
// it from address 0 (code) and from the fixed offsets down (strings and
// lexicon); the VM later treats the whole file as flash and copies the first
// 4096 cells into ROM and instruction memory.

use crate::Cell;
use std::fs::File;
use std::io::Write;
use std::{fs, io};

/// Image size in cells (8 MiB on disk).
pub const IMAGE_CELLS: usize = 2_097_152;
/// Top of the lexicon, which grows toward lower addresses.
pub const LEXICON_OFFSET: Cell = 2_017_152;
/// Top of the string table, which grows toward lower addresses.
pub const STRINGS_OFFSET: Cell = 2_097_152;
/// Cells copied into ROM and instruction memory at boot.
pub const ROM_CELLS: usize = 4096;

const CHUNK_CELLS: usize = 4096;

/// Pre-write a zero-filled image of the full size, so that a complete file
/// exists on disk before compilation starts.
pub fn create(path: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    log::info!("creating image: {}", path);
    let chunk = [0u8; CHUNK_CELLS * 4];
    for _ in 0..IMAGE_CELLS / CHUNK_CELLS {
        file.write_all(&chunk)?;
    }
    log::info!("created image: {}", path);
    Ok(())
}

/// Read an image file into cells. A trailing partial cell is dropped.
pub fn load(path: &str) -> io::Result<Vec<Cell>> {
    let bytes = fs::read(path)?;
    Ok(bytes.chunks_exact(4).map(|c| Cell::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

/// Write cells back to the image file.
pub fn store(path: &str, cells: &[Cell]) -> io::Result<()> {
    let mut bytes = Vec::with_capacity(cells.len() * 4);
    for cell in cells {
        bytes.extend_from_slice(&cell.to_le_bytes());
    }
    fs::write(path, bytes)
}
