use std::fmt;
use std::io;

pub mod charset;
pub mod compiler;
pub mod devices;
pub mod image;
pub mod memory;
pub mod processor;
pub mod video;

/// One machine word, the universal unit of addressing and stacking.
pub type Cell = u32;

pub struct Configuration {
    /// Fetches between host event pumps.
    pub interrupt_rate: u64,
    /// Fetches between display refreshes.
    pub refresh_rate: u64,
    /// RAM size in cells, must be a power of two.
    pub ram_cells: usize,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration { interrupt_rate: 10_000, refresh_rate: 1_000_000, ram_cells: 1 << 28 }
    }
}

/// Fatal conditions while bringing the machine up, plus the flash
/// write-back when it shuts down. In between, while the fetch loop runs,
/// nothing raises: stacks wrap, unknown opcodes fall through, device
/// comparisons yield zero.
pub enum BootError {
    NoRam,
    NoFile(io::Error),
    NoMap(io::Error),
    NoWriteback(io::Error),
    NoRom,
    NoDisplay(String),
    NoAudio(String),
    NoNetDevice(String),
    NoNetAddr(String),
    NoCapture(String),
}

impl BootError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootError::NoRam => 1,
            BootError::NoFile(_) => 2,
            BootError::NoMap(_) | BootError::NoWriteback(_) => 3,
            BootError::NoRom => 4,
            BootError::NoDisplay(_) => 5,
            BootError::NoAudio(_) => 6,
            BootError::NoNetDevice(_) => 7,
            BootError::NoNetAddr(_) => 8,
            BootError::NoCapture(_) => 9,
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::NoRam => write!(f, "cannot allocate RAM"),
            BootError::NoFile(err) => write!(f, "cannot open image file: {}", err),
            BootError::NoMap(err) => write!(f, "cannot map image file: {}", err),
            BootError::NoWriteback(err) => write!(f, "cannot flush image file: {}", err),
            BootError::NoRom => write!(f, "image too small to hold the ROM"),
            BootError::NoDisplay(err) => write!(f, "cannot open display: {}", err),
            BootError::NoAudio(err) => write!(f, "cannot open audio output: {}", err),
            BootError::NoNetDevice(err) => write!(f, "no network device: {}", err),
            BootError::NoNetAddr(err) => write!(f, "no network address: {}", err),
            BootError::NoCapture(err) => write!(f, "cannot open packet capture: {}", err),
        }
    }
}

impl fmt::Debug for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
