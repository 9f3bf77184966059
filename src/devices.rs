// Device back-ends behind the memory-mapped ports. Each device implements
// the small capability trait below; the bus in the memory module routes port
// reads and writes to it, delivers drained host events, and ticks it at the
// refresh rate.

use crate::memory::Port;
use crate::Cell;
use minifb::Key;
use rodio::Source;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Network read and write buffers hold this many cells.
pub const NET_CELLS: usize = 4096;
/// One second of 44.1 kHz stereo 16-bit PCM, one frame per cell.
pub const AUDIO_CELLS: usize = 44100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ok,
    Quit,
}

/// One drained host event. Key events carry the translated Firth code,
/// mouse buttons their 1-based host number.
#[derive(Debug, Clone, Copy)]
pub enum HostEvent {
    KeyDown(Cell),
    KeyUp(Cell),
    MouseMove(Cell, Cell),
    MouseDown(u8),
    MouseUp(u8),
    User,
    Quit,
}

pub type EventQueue = Rc<RefCell<VecDeque<HostEvent>>>;

pub type DeviceList = Vec<(Port, Box<dyn Device>)>;

pub trait Device {
    /// Read one cell; output-only devices stay at the default.
    fn read_cell(&mut self) -> Cell {
        0
    }
    /// Write one cell; input-only devices stay at the default.
    fn write_cell(&mut self, _value: Cell) {}
    /// Refresh-rate housekeeping (present, poll the host, flush buffers).
    fn tick(&mut self) -> Signal {
        Signal::Ok
    }
    /// One host event delivered by the interrupt pump.
    fn event(&mut self, _event: &HostEvent) {}
}

/// Printing keys in Firth order; index is the character code, shift adds
/// 0x30 to reach the capital and symbol region.
pub const PRINTING_KEYS: [Key; 48] = [
    Key::Key0,
    Key::Key1,
    Key::Key2,
    Key::Key3,
    Key::Key4,
    Key::Key5,
    Key::Key6,
    Key::Key7,
    Key::Key8,
    Key::Key9,
    Key::A,
    Key::B,
    Key::C,
    Key::D,
    Key::E,
    Key::F,
    Key::G,
    Key::H,
    Key::I,
    Key::J,
    Key::K,
    Key::L,
    Key::M,
    Key::N,
    Key::O,
    Key::P,
    Key::Q,
    Key::R,
    Key::S,
    Key::T,
    Key::U,
    Key::V,
    Key::W,
    Key::X,
    Key::Y,
    Key::Z,
    Key::Comma,
    Key::Period,
    Key::Slash,
    Key::Semicolon,
    Key::Apostrophe,
    Key::LeftBracket,
    Key::RightBracket,
    Key::Backslash,
    Key::Backquote,
    Key::Minus,
    Key::Equal,
    Key::Space,
];

/// Translate a host key to the Firth character set. Non-printing keys land
/// in the 0x60..0x66 control band; anything else is 0x66.
pub fn keymap(key: Key, shift: bool) -> Cell {
    for (i, &k) in PRINTING_KEYS.iter().enumerate() {
        if k == key {
            return if shift { 0x30 + i as Cell } else { i as Cell };
        }
    }
    match key {
        Key::Tab => 0x60,
        Key::Enter => 0x61,
        Key::Backspace => 0x62,
        Key::LeftSuper | Key::RightSuper => 0x63,
        Key::LeftAlt | Key::RightAlt => 0x64,
        Key::LeftCtrl | Key::RightCtrl => 0x65,
        _ => 0x66,
    }
}

/// The key buffer: one cell holding the last key event, 0x80 | code for a
/// press, 0x7f & code for a release.
pub struct Keyboard {
    buffer: Cell,
}

impl Keyboard {
    pub fn new() -> Box<Keyboard> {
        Box::new(Keyboard { buffer: 0 })
    }
}

impl Device for Keyboard {
    fn read_cell(&mut self) -> Cell {
        self.buffer
    }
    fn event(&mut self, event: &HostEvent) {
        match *event {
            HostEvent::KeyDown(code) => self.buffer = 0x80 | code,
            HostEvent::KeyUp(code) => self.buffer = 0x7f & code,
            _ => {}
        }
    }
}

/// The three-cell mouse buffer (x, y, buttons), read one cell per fetch
/// cyclically.
pub struct Mouse {
    buffer: [Cell; 3],
    cursor: usize,
}

impl Mouse {
    pub fn new() -> Box<Mouse> {
        Box::new(Mouse { buffer: [0; 3], cursor: 0 })
    }
}

impl Device for Mouse {
    fn read_cell(&mut self) -> Cell {
        self.cursor %= 3;
        let value = self.buffer[self.cursor];
        self.cursor += 1;
        value
    }
    fn event(&mut self, event: &HostEvent) {
        match *event {
            HostEvent::MouseMove(x, y) => {
                self.buffer[0] = x;
                self.buffer[1] = y;
            }
            HostEvent::MouseDown(button) => self.buffer[2] = 0x80 | (1 << (button - 1)),
            HostEvent::MouseUp(button) => self.buffer[2] = 0x7f & (1 << (button - 1)),
            _ => {}
        }
    }
}

/// The capture facility behind the network port. The VM only sees the cell
/// buffers; what carries the packets is the host's concern.
pub trait PacketLink {
    fn capture(&mut self) -> Option<Vec<Cell>>;
    fn inject(&mut self, packet: &[Cell]);
}

/// Runs the machine with networking switched off: nothing is captured and
/// injected packets are dropped.
pub struct DisabledLink;

impl PacketLink for DisabledLink {
    fn capture(&mut self) -> Option<Vec<Cell>> {
        None
    }
    fn inject(&mut self, _packet: &[Cell]) {}
}

/// Network port: reads walk the most recently captured packet and return 0
/// past its end; writes fill an outgoing buffer that is flushed as a single
/// packet at the next tick. A captured packet raises the user event.
pub struct Network {
    link: Box<dyn PacketLink>,
    events: EventQueue,
    read_buffer: Vec<Cell>,
    read_index: usize,
    write_buffer: Vec<Cell>,
    write_index: usize,
}

impl Network {
    pub fn new(link: Box<dyn PacketLink>, events: EventQueue) -> Box<Network> {
        Box::new(Network {
            link,
            events,
            read_buffer: Vec::new(),
            read_index: 0,
            write_buffer: vec![0; NET_CELLS],
            write_index: 0,
        })
    }
}

impl Device for Network {
    fn read_cell(&mut self) -> Cell {
        if self.read_index >= self.read_buffer.len() {
            return 0;
        }
        let value = self.read_buffer[self.read_index];
        self.read_index += 1;
        value
    }
    fn write_cell(&mut self, value: Cell) {
        self.write_index %= NET_CELLS;
        self.write_buffer[self.write_index] = value;
        self.write_index += 1;
    }
    fn tick(&mut self) -> Signal {
        if self.write_index > 0 {
            self.link.inject(&self.write_buffer[..self.write_index]);
            self.write_index = 0;
        }
        if let Some(packet) = self.link.capture() {
            log::debug!("got packet of {} cells", packet.len());
            self.read_buffer = packet;
            self.read_buffer.truncate(NET_CELLS);
            self.read_index = 0;
            self.events.borrow_mut().push_back(HostEvent::User);
        }
        Signal::Ok
    }
}

/// The audio ring: one second of samples, written by the VM under the lock
/// and drained by the output stream. The reader resets and goes silent when
/// it catches the writer.
pub struct AudioRing {
    cells: Vec<Cell>,
    write_index: usize,
    read_index: usize,
}

impl AudioRing {
    fn new() -> AudioRing {
        AudioRing { cells: vec![0; AUDIO_CELLS], write_index: 0, read_index: 0 }
    }

    fn push(&mut self, value: Cell) {
        self.write_index %= AUDIO_CELLS;
        let at = self.write_index;
        self.cells[at] = value;
        self.write_index += 1;
    }

    fn pop(&mut self) -> Option<Cell> {
        if self.read_index >= self.write_index {
            self.read_index = 0;
            return None;
        }
        let value = self.cells[self.read_index % AUDIO_CELLS];
        self.read_index += 1;
        Some(value)
    }
}

/// Audio port: every write appends one cell to the ring under the lock.
pub struct Audio {
    ring: Arc<Mutex<AudioRing>>,
}

impl Audio {
    pub fn new() -> Box<Audio> {
        Box::new(Audio { ring: Arc::new(Mutex::new(AudioRing::new())) })
    }

    /// Handle for the output stream that drains the ring.
    pub fn ring(&self) -> Arc<Mutex<AudioRing>> {
        Arc::clone(&self.ring)
    }
}

impl Device for Audio {
    fn write_cell(&mut self, value: Cell) {
        if let Ok(mut ring) = self.ring.lock() {
            ring.push(value);
        }
    }
}

/// Drains the ring as interleaved stereo samples, one cell per frame with
/// the left sample in the low half. Yields silence while the ring is empty.
pub struct AudioStream {
    ring: Arc<Mutex<AudioRing>>,
    pending: Option<i16>,
}

impl AudioStream {
    pub fn new(ring: Arc<Mutex<AudioRing>>) -> AudioStream {
        AudioStream { ring, pending: None }
    }
}

impl Iterator for AudioStream {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if let Some(sample) = self.pending.take() {
            return Some(sample);
        }
        let cell = self.ring.lock().ok().and_then(|mut ring| ring.pop());
        match cell {
            Some(cell) => {
                self.pending = Some((cell >> 16) as i16);
                Some(cell as i16)
            }
            None => Some(0),
        }
    }
}

impl Source for AudioStream {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }
    fn channels(&self) -> u16 {
        2
    }
    fn sample_rate(&self) -> u32 {
        44100
    }
    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
