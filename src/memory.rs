// The memory map. Every cell address resolves to exactly one target: flash
// (high bit set), one of the seven device ports just below the flash range,
// ROM or instruction memory (below 0x1000, depending on the access side),
// or RAM. The `Bus` owns the devices behind the ports, the `Memory` owns
// the four backing stores.

use crate::devices::{Device, DeviceList, EventQueue, HostEvent, Signal};
use crate::{BootError, Cell};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const ROM_CELLS: usize = crate::image::ROM_CELLS;
pub const IM_CELLS: usize = 4096;

/// The seven memory-mapped device ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Network, // 0x7fffffff
    Video,   // 0x7ffffffe
    Audio,   // 0x7ffffffd
    Mouse,   // 0x7ffffffc
    Key,     // 0x7ffffffb
    Spare0,  // 0x7ffffffa
    Spare1,  // 0x7ffffff9
}

impl Port {
    pub fn from_address(addr: Cell) -> Option<Port> {
        match addr {
            0x7fff_ffff => Some(Port::Network),
            0x7fff_fffe => Some(Port::Video),
            0x7fff_fffd => Some(Port::Audio),
            0x7fff_fffc => Some(Port::Mouse),
            0x7fff_fffb => Some(Port::Key),
            0x7fff_fffa => Some(Port::Spare0),
            0x7fff_fff9 => Some(Port::Spare1),
            _ => None,
        }
    }

    /// Ports the DMA engine may fan a block read out of.
    pub fn readable(self) -> bool {
        match self {
            Port::Network | Port::Mouse | Port::Key => true,
            _ => false,
        }
    }

    /// Ports the DMA engine may fan a block write into.
    pub fn writable(self) -> bool {
        match self {
            Port::Network | Port::Video | Port::Audio => true,
            _ => false,
        }
    }
}

/// Which store an address resolves to, with the index into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Flash(usize),
    Rom(usize),
    Im(usize),
    Ram(usize),
    Port(Port),
}

/// Addresses below 0x1000 read from ROM but write to instruction memory.
#[derive(Debug, Clone, Copy)]
pub enum Side {
    Read,
    Write,
}

pub fn classify(addr: Cell, side: Side) -> Target {
    if addr & 0x8000_0000 != 0 {
        Target::Flash((addr & 0x7fff_ffff) as usize)
    } else if let Some(port) = Port::from_address(addr) {
        Target::Port(port)
    } else if addr < 0x1000 {
        match side {
            Side::Read => Target::Rom(addr as usize),
            Side::Write => Target::Im(addr as usize),
        }
    } else {
        Target::Ram(addr as usize)
    }
}

impl Target {
    pub fn offset(self, delta: usize) -> Target {
        match self {
            Target::Flash(i) => Target::Flash(i.wrapping_add(delta)),
            Target::Rom(i) => Target::Rom(i.wrapping_add(delta)),
            Target::Im(i) => Target::Im(i.wrapping_add(delta)),
            Target::Ram(i) => Target::Ram(i.wrapping_add(delta)),
            Target::Port(p) => Target::Port(p),
        }
    }

    pub fn rewind(self, delta: usize) -> Target {
        match self {
            Target::Flash(i) => Target::Flash(i.wrapping_sub(delta)),
            Target::Rom(i) => Target::Rom(i.wrapping_sub(delta)),
            Target::Im(i) => Target::Im(i.wrapping_sub(delta)),
            Target::Ram(i) => Target::Ram(i.wrapping_sub(delta)),
            Target::Port(p) => Target::Port(p),
        }
    }
}

pub struct Memory {
    rom: Vec<Cell>,
    im: Vec<Cell>,
    ram: Vec<Cell>,
    flash: Vec<Cell>,
}

impl Memory {
    /// Initialise the stores from a flash image: ROM and instruction memory
    /// both start as copies of its first 4096 cells.
    pub fn boot(flash: Vec<Cell>, ram_cells: usize) -> Result<Memory, BootError> {
        assert!(ram_cells.is_power_of_two());
        if flash.len() < ROM_CELLS {
            return Err(BootError::NoRom);
        }
        let mut ram = Vec::new();
        ram.try_reserve_exact(ram_cells).map_err(|_| BootError::NoRam)?;
        ram.resize(ram_cells, 0);
        let rom = flash[..ROM_CELLS].to_vec();
        let im = rom.clone();
        Ok(Memory { rom, im, ram, flash })
    }

    /// One instruction fetch; the pointer wraps within instruction memory.
    pub fn fetch(&self, ip: Cell) -> Cell {
        self.im[(ip & 0x0fff) as usize]
    }

    pub fn flash(&self) -> &[Cell] {
        &self.flash
    }

    /// Read a non-port target. Out-of-range indices wrap within their store.
    pub fn load(&self, target: Target) -> Cell {
        match target {
            Target::Flash(i) => self.flash[i % self.flash.len()],
            Target::Rom(i) => self.rom[i & (ROM_CELLS - 1)],
            Target::Im(i) => self.im[i & (IM_CELLS - 1)],
            Target::Ram(i) => self.ram[i & (self.ram.len() - 1)],
            Target::Port(_) => 0,
        }
    }

    /// Write a non-port target. ROM is never a write target.
    pub fn store(&mut self, target: Target, value: Cell) {
        match target {
            Target::Flash(i) => {
                let len = self.flash.len();
                self.flash[i % len] = value;
            }
            Target::Rom(_) => {}
            Target::Im(i) => self.im[i & (IM_CELLS - 1)] = value,
            Target::Ram(i) => {
                let mask = self.ram.len() - 1;
                self.ram[i & mask] = value;
            }
            Target::Port(_) => {}
        }
    }

    /// Copy a block out of a store, used by the DMA engine. Buffering the
    /// block makes overlapping moves safe in either direction.
    pub fn extract(&self, base: Target, cnt: usize) -> Vec<Cell> {
        (0..cnt).map(|k| self.load(base.offset(k))).collect()
    }

    /// Copy a block into a store.
    pub fn inject(&mut self, base: Target, cells: &[Cell]) {
        for (k, &value) in cells.iter().enumerate() {
            self.store(base.offset(k), value);
        }
    }
}

pub struct Bus {
    pub devices: DeviceList,
    events: EventQueue,
}

impl Bus {
    pub fn new() -> Bus {
        Bus { devices: DeviceList::new(), events: Rc::new(RefCell::new(VecDeque::new())) }
    }

    /// The queue devices feed host events into.
    pub fn events(&self) -> EventQueue {
        Rc::clone(&self.events)
    }

    pub fn attach(&mut self, port: Port, device: Box<dyn Device>) {
        self.devices.push((port, device));
    }

    /// Read one cell from a port; unattached and output-only ports yield 0.
    pub fn read(&mut self, port: Port) -> Cell {
        for (p, device) in &mut self.devices {
            if *p == port {
                return device.read_cell();
            }
        }
        0
    }

    /// Write one cell to a port; unattached and input-only ports discard.
    pub fn write(&mut self, port: Port, value: Cell) {
        for (p, device) in &mut self.devices {
            if *p == port {
                device.write_cell(value);
                return;
            }
        }
    }

    /// Refresh-rate housekeeping: let every device present and poll its host
    /// side. A closed window propagates as `Signal::Quit`.
    pub fn refresh(&mut self) -> Signal {
        let mut signal = Signal::Ok;
        for (_, device) in &mut self.devices {
            if let Signal::Quit = device.tick() {
                signal = Signal::Quit;
            }
        }
        signal
    }

    /// Drain one pending host event into the device buffers and report the
    /// event bits it raises in the utility register.
    pub fn interrupt(&mut self) -> (Cell, Signal) {
        let event = self.events.borrow_mut().pop_front();
        let event = match event {
            Some(event) => event,
            None => return (0, Signal::Ok),
        };
        let bits = match event {
            HostEvent::Quit => return (0, Signal::Quit),
            HostEvent::KeyDown(_) | HostEvent::KeyUp(_) => 0x1,
            HostEvent::MouseMove(_, _) | HostEvent::MouseDown(_) | HostEvent::MouseUp(_) => 0x2,
            HostEvent::User => 0x4,
        };
        for (_, device) in &mut self.devices {
            device.event(&event);
        }
        (bits, Signal::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booted() -> Memory {
        let mut flash = vec![0; ROM_CELLS];
        for (i, cell) in flash.iter_mut().enumerate() {
            *cell = i as Cell;
        }
        flash.push(0xdead_beef);
        Memory::boot(flash, 1 << 16).unwrap()
    }

    #[test]
    fn test_classification_partition() {
        assert_eq!(classify(0x8000_0000, Side::Read), Target::Flash(0));
        assert_eq!(classify(0xffff_ffff, Side::Write), Target::Flash(0x7fff_ffff));
        assert_eq!(classify(0x7fff_ffff, Side::Read), Target::Port(Port::Network));
        assert_eq!(classify(0x7fff_fffb, Side::Read), Target::Port(Port::Key));
        assert_eq!(classify(0x7fff_fff9, Side::Write), Target::Port(Port::Spare1));
        assert_eq!(classify(0x7fff_fff8, Side::Read), Target::Ram(0x7fff_fff8));
        assert_eq!(classify(0x0fff, Side::Read), Target::Rom(0x0fff));
        assert_eq!(classify(0x0fff, Side::Write), Target::Im(0x0fff));
        assert_eq!(classify(0x1000, Side::Read), Target::Ram(0x1000));
    }

    #[test]
    fn test_rom_is_immutable() {
        let mut memory = booted();
        memory.store(classify(0x10, Side::Write), 0x1234);
        assert_eq!(memory.load(classify(0x10, Side::Read)), 0x10);
        assert_eq!(memory.load(Target::Im(0x10)), 0x1234);
    }

    #[test]
    fn test_im_starts_as_rom_copy() {
        let memory = booted();
        assert_eq!(memory.fetch(0x123), 0x123);
        assert_eq!(memory.fetch(0x1123), 0x123); // ip wraps to 12 bits
    }

    #[test]
    fn test_flash_and_ram_round_trip() {
        let mut memory = booted();
        memory.store(classify(0x8000_1000, Side::Write), 42);
        assert_eq!(memory.load(classify(0x8000_1000, Side::Read)), 42);
        memory.store(classify(0x2000, Side::Write), 43);
        assert_eq!(memory.load(classify(0x2000, Side::Read)), 43);
    }

    #[test]
    fn test_rom_too_small() {
        assert!(Memory::boot(vec![0; 16], 1 << 16).is_err());
    }

    #[test]
    fn test_unattached_ports_read_zero() {
        let mut bus = Bus::new();
        assert_eq!(bus.read(Port::Key), 0);
        bus.write(Port::Video, 7);
    }
}
