// The decoder and ALU. A fetched cell with the high bit clear is a literal
// and is pushed whole; otherwise it packs up to four opcodes, executed from
// the low byte upward until the remaining bits are zero. Control transfers
// abandon the rest of the pack. The same struct carries the DMA engine and
// the interrupt and refresh ticks, which are the only places time advances.

use crate::devices::Signal;
use crate::memory::{classify, Bus, Memory, Side, Target};
use crate::{Cell, Configuration};

/// DMA-completion flag in the utility register; bits 0..2 are the keyboard,
/// mouse and user event bits.
const DMA_DONE: Cell = 0x08;

pub struct Vm {
    pub ip: Cell,
    pub ds: [Cell; 8],
    pub dsi: usize,
    pub rs: [Cell; 8],
    pub rsi: usize,
    pub cnt: Cell,
    pub src: Cell,
    pub dst: Cell,
    pub utl: Cell,
    pub ticks: u64,
    pub memory: Memory,
    pub bus: Bus,
    interrupt_rate: u64,
    refresh_rate: u64,
}

impl Vm {
    pub fn new(memory: Memory, bus: Bus, config: &Configuration) -> Vm {
        Vm {
            ip: 0,
            ds: [0; 8],
            dsi: 0,
            rs: [0; 8],
            rsi: 0,
            cnt: 0,
            src: 0,
            dst: 0,
            utl: 0,
            ticks: 0,
            memory,
            bus,
            interrupt_rate: config.interrupt_rate,
            refresh_rate: config.refresh_rate,
        }
    }

    // Both stacks are 8 cells and circular: pushes and drops wrap the index
    // silently, there is no underflow or overflow.

    pub fn tos(&self) -> Cell {
        self.ds[self.dsi]
    }

    pub fn nos(&self) -> Cell {
        self.ds[self.dsi.wrapping_sub(1) & 7]
    }

    pub fn up(&mut self, value: Cell) {
        self.dsi = (self.dsi + 1) & 7;
        self.ds[self.dsi] = value;
    }

    pub fn down(&mut self) {
        self.dsi = self.dsi.wrapping_sub(1) & 7;
    }

    pub fn stos(&mut self, value: Cell) {
        self.ds[self.dsi] = value;
    }

    pub fn snos(&mut self, value: Cell) {
        self.ds[self.dsi.wrapping_sub(1) & 7] = value;
    }

    pub fn rtos(&self) -> Cell {
        self.rs[self.rsi]
    }

    pub fn upr(&mut self, value: Cell) {
        self.rsi = (self.rsi + 1) & 7;
        self.rs[self.rsi] = value;
    }

    pub fn downr(&mut self) {
        self.rsi = self.rsi.wrapping_sub(1) & 7;
    }

    /// Read one cell through the memory map, device ports included.
    pub fn mem_read(&mut self, addr: Cell) -> Cell {
        match classify(addr, Side::Read) {
            Target::Port(port) => self.bus.read(port),
            target => self.memory.load(target),
        }
    }

    /// Write one cell through the memory map, device ports included.
    pub fn mem_write(&mut self, addr: Cell, value: Cell) {
        match classify(addr, Side::Write) {
            Target::Port(port) => self.bus.write(port, value),
            target => self.memory.store(target, value),
        }
    }

    /// Move `cnt` cells between the resolved endpoints. Direction +1 copies
    /// the block starting at src/dst, -1 the block ending there. A readable
    /// source port fans out onto the data stack, a writable destination port
    /// consumes the source block cell by cell; two ports are a no-op.
    pub fn mem_move(&mut self, direction: i32) {
        self.utl &= !DMA_DONE;
        let cnt = self.cnt as usize;
        let src = classify(self.src, Side::Read);
        let dst = classify(self.dst, Side::Write);
        match (src, dst) {
            (Target::Port(_), Target::Port(_)) => {}
            (Target::Port(port), _) => {
                if port.readable() {
                    for _ in 0..cnt {
                        let value = self.bus.read(port);
                        self.up(value);
                    }
                }
            }
            (source, Target::Port(port)) => {
                if port.writable() {
                    let block = self.memory.extract(source, cnt);
                    for value in block {
                        self.bus.write(port, value);
                    }
                }
            }
            (source, destination) => {
                let (source, destination) = if direction < 0 {
                    (source.rewind(cnt), destination.rewind(cnt))
                } else {
                    (source, destination)
                };
                let block = self.memory.extract(source, cnt);
                self.memory.inject(destination, &block);
            }
        }
        self.utl |= DMA_DONE;
    }

    /// Compare `cnt` cells at the two endpoints, leaving the byte-wise
    /// difference in the count register. Ports cannot be compared and leave
    /// 0, as if equal.
    pub fn mem_cmp(&mut self) {
        self.utl &= !DMA_DONE;
        let cnt = self.cnt as usize;
        let src = classify(self.src, Side::Read);
        let dst = classify(self.dst, Side::Write);
        self.cnt = match (src, dst) {
            (Target::Port(_), _) | (_, Target::Port(_)) => 0,
            (source, destination) => {
                let a = self.memory.extract(source, cnt);
                let b = self.memory.extract(destination, cnt);
                cmp_cells(&a, &b) as Cell
            }
        };
        self.utl |= DMA_DONE;
    }

    /// Advance the clock: pump one host event at the interrupt rate, present
    /// the devices at the refresh rate.
    fn update(&mut self) -> Signal {
        self.ticks += 1;
        if self.ticks % self.interrupt_rate == 0 {
            if let Signal::Quit = self.interrupt() {
                return Signal::Quit;
            }
        }
        if self.ticks % self.refresh_rate == 0 {
            if let Signal::Quit = self.bus.refresh() {
                return Signal::Quit;
            }
        }
        Signal::Ok
    }

    fn interrupt(&mut self) -> Signal {
        self.utl &= !0xf;
        let (bits, signal) = self.bus.interrupt();
        self.utl |= bits;
        signal
    }

    /// One fetch: tick, read the cell under the masked instruction pointer,
    /// then push it or decode it.
    pub fn step(&mut self) -> Signal {
        if let Signal::Quit = self.update() {
            return Signal::Quit;
        }
        self.ip &= 0x0fff;
        let instr = self.memory.fetch(self.ip);
        self.ip += 1;
        if instr & 0x8000_0000 == 0 {
            self.up(instr);
            return Signal::Ok;
        }
        let mut pack = instr;
        loop {
            if self.execute((pack & 0xff) as u8) {
                break;
            }
            pack >>= 8;
            if pack == 0 {
                break;
            }
        }
        Signal::Ok
    }

    pub fn run(&mut self) {
        loop {
            if let Signal::Quit = self.step() {
                break;
            }
        }
    }

    /// Execute one opcode; returns true on a control transfer, which
    /// abandons the rest of the pack. Unknown opcodes fall through.
    fn execute(&mut self, op: u8) -> bool {
        match op {
            0x80 => {} // nop
            0x81 => {
                // call
                self.upr(self.ip);
                self.ip = self.tos();
                self.down();
                return true;
            }
            0x82 => self.down(),
            0x83 => {
                // nip
                let top = self.tos();
                self.snos(top);
                self.down();
            }
            0x84 => {
                // >r
                let top = self.tos();
                self.upr(top);
                self.down();
            }
            0x85 => {
                let top = self.tos();
                self.stos(!top);
            }
            0x86 => {
                let value = self.tos() & self.nos();
                self.snos(value);
                self.down();
            }
            0x87 => {
                let value = self.tos() | self.nos();
                self.snos(value);
                self.down();
            }
            0x88 => {
                let value = self.tos() ^ self.nos();
                self.snos(value);
                self.down();
            }
            0x89 => {
                // fetch
                let value = self.mem_read(self.tos());
                self.stos(value);
            }
            0x8a => {
                let flag = if (self.nos() as i32) < (self.tos() as i32) { !0 } else { 0 };
                self.down();
                self.stos(flag);
            }
            0x8b => {
                let flag = if self.nos() == self.tos() { !0 } else { 0 };
                self.down();
                self.stos(flag);
            }
            0x8c => {
                let top = self.tos();
                self.stos(top << 1);
            }
            0x8d => {
                let top = self.tos();
                self.stos(top << 8);
            }
            0x8e => self.up(0),
            0x8f => self.up(1),
            0x90 => {
                // jump
                self.ip = self.rtos();
                self.downr();
                return true;
            }
            0x91 => {
                // cond-jump: ( flag target -- )
                if self.nos() == 0 {
                    self.down();
                    self.down();
                } else {
                    self.ip = self.tos();
                    self.down();
                    self.down();
                    return true;
                }
            }
            0x92 => self.up(self.tos()),
            0x93 => self.up(self.nos()),
            0x94 => {
                // r>
                let top = self.rtos();
                self.downr();
                self.up(top);
            }
            0x95 => {
                let top = self.tos();
                self.stos((top as i32).wrapping_neg() as Cell);
            }
            0x96 => {
                let value = self.tos().wrapping_add(self.nos());
                self.snos(value);
                self.down();
            }
            0x97 => {
                // product replaces nos, tos survives
                let value = (self.tos() as i32).wrapping_mul(self.nos() as i32);
                self.snos(value as Cell);
            }
            0x98 => {
                // a = tos, b = nos; quotient to tos, remainder to nos
                let a = self.tos() as i32;
                let b = self.nos() as i32;
                self.stos(a.wrapping_div(b) as Cell);
                self.snos(a.wrapping_rem(b) as Cell);
            }
            0x99 => {
                // store
                let addr = self.tos();
                let value = self.nos();
                self.mem_write(addr, value);
                self.down();
            }
            0x9a => {
                let flag = if (self.nos() as i32) > (self.tos() as i32) { !0 } else { 0 };
                self.down();
                self.stos(flag);
            }
            0x9b => {
                let flag = if self.nos() != self.tos() { !0 } else { 0 };
                self.down();
                self.stos(flag);
            }
            0x9c => {
                let top = self.tos();
                self.stos(top >> 1);
            }
            0x9d => {
                let top = self.tos();
                self.stos(top >> 8);
            }
            0x9e => self.up(self.utl),
            0x9f => self.up(!0),
            0xa0 => self.mem_move(-1),
            0xa1 => self.up(self.cnt),
            0xa2 => self.up(self.src),
            0xa3 => self.up(self.dst),
            0xc0 => self.mem_cmp(),
            0xc1 => self.cnt = self.cnt.wrapping_add(1),
            0xc2 => {
                // src-fetch
                self.up(0);
                let value = self.mem_read(self.src);
                self.stos(value);
                self.src = self.src.wrapping_add(1);
            }
            0xc3 => {
                // dst-store
                let top = self.tos();
                self.mem_write(self.dst, top);
                self.dst = self.dst.wrapping_add(1);
            }
            0xe0 => self.mem_move(1),
            0xe1 => {
                self.cnt = self.tos();
                self.down();
            }
            0xe2 => {
                self.src = self.tos();
                self.down();
            }
            0xe3 => {
                self.dst = self.tos();
                self.down();
            }
            _ => {}
        }
        false
    }
}

/// Byte-wise comparison of two cell blocks in memory order, glibc-style:
/// the difference of the first unequal byte pair, or 0.
fn cmp_cells(a: &[Cell], b: &[Cell]) -> i32 {
    for (x, y) in a.iter().zip(b.iter()) {
        for (p, q) in x.to_le_bytes().iter().zip(y.to_le_bytes().iter()) {
            if p != q {
                return *p as i32 - *q as i32;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Device, HostEvent};
    use crate::memory::Port;

    fn vm(code: &[Cell]) -> Vm {
        let mut flash = code.to_vec();
        flash.resize(crate::memory::ROM_CELLS, 0);
        let config =
            Configuration { ram_cells: 1 << 16, ..Configuration::default() };
        let memory = Memory::boot(flash, config.ram_cells).unwrap();
        Vm::new(memory, Bus::new(), &config)
    }

    #[test]
    fn test_literal_pushes_raw_cell() {
        let mut vm = vm(&[0x7fff_ffff]);
        vm.step();
        assert_eq!(vm.tos(), 0x7fff_ffff);
    }

    #[test]
    fn test_pack_executes_low_byte_first() {
        // push 0, push 1, nip, nop
        let mut vm = vm(&[0x8083_8f8e]);
        vm.step();
        assert_eq!(vm.tos(), 1);
        assert_eq!(vm.dsi, 1);
    }

    #[test]
    fn test_stack_indices_stay_in_range() {
        let mut vm = vm(&[]);
        for i in 0..20 {
            vm.up(i);
            assert!(vm.dsi < 8);
        }
        for _ in 0..20 {
            vm.down();
            assert!(vm.dsi < 8);
        }
    }

    #[test]
    fn test_comparisons_consume_operands() {
        let mut vm = vm(&[]);
        vm.up(3);
        vm.up(5);
        vm.execute(0x8a); // 3 < 5
        assert_eq!(vm.tos(), !0);
        assert_eq!(vm.dsi, 1);
        vm.up(0xffff_ffff); // -1 > tos(-1)? no: signed
        vm.execute(0x9a);
        assert_eq!(vm.tos(), 0);
    }

    #[test]
    fn test_less_compares_signed() {
        let mut vm = vm(&[]);
        vm.up(0xffff_ffff); // -1
        vm.up(1);
        vm.execute(0x8a);
        assert_eq!(vm.tos(), !0);
    }

    #[test]
    fn test_multiply_keeps_tos() {
        let mut vm = vm(&[]);
        vm.up(6);
        vm.up(7);
        vm.execute(0x97);
        assert_eq!(vm.tos(), 7);
        assert_eq!(vm.nos(), 42);
    }

    #[test]
    fn test_divide_operand_order() {
        let mut vm = vm(&[]);
        vm.up(3); // b = nos
        vm.up(7); // a = tos
        vm.execute(0x98);
        assert_eq!(vm.tos(), 2); // 7 / 3
        assert_eq!(vm.nos(), 1); // 7 % 3
    }

    #[test]
    fn test_store_drops_address_only() {
        let mut vm = vm(&[]);
        vm.up(42);
        vm.up(0x2000);
        vm.execute(0x99);
        assert_eq!(vm.tos(), 42);
        assert_eq!(vm.mem_read(0x2000), 42);
    }

    #[test]
    fn test_taken_branch_abandons_pack() {
        // push 1 (flag), then a pack: literal 5 would follow; instead use
        // cond-jump with trailing push ops that must not run
        let mut vm = vm(&[0x0000_0001, 0x0000_0123, 0x8e8e_8e91]);
        vm.step(); // flag
        vm.step(); // target
        vm.step(); // cond-jump, taken
        assert_eq!(vm.ip, 0x123);
        assert_eq!(vm.dsi, 0); // both consumed, nothing else pushed
    }

    #[test]
    fn test_untaken_branch_continues_pack() {
        let mut vm = vm(&[0x0000_0000, 0x0000_0123, 0x8080_8e91]);
        vm.step();
        vm.step();
        vm.step(); // cond-jump not taken, then push 0
        assert_eq!(vm.ip, 3);
        assert_eq!(vm.dsi, 1);
        assert_eq!(vm.tos(), 0);
    }

    #[test]
    fn test_dma_up_and_completion_flag() {
        let mut vm = vm(&[0x8000_00e0]);
        for (i, value) in [1u32, 2, 3, 4].iter().enumerate() {
            vm.mem_write(0x1000 + i as Cell, *value);
        }
        vm.src = 0x1000;
        vm.dst = 0x1100;
        vm.cnt = 4;
        vm.step();
        for (i, value) in [1u32, 2, 3, 4].iter().enumerate() {
            assert_eq!(vm.mem_read(0x1100 + i as Cell), *value);
        }
        assert_ne!(vm.utl & 0x08, 0);
    }

    #[test]
    fn test_dma_down_copies_block_ending_at_registers() {
        let mut vm = vm(&[]);
        for i in 0..4 {
            vm.mem_write(0x2000 + i, 10 + i);
        }
        vm.src = 0x2004;
        vm.dst = 0x2104;
        vm.cnt = 4;
        vm.mem_move(-1);
        for i in 0..4 {
            assert_eq!(vm.mem_read(0x2100 + i), 10 + i);
        }
    }

    #[test]
    fn test_dma_tolerates_overlap() {
        let mut vm = vm(&[]);
        for i in 0..4 {
            vm.mem_write(0x3000 + i, i);
        }
        vm.src = 0x3000;
        vm.dst = 0x3001;
        vm.cnt = 4;
        vm.mem_move(1);
        for i in 0..4 {
            assert_eq!(vm.mem_read(0x3001 + i), i);
        }
    }

    #[test]
    fn test_dma_into_im_executes() {
        let mut vm = vm(&[]);
        vm.mem_write(0x1000, 0x0000_002a);
        vm.src = 0x1000;
        vm.dst = 0x0000;
        vm.cnt = 1;
        vm.mem_move(1);
        vm.step(); // fetch the freshly written literal
        assert_eq!(vm.tos(), 0x2a);
        // ROM still holds the boot value
        assert_eq!(vm.mem_read(0x0000), 0);
    }

    struct Counter {
        next: Cell,
    }

    impl Device for Counter {
        fn read_cell(&mut self) -> Cell {
            self.next += 1;
            self.next
        }
    }

    struct Sink {
        sunk: std::rc::Rc<std::cell::RefCell<Vec<Cell>>>,
    }

    impl Device for Sink {
        fn write_cell(&mut self, value: Cell) {
            self.sunk.borrow_mut().push(value);
        }
    }

    #[test]
    fn test_dma_from_port_pushes_onto_stack() {
        let mut vm = vm(&[]);
        vm.bus.attach(Port::Key, Box::new(Counter { next: 0 }));
        vm.src = 0x7fff_fffb;
        vm.dst = 0x1000;
        vm.cnt = 3;
        vm.mem_move(1);
        assert_eq!(vm.dsi, 3);
        assert_eq!(vm.tos(), 3);
        assert_eq!(vm.nos(), 2);
    }

    #[test]
    fn test_dma_to_port_writes_source_block() {
        let mut vm = vm(&[]);
        let sunk = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        vm.bus.attach(Port::Network, Box::new(Sink { sunk: std::rc::Rc::clone(&sunk) }));
        for i in 0..3 {
            vm.mem_write(0x1000 + i, 7 + i);
        }
        vm.src = 0x1000;
        vm.dst = 0x7fff_ffff;
        vm.cnt = 3;
        vm.mem_move(1);
        assert_eq!(*sunk.borrow(), vec![7, 8, 9]);
    }

    #[test]
    fn test_mem_cmp_equal_and_unequal() {
        let mut vm = vm(&[]);
        for i in 0..4 {
            vm.mem_write(0x1000 + i, i);
            vm.mem_write(0x1100 + i, i);
        }
        vm.src = 0x1000;
        vm.dst = 0x1100;
        vm.cnt = 4;
        vm.mem_cmp();
        assert_eq!(vm.cnt, 0);
        assert_ne!(vm.utl & 0x08, 0);
        vm.mem_write(0x1102, 9);
        vm.cnt = 4;
        vm.mem_cmp();
        assert_ne!(vm.cnt, 0);
    }

    #[test]
    fn test_mem_cmp_against_port_yields_zero() {
        let mut vm = vm(&[]);
        vm.src = 0x7fff_fffb;
        vm.dst = 0x1000;
        vm.cnt = 4;
        vm.mem_cmp();
        assert_eq!(vm.cnt, 0);
        assert_ne!(vm.utl & 0x08, 0);
    }

    #[test]
    fn test_interrupt_pump_sets_event_bits() {
        let mut flash = vec![0x8080_8080u32];
        flash.resize(crate::memory::ROM_CELLS, 0);
        let config = Configuration { interrupt_rate: 1, ram_cells: 1 << 16, ..Configuration::default() };
        let memory = Memory::boot(flash, config.ram_cells).unwrap();
        let bus = Bus::new();
        let events = bus.events();
        let mut vm = Vm::new(memory, bus, &config);
        vm.bus.attach(Port::Key, crate::devices::Keyboard::new());
        events.borrow_mut().push_back(HostEvent::KeyDown(0x0b));
        vm.step();
        assert_eq!(vm.utl & 0xf, 0x1);
        assert_eq!(vm.mem_read(0x7fff_fffb), 0x8b);
        // the next pump clears the event bits again
        vm.step();
        assert_eq!(vm.utl & 0xf, 0);
    }

    #[test]
    fn test_quit_event_stops_the_machine() {
        let mut flash = vec![0x8080_8080u32];
        flash.resize(crate::memory::ROM_CELLS, 0);
        let config = Configuration { interrupt_rate: 1, ram_cells: 1 << 16, ..Configuration::default() };
        let memory = Memory::boot(flash, config.ram_cells).unwrap();
        let bus = Bus::new();
        let events = bus.events();
        let mut vm = Vm::new(memory, bus, &config);
        events.borrow_mut().push_back(HostEvent::Quit);
        assert_eq!(vm.step(), Signal::Quit);
    }

    #[test]
    fn test_utility_register_reads_back() {
        let mut vm = vm(&[]);
        vm.utl = 0xdead_0000;
        vm.execute(0x9e);
        assert_eq!(vm.tos(), 0xdead_0000);
    }

    #[test]
    fn test_register_loads_pop() {
        let mut vm = vm(&[]);
        vm.up(0x40);
        vm.up(0x50);
        vm.up(0x60);
        vm.execute(0xe3);
        vm.execute(0xe2);
        vm.execute(0xe1);
        assert_eq!((vm.cnt, vm.src, vm.dst), (0x40, 0x50, 0x60));
        assert_eq!(vm.dsi, 0);
    }

    #[test]
    fn test_src_fetch_and_dst_store_walk() {
        let mut vm = vm(&[]);
        vm.mem_write(0x1000, 0xaa);
        vm.src = 0x1000;
        vm.execute(0xc2);
        assert_eq!(vm.tos(), 0xaa);
        assert_eq!(vm.src, 0x1001);
        vm.dst = 0x1200;
        vm.execute(0xc3);
        assert_eq!(vm.mem_read(0x1200), 0xaa);
        assert_eq!(vm.dst, 0x1201);
        assert_eq!(vm.tos(), 0xaa); // dst-store does not drop
    }
}
