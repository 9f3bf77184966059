// The video port speaks VGDD: three-cell commands whose first cell is the
// opcode and whose arguments carry 16-bit signed geometry in their low
// halves. The canvas rasterizes the command stream into an RGB framebuffer
// with the origin at the bottom left; the console presents that buffer in a
// window at the refresh tick and feeds key, mouse and quit events back into
// the shared queue.

use crate::devices::{keymap, Device, EventQueue, HostEvent, Signal};
use crate::{BootError, Cell};
use minifb::{Key, MouseButton, MouseMode, Window, WindowOptions};

pub const WIDTH: usize = 1280;
pub const HEIGHT: usize = 720;

const WHITE: u32 = 0x00ff_ffff;
/// A quarter turn, with pi approximated as 355/113.
const QUARTER_TURN: f64 = 355.0 / 226.0;

/// Colors arrive as RGBA cells with red in the low byte; the framebuffer
/// wants 0RGB with red in the high byte.
fn pixel(color: Cell) -> u32 {
    let r = color & 0xff;
    let g = (color >> 8) & 0xff;
    let b = (color >> 16) & 0xff;
    (r << 16) | (g << 8) | b
}

pub struct Canvas {
    buffer: Vec<u32>,
    x: i16,
    y: i16,
    dx: i16,
    dy: i16,
    line_color: Cell,
    fill_color: Cell,
    command: [Cell; 3],
    index: usize,
}

impl Canvas {
    pub fn new() -> Canvas {
        Canvas {
            buffer: vec![WHITE; WIDTH * HEIGHT],
            x: 0,
            y: 0,
            dx: 0,
            dy: 0,
            line_color: 0,
            fill_color: 0,
            command: [0; 3],
            index: 0,
        }
    }

    pub fn buffer(&self) -> &[u32] {
        &self.buffer
    }

    pub fn position(&self) -> (i16, i16) {
        (self.x, self.y)
    }

    /// Feed one cell into the command buffer; a command fires as soon as its
    /// argument count is reached.
    pub fn write(&mut self, value: Cell) {
        self.index %= 3;
        self.command[self.index] = value;
        self.index += 1;
        let fires = match self.command[0] {
            0x0 | 0x4 | 0x6 | 0x9 | 0xa => self.index == 1,
            0x5 | 0x7 | 0x8 => self.index == 2,
            0x1 | 0x2 | 0x3 => self.index == 3,
            _ => false,
        };
        if !fires {
            return;
        }
        match self.command[0] {
            0x0 => self.clear(),
            0x1 => self.at(),
            0x2 => self.to(),
            0x3 => self.by(),
            0x4 => self.line(),
            0x5 => self.arc(),
            0x6 => self.rect(),
            0x7 => self.line_color = self.command[1],
            0x8 => self.fill_color = self.command[1],
            0x9 => self.advance(),
            _ => {} // 0xa blit: texture transfers are not wired up
        }
        self.index = 0;
    }

    fn arg(&self, i: usize) -> i16 {
        (self.command[i] & 0xffff) as i16
    }

    fn clear(&mut self) {
        for cell in self.buffer.iter_mut() {
            *cell = WHITE;
        }
    }

    fn at(&mut self) {
        self.x = self.arg(1);
        self.y = self.arg(2);
    }

    fn to(&mut self) {
        self.x = self.x.wrapping_add(self.arg(1));
        self.y = self.y.wrapping_add(self.arg(2));
    }

    fn by(&mut self) {
        self.dx = self.arg(1);
        self.dy = self.arg(2);
    }

    fn advance(&mut self) {
        self.x = self.x.wrapping_add(self.dx);
        self.y = self.y.wrapping_add(self.dy);
    }

    fn plot(&mut self, x: i32, y: i32, color: u32) {
        if x < 0 || y < 0 || x >= WIDTH as i32 || y >= HEIGHT as i32 {
            return;
        }
        let row = HEIGHT as i32 - 1 - y; // y runs up from the bottom
        self.buffer[(row * WIDTH as i32 + x) as usize] = color;
    }

    /// Draw a line from the current position along (dx, dy), then advance.
    fn line(&mut self) {
        let color = pixel(self.line_color);
        let (x0, y0) = (self.x as i32, self.y as i32);
        let (dx, dy) = (self.dx as i32, self.dy as i32);
        let steps = dx.abs().max(dy.abs()).max(1);
        for k in 0..=steps {
            self.plot(x0 + dx * k / steps, y0 + dy * k / steps, color);
        }
        self.advance();
    }

    /// Draw a quarter arc from the current position to (x+dx, y+dy), bowing
    /// one way or the other depending on the orientation argument.
    fn arc(&mut self) {
        let color = pixel(self.line_color);
        let clockwise = self.command[1] != 0;
        let (x0, y0) = (self.x as f64, self.y as f64);
        let (dx, dy) = (self.dx as f64, self.dy as f64);
        let length = (dx * dx + dy * dy).sqrt();
        let step = if length > 0.0 { 2.0 * QUARTER_TURN / length } else { 2.0 * QUARTER_TURN };
        let mut d = 0.0;
        while d < QUARTER_TURN {
            let (px, py) = if clockwise {
                (x0 + dx * d.sin(), y0 + dy * (1.0 - d.cos()))
            } else {
                (x0 + dx * (1.0 - d.sin()), y0 + dy * d.cos())
            };
            self.plot(px as i32, py as i32, color);
            d += step;
        }
        self.advance();
    }

    /// Fill the rectangle between the current position and (x+dx, y+dy),
    /// then advance.
    fn rect(&mut self) {
        let color = pixel(self.fill_color);
        let (x0, x1) = (self.x as i32, self.x as i32 + self.dx as i32);
        let (y0, y1) = (self.y as i32, self.y as i32 + self.dy as i32);
        for y in y0.min(y1)..=y0.max(y1) {
            for x in x0.min(x1)..=x0.max(x1) {
                self.plot(x, y, color);
            }
        }
        self.advance();
    }
}

/// The display device: owns the window, presents the canvas, and turns host
/// input into events for the interrupt pump.
pub struct Console {
    window: Window,
    canvas: Canvas,
    events: EventQueue,
    keys: Vec<Key>,
    mouse: (f32, f32),
    buttons: [bool; 3],
}

const BUTTONS: [MouseButton; 3] = [MouseButton::Left, MouseButton::Middle, MouseButton::Right];

impl Console {
    pub fn new(events: EventQueue) -> Result<Box<Console>, BootError> {
        let window = Window::new("NewScript", WIDTH, HEIGHT, WindowOptions::default())
            .map_err(|err| BootError::NoDisplay(err.to_string()))?;
        Ok(Box::new(Console {
            window,
            canvas: Canvas::new(),
            events,
            keys: Vec::new(),
            mouse: (0.0, 0.0),
            buttons: [false; 3],
        }))
    }

    fn poll_input(&mut self) {
        let mut events = self.events.borrow_mut();
        let shift =
            self.window.is_key_down(Key::LeftShift) || self.window.is_key_down(Key::RightShift);
        let keys = self.window.get_keys().unwrap_or_default();
        for &key in keys.iter() {
            if !self.keys.contains(&key) {
                events.push_back(HostEvent::KeyDown(keymap(key, shift)));
            }
        }
        for &key in self.keys.iter() {
            if !keys.contains(&key) {
                events.push_back(HostEvent::KeyUp(keymap(key, shift)));
            }
        }
        self.keys = keys;
        if let Some(position) = self.window.get_mouse_pos(MouseMode::Clamp) {
            if position != self.mouse {
                self.mouse = position;
                events.push_back(HostEvent::MouseMove(position.0 as Cell, position.1 as Cell));
            }
        }
        for (i, &button) in BUTTONS.iter().enumerate() {
            let down = self.window.get_mouse_down(button);
            if down != self.buttons[i] {
                self.buttons[i] = down;
                let number = i as u8 + 1;
                events.push_back(if down {
                    HostEvent::MouseDown(number)
                } else {
                    HostEvent::MouseUp(number)
                });
            }
        }
    }
}

impl Device for Console {
    fn write_cell(&mut self, value: Cell) {
        self.canvas.write(value);
    }

    fn tick(&mut self) -> Signal {
        if !self.window.is_open() || self.window.is_key_down(Key::Escape) {
            return Signal::Quit;
        }
        if let Err(err) = self.window.update_with_buffer(self.canvas.buffer(), WIDTH, HEIGHT) {
            log::error!("cannot update display: {}", err);
        }
        self.poll_input();
        Signal::Ok
    }
}
