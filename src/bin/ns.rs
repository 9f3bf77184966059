use newscript::devices::{Audio, AudioStream, DisabledLink, Keyboard, Mouse, Network};
use newscript::memory::{Bus, Memory, Port};
use newscript::processor::Vm;
use newscript::video::Console;
use newscript::{image, BootError, Configuration};
use rodio::{OutputStream, Source};
use std::rc::Rc;
use std::{env, process};

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} [file]", args[0]);
        return;
    }
    if let Err(err) = boot(&args[1]) {
        log::error!("{}", err);
        process::exit(err.exit_code());
    }
}

fn boot(path: &str) -> Result<(), BootError> {
    let flash = image::load(path).map_err(BootError::NoFile)?;
    let config = Configuration::default();
    let memory = Memory::boot(flash, config.ram_cells)?;

    let mut bus = Bus::new();
    let events = bus.events();
    bus.attach(Port::Video, Console::new(Rc::clone(&events))?);
    bus.attach(Port::Key, Keyboard::new());
    bus.attach(Port::Mouse, Mouse::new());
    bus.attach(Port::Network, Network::new(Box::new(DisabledLink), events));
    let audio = Audio::new();
    let ring = audio.ring();
    bus.attach(Port::Audio, audio);

    // keep the stream alive for the whole run
    let (_stream, handle) =
        OutputStream::try_default().map_err(|err| BootError::NoAudio(err.to_string()))?;
    handle
        .play_raw(AudioStream::new(ring).convert_samples())
        .map_err(|err| BootError::NoAudio(err.to_string()))?;

    log::info!("booting {}", path);
    let mut vm = Vm::new(memory, bus, &config);
    vm.run();

    // quit is terminal: flush flash back to the image file
    image::store(path, vm.memory.flash()).map_err(BootError::NoWriteback)?;
    Ok(())
}
