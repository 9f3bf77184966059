use newscript::compiler::Compiler;
use newscript::image;
use std::io;
use std::{env, process};

fn main() {
    // unknown-word diagnostics go to stderr unless the filter says otherwise
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} image.nsi", args[0]);
        return;
    }
    let path = &args[1];
    if let Err(err) = image::create(path) {
        log::error!("cannot create image {}: {}", path, err);
        process::exit(1);
    }
    let stdin = io::stdin();
    let mut compiler = Compiler::new();
    compiler.compile(stdin.lock());
    if let Err(err) = image::store(path, compiler.cells()) {
        log::error!("cannot write image {}: {}", path, err);
        process::exit(2);
    }
}
