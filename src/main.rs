fn main() {
    let code = nin::run::run().unwrap_or_else(|err| {
        eprintln!("ninja: error: {:#}", err);
        1
    });
    std::process::exit(code);
}
