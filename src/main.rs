fn main() {
    if let Err(err) = toolrelay::cli::main() {
        eprintln!("❌ Error: {err}");
        std::process::exit(1);
    }
}
