fn main() {
    if let Err(err) = boltd::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
