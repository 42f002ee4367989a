fn main() {
    if let Err(err) = graph_migrate::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
