fn main() {
    if let Err(err) = sandboxctl::cli::run_sandboxctl() {
        tracing::debug!(error = ?err, "sandboxctl failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
