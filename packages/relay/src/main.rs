fn main() {
    if let Err(err) = claude_relay::cli::run_claude_relay() {
        tracing::error!(error = %err, "claude-relay failed");
        std::process::exit(1);
    }
}
