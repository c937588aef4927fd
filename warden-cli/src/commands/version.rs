//! Version command - show version information.

use anyhow::Result;

/// Version information.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the version command.
pub fn run() -> Result<()> {
    println!("Warden - Raft-replicated authorization decisions");
    println!();
    println!("Version:     {}", VERSION);
    println!(
        "Platform:    {} / {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    println!();
    println!("Components:");
    println!("  warden-core      Policy model, role graph, evaluator");
    println!("  warden-cluster   Replicated state machine, snapshots, membership");
    println!("  warden-cli       Command-line interface");

    Ok(())
}
