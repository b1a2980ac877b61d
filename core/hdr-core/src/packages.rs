//! Third-party package enumeration.

use tracing::{debug, warn};

use crate::runner::CommandRunner;

/// Tried in order; the first that succeeds with output wins.
const LIST_COMMANDS: [&str; 4] = [
    "pm list packages -3",
    "cmd package list packages -3",
    "/system/bin/pm list packages -3",
    "/system/bin/cmd package list packages -3",
];

/// Parses `pm list packages` output into package ids.
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_start_matches("package:").trim())
        .filter(|pkg| !pkg.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lists user-installed packages. All commands failing yields an empty list.
pub async fn list_packages(runner: &dyn CommandRunner) -> Vec<String> {
    for command in LIST_COMMANDS {
        let output = runner.exec(command).await;
        if output.success() && !output.stdout.trim().is_empty() {
            let packages = parse_package_list(&output.stdout);
            debug!(command, count = packages.len(), "Packages listed");
            return packages;
        }
        debug!(command, errno = output.errno, stderr = %output.stderr, "Package list command failed");
    }
    warn!("No package list command succeeded");
    Vec::new()
}
