//! Build script to capture git commit hash at compile time

use std::process::Command;

fn main() {
    // Release tarballs have no .git, let the packager supply the hash
    if let Ok(hash) = std::env::var("MACHINETIME_GIT_HASH") {
        println!("cargo:rustc-env=GIT_HASH={}", hash);
        println!("cargo:rerun-if-env-changed=MACHINETIME_GIT_HASH");
        return;
    }

    // Get short git hash
    let output = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output();

    let git_hash = match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => String::from("unknown"),
    };

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);

    // Rerun if git HEAD changes
    println!("cargo:rerun-if-changed=.git/HEAD");
}
