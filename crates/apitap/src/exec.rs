//! Subcommand execution: run the user's workload in a subshell while the
//! capture is live, relay its output between delimiter lines, and hand its
//! exit code back to the controller.

use anyhow::Context;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};

const DELIMITER: &str = "================================================";

/// Run `command` under `/bin/sh -c`, optionally as another user. Running as
/// root implicitly (via sudo, with no --user) is rejected so captures
/// started with elevated privilege don't silently run workloads as root.
pub async fn run_subcommand(command: &str, user: Option<&str>) -> anyhow::Result<i32> {
    let mut cmd = tokio::process::Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    match user {
        Some(name) => {
            let user = nix::unistd::User::from_name(name)
                .with_context(|| format!("looking up user {}", name))?
                .with_context(|| format!("user {} does not exist", name))?;
            cmd.uid(user.uid.as_raw()).gid(user.gid.as_raw());
        }
        None => {
            if nix::unistd::geteuid().is_root() && std::env::var_os("SUDO_USER").is_some() {
                anyhow::bail!(
                    "refusing to run the subcommand as root; pass --user to pick the account"
                );
            }
        }
    }

    let mut child = cmd.spawn().with_context(|| format!("spawning: {}", command))?;
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    println!("{}", DELIMITER);

    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            println!("{}", line);
        }
    });
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            eprintln!("{}", line);
        }
    });

    let status = child.wait().await.context("waiting for subcommand")?;
    let _ = tokio::join!(out_task, err_task);

    println!("{}", DELIMITER);

    Ok(status.code().unwrap_or(1))
}
