use std::io;
use std::process::ExitStatus;
use log::{debug, warn};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Split `NAME=value` entries, anything without a `=` is skipped.
pub fn env_pairs(envs: &[String]) -> Vec<(&str, &str)> {
    envs.iter().filter_map(|e| e.split_once('=')).collect()
}

fn command(cmd: &str, envs: &[String]) -> Command {
    let mut c = Command::new("/bin/sh");
    c.arg("-c").arg(cmd).envs(env_pairs(envs));
    c
}

/// Run `cmd` with the meter variables exported and wait for it.
pub async fn run_shell(cmd: &str, envs: &[String]) -> io::Result<ExitStatus> {
    command(cmd, envs).status().await
}

/// Start `cmd` and return at once, the exit status is only logged.
/// Await the handle to wait for the command.
pub fn invoke_shell(cmd: &str, envs: &[String]) -> JoinHandle<()> {
    let cmd = cmd.to_string();
    let envs = envs.to_vec();
    tokio::spawn(async move {
        match run_shell(&cmd, &envs).await {
            Ok(status) if status.success() => debug!("Shell command {cmd:?} done"),
            Ok(status) => warn!("Shell command {cmd:?} exited with {status}"),
            Err(e) => warn!("Unable to run shell command {cmd:?}: {e}"),
        }
    })
}
