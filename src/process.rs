//! Child processes that can be cancelled between output lines.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;

use crate::model::CancelFlag;

/// Longest time between two looks at the cancel flag while a child runs.
pub const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(100);

/// Lines of stderr kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug)]
pub enum RunOutcome {
    Exited {
        status: ExitStatus,
        /// Last lines the child wrote to stderr
        stderr: String,
    },
    /// The child was killed after the cancel flag was seen.
    Cancelled,
}

/// Spawns `cmd`, feeds every stdout line to `on_line` and waits for exit.
///
/// The cancel flag is checked after each line and at least every
/// [`CHECKPOINT_INTERVAL`]; once set, the child is killed.
pub async fn run_streaming(
    mut cmd: Command,
    cancel: &CancelFlag,
    mut on_line: impl FnMut(&str),
) -> io::Result<RunOutcome> {
    if cancel.is_cancelled() {
        return Ok(RunOutcome::Cancelled);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;
    let stderr_task = tokio::spawn(collect_tail(stderr));

    let mut lines = BufReader::new(stdout).lines();
    let mut stdout_open = true;
    let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if cancel.is_cancelled() {
            debug!("Cancel requested, killing child {:?}", child.id());
            child.kill().await?;
            stderr_task.abort();
            return Ok(RunOutcome::Cancelled);
        }

        tokio::select! {
            line = lines.next_line(), if stdout_open => match line? {
                Some(line) => on_line(&line),
                None => stdout_open = false,
            },
            status = child.wait(), if !stdout_open => {
                let status = status?;
                let stderr = stderr_task.await.unwrap_or_default();
                return Ok(RunOutcome::Exited { status, stderr });
            }
            _ = ticker.tick() => {}
        }
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(stream: R) -> String {
    let mut lines = BufReader::new(stream).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn streams_lines_and_captures_stderr() {
        let mut seen = Vec::new();
        let outcome = run_streaming(
            sh("echo one; echo two; echo oops >&2; exit 3"),
            &CancelFlag::new(),
            |line| seen.push(line.to_string()),
        )
        .await
        .unwrap();

        assert_eq!(seen, vec!["one", "two"]);
        assert_matches!(outcome, RunOutcome::Exited { status, stderr } => {
            assert_eq!(status.code(), Some(3));
            assert_eq!(stderr, "oops");
        });
    }

    #[tokio::test]
    async fn cancel_kills_a_silent_child_within_a_checkpoint() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = run_streaming(sh("sleep 30"), &cancel, |_| {}).await.unwrap();
        assert_matches!(outcome, RunOutcome::Cancelled);
        // 150 ms until the flag is set, then at most a couple of checkpoints
        let elapsed = started.elapsed();
        assert!(
            elapsed < Duration::from_millis(150) + CHECKPOINT_INTERVAL * 5,
            "took {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn does_not_spawn_when_already_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = run_streaming(Command::new("/definitely/not/here"), &cancel, |_| {})
            .await
            .unwrap();
        assert_matches!(outcome, RunOutcome::Cancelled);
    }
}
