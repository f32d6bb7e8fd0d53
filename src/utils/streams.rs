// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// Reads every line of a child's stdout or stderr until the pipe closes.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to drain.
///
/// # Returns
/// Vec<String> of lines, without line endings.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    match stream {
        ChildStream::Stdout => {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| anyhow!("Child stdout is not piped"))?;
            read_lines(stdout).await
        }
        ChildStream::Stderr => {
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| anyhow!("Child stderr is not piped"))?;
            read_lines(stderr).await
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<String>> {
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    Ok(out)
}


/// Drains a stream on its own task so a chatty child never blocks on a full pipe.
pub fn spawn_line_collector<R>(reader: R) -> JoinHandle<Result<Vec<String>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { read_lines(reader).await })
}

/// Joins a collector, treating a dropped or failed collector as empty output.
pub async fn collect_lines(handle: Option<JoinHandle<Result<Vec<String>>>>) -> Vec<String> {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(lines)) => lines,
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

/// Last `n` lines joined with newlines.
pub fn tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
