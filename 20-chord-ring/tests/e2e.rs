use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn console_ring_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chord-ring");

    let mut five = spawn_node(&binary, 5, 47501).await?;
    let mut twenty = spawn_node(&binary, 20, 47502).await?;

    five.send_line("bogus").await?;
    five.read_until("usage hint", |line| line.starts_with("commands:"))
        .await?;

    five.send_line("new").await?;
    five.expect_line("created ring as node 5 (127.0.0.1:47501)").await?;
    five.send_line("set 3 hello").await?;
    five.send_line("get 3").await?;
    five.expect_line("key 3 = hello").await?;

    twenty.send_line("pentry 5 127.0.0.1 47501").await?;
    twenty
        .expect_line("successor is node 5 (127.0.0.1:47501)")
        .await?;

    // Key 12 lies in node 5's arc, key 3 moved to node 20 on join.
    twenty.send_line("find 12").await?;
    twenty
        .expect_line("key 12 belongs to node 5 (127.0.0.1:47501)")
        .await?;
    five.send_line("get 3").await?;
    five.expect_line("key 3 = hello").await?;
    five.send_line("find 3").await?;
    five.expect_line("key 3 belongs to node 20 (127.0.0.1:47502)")
        .await?;

    five.send_line("SHOW").await?;
    five.expect_line("node 5 (127.0.0.1:47501) [connected]").await?;

    // Exiting node 20 hands key 3 back and leaves node 5 alone.
    twenty.send_line("exit").await?;
    ensure_success(&mut twenty.child, "node 20").await?;
    five.expect_line("successor is node 5 (127.0.0.1:47501)")
        .await?;
    five.send_line("get 3").await?;
    five.expect_line("key 3 = hello").await?;

    five.send_line("exit").await?;
    ensure_success(&mut five.child, "node 5").await?;
    Ok(())
}

struct NodeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl NodeProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect_line(&mut self, expected: &str) -> Result<String> {
        self.read_until(expected, |line| line == expected).await
    }

    /// Reads lines until one matches, skipping topology notices.
    async fn read_until<F>(&mut self, description: &str, matches: F) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        loop {
            let line = read_line(&mut self.stdout)
                .await
                .with_context(|| format!("waiting for {description}"))?
                .with_context(|| format!("stdout closed while waiting for {description}"))?;
            if matches(&line) {
                return Ok(line);
            }
        }
    }
}

async fn spawn_node(binary: &Path, key: u8, port: u16) -> Result<NodeProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg(key.to_string())
        .arg("127.0.0.1")
        .arg(port.to_string())
        .arg("--bind")
        .arg("127.0.0.1")
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn node {key}"))?;
    let stdin = child.stdin.take().context("node stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("node stdout missing after spawn")?;

    Ok(NodeProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let bytes = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .with_context(|| format!("{name} did not exit"))?
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
