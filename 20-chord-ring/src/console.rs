use anyhow::Result;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tracing::debug;

use crate::config::NodeConfig;
use crate::lookup::{Lookup, SetOutcome};
use crate::protocol::{ConsoleCommand, USAGE};
use crate::runtime::{spawn_node, NodeHandle};

/// Runs a node driven by stdin until `exit` or end of input.
pub async fn run(config: NodeConfig) -> Result<()> {
    let (handle, mut events) = spawn_node(config);
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        select! {
            Some(event) = events.recv() => write_stdout(&event.to_string()).await?,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_input(&handle, &line).await? {
                    break;
                }
            }
        }
    }

    handle.shutdown().await?;
    while let Ok(event) = events.try_recv() {
        write_stdout(&event.to_string()).await?;
    }
    Ok(())
}

async fn handle_input(handle: &NodeHandle, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err:#}")).await?;
            write_stdout(USAGE).await?;
            return Ok(true);
        }
    };

    let outcome = match command {
        ConsoleCommand::New => handle.create().await,
        ConsoleCommand::PEntry(predecessor) => handle.join(predecessor).await,
        ConsoleCommand::BEntry(boot) => handle.bootstrap(boot).await,
        ConsoleCommand::Find(key) => match handle.find(key).await {
            Ok(Lookup::Local(owner)) => {
                write_stdout(&format!("key {key} belongs to node {owner}")).await?;
                Ok(())
            }
            Ok(Lookup::Pending(seq)) => {
                debug!(%key, %seq, "find routed");
                Ok(())
            }
            Err(err) => Err(err),
        },
        ConsoleCommand::Get(key) => match handle.get(key).await {
            Ok(Lookup::Local(Some(value))) => {
                write_stdout(&format!("key {key} = {value}")).await?;
                Ok(())
            }
            Ok(Lookup::Local(None)) => {
                write_stdout(&format!("key {key} not found")).await?;
                Ok(())
            }
            Ok(Lookup::Pending(seq)) => {
                debug!(%key, %seq, "get routed");
                Ok(())
            }
            Err(err) => Err(err),
        },
        ConsoleCommand::Set { key, value } => handle.set(key, value).await.map(|outcome| {
            if outcome == SetOutcome::Forwarded {
                debug!(%key, "set routed");
            }
        }),
        ConsoleCommand::Chord(shortcut) => handle.set_shortcut(shortcut).await,
        ConsoleCommand::EChord => handle.clear_shortcut().await,
        ConsoleCommand::Show => match handle.status().await {
            Ok(status) => {
                write_stdout(&status.to_string()).await?;
                Ok(())
            }
            Err(err) => Err(err),
        },
        ConsoleCommand::Leave => handle.leave().await,
        ConsoleCommand::Exit => return Ok(false),
        ConsoleCommand::Help => {
            write_stdout(USAGE).await?;
            Ok(())
        }
    };

    if let Err(err) = outcome {
        write_stderr(&format!("!!! {err:#}")).await?;
    }
    Ok(true)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
