use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn binary_relays_between_clients() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broadcast-relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Drain additional relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let banner = reqwest::get(format!("http://{addr}/"))
        .await
        .context("readiness request failed")?
        .text()
        .await?;
    assert_eq!(banner, "Boardgame backend running!");

    let (mut alice, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .context("alice failed to connect")?;
    let (mut bob, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .context("bob failed to connect")?;

    // Registration happens after the upgrade completes; keep knocking until
    // bob is reachable.
    let greeting = timeout(READ_TIMEOUT, async {
        loop {
            alice.send(Message::Text("/chess".into())).await?;
            match timeout(Duration::from_millis(100), bob.next()).await {
                Ok(Some(frame)) => return anyhow::Ok(frame?),
                Ok(None) => return Err(anyhow!("bob's stream ended")),
                Err(_) => continue,
            }
        }
    })
    .await
    .context("bob never heard alice")??;
    assert_eq!(greeting, Message::Text("/chess".into()));

    bob.close(None).await.context("bob close")?;
    alice.close(None).await.context("alice close")?;

    // Relay stays up after clients disconnect; terminate it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    let _ = relay_log_task.await;

    Ok(())
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("relay did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
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

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while let Ok(bytes) = reader.read_line(&mut buffer).await {
        if bytes == 0 {
            break;
        }
        buffer.clear();
    }
}
