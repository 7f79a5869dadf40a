mod request;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use avlink::{devices, open_serial, DeviceConfig, DeviceEngine};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "avlinkd",
    about = "Drive one serially attached A/V device; JSON requests on stdin, replies on stdout"
)]
struct Cli {
    /// Device definition (TOML with a [device] table).
    #[arg(long)]
    config: PathBuf,

    /// Serial port, overriding the one in the config file.
    #[arg(long)]
    port: Option<String>,

    /// Validate the config and driver, then exit without opening the port.
    #[arg(long)]
    check: bool,
}

fn init_tracing() {
    // stdout carries the request protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

async fn write_lines(mut rx: mpsc::UnboundedReceiver<serde_json::Value>) -> std::io::Result<()> {
    let mut out = tokio::io::stdout();
    while let Some(msg) = rx.recv().await {
        let mut line = msg.to_string();
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut cfg = DeviceConfig::from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        cfg.serial.port = port;
        cfg.serial.validate()?;
    }
    let protocol = Arc::new(devices::protocol_for(&cfg.driver)?);
    let (engine, handle) = DeviceEngine::new(&cfg.name, protocol, &cfg.serial)?;
    if cli.check {
        info!(device = %cfg.name, driver = %cfg.driver, "configuration is valid");
        return Ok(());
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    {
        let tx = out_tx.clone();
        handle
            .state()
            .write()
            .map_err(|_| anyhow!("state model lock poisoned"))?
            .on_any_change(move |change| {
                let _ = tx.send(request::update_line(change));
            });
    }
    let writer = tokio::spawn(write_lines(out_rx));

    let port = open_serial(&cfg.serial).with_context(|| format!("opening {}", cfg.serial.port))?;
    let mut engine_task = tokio::spawn(engine.run(port));
    info!(device = %cfg.name, port = %cfg.serial.port, "running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let h = handle.clone();
                let tx = out_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(request::answer(&h, &line).await);
                });
            }
            ended = &mut engine_task => {
                ended??;
                warn!(device = %cfg.name, "engine stopped");
                return Ok(());
            }
        }
    }

    // stdin closed: let in-flight requests finish, then the engine stops with the last handle
    drop(handle);
    drop(out_tx);
    engine_task.await??;
    writer.await??;
    Ok(())
}
