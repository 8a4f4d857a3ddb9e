use std::path::Path;

use fwpilot_core::{decode, Adapters, ChannelTransport, Input, Orchestrator, Settings, WireMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[tokio::main]
async fn main() {
    let settings = match std::env::args().nth(1) {
        Some(path) => match Settings::load(Path::new(&path)) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("fwpilot: {e}");
                std::process::exit(2);
            }
        },
        None => Settings::default(),
    };

    // stdout carries the observer protocol, so logs go to stderr
    let level = settings.level_filter();
    let adapter_level = if level >= log::LevelFilter::Debug {
        log::LevelFilter::Trace
    } else {
        level
    };
    if let Err(e) = simple_logger::SimpleLogger::new()
        .with_level(level)
        .with_module_level("devadapter", adapter_level)
        .with_module_level("mio", log::LevelFilter::Warn)
        .init()
    {
        eprintln!("fwpilot: logger unavailable: {e}");
    }

    log::info!("fwpilot starting, utility {}", settings.utility_path.display());

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_observer_messages(out_rx));
    tokio::spawn(read_observer_messages(in_tx.clone()));
    tokio::spawn(shutdown_on_interrupt(in_tx.clone()));

    let adapters = Adapters::native(&settings);
    Orchestrator::new(settings, adapters, Box::new(ChannelTransport::new(out_tx)), in_tx)
        .run(in_rx)
        .await;

    if let Err(e) = writer.await {
        log::error!("Observer writer failed: {e}");
    }
    log::info!("fwpilot exited");
}

/// One JSON message per line on stdout
async fn write_observer_messages(mut messages: UnboundedReceiver<WireMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = messages.recv().await {
        let line = match message.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("Dropping observer message: {e}");
                continue;
            }
        };
        if let Err(e) = write_line(&mut stdout, &line).await {
            log::error!("Observer output closed: {e}");
            break;
        }
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

/// Decode observer messages from stdin until it closes
async fn read_observer_messages(inputs: UnboundedSender<Input>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match WireMessage::from_json_line(&line).and_then(decode) {
                Ok(input) => {
                    if inputs.send(input).is_err() {
                        return;
                    }
                }
                Err(e) => log::warn!("Ignoring observer message {line:?}: {e}"),
            },
            Ok(None) => {
                log::info!("Observer input closed");
                break;
            }
            Err(e) => {
                log::error!("Failed to read observer input: {e}");
                break;
            }
        }
    }
    let _ = inputs.send(Input::Shutdown);
}

async fn shutdown_on_interrupt(inputs: UnboundedSender<Input>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Interrupted");
            let _ = inputs.send(Input::Shutdown);
        }
        Err(e) => log::warn!("Cannot listen for interrupts: {e}"),
    }
}
