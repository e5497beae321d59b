//! streamer - relay a device stream to the terminal
//!
//! Usage:
//!   streamer tcp://localhost:9000
//!   streamer --timeout 5 --meta tty://localhost:9600/dev/ttyUSB0
//!
//! Every stdin line is sent with a trailing carriage return; incoming
//! bytes are copied to stdout as they arrive.

mod cli;

use anyhow::{bail, Context, Result};
use bytes::{Buf, BytesMut};
use clap::Parser;
use devstreams::constants::IO_BUFFER_SIZE;
use devstreams::{config, logging, Broker, OutputStream, StreamError, StreamEvent};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    logging::init_tracing(cli.verbose);

    let path = cli.config.clone().unwrap_or_else(config::default_path);
    let config = config::load(&path);
    let timeout = match cli.timeout {
        Some(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(_) => None,
        None => config.broker.connect_timeout(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli, config, timeout))
}

async fn run(cli: cli::Cli, config: config::Config, timeout: Option<Duration>) -> Result<()> {
    let broker = Broker::builder().config(config).build();
    let mut pair = broker
        .connect_with_timeout(&cli.url, timeout)
        .await
        .with_context(|| format!("Failed to connect to {}", cli.url))?;

    if cli.meta {
        println!("{}", serde_json::to_string_pretty(&pair.metadata)?);
    }
    for warning in &pair.metadata.warnings {
        eprintln!("warning: {}", warning);
    }

    let mut input_events = pair.input.events();
    let mut output_events = pair.output.events();
    pair.input.open();
    pair.output.open();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut outgoing = BytesMut::new();
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; IO_BUFFER_SIZE];

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = input_events.next() => match event {
                Some(StreamEvent::HasBytesAvailable) => {
                    loop {
                        let n = pair.input.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        stdout.write_all(&buf[..n]).await?;
                    }
                    stdout.flush().await?;
                }
                Some(StreamEvent::ErrorOccurred(reason)) => bail!("Read failed: {}", reason),
                Some(StreamEvent::EndEncountered) | None => {
                    eprintln!("Connection closed");
                    break;
                }
                Some(_) => {}
            },
            event = output_events.next() => match event {
                Some(StreamEvent::HasSpaceAvailable) => flush(&mut pair.output, &mut outgoing)?,
                Some(StreamEvent::ErrorOccurred(reason)) => bail!("Write failed: {}", reason),
                Some(StreamEvent::EndEncountered) | None => break,
                Some(_) => {}
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    outgoing.extend_from_slice(line.as_bytes());
                    outgoing.extend_from_slice(b"\r");
                    if pair.output.has_space_available() {
                        flush(&mut pair.output, &mut outgoing)?;
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    pair.close();
    Ok(())
}

/// Write as much of `outgoing` as the stream accepts right now
fn flush(output: &mut OutputStream, outgoing: &mut BytesMut) -> devstreams::Result<()> {
    while !outgoing.is_empty() {
        match output.write(&outgoing[..]) {
            Ok(0) | Err(StreamError::WritePending) => break,
            Ok(n) => outgoing.advance(n),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
