//! TCP socket transport.
//!
//! One client at a time, line-oriented both ways. Output produced while no
//! client is connected is buffered and flushed on the next connect, so the
//! welcome banner and any startup chatter are never lost.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

use crate::cli::{self, CliContext};
use crate::messages::Message;

/// Listen on `addr` and serve clients until the message channel closes.
pub async fn run(
    addr: &str,
    ctx: CliContext,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    report_inches: bool,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding command socket on {addr}"))?;
    info!(addr, "socket transport listening");

    let mut pending: Vec<String> = Vec::new();

    loop {
        // Between clients, keep draining output into the pending buffer.
        let stream = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accepting client")?;
                    info!(%peer, "client connected");
                    break stream;
                }
                message = outbound.recv() => {
                    match message {
                        Some(message) => buffer_message(&mut pending, &message, report_inches),
                        None => return Ok(()),
                    }
                }
            }
        };

        if let Err(err) = serve_client(stream, &ctx, &mut outbound, &mut pending, report_inches).await
        {
            warn!("client connection ended: {err}");
        }
        info!("client disconnected");
    }
}

fn buffer_message(pending: &mut Vec<String>, message: &Message, report_inches: bool) {
    pending.push(message.render(report_inches));
    if message.follows_with_ok() {
        pending.push("ok".to_string());
    }
}

async fn serve_client(
    stream: TcpStream,
    ctx: &CliContext,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    pending: &mut Vec<String>,
    report_inches: bool,
) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(1024));

    for line in pending.drain(..) {
        framed.send(line).await?;
    }

    loop {
        tokio::select! {
            incoming = framed.next() => {
                match incoming {
                    Some(line) => cli::process_line(&line?, ctx),
                    None => return Ok(()),
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else { return Ok(()) };
                framed.send(message.render(report_inches)).await?;
                if message.follows_with_ok() {
                    framed.send("ok".to_string()).await?;
                }
            }
        }
    }
}
