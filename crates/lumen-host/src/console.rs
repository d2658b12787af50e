//! Console transport: stdin lines in, messages out on stdout.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::{self, CliContext};
use crate::messages::Message;

/// Run the console transport until stdin closes.
pub async fn run(
    ctx: CliContext,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    report_inches: bool,
) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("console transport ready");

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                stdout
                    .write_all(format!("{}\n", message.render(report_inches)).as_bytes())
                    .await?;
                if message.follows_with_ok() {
                    stdout.write_all(b"ok\n").await?;
                }
                stdout.flush().await?;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => cli::process_line(&line, &ctx),
                    None => break, // EOF
                }
            }
        }
    }
    Ok(())
}
