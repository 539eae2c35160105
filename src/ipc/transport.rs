//! Newline-delimited JSON-RPC over a byte stream
//!
//! Each request runs on its own task so a long inference does not hold up a
//! `cancelInference` sent after it. All output goes through a single writer task.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::dispatcher::RpcDispatcher;
use super::message::RpcMessage;
use crate::runtime::Runtime;

/// Serves requests read from `reader` until end of input, then waits for in-flight
/// calls and streams to drain
pub async fn serve<R, W>(runtime: Arc<Runtime>, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcMessage>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping unserializable IPC message: {}", e);
                    continue;
                }
            };
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<(), io::Error>(())
    });

    let dispatcher = Arc::new(RpcDispatcher::new(runtime, tx));
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        handled += 1;

        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.handle_line(&line).await });
    }

    info!("IPC input closed after {} message(s), draining", handled);
    drop(dispatcher);

    writer_task
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
}

/// Serves JSON-RPC on stdin/stdout
pub async fn serve_stdio(runtime: Arc<Runtime>) -> io::Result<()> {
    info!("Serving JSON-RPC on stdio");
    serve(runtime, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fixtures::builder;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_serves_until_end_of_input() {
        let home = TempDir::new().unwrap();
        let runtime = Arc::new(builder(&home).build().unwrap());

        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"getPrivacyPolicy","id":1}"#,
            "\n\n",
            "garbage\n",
            r#"{"jsonrpc":"2.0","method":"purgeAudit"}"#,
            "\n",
        );
        let (client, server) = tokio::io::duplex(64 * 1024);
        serve(runtime, input.as_bytes(), server).await.unwrap();

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();

        let mut responses: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        responses.sort_by_key(|r| r["id"].as_i64().unwrap_or(-1));

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["id"], 1);
        assert_eq!(responses[1]["result"]["dataRetentionDays"], 7);
    }
}
