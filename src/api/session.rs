//! Line Protocol Session
//!
//! Reads request lines from an async reader and writes one response line
//! per request. Engine calls block on disk I/O, so each request runs on the
//! blocking pool.

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error};

use super::handlers::{handle_line, AppState};
use crate::error::CacheError;
use crate::models::Response;

/// Serves requests until the reader reaches end of input.
///
/// Returns the number of requests handled.
pub async fn serve<R, W>(reader: R, mut writer: W, state: AppState) -> std::io::Result<u64>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let task_state = state.clone();
        let response = match tokio::task::spawn_blocking(move || handle_line(&task_state, &line))
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!("Request handler failed: {}", err);
                Response::failure(&CacheError::Internal(format!("request handler failed: {}", err)))
            }
        };

        writer.write_all(response.to_line().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        handled += 1;
    }

    debug!("Session ended after {} requests", handled);
    Ok(handled)
}
