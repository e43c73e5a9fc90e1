use std::time::Duration;

use shared::codec::{self, Value};
use shared::protocol::{Request, Response, REQUEST_MAX};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::DirectoryHandle;

/// How long the tail of an oversized request may take to arrive.
const DRAIN_WAIT: Duration = Duration::from_millis(50);

/// Serves one client until it hangs up or a socket call fails. Each read is
/// expected to carry exactly one request.
pub async fn serve<S>(mut stream: S, handle: DirectoryHandle)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; REQUEST_MAX + 1];

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Control client hung up");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Failed to read from control client: {}", e);
                break;
            }
        };
        if n > REQUEST_MAX {
            let id = request_id(&buf[..n]);
            let Some(total) = drain(&mut stream, &mut buf, n).await else {
                break;
            };
            tracing::warn!("Discarding oversized request {} ({} bytes)", id, total);
            let reply = match Response::failure(id, "request too large").encode() {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if let Err(e) = stream.write_all(&reply).await {
                tracing::warn!("Failed to send response {}: {}", id, e);
                break;
            }
            continue;
        }

        let request = match Request::decode(&buf[..n]) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Discarding malformed request: {}", e);
                continue;
            }
        };
        let id = request.id;
        tracing::debug!("Request {} for {}", id, request.command);

        let response = match handle.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Dropping control client: {:#}", e);
                break;
            }
        };

        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode response {}: {}", id, e);
                match Response::failure(id, "response too large").encode() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            }
        };
        if let Err(e) = stream.write_all(&bytes).await {
            tracing::warn!("Failed to send response {}: {}", id, e);
            break;
        }
    }
}

/// Reads and drops the rest of an oversized request, stopping at a short
/// read or once the client goes quiet. Returns the total size seen, or
/// `None` when the client hung up or the read failed.
async fn drain<S>(stream: &mut S, buf: &mut [u8], mut total: usize) -> Option<usize>
where
    S: AsyncRead + Unpin,
{
    loop {
        match tokio::time::timeout(DRAIN_WAIT, stream.read(buf)).await {
            Err(_) => return Some(total),
            Ok(Ok(0)) => return None,
            Ok(Ok(n)) => {
                total += n;
                if n < buf.len() {
                    return Some(total);
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to read from control client: {}", e);
                return None;
            }
        }
    }
}

/// Best-effort request id from the envelope header, 0 when unreadable.
fn request_id(bytes: &[u8]) -> u32 {
    let Ok((_, consumed)) = codec::decode_value(bytes) else {
        return 0;
    };
    match codec::decode_value(&bytes[consumed..]) {
        Ok((Value::U32(id), _)) => id,
        _ => 0,
    }
}
