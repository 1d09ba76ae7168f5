//! Raw PCM in and out. Capture reads fixed-size chunks (stdin in the daemon);
//! playback writes received chunks (stdout in the daemon).

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use trail_core::{AudioChunk, TalkState};

/// Read `chunk_size`-byte chunks from `input` and pass them to `send` while
/// `talk` says the channel is clear. Chunks captured while the peer talks are
/// dropped. Returns when the input ends or `send` returns `false`.
pub async fn run_capture<R, F>(
    mut input: R,
    chunk_size: usize,
    talk: watch::Receiver<TalkState>,
    mut send: F,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(Vec<u8>) -> bool,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        match input.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("capture input ended");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        if !talk.borrow().can_talk() {
            trace!("peer talking, capture chunk dropped");
            continue;
        }
        if !send(buf.clone()) {
            return Ok(());
        }
    }
}

/// Spawn a writer for received audio. Chunks are written in order; the task
/// ends when the sender is dropped or the output fails.
pub fn spawn_playback<W>(mut out: W) -> mpsc::UnboundedSender<AudioChunk>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<AudioChunk>();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let written = async {
                out.write_all(chunk.as_bytes()).await?;
                out.flush().await
            };
            if let Err(e) = written.await {
                warn!("playback output failed: {}", e);
                break;
            }
        }
    });
    tx
}
