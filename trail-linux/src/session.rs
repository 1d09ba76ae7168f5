//! One live channel: a read loop feeding the demultiplexer and a serialized
//! writer draining an outbound queue.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use trail_core::{AudioChunk, Demuxed, DeviceAddress, FrameCodec, FrameError};

const READ_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Audio(SessionId, AudioChunk),
    /// Raw record text, not yet parsed.
    Location(SessionId, String),
    /// The session ended on its own. Sent at most once, never after `close`.
    Closed(SessionId, SessionError),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer closed the channel")]
    PeerClosed,
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("not connected")]
    NotConnected,
}

struct Shared {
    id: SessionId,
    closed: AtomicBool,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// End the session because of `err`; only the first fault is reported.
    fn fail(&self, err: SessionError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session = %self.id, "session ended: {}", err);
            let _ = self.events.send(SessionEvent::Closed(self.id, err));
        }
        self.cancel.cancel();
    }
}

pub struct Session {
    shared: Arc<Shared>,
    peer: Option<DeviceAddress>,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Session {
    /// Take ownership of `channel` and start its read loop and writer.
    /// Must be called from within a tokio runtime.
    pub fn open<C>(
        id: SessionId,
        peer: Option<DeviceAddress>,
        channel: C,
        buffer_size: usize,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, FrameError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = FrameCodec::new(buffer_size)?;
        let shared = Arc::new(Shared {
            id,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
        });
        let (reader, writer) = tokio::io::split(channel);
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(read_loop(reader, codec, shared.clone()));
        tokio::spawn(write_loop(writer, rx, shared.clone()));
        debug!(session = %id, peer = ?peer, "session opened");

        Ok(Self {
            shared,
            peer,
            outbound: Some(tx),
        })
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn peer(&self) -> Option<DeviceAddress> {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Queue bytes for the writer. Writes go out whole and in queue order.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        if self.shared.is_closed() {
            return Err(SessionError::NotConnected);
        }
        match &self.outbound {
            Some(tx) => tx.send(bytes).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Stop both loops and release the channel. Safe to call more than once.
    pub fn close(&mut self) {
        if self.outbound.take().is_some() {
            debug!(session = %self.shared.id, "closing session");
        }
        self.shared.closed.store(true, Ordering::Release);
        self.shared.cancel.cancel();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(mut reader: R, mut codec: FrameCodec, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF];
    let mut out = Vec::new();
    loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            r = reader.read(&mut buf) => match r {
                Ok(0) => {
                    shared.fail(SessionError::PeerClosed);
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(session = %shared.id, "read error: {}", e);
                    shared.fail(SessionError::Read(e));
                    break;
                }
            },
        };
        trace!(session = %shared.id, n, "read");
        for &b in &buf[..n] {
            codec.push(b, &mut out);
        }
        for item in out.drain(..) {
            if shared.is_closed() {
                return;
            }
            let ev = match item {
                Demuxed::Audio(chunk) => SessionEvent::Audio(shared.id, chunk),
                Demuxed::Location(text) => SessionEvent::Location(shared.id, text),
            };
            if shared.events.send(ev).is_err() {
                shared.cancel.cancel();
                return;
            }
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            r = written => r,
        };
        if let Err(e) = result {
            warn!(session = %shared.id, "write error: {}", e);
            shared.fail(SessionError::Write(e));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trail_core::encode_location_record;

    async fn no_more_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await,
            Err(_) | Ok(None)
        )
    }

    #[tokio::test]
    async fn rejects_zero_buffer_size() {
        let (local, _remote) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(Session::open(SessionId(1), None, local, 0, tx).is_err());
    }

    #[tokio::test]
    async fn inbound_bytes_are_demultiplexed() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _session = Session::open(SessionId(7), None, local, 4, tx).unwrap();

        let mut wire = b"abcd".to_vec();
        wire.extend_from_slice(&encode_location_record("{}"));
        wire.extend_from_slice(b"efgh");
        remote.write_all(&wire).await.unwrap();

        match rx.recv().await.unwrap() {
            SessionEvent::Audio(SessionId(7), chunk) => assert_eq!(chunk.as_bytes(), b"abcd"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            SessionEvent::Location(SessionId(7), text) => assert_eq!(text, "{}"),
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            SessionEvent::Audio(_, chunk) => assert_eq!(chunk.as_bytes(), b"efgh"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn writes_go_out_in_queue_order() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::open(SessionId(1), None, local, 4, tx).unwrap();

        for i in 0u8..10 {
            session.send(vec![i; 3]).unwrap();
        }
        let mut got = vec![0u8; 30];
        remote.read_exact(&mut got).await.unwrap();
        let expected: Vec<u8> = (0u8..10).flat_map(|i| [i; 3]).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn peer_close_reported_once() {
        let (local, remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::open(SessionId(3), None, local, 4, tx).unwrap();

        drop(remote);
        match rx.recv().await.unwrap() {
            SessionEvent::Closed(SessionId(3), SessionError::PeerClosed) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(!session.is_open());
        assert!(matches!(session.send(vec![1]), Err(SessionError::NotConnected)));
        assert!(no_more_events(&mut rx).await);
    }

    #[tokio::test]
    async fn close_releases_channel_without_event() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(SessionId(4), None, local, 4, tx).unwrap();

        session.close();
        session.close();
        assert!(!session.is_open());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(matches!(session.send(vec![1]), Err(SessionError::NotConnected)));
        assert!(no_more_events(&mut rx).await);
    }

    #[tokio::test]
    async fn nothing_emitted_after_close() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::open(SessionId(5), None, local, 2, tx).unwrap();
        session.close();
        let _ = remote.write_all(b"abcdef").await;
        assert!(no_more_events(&mut rx).await);
    }
}
