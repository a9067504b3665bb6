//! Duplex line connection
//!
//! Wraps a TCP stream with newline-delimited read/write primitives.
//! The read half stays with the task driving the session, writes go through
//! a bounded channel into a dedicated writer task. All lines written to
//! one peer therefore leave in the order they were queued, whichever task
//! queued them. A peer that lets its queue fill up is closed.
//!
//! Closing is signalled with a `CancellationToken`: it unblocks a parked
//! reader immediately, while the writer task gets `CLOSE_TIMEOUT` to flush
//! lines queued before the close before it drops the write half.
//!
//! Incoming bytes are not required to be UTF-8; invalid sequences are
//! replaced with U+FFFD.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ConnectionError;

/// Lines that may wait for one peer before it counts as stalled
pub const OUTBOUND_QUEUE_SIZE: usize = 256;

/// How long a closing writer may spend flushing to the peer
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of a single `read_line` call
#[derive(Debug)]
pub enum ReadOutcome {
    /// A full line, separator stripped. May be empty.
    Line(String),
    /// The peer closed the stream or the connection was closed locally
    Closed,
    /// Transport or framing fault
    Fault(ConnectionError),
}

/// Read side of a line connection
#[derive(Debug)]
pub struct LineReader {
    frames: FramedRead<OwnedReadHalf, AnyDelimiterCodec>,
    shutdown: CancellationToken,
}

impl LineReader {
    /// Wait for the next line
    ///
    /// Returns `Closed` as soon as the connection is closed, even when the
    /// peer has not sent anything.
    pub async fn read_line(&mut self) -> ReadOutcome {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => ReadOutcome::Closed,
            frame = self.frames.next() => match frame {
                Some(Ok(chunk)) => ReadOutcome::Line(decode_line(&chunk)),
                Some(Err(e)) => ReadOutcome::Fault(e.into()),
                None => ReadOutcome::Closed,
            },
        }
    }
}

/// Lossy UTF-8 decode of one frame, dropping a trailing `\r`
fn decode_line(chunk: &[u8]) -> String {
    let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(chunk).into_owned()
}

/// Write side of a line connection
///
/// Cheap to clone; every clone feeds the same writer task.
#[derive(Debug, Clone)]
pub struct LineWriter {
    sender: mpsc::Sender<String>,
    shutdown: CancellationToken,
    peer_addr: Option<SocketAddr>,
}

impl LineWriter {
    /// Queue one line for the peer. The separator is appended by the codec.
    ///
    /// Never waits for the peer. Fails with `Closed` once the connection
    /// has been closed; a full queue closes the connection and fails with
    /// `QueueFull`.
    pub fn write_line(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        match self.sender.try_send(text.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue to {:?} is full, closing", self.peer_addr);
                self.close();
                Err(ConnectionError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("Closing connection to {:?}", self.peer_addr);
            self.shutdown.cancel();
        }
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A TCP stream split into a line reader and a line writer
#[derive(Debug)]
pub struct LineConnection {
    reader: LineReader,
    writer: LineWriter,
}

impl LineConnection {
    /// Wrap an open stream and spawn its writer task
    ///
    /// `shutdown` becomes this connection's close signal; pass a child of a
    /// wider token to have the connection closed together with its owner.
    pub fn new(stream: TcpStream, shutdown: CancellationToken, max_line_length: usize) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE_SIZE);

        tokio::spawn(write_task(
            FramedWrite::new(write_half, LinesCodec::new()),
            receiver,
            shutdown.clone(),
        ));

        Self {
            reader: LineReader {
                frames: FramedRead::new(
                    read_half,
                    AnyDelimiterCodec::new_with_max_length(
                        b"\n".to_vec(),
                        b"\n".to_vec(),
                        max_line_length,
                    ),
                ),
                shutdown: shutdown.clone(),
            },
            writer: LineWriter {
                sender,
                shutdown,
                peer_addr,
            },
        }
    }

    pub async fn read_line(&mut self) -> ReadOutcome {
        self.reader.read_line().await
    }

    pub fn write_line(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.writer.write_line(text)
    }

    pub fn close(&self) {
        self.writer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }

    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// Writer task: drains the outbound queue into the socket
///
/// Every send races the close signal, so a peer that stopped reading can
/// hold the write half for at most `CLOSE_TIMEOUT` after a close.
async fn write_task(
    mut sink: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut receiver: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = receiver.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let send = sink.send(line);
        tokio::pin!(send);
        tokio::select! {
            result = &mut send => {
                if let Err(e) = result {
                    debug!("Write failed, closing connection: {}", e);
                    shutdown.cancel();
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                // Closed mid-write
                let _ = timeout(CLOSE_TIMEOUT, send).await;
                break;
            }
        }
    }

    // Lines queued before the close still go out, then FIN
    let flush = async {
        while let Ok(line) = receiver.try_recv() {
            if sink.send(line).await.is_err() {
                return;
            }
        }
        let _ = SinkExt::<String>::close(&mut sink).await;
    };
    if timeout(CLOSE_TIMEOUT, flush).await.is_err() {
        debug!("Peer not reading, dropping unsent lines");
    }

    debug!("Write task ended");
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::net::{TcpListener, TcpStream};

    /// Two ends of a loopback TCP connection: (client side, server side)
    pub(crate) async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use super::test_support::tcp_pair;
    use super::*;

    const MAX: usize = 1024;

    async fn read(conn: &mut LineConnection) -> ReadOutcome {
        timeout(Duration::from_secs(5), conn.read_line())
            .await
            .expect("read timed out")
    }

    #[tokio::test]
    async fn test_write_then_read_line() {
        let (a, b) = tcp_pair().await;
        let a = LineConnection::new(a, CancellationToken::new(), MAX);
        let mut b = LineConnection::new(b, CancellationToken::new(), MAX);

        a.write_line("hello").unwrap();
        a.write_line("world").unwrap();

        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l == "hello"));
        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l == "world"));
    }

    #[tokio::test]
    async fn test_empty_line_is_a_line() {
        let (mut raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, CancellationToken::new(), MAX);

        raw.write_all(b"\nnext\r\n").await.unwrap();

        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l.is_empty()));
        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l == "next"));
    }

    #[tokio::test]
    async fn test_peer_drop_reads_closed() {
        let (raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, CancellationToken::new(), MAX);

        drop(raw);

        assert!(matches!(read(&mut b).await, ReadOutcome::Closed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, CancellationToken::new(), MAX);

        b.close();
        b.close();

        assert!(b.is_closed());
        assert!(matches!(b.write_line("late"), Err(ConnectionError::Closed)));
        assert!(matches!(read(&mut b).await, ReadOutcome::Closed));
    }

    #[tokio::test]
    async fn test_close_unblocks_parked_reader() {
        let (_raw, b) = tcp_pair().await;
        let b = LineConnection::new(b, CancellationToken::new(), MAX);
        let (mut reader, writer) = b.into_split();

        let parked = tokio::spawn(async move { reader.read_line().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.close();

        let outcome = timeout(Duration::from_secs(5), parked).await.unwrap().unwrap();
        assert!(matches!(outcome, ReadOutcome::Closed));
    }

    #[tokio::test]
    async fn test_parent_token_closes_connection() {
        let parent = CancellationToken::new();
        let (_raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, parent.child_token(), MAX);

        parent.cancel();

        assert!(b.is_closed());
        assert!(matches!(read(&mut b).await, ReadOutcome::Closed));
    }

    #[tokio::test]
    async fn test_queued_lines_flushed_before_close() {
        let (mut raw, b) = tcp_pair().await;
        let b = LineConnection::new(b, CancellationToken::new(), MAX);

        b.write_line("0|bye").unwrap();
        b.close();

        let mut received = String::new();
        timeout(Duration::from_secs(5), raw.read_to_string(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "0|bye\n");
    }

    #[tokio::test]
    async fn test_line_too_long_is_fault() {
        let (mut raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, CancellationToken::new(), 8);

        raw.write_all(b"this line is far too long\n").await.unwrap();

        assert!(matches!(
            read(&mut b).await,
            ReadOutcome::Fault(ConnectionError::LineTooLong)
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let (mut raw, b) = tcp_pair().await;
        let mut b = LineConnection::new(b, CancellationToken::new(), MAX);

        raw.write_all(b"caf\xe9\r\nok\n").await.unwrap();

        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l == "caf\u{FFFD}"));
        assert!(matches!(read(&mut b).await, ReadOutcome::Line(l) if l == "ok"));
    }

    #[tokio::test]
    async fn test_full_queue_closes_connection() {
        let (_raw, b) = tcp_pair().await;
        let b = LineConnection::new(b, CancellationToken::new(), MAX);

        // No await in between: the writer task never gets to drain
        for _ in 0..OUTBOUND_QUEUE_SIZE {
            b.write_line("x").unwrap();
        }

        assert!(matches!(b.write_line("x"), Err(ConnectionError::QueueFull)));
        assert!(b.is_closed());
        assert!(matches!(b.write_line("x"), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_close_releases_socket_of_stalled_peer() {
        let (mut raw, b) = tcp_pair().await;
        let b = LineConnection::new(b, CancellationToken::new(), MAX);

        // Far more than the socket buffers hold; the peer never reads
        let big = "x".repeat(64 * 1024);
        for _ in 0..250 {
            b.write_line(big.clone()).unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        b.close();
        drop(b);
        tokio::time::sleep(CLOSE_TIMEOUT * 2 + Duration::from_millis(500)).await;

        // Writing to a released socket is reset by the kernel
        let mut reset = false;
        for _ in 0..100 {
            if raw.write_all(b"ping\n").await.is_err() {
                reset = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(reset);
    }
}
