// Attach stream pump - one bounded interactive session with a container
//
// The pump owns a duplex socket already attached to the container's stdio.
// It feeds the optional input, half-closes the write direction exactly once
// when the input is exhausted (the container's stdin stays open until then),
// and collects the raw multiplexed output until end-of-stream or the
// deadline. The container itself is never stopped here.

use super::error::{PumpError, Result as SandboxResult};
use nix::errno::Errno;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest single wait for socket readiness; bounds deadline granularity.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum bytes taken from the socket per read.
pub const READ_CHUNK: usize = 4096;

/// Back-off after a write that made no progress.
pub const IDLE_SLEEP: Duration = Duration::from_millis(50);

enum Ready {
    Read(io::Result<usize>),
    Write(io::Result<usize>),
}

/// Drives one attach socket until the container closes its output.
pub struct StreamPump<S> {
    sock: S,
}

impl<S> StreamPump<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(sock: S) -> Self {
        Self { sock }
    }

    /// Run the session.
    ///
    /// `start` is awaited after the socket is attached (and, when there is no
    /// input, after stdin has been closed) so no early output is lost.
    ///
    /// Returns the raw multiplexed output, or
    /// [`PumpError::DeadlineExceeded`] when the stream is still open after
    /// `deadline`.
    pub async fn communicate<F>(
        self,
        stdin: Option<&[u8]>,
        start: Option<F>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, PumpError>
    where
        F: Future<Output = SandboxResult<()>>,
    {
        let (mut reader, mut writer) = tokio::io::split(self.sock);

        let mut pending: &[u8] = stdin.unwrap_or_default();
        let mut write_open = !pending.is_empty();
        if !write_open {
            debug!("There is no input data. Shutting down the write half of the socket");
            writer.shutdown().await?;
        }

        if let Some(start) = start {
            start.await?;
            debug!("Container started");
        }

        let mut stream_data = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed();
            let wait = match deadline {
                Some(limit) if elapsed >= limit => {
                    // Dropping both halves closes the socket.
                    return Err(PumpError::DeadlineExceeded(limit));
                }
                Some(limit) => POLL_INTERVAL.min(limit - elapsed),
                None => POLL_INTERVAL,
            };

            let ready = tokio::time::timeout(wait, async {
                tokio::select! {
                    res = reader.read(&mut buf) => Ready::Read(res),
                    res = writer.write(pending), if write_open => Ready::Write(res),
                }
            })
            .await;

            match ready {
                // Neither direction became ready within the wait.
                Err(_) => continue,
                Ok(Ready::Read(Ok(0))) => {
                    debug!("Container output reached EOF");
                    break;
                }
                Ok(Ready::Read(Ok(n))) => stream_data.extend_from_slice(&buf[..n]),
                Ok(Ready::Read(Err(e))) if e.kind() == io::ErrorKind::ConnectionReset => {
                    warn!("Connection reset caught on reading the container output stream. Break communication");
                    break;
                }
                Ok(Ready::Read(Err(e))) => return Err(e.into()),
                Ok(Ready::Write(res)) => {
                    let written = match res {
                        Ok(n) => n,
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            // The container may exit (e.g. OOM killed) before
                            // it has read all of its input.
                            warn!("Broken pipe caught on writing to stdin. Break communication");
                            break;
                        }
                        Err(e) if is_recoverable(&e) => 0,
                        Err(e) => return Err(e.into()),
                    };

                    if written == 0 {
                        tokio::time::sleep(IDLE_SLEEP).await;
                        continue;
                    }

                    pending = &pending[written..];
                    if pending.is_empty() {
                        debug!("All input data has been sent. Shutting down the write half of the socket");
                        writer.shutdown().await?;
                        write_open = false;
                    }
                }
            }
        }

        debug!(bytes = stream_data.len(), elapsed = ?started.elapsed(), "Attach session finished");
        Ok(stream_data)
    }
}

/// Write failures that mean "nothing written, try again later".
fn is_recoverable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
        || e.raw_os_error() == Some(Errno::EDEADLK as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::SandboxError;
    use crate::sandbox::stream::{demultiplex, encode_frame};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll, Waker};
    use tokio::io::{duplex, ReadBuf};

    type NoStart = std::future::Ready<SandboxResult<()>>;

    #[tokio::test]
    async fn test_no_input_closes_stdin_before_start() {
        let (client, mut server) = duplex(1024);
        let started = Arc::new(AtomicBool::new(false));

        let peer = tokio::spawn(async move {
            // Stdin is already closed when the container reads it.
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(n, 0);
            server.write_all(&encode_frame(1, b"stdout data\n")).await.unwrap();
            server.write_all(&encode_frame(2, b"stderr data\n")).await.unwrap();
        });

        let flag = started.clone();
        let start = async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        };
        let raw = StreamPump::new(client)
            .communicate(None, Some(start), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        peer.await.unwrap();

        assert!(started.load(Ordering::SeqCst));
        let (stdout, stderr) = demultiplex(&raw);
        assert_eq!(stdout, b"stdout data\n");
        assert_eq!(stderr, b"stderr data\n");
    }

    #[tokio::test]
    async fn test_large_input_is_echoed_in_order() {
        let (client, mut server) = duplex(512);
        let input: Vec<u8> = b"a b c d e\n".iter().cycle().take(64 * 1024).copied().collect();

        let peer = tokio::spawn(async move {
            let mut chunk = [0u8; 700];
            loop {
                let n = server.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                server.write_all(&encode_frame(1, &chunk[..n])).await.unwrap();
            }
        });

        let raw = StreamPump::new(client)
            .communicate(Some(&input), None::<NoStart>, None)
            .await
            .unwrap();
        peer.await.unwrap();

        let (stdout, stderr) = demultiplex(&raw);
        assert_eq!(stdout, input);
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let (client, server) = duplex(64);
        let begin = std::time::Instant::now();

        let result = StreamPump::new(client)
            .communicate(None, None::<NoStart>, Some(Duration::from_millis(200)))
            .await;

        assert!(matches!(result, Err(PumpError::DeadlineExceeded(d)) if d == Duration::from_millis(200)));
        assert!(begin.elapsed() < Duration::from_secs(2));
        drop(server);
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let (client, _server) = duplex(64);
        let start = async { Err(SandboxError::Engine("No such container".to_string())) };

        let result = StreamPump::new(client)
            .communicate(None, Some(start), Some(Duration::from_secs(1)))
            .await;

        assert!(matches!(result, Err(PumpError::Start(SandboxError::Engine(_)))));
    }

    #[tokio::test]
    async fn test_peer_gone_before_input_written() {
        let (client, server) = duplex(8);
        drop(server);

        let raw = StreamPump::new(client)
            .communicate(Some(b"never read by anyone"), None::<NoStart>, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_connection_reset_ends_session() {
        let sock = tokio_test::io::Builder::new()
            .read(&encode_frame(1, b"partial"))
            .read_error(io::ErrorKind::ConnectionReset.into())
            .build();

        let raw = StreamPump::new(sock)
            .communicate(None, None::<NoStart>, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(demultiplex(&raw).0, b"partial");
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let frame = encode_frame(2, b"warning: unused\n");
        let sock = tokio_test::io::Builder::new()
            .read(&frame[..5])
            .read(&frame[5..])
            .read(&encode_frame(1, b"ok"))
            .build();

        let raw = StreamPump::new(sock)
            .communicate(None, None::<NoStart>, None)
            .await
            .unwrap();

        let (stdout, stderr) = demultiplex(&raw);
        assert_eq!(stdout, b"ok");
        assert_eq!(stderr, b"warning: unused\n");
    }

    /// Echo peer whose first write attempt is interrupted.
    #[derive(Default)]
    struct FlakyEcho {
        fail_next_write: bool,
        received: Vec<u8>,
        shut: bool,
        served: bool,
        read_waker: Option<Waker>,
    }

    impl AsyncRead for FlakyEcho {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            if !self.shut {
                self.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            if !self.served {
                self.served = true;
                let frame = encode_frame(1, &self.received);
                buf.put_slice(&frame);
            }
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FlakyEcho {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            if self.fail_next_write {
                self.fail_next_write = false;
                return Poll::Ready(Err(io::ErrorKind::Interrupted.into()));
            }
            self.received.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shut = true;
            if let Some(waker) = self.read_waker.take() {
                waker.wake();
            }
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_interrupted_write_is_retried() {
        let sock = FlakyEcho {
            fail_next_write: true,
            ..Default::default()
        };

        let raw = StreamPump::new(sock)
            .communicate(Some(b"hi"), None::<NoStart>, Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(demultiplex(&raw).0, b"hi");
    }

    #[test]
    fn test_recoverable_errno_set() {
        assert!(is_recoverable(&io::Error::from_raw_os_error(Errno::EDEADLK as i32)));
        assert!(is_recoverable(&io::Error::from_raw_os_error(Errno::EAGAIN as i32)));
        assert!(is_recoverable(&io::ErrorKind::Interrupted.into()));
        assert!(!is_recoverable(&io::ErrorKind::BrokenPipe.into()));
    }
}
