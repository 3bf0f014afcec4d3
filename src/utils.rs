//! Byte-pumping helpers shared by sessions and the forwarding handlers,
//! and the activity-tracking stream wrapper the accept pipeline installs.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::context::Context;

/// Bridges two bidirectional streams until either side closes.
pub async fn bridge<S1, S2>(mut s1: S1, mut s2: S2, label: &str)
where
    S1: AsyncRead + AsyncWrite + Unpin,
    S2: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut s1, &mut s2).await {
        Ok((a_to_b, b_to_a)) => {
            debug!("bridge {} done: {} bytes out, {} bytes back", label, a_to_b, b_to_a);
        }
        Err(e) => {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                debug!("bridge {} error: {}", label, e);
            }
        }
    }
}

/// Pumps an `AsyncRead` into an SSH channel until EOF, then closes the
/// channel.
pub async fn pipe_read_to_ssh<R>(
    mut reader: R,
    handle: russh::server::Handle,
    channel_id: russh::ChannelId,
    label: &str,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("{} EOF", label);
                break;
            }
            Ok(n) => {
                if handle.data(channel_id, (&buf[..n]).into()).await.is_err() {
                    break;
                }
            }
            // PTY masters report EIO when the slave side goes away.
            Err(e) if e.raw_os_error() == Some(5) => {
                debug!("{} closed: {}", label, e);
                break;
            }
            Err(e) => {
                error!("{} read error: {}", label, e);
                break;
            }
        }
    }
    let _ = handle.close(channel_id).await;
}

/// Drains a byte channel into an `AsyncWrite`, flushing per message.
pub async fn pipe_rx_to_write<W>(mut rx: mpsc::UnboundedReceiver<Bytes>, mut writer: W, label: &str)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if writer.write_all(&data).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    debug!("{} receiver closed", label);
}

/// Shared activity record between a [`DeadlineStream`] and the watchdog
/// task enforcing idle/absolute timeouts.
#[derive(Clone)]
pub(crate) struct Activity {
    last: Arc<Mutex<Instant>>,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Activity {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub(crate) fn last(&self) -> Instant {
        *self.last.lock().unwrap()
    }
}

/// Wraps the raw connection stream. Every successful read or write
/// refreshes the activity record (the watchdog derives
/// `min(absolute_deadline, last_activity + idle_timeout)` from it), an I/O
/// error cancels the connection context, and the first inbound line is
/// captured as the client's identification string.
pub(crate) struct DeadlineStream<S> {
    inner: S,
    activity: Activity,
    ctx: Context,
    version_buf: Option<Vec<u8>>,
}

impl<S> DeadlineStream<S> {
    pub(crate) fn new(inner: S, activity: Activity, ctx: Context) -> Self {
        DeadlineStream {
            inner,
            activity,
            ctx,
            version_buf: Some(Vec::new()),
        }
    }

    fn observe_inbound(&mut self, data: &[u8]) {
        let Some(buf) = self.version_buf.as_mut() else {
            return;
        };
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&data[..pos]);
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(buf).into_owned();
            self.ctx.set_client_version(line);
            self.version_buf = None;
        } else {
            buf.extend_from_slice(data);
            // identification lines are capped at 255 bytes
            if buf.len() > 255 {
                self.version_buf = None;
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                self.activity.touch();
                let filled = buf.filled();
                if filled.len() > before {
                    let new = filled[before..].to_vec();
                    self.observe_inbound(&new);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.ctx.cancel();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.activity.touch();
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                self.ctx.cancel();
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> Context {
        Context::new(
            1,
            "127.0.0.1:50000".parse().unwrap(),
            "127.0.0.1:2222".parse().unwrap(),
            "SSH-2.0-test".into(),
        )
    }

    #[tokio::test]
    async fn bridge_copies_both_directions() {
        let (a, a_far) = tokio::io::duplex(1024);
        let (b, b_far) = tokio::io::duplex(1024);
        let task = tokio::spawn(bridge(a_far, b_far, "test"));

        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);
        a_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_write.write_all(b"pong").await.unwrap();
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(a_write);
        drop(a_read);
        drop(b_write);
        drop(b_read);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pipe_rx_to_write_flushes_messages() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (near, far) = tokio::io::duplex(1024);
        let task = tokio::spawn(pipe_rx_to_write(rx, near, "test"));
        tx.send(Bytes::from_static(b"hello ")).unwrap();
        tx.send(Bytes::from_static(b"world")).unwrap();
        drop(tx);
        task.await.unwrap();

        let mut out = Vec::new();
        let (mut far_read, far_write) = tokio::io::split(far);
        drop(far_write);
        far_read.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn deadline_stream_captures_client_version() {
        let ctx = test_context();
        let (near, far) = tokio::io::duplex(1024);
        let mut wrapped = DeadlineStream::new(near, Activity::new(), ctx.clone());

        let (_far_read, mut far_write) = tokio::io::split(far);
        far_write.write_all(b"SSH-2.0-OpenSSH_9.7\r\nrest").await.unwrap();

        let mut buf = [0u8; 64];
        let n = wrapped.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(ctx.client_version(), "SSH-2.0-OpenSSH_9.7");
    }

    #[tokio::test]
    async fn deadline_stream_tracks_activity() {
        let ctx = test_context();
        let activity = Activity::new();
        let start = activity.last();
        let (near, far) = tokio::io::duplex(64);
        let mut wrapped = DeadlineStream::new(near, activity.clone(), ctx);

        tokio::time::sleep(std::time::Duration::from_millis(15)).await;
        let (_fr, mut fw) = tokio::io::split(far);
        fw.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 8];
        wrapped.read(&mut buf).await.unwrap();
        assert!(activity.last() > start);
    }
}
