//! Request channel: executes commands pushed by the coordinator.
//!
//! The coordinator connects to a well-known port, sends one command
//! envelope, reads one `output` frame and disconnects. Connections are
//! serviced strictly one after another; the next accept only happens once
//! the previous reply has been written and the socket closed.

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::{EnvelopeCodec, Frame};
use crate::error::AgentError;
use crate::exec::ExecutionEngine;
use crate::lifecycle::{Channel, ChannelResult, StopReason};

const CHANNEL: Channel = Channel::Request;

/// Bind the request listener with address reuse and an explicit backlog.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

pub struct RequestChannel {
    listener: TcpListener,
    engine: ExecutionEngine,
}

impl RequestChannel {
    pub fn new(listener: TcpListener, engine: ExecutionEngine) -> Self {
        Self { listener, engine }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and service connections until a fatal error or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> ChannelResult {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Request channel cancelled");
                Ok(StopReason::Cancelled)
            }
            result = self.serve(&cancel) => result,
        }
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> ChannelResult {
        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| AgentError::transport(CHANNEL, e))?;
            let span = tracing::info_span!("request", %peer);
            serve_connection(&mut self.engine, stream, cancel)
                .instrument(span)
                .await?;
        }
    }
}

/// Service exactly one pushed command on `stream`, then drop it.
pub async fn serve_connection<S>(
    engine: &mut ExecutionEngine,
    stream: S,
    cancel: &CancellationToken,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, EnvelopeCodec::new());

    let envelope = framed
        .next()
        .await
        .ok_or(AgentError::ConnectionClosed { channel: CHANNEL })?
        .map_err(|e| AgentError::frame(CHANNEL, e))?;
    tracing::debug!(
        command_len = envelope.command.len(),
        input_len = envelope.input.len(),
        "Request received"
    );

    let output = engine
        .execute(envelope.input, &envelope.command, cancel)
        .await?;

    framed
        .send(Frame::output(output))
        .await
        .map_err(|e| AgentError::frame(CHANNEL, e))?;
    tracing::debug!("Reply sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::path::{Path, PathBuf};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf, duplex};
    use tokio::net::TcpStream;
    use tokio::process::Child;

    use crate::exec::{ShellSpawner, SpawnError, Spawner, WorkingDir};

    /// Records each command line, then runs `cat` in its place.
    #[derive(Default)]
    struct CatSpawner {
        commands: Mutex<Vec<String>>,
    }

    impl Spawner for CatSpawner {
        fn spawn(&self, command: &OsStr, cwd: &Path) -> Result<Child, SpawnError> {
            self.commands
                .lock()
                .unwrap()
                .push(command.to_string_lossy().into_owned());
            ShellSpawner::new().spawn(OsStr::new("cat"), cwd)
        }
    }

    fn engine_with(spawner: Arc<dyn Spawner>) -> ExecutionEngine {
        ExecutionEngine::new(WorkingDir::new(PathBuf::from("/"))).with_spawner(spawner)
    }

    #[tokio::test]
    async fn exchange_invokes_engine_and_replies() {
        let spawner = Arc::new(CatSpawner::default());
        let mut engine = engine_with(spawner.clone());
        let (agent_side, mut coordinator) = duplex(1024);

        coordinator.write_all(b"c00005").await.unwrap();
        coordinator.write_all(b"i00003").await.unwrap();
        coordinator.write_all(b"xyz").await.unwrap();
        coordinator.write_all(b"abcde").await.unwrap();

        serve_connection(&mut engine, agent_side, &CancellationToken::new())
            .await
            .unwrap();

        let mut reply = Vec::new();
        coordinator.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"o00003xyz");
        assert_eq!(*spawner.commands.lock().unwrap(), vec!["abcde".to_string()]);
    }

    #[tokio::test]
    async fn cd_request_replies_with_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = ExecutionEngine::new(WorkingDir::new(PathBuf::from("/")));
        let (agent_side, mut coordinator) = duplex(1024);

        let command = format!("cd {}", dir.path().display());
        let mut wire = format!("c{:05}i00000", command.len()).into_bytes();
        wire.extend_from_slice(command.as_bytes());
        coordinator.write_all(&wire).await.unwrap();

        serve_connection(&mut engine, agent_side, &CancellationToken::new())
            .await
            .unwrap();

        let mut reply = Vec::new();
        coordinator.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"o00000");
        assert_eq!(engine.cwd(), dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn wrong_header_tag_is_fatal() {
        let mut engine = engine_with(Arc::new(CatSpawner::default()));
        let (agent_side, mut coordinator) = duplex(1024);
        coordinator.write_all(b"o00001i00000x").await.unwrap();

        let err = serve_connection(&mut engine, agent_side, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Protocol { .. }));
    }

    #[tokio::test]
    async fn hangup_mid_request_is_fatal() {
        let mut engine = engine_with(Arc::new(CatSpawner::default()));
        let (agent_side, mut coordinator) = duplex(1024);
        coordinator.write_all(b"c00005i00003xy").await.unwrap();
        drop(coordinator);

        let err = serve_connection(&mut engine, agent_side, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport { .. }));
    }

    /// Serves a fixed request, then accepts no reply bytes.
    struct WriteZeroStream {
        request: &'static [u8],
    }

    impl AsyncRead for WriteZeroStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let n = this.request.len().min(buf.remaining());
            buf.put_slice(&this.request[..n]);
            this.request = &this.request[n..];
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for WriteZeroStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn partial_reply_write_is_fatal() {
        let mut engine = engine_with(Arc::new(CatSpawner::default()));
        let stream = WriteZeroStream {
            request: b"c00003i00003xyzcat",
        };

        let err = serve_connection(&mut engine, stream, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AgentError::Transport { channel, source } => {
                assert_eq!(channel, Channel::Request);
                assert_eq!(source.kind(), io::ErrorKind::WriteZero);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn serves_connections_one_after_another() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let channel = RequestChannel::new(
            listener,
            ExecutionEngine::new(WorkingDir::new(PathBuf::from("/"))),
        );
        let addr = channel.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(cancel.clone()));

        for payload in ["first\n", "second\n"] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let wire = format!("c00003i{:05}{payload}cat", payload.len());
            stream.write_all(wire.as_bytes()).await.unwrap();

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, format!("o{:05}{payload}", payload.len()).as_bytes());
        }

        cancel.cancel();
        let reason = task.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn bind_fails_on_address_in_use() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let addr = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two active listeners on one port.
        assert!(bind_listener(addr, 1).is_err());
    }
}
