//! Tokio runtime implementation.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream as TokioTcpStream, UdpSocket as TokioUdpSocket};

use super::{AsyncLineReader, AsyncLineWriter, AsyncTcpStream, AsyncUdpSocket, Spawner, TimedOut};

/// Tokio-based UDP socket.
pub struct UdpSocket(TokioUdpSocket);

impl AsyncUdpSocket for UdpSocket {
    async fn bind(addr: &str) -> io::Result<Self> {
        TokioUdpSocket::bind(addr).await.map(UdpSocket)
    }

    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize> {
        self.0.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.0.join_multicast_v4(group, interface)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

/// Tokio-based TCP stream.
pub struct TcpStream(TokioTcpStream);

/// Buffered read half of a tokio TCP stream.
pub struct TcpReader(BufReader<OwnedReadHalf>);

/// Write half of a tokio TCP stream.
pub struct TcpWriter(OwnedWriteHalf);

impl AsyncTcpStream for TcpStream {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TokioTcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpStream(stream))
    }

    fn into_split(self) -> (TcpReader, TcpWriter) {
        let (read, write) = self.0.into_split();
        (TcpReader(BufReader::new(read)), TcpWriter(write))
    }
}

impl AsyncLineReader for TcpReader {
    async fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.0.read_until(b'\n', buf).await
    }
}

impl AsyncLineWriter for TcpWriter {
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// Tokio task spawner.
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    type JoinHandle<T: Send + 'static> = TokioJoinHandle<T>;

    fn spawn<F, T>(future: F) -> Self::JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        TokioJoinHandle(tokio::spawn(future))
    }
}

/// Wrapper around tokio's JoinHandle that extracts the value on await.
pub struct TokioJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> Future for TokioJoinHandle<T> {
    type Output = T;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        use std::task::Poll;
        match std::pin::Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(e)) => {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
                panic!("Task was cancelled unexpectedly");
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Internal instant type for tokio.
#[derive(Debug, Clone, Copy)]
pub struct InstantInner(tokio::time::Instant);

impl InstantInner {
    pub fn now() -> Self {
        InstantInner(tokio::time::Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

/// Sleep for the specified duration using tokio.
pub async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Run a future with a timeout using tokio.
pub async fn timeout_impl<F, T>(duration: Duration, future: F) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimedOut)
}

/// Spawn a task using tokio.
pub fn spawn<F, T>(future: F) -> TokioJoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    TokioSpawner::spawn(future)
}
