//! async-std runtime implementation.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::time::Duration;

use async_std::io::BufReader;
use async_std::io::prelude::{BufReadExt, WriteExt};
use async_std::net::{TcpStream as AsyncStdTcpStream, UdpSocket as AsyncStdUdpSocket};

use super::{AsyncLineReader, AsyncLineWriter, AsyncTcpStream, AsyncUdpSocket, Spawner, TimedOut};

/// async-std-based UDP socket.
pub struct UdpSocket(AsyncStdUdpSocket);

impl AsyncUdpSocket for UdpSocket {
    async fn bind(addr: &str) -> io::Result<Self> {
        AsyncStdUdpSocket::bind(addr).await.map(UdpSocket)
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

/// async-std-based TCP stream.
pub struct TcpStream(AsyncStdTcpStream);

/// Buffered read half; async-std streams are cheaply cloneable.
pub struct TcpReader(BufReader<AsyncStdTcpStream>);

/// Write half of an async-std TCP stream.
pub struct TcpWriter(AsyncStdTcpStream);

impl AsyncTcpStream for TcpStream {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    async fn connect(addr: &str) -> io::Result<Self> {
        let stream = AsyncStdTcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpStream(stream))
    }

    fn into_split(self) -> (TcpReader, TcpWriter) {
        (TcpReader(BufReader::new(self.0.clone())), TcpWriter(self.0))
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
        self.0.shutdown(Shutdown::Both)
    }
}

/// async-std task spawner.
pub struct AsyncStdSpawner;

impl Spawner for AsyncStdSpawner {
    type JoinHandle<T: Send + 'static> = AsyncStdJoinHandle<T>;

    fn spawn<F, T>(future: F) -> Self::JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        AsyncStdJoinHandle(async_std::task::spawn(future))
    }
}

/// Wrapper around async-std's JoinHandle.
pub struct AsyncStdJoinHandle<T>(async_std::task::JoinHandle<T>);

impl<T> Future for AsyncStdJoinHandle<T> {
    type Output = T;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.0).poll(cx)
    }
}

/// Internal instant type for async-std.
#[derive(Debug, Clone, Copy)]
pub struct InstantInner(std::time::Instant);

impl InstantInner {
    pub fn now() -> Self {
        InstantInner(std::time::Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

/// Sleep for the specified duration using async-std.
pub async fn sleep_impl(duration: Duration) {
    async_std::task::sleep(duration).await
}

/// Run a future with a timeout using async-std.
pub async fn timeout_impl<F, T>(duration: Duration, future: F) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    async_std::future::timeout(duration, future)
        .await
        .map_err(|_| TimedOut)
}

/// Spawn a task using async-std.
pub fn spawn<F, T>(future: F) -> AsyncStdJoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    AsyncStdSpawner::spawn(future)
}
