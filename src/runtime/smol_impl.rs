//! smol runtime implementation.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::time::Duration;

use async_io::Async;
use smol::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{AsyncLineReader, AsyncLineWriter, AsyncTcpStream, AsyncUdpSocket, Spawner, TimedOut};

/// smol-based UDP socket using async-io.
pub struct UdpSocket(Async<std::net::UdpSocket>);

impl AsyncUdpSocket for UdpSocket {
    async fn bind(addr: &str) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        Async::new(socket).map(UdpSocket)
    }

    async fn send_to(&self, buf: &[u8], addr: &str) -> io::Result<usize> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.0.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }

    fn join_multicast_v4(&self, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        self.0.get_ref().join_multicast_v4(&group, &interface)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.get_ref().local_addr()
    }
}

/// smol-based TCP stream.
pub struct TcpStream(smol::net::TcpStream);

/// Buffered read half; smol streams share one socket between clones.
pub struct TcpReader(BufReader<smol::net::TcpStream>);

/// Write half of a smol TCP stream.
pub struct TcpWriter(smol::net::TcpStream);

impl AsyncTcpStream for TcpStream {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    async fn connect(addr: &str) -> io::Result<Self> {
        let stream = smol::net::TcpStream::connect(addr).await?;
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

/// smol task spawner.
pub struct SmolSpawner;

impl Spawner for SmolSpawner {
    type JoinHandle<T: Send + 'static> = SmolJoinHandle<T>;

    fn spawn<F, T>(future: F) -> Self::JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        SmolJoinHandle(Some(smol::spawn(future)))
    }
}

/// Wrapper around smol's Task.
///
/// smol cancels a task when its handle is dropped, so the handle detaches on
/// drop to match the fire-and-forget semantics of the other runtimes.
pub struct SmolJoinHandle<T>(Option<smol::Task<T>>);

impl<T> Future for SmolJoinHandle<T> {
    type Output = T;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match self.0.as_mut() {
            Some(task) => std::pin::Pin::new(task).poll(cx),
            None => std::task::Poll::Pending,
        }
    }
}

impl<T> Drop for SmolJoinHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.detach();
        }
    }
}

/// Internal instant type for smol.
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

/// Sleep for the specified duration using smol.
pub async fn sleep_impl(duration: Duration) {
    smol::Timer::after(duration).await;
}

/// Run a future with a timeout using smol.
pub async fn timeout_impl<F, T>(duration: Duration, future: F) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    use futures::future::Either;

    let timeout_future = smol::Timer::after(duration);

    futures::pin_mut!(future);
    futures::pin_mut!(timeout_future);

    match futures::future::select(future, timeout_future).await {
        Either::Left((result, _)) => Ok(result),
        Either::Right((_, _)) => Err(TimedOut),
    }
}

/// Spawn a task using smol.
pub fn spawn<F, T>(future: F) -> SmolJoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    SmolSpawner::spawn(future)
}
