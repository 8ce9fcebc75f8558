//! Local stand-ins for devices, used by socket-level tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::types::Endpoint;

type Requests = Arc<Mutex<Vec<Value>>>;

/// A device that answers every request line with the lines `reply` returns.
pub(crate) struct FakeDevice {
    addr: SocketAddr,
    requests: Requests,
}

impl FakeDevice {
    pub(crate) async fn start<F>(reply: F) -> Self
    where
        F: Fn(&Value) -> Vec<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Requests = Arc::default();
        let reply = Arc::new(reply);

        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                let reply = Arc::clone(&reply);
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = serde_json::from_str(&line).unwrap();
                        seen.lock().unwrap().push(request.clone());
                        for out in reply(&request) {
                            if write.write_all(format!("{out}\r\n").as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        FakeDevice { addr, requests }
    }

    /// A device acknowledging everything with `["ok"]`.
    pub(crate) async fn acking() -> Self {
        Self::start(|r| vec![json!({"id": r["id"], "result": ["ok"]}).to_string()]).await
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| r["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

/// An endpoint nothing listens on.
pub(crate) fn refused_endpoint() -> Endpoint {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Endpoint::new("127.0.0.1", port)
}

/// A listener whose accept queue is full, so new connects hang unanswered.
pub(crate) struct StalledListener {
    addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

impl StalledListener {
    pub(crate) async fn start() -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let listener = socket.listen(0).unwrap();

        let mut queued = Vec::new();
        for _ in 0..8 {
            match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => queued.push(stream),
                _ => break,
            }
        }

        StalledListener {
            addr,
            _listener: listener,
            _queued: queued,
        }
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }
}
