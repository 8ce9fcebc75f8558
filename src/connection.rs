//! One TCP control socket to one device.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::oneshot;
use futures::future::{self, Either};
use log::{debug, trace};

use crate::errors::Error;
use crate::protocol::{self, Inbound};
use crate::runtime::{self, AsyncLineReader, AsyncLineWriter, AsyncTcpStream, TcpStream};
use crate::types::Endpoint;

type Result<T> = std::result::Result<T, Error>;

/// Something that happened on a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A well-formed line arrived.
    Message(Inbound),
    /// The socket is gone. Emitted exactly once per connection.
    Closed { error: bool },
}

/// Receives the events of a connection, tagged with the connection's generation.
pub type EventSink = Arc<dyn Fn(u64, ConnectionEvent) + Send + Sync + 'static>;

/// A live, newline-framed control socket.
///
/// Inbound lines are decoded by a background reader task and handed to the
/// [`EventSink`] the connection was opened with. Dropping or closing the
/// connection stops that task.
pub struct Connection {
    endpoint: Endpoint,
    writer: <TcpStream as AsyncTcpStream>::Writer,
    open: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
}

impl Connection {
    /// Connect to `endpoint` and start routing inbound lines to `sink`.
    pub async fn open(endpoint: &Endpoint, generation: u64, sink: EventSink) -> Result<Self> {
        let stream = TcpStream::connect(&endpoint.to_string())
            .await
            .map_err(|e| Error::socket("connect", e))?;
        let (reader, writer) = stream.into_split();

        let open = Arc::new(AtomicBool::new(true));
        let (stop, stopped) = oneshot::channel();
        runtime::spawn(read_loop(reader, stopped, generation, Arc::clone(&open), sink));

        debug!("connected to {endpoint} (generation {generation})");
        Ok(Connection {
            endpoint: endpoint.clone(),
            writer,
            open,
            stop: Some(stop),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the reader still sees a live socket.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write one already-terminated line.
    pub async fn send(&mut self, line: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Disconnected);
        }
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::socket("send", e))
    }

    /// Shut the socket down. Errors are ignored; closing twice is harmless.
    pub async fn close(mut self) {
        self.signal_stop();
        if let Err(e) = self.writer.shutdown().await {
            trace!("ignoring shutdown error on {}: {e}", self.endpoint);
        }
    }

    fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

async fn read_loop<R: AsyncLineReader>(
    mut reader: R,
    mut stopped: oneshot::Receiver<()>,
    generation: u64,
    open: Arc<AtomicBool>,
    sink: EventSink,
) {
    let mut buf = Vec::new();

    let error = loop {
        buf.clear();
        let read = {
            let line = reader.read_line(&mut buf);
            futures::pin_mut!(line);
            match future::select(line, &mut stopped).await {
                Either::Left((read, _)) => read,
                Either::Right(_) => break false,
            }
        };

        match read {
            Ok(0) => break false,
            Ok(_) => match std::str::from_utf8(&buf).ok().and_then(protocol::decode_line) {
                Some(message) => sink(generation, ConnectionEvent::Message(message)),
                None => trace!("dropping unrecognised line: {:?}", String::from_utf8_lossy(&buf)),
            },
            Err(e) => {
                debug!("read error on generation {generation}: {e}");
                break true;
            }
        }
    };

    open.store(false, Ordering::Release);
    sink(generation, ConnectionEvent::Closed { error });
}

#[cfg(all(test, feature = "runtime-tokio"))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn recording_sink() -> (EventSink, Arc<Mutex<Vec<ConnectionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |_: u64, event: ConnectionEvent| sink_events.lock().unwrap().push(event));
        (sink, events)
    }

    async fn wait_for_close(events: &Arc<Mutex<Vec<ConnectionEvent>>>) {
        for _ in 0..100 {
            if events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, ConnectionEvent::Closed { .. }))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection never reported close");
    }

    #[tokio::test]
    async fn test_routes_lines_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"garbage\r\n\xff\xfe\r\n{\"id\":5,\"result\":[\"ok\"]}\r\n")
                .await
                .unwrap();
        });

        let (sink, events) = recording_sink();
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let conn = Connection::open(&endpoint, 1, sink).await.unwrap();
        server.await.unwrap();
        wait_for_close(&events).await;

        let events = events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ConnectionEvent::Message(Inbound::Response {
                    id: 5,
                    outcome: Ok(vec![serde_json::json!("ok")])
                }),
                ConnectionEvent::Closed { error: false },
            ]
        );
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_send_and_close_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            lines.next_line().await.unwrap()
        });

        let (sink, events) = recording_sink();
        let endpoint = Endpoint::new("127.0.0.1", addr.port());
        let mut conn = Connection::open(&endpoint, 1, sink).await.unwrap();
        conn.send("{\"id\":1}\r\n").await.unwrap();
        assert_eq!(server.await.unwrap().as_deref(), Some("{\"id\":1}"));

        conn.close().await;
        wait_for_close(&events).await;
        let closes = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (sink, _) = recording_sink();
        let result = Connection::open(&Endpoint::new("127.0.0.1", port), 1, sink).await;
        assert!(matches!(result, Err(Error::Socket { .. })));
    }
}
