//! Full-stack ingest tests over real TCP sockets.
//!
//! A complete server (listener, admission control, queue sink) runs in
//! process on an OS-assigned port; clients speak SMTP over loopback.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postern_common::{clock::SystemClock, stats::ServerStats, Signal};
use postern_policy::{AdmissionControl, PolicyConfig};
use postern_queue::TestQueue;
use postern_smtp::{Listener, Server, SessionConfig};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::broadcast,
    task::JoinHandle,
};

struct TestServer {
    addr: SocketAddr,
    queue: TestQueue,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_server(policy: PolicyConfig) -> TestServer {
    let stats = Arc::new(ServerStats::default());
    let admission = Arc::new(AdmissionControl::new(
        policy,
        Arc::new(SystemClock),
        stats,
    ));

    let queue = TestQueue::new();
    let config = SessionConfig::builder(Arc::new(queue.clone()), Arc::clone(&admission))
        .with_hostname("e2e.test")
        .build();

    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .unwrap()
        .with_drain_deadline(Duration::from_secs(5));
    let addr = listener.local_addr();

    let server = Server::new(admission).with_listener(listener);
    let (shutdown, receiver) = broadcast::channel(4);
    let handle = tokio::spawn(async move { server.serve(receiver).await });

    TestServer {
        addr,
        queue,
        shutdown,
        handle,
    }
}

struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert!(read > 0, "server closed the connection unexpectedly");
        line.trim_end_matches("\r\n").to_string()
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let line = self.read_line().await;
        assert!(
            line.starts_with(prefix),
            "expected reply starting {prefix:?}, got {line:?}"
        );
        line
    }

    /// Read through the end of a multi-line reply for `code`.
    async fn expect_reply(&mut self, code: &str) {
        loop {
            let line = self.read_line().await;
            assert!(line.starts_with(code), "unexpected reply {line:?}");
            if !line[code.len()..].starts_with('-') {
                return;
            }
        }
    }

    async fn expect_eof(&mut self) {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert_eq!(read, 0, "expected connection close, got {line:?}");
    }
}

#[tokio::test]
async fn submission_over_tcp_reaches_the_queue() {
    let server = start_server(PolicyConfig::default()).await;

    let mut client = Client::connect(server.addr).await;
    client.expect("220 e2e.test ESMTP").await;
    client.send("EHLO e2e-client").await;
    client.expect_reply("250").await;
    client.send("MAIL FROM:<sender@example.org>").await;
    client.expect("250").await;
    client.send("RCPT TO:<rcpt@example.net>").await;
    client.expect("250").await;
    client.send("DATA").await;
    client.expect("354").await;
    client
        .send_raw(b"Subject: e2e\r\n\r\nover tcp\r\n.\r\n")
        .await;
    client.expect("250 OK: ").await;
    client.send("QUIT").await;
    client.expect("221").await;
    client.expect_eof().await;

    server
        .queue
        .wait_for_count(1, Duration::from_secs(5))
        .await
        .unwrap();
    let messages = server.queue.messages();
    assert_eq!(messages[0].body, b"Subject: e2e\r\n\r\nover tcp\r\n");
    assert_eq!(messages[0].envelope.sender(), Some("sender@example.org"));

    server.shutdown.send(Signal::Shutdown).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn connection_cap_turns_excess_accepts_away() {
    let server = start_server(PolicyConfig {
        max_connections: 1,
        ..PolicyConfig::default()
    })
    .await;

    let mut first = Client::connect(server.addr).await;
    first.expect("220").await;

    // The second connection is over the cap: one 421, then close.
    let mut second = Client::connect(server.addr).await;
    second.expect("421").await;
    second.expect_eof().await;

    // Releasing the first slot lets a new connection in.
    first.send("QUIT").await;
    first.expect("221").await;
    first.expect_eof().await;

    // Allow for the first session's slot release to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut third = Client::connect(server.addr).await;
    third.expect("220").await;

    server.shutdown.send(Signal::Shutdown).unwrap();
    server.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_drains_live_sessions_with_421() {
    let server = start_server(PolicyConfig::default()).await;

    let mut client = Client::connect(server.addr).await;
    client.expect("220").await;
    client.send("EHLO e2e-client").await;
    client.expect_reply("250").await;

    server.shutdown.send(Signal::Shutdown).unwrap();

    // The idle session is told to go away and the server comes down
    // within the drain deadline.
    client.expect("421").await;
    client.expect_eof().await;
    server.handle.await.unwrap().unwrap();
}
