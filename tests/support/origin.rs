use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request as the origin saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    body_delay: Option<StdDuration>,
}

/// Minimal HTTP/1.1 origin that counts and records requests and answers every one of them
/// with the same configurable response.
pub struct MockOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    reply: Arc<Mutex<Reply>>,
    handle: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start(body: &str) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let reply = Arc::new(Mutex::new(Reply {
            status: 200,
            headers: vec![("Content-Type".into(), "text/plain".into())],
            body: body.as_bytes().to_vec(),
            body_delay: None,
        }));

        let handle = {
            let requests = requests.clone();
            let recorded = recorded.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    let requests = requests.clone();
                    let recorded = recorded.clone();
                    let reply = reply.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(socket, requests, recorded, reply).await;
                    });
                }
            })
        };

        Ok(Self {
            addr,
            requests,
            recorded,
            reply,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().clone()
    }

    pub fn set_status(&self, status: u16) {
        self.reply.lock().status = status;
    }

    pub fn add_header(&self, name: &str, value: &str) {
        self.reply
            .lock()
            .headers
            .push((name.to_string(), value.to_string()));
    }

    /// Delays the body after the head has been sent.
    pub fn set_body_delay(&self, delay: StdDuration) {
        self.reply.lock().body_delay = Some(delay);
    }

    /// Stops accepting connections; the port refuses connections afterwards.
    pub async fn stop(&mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    socket: TcpStream,
    requests: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
    reply: Arc<Mutex<Reply>>,
) -> Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?.to_string();
    let target = parts.next().ok_or_else(|| anyhow!("missing target"))?.to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.trim_end().split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    requests.fetch_add(1, Ordering::SeqCst);
    recorded.lock().push(RecordedRequest {
        method: method.clone(),
        target,
        headers,
        body,
    });

    let reply = reply.lock().clone();
    let mut head = format!("HTTP/1.1 {} Test\r\n", reply.status);
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        reply.body.len()
    ));

    let socket = reader.get_mut();
    socket.write_all(head.as_bytes()).await?;
    if let Some(delay) = reply.body_delay {
        tokio::time::sleep(delay).await;
    }
    if method != "HEAD" {
        socket.write_all(&reply.body).await?;
    }
    socket.shutdown().await.ok();
    Ok(())
}
