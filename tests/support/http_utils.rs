use std::net::SocketAddr;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const IO_TIMEOUT: StdDuration = StdDuration::from_secs(5);

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Sends one request with `Connection: close` and reads the response until EOF.
pub async fn send_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<HttpResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(body).await?;

    let mut raw = Vec::new();
    timeout(IO_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .context("timed out reading response")??;
    parse_response(&raw)
}

pub async fn get(addr: SocketAddr, path: &str) -> Result<HttpResponse> {
    send_request(addr, "GET", path, &[], &[]).await
}

/// Parses a complete response whose body runs to the end of `raw`.
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response head not terminated"))?;
    let head = std::str::from_utf8(&raw[..split]).context("response head is not UTF-8")?;
    let mut lines = head.split("\r\n");
    let status = parse_status_line(lines.next().unwrap_or_default())?;
    let headers = lines.filter_map(split_header).collect();
    Ok(HttpResponse {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

/// Reads one `Content-Length` framed response from a keep-alive connection.
pub async fn read_response<S>(reader: &mut BufReader<S>) -> Result<HttpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let bytes = timeout(IO_TIMEOUT, reader.read_line(&mut line)).await??;
    if bytes == 0 {
        return Err(anyhow!("connection closed before response status line"));
    }
    let status = parse_status_line(line.trim_end())?;
    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = timeout(IO_TIMEOUT, reader.read_line(&mut line)).await??;
        if n == 0 || line == "\r\n" {
            break;
        }
        if let Some(header) = split_header(line.trim_end()) {
            headers.push(header);
        }
    }
    let length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.parse::<usize>())
        .transpose()?
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    timeout(IO_TIMEOUT, reader.read_exact(&mut body)).await??;
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<u16> {
    line.split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code in response line {line:?}"))?
        .parse::<u16>()
        .map_err(|err| anyhow!("invalid status code: {err}"))
}

fn split_header(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}
