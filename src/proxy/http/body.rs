use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proxy::http::codec::{LineTimeout, RequestHead, ResponseHead, read_line};
use crate::util::timeout_with_context;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const COPY_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Error)]
#[error("request body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: u64,
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub(crate) fn request_body_plan(head: &RequestHead) -> BodyPlan {
    if head.chunked {
        BodyPlan::Chunked
    } else {
        match head.content_length {
            Some(length) if length > 0 => BodyPlan::Fixed(length),
            _ => BodyPlan::Empty,
        }
    }
}

pub(crate) fn response_body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }
    if head.chunked {
        return BodyPlan::Chunked;
    }
    match head.content_length {
        Some(0) => BodyPlan::Empty,
        Some(length) => BodyPlan::Fixed(length),
        None => BodyPlan::UntilClose,
    }
}

/// Reads a whole body into memory, decoding chunked framing. With `limit` set, a body larger
/// than the limit fails with [`BodyTooLarge`] before the excess is buffered.
pub(crate) async fn read_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    read_timeout: Duration,
    peer: SocketAddr,
    limit: Option<u64>,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let check = |size: u64| -> Result<()> {
        match limit {
            Some(limit) if size > limit => Err(BodyTooLarge { limit }.into()),
            _ => Ok(()),
        }
    };

    let mut body = BytesMut::new();
    match plan {
        BodyPlan::Empty => {}
        BodyPlan::Fixed(length) => {
            check(length)?;
            read_exact_into(reader, &mut body, length, read_timeout, peer).await?;
        }
        BodyPlan::Chunked => {
            let mut line = String::new();
            loop {
                let chunk_size = read_chunk_size(reader, &mut line, read_timeout, peer).await?;
                if chunk_size == 0 {
                    skip_trailers(reader, &mut line, read_timeout, peer).await?;
                    break;
                }
                check((body.len() as u64).saturating_add(chunk_size))?;
                read_exact_into(reader, &mut body, chunk_size, read_timeout, peer).await?;
                read_chunk_terminator(reader, read_timeout, peer).await?;
            }
        }
        BodyPlan::UntilClose => {
            let mut buffer = [0u8; COPY_BUFFER_SIZE];
            loop {
                let read = timeout_with_context(
                    read_timeout,
                    reader.read(&mut buffer),
                    format!("reading body from {peer}"),
                )
                .await?;
                if read == 0 {
                    break;
                }
                check((body.len() + read) as u64)?;
                body.extend_from_slice(&buffer[..read]);
            }
        }
    }
    Ok(body.freeze())
}

/// Copies a body from `reader` to `writer` as-is; chunked framing and trailers pass through
/// verbatim. Returns the number of bytes written.
pub(crate) async fn relay_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    plan: BodyPlan,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(0),
        BodyPlan::Fixed(length) => {
            relay_fixed_body(reader, writer, length, read_timeout, write_timeout, peer).await
        }
        BodyPlan::Chunked => {
            relay_chunked_body(reader, writer, read_timeout, write_timeout, peer).await
        }
        BodyPlan::UntilClose => {
            relay_until_close(reader, writer, read_timeout, write_timeout, peer).await
        }
    }
}

async fn read_exact_into<S>(
    reader: &mut BufReader<S>,
    body: &mut BytesMut,
    length: u64,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut remaining = length;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading body from {peer}");
        }
        body.extend_from_slice(&buffer[..read]);
        remaining -= read as u64;
    }
    Ok(())
}

async fn read_chunk_size<S>(
    reader: &mut BufReader<S>,
    line: &mut String,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let read = read_line(
        reader,
        line,
        LineTimeout::PerRead(read_timeout),
        peer,
        MAX_CHUNK_LINE_LENGTH,
    )
    .await?;
    if read == 0 {
        bail!("unexpected EOF while reading chunk size from {peer}");
    }
    parse_chunk_size(line)
}

fn parse_chunk_size(line: &str) -> Result<u64> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let size_str = trimmed
        .split_once(';')
        .map(|(size, _)| size)
        .unwrap_or(trimmed)
        .trim();
    u64::from_str_radix(size_str, 16).with_context(|| format!("invalid chunk size '{size_str}'"))
}

async fn read_chunk_terminator<S>(
    reader: &mut BufReader<S>,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut crlf = [0u8; 2];
    timeout_with_context(
        read_timeout,
        reader.read_exact(&mut crlf),
        format!("reading chunk terminator from {peer}"),
    )
    .await?;
    if &crlf != b"\r\n" {
        bail!("invalid chunk terminator when reading from {peer}");
    }
    Ok(())
}

async fn skip_trailers<S>(
    reader: &mut BufReader<S>,
    line: &mut String,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        let read = read_line(
            reader,
            line,
            LineTimeout::PerRead(read_timeout),
            peer,
            MAX_CHUNK_LINE_LENGTH,
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk trailer from {peer}");
        }
        if line.trim_end_matches(['\r', '\n']).is_empty() {
            return Ok(());
        }
    }
}

async fn relay_fixed_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    mut remaining: u64,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut transferred = 0u64;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading response body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("upstream closed connection early while sending response body");
        }
        remaining -= read as u64;
        timeout_with_context(
            write_timeout,
            writer.write_all(&buffer[..read]),
            "writing response body to client",
        )
        .await?;
        transferred = transferred.saturating_add(read as u64);
    }
    Ok(transferred)
}

async fn relay_chunked_body<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total_bytes = 0u64;
    let mut line = String::new();

    loop {
        let chunk_size = read_chunk_size(reader, &mut line, read_timeout, peer).await?;
        timeout_with_context(
            write_timeout,
            writer.write_all(line.as_bytes()),
            "forwarding chunk size to client",
        )
        .await?;
        total_bytes = total_bytes.saturating_add(line.len() as u64);

        if chunk_size == 0 {
            loop {
                let trailer_bytes = read_line(
                    reader,
                    &mut line,
                    LineTimeout::PerRead(read_timeout),
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                timeout_with_context(
                    write_timeout,
                    writer.write_all(line.as_bytes()),
                    "forwarding chunk trailer to client",
                )
                .await?;
                total_bytes = total_bytes.saturating_add(trailer_bytes as u64);
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        let copied = relay_fixed_body(
            reader,
            writer,
            chunk_size,
            read_timeout,
            write_timeout,
            peer,
        )
        .await?;
        total_bytes = total_bytes.saturating_add(copied);

        read_chunk_terminator(reader, read_timeout, peer).await?;
        timeout_with_context(
            write_timeout,
            writer.write_all(b"\r\n"),
            "forwarding chunk terminator to client",
        )
        .await?;
        total_bytes = total_bytes.saturating_add(2);
    }

    Ok(total_bytes)
}

async fn relay_until_close<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buffer = [0u8; COPY_BUFFER_SIZE];
    loop {
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer),
            format!("reading response body from upstream {peer}"),
        )
        .await?;
        if read == 0 {
            break;
        }
        timeout_with_context(
            write_timeout,
            writer.write_all(&buffer[..read]),
            "writing response body to client",
        )
        .await?;
        total = total.saturating_add(read as u64);
    }
    Ok(total)
}
