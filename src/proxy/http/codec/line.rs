use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// How long a single line read may take.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LineTimeout {
    /// The whole line (and anything read after it with the same deadline) must arrive by then.
    Deadline(Instant),
    /// Each individual socket read must complete within the duration.
    PerRead(Duration),
}

impl LineTimeout {
    fn next_wait(&self, context: &str) -> Result<Duration> {
        match self {
            LineTimeout::Deadline(deadline) => deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| anyhow!("timed out {context}")),
            LineTimeout::PerRead(duration) => Ok(*duration),
        }
    }
}

/// Reads one line including its terminator into `buf`. Returns 0 on a clean EOF before any
/// byte was read.
pub(crate) async fn read_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    limit: LineTimeout,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let wait = limit.next_wait(&context)?;
        let available = timeout_with_context(wait, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map_or(available.len(), |idx| idx + 1);
        let total = collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?;
        if total > max_len {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    *buf = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    Ok(buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reads_lines_and_reports_eof() -> Result<()> {
        let data = b"first\r\nsecond\n";
        let mut reader = BufReader::new(&data[..]);
        let peer: SocketAddr = "127.0.0.1:1".parse()?;
        let mut line = String::new();
        let limit = LineTimeout::PerRead(Duration::from_secs(1));

        assert_eq!(read_line(&mut reader, &mut line, limit, peer, 64).await?, 7);
        assert_eq!(line, "first\r\n");
        read_line(&mut reader, &mut line, limit, peer, 64).await?;
        assert_eq!(line, "second\n");
        assert_eq!(read_line(&mut reader, &mut line, limit, peer, 64).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_overlong_line() {
        let data = b"0123456789\n";
        let mut reader = BufReader::new(&data[..]);
        let mut line = String::new();
        let err = read_line(
            &mut reader,
            &mut line,
            LineTimeout::PerRead(Duration::from_secs(1)),
            "127.0.0.1:1".parse().unwrap(),
            4,
        )
        .await
        .expect_err("line over limit must fail");
        assert!(err.to_string().contains("exceeds configured limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_applies_across_partial_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = String::new();
            read_line(
                &mut reader,
                &mut line,
                LineTimeout::Deadline(Instant::now() + Duration::from_millis(50)),
                "127.0.0.1:1".parse().unwrap(),
                64,
            )
            .await
        });

        client.write_all(b"partial").await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;

        let err = handle
            .await
            .unwrap()
            .expect_err("partial line must time out");
        assert!(err.to_string().contains("timed out"), "unexpected: {err}");
    }
}
