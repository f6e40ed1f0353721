use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Parsed header section with the framing facts the body readers need.
#[derive(Debug, Default)]
pub(crate) struct HeaderBlock {
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub transfer_encoding_present: bool,
}

/// Collects header lines up to a byte budget.
pub(crate) struct HeaderAccumulator {
    max_bytes: usize,
    consumed: usize,
    block: HeaderBlock,
}

impl HeaderAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            consumed: 0,
            block: HeaderBlock::default(),
        }
    }

    /// Records one raw line. Returns `false` once the blank line ending the section is seen.
    pub fn push_line(&mut self, line: &str) -> Result<bool> {
        self.reserve(line.len())?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(false);
        }
        if trimmed.starts_with([' ', '\t']) {
            bail!("obsolete header line folding is not supported");
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        ensure!(!name.is_empty(), "header name must not be empty");
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let value = value.trim();
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;

        if name == http::header::CONTENT_LENGTH {
            ensure!(
                self.block.content_length.is_none(),
                "multiple Content-Length headers are not supported"
            );
            let length: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            self.block.content_length = Some(length);
        } else if name == http::header::TRANSFER_ENCODING {
            self.block.transfer_encoding_present = true;
            let last = value.rsplit(',').next().unwrap_or_default().trim();
            self.block.chunked = last.eq_ignore_ascii_case("chunked");
        }

        self.block.headers.append(name, header_value);
        Ok(true)
    }

    pub fn total_bytes(&self) -> usize {
        self.consumed
    }

    pub fn finish(self) -> Result<HeaderBlock> {
        ensure!(
            !(self.block.transfer_encoding_present && self.block.content_length.is_some()),
            "message must not include both Transfer-Encoding and Content-Length"
        );
        Ok(self.block)
    }

    fn reserve(&mut self, byte_len: usize) -> Result<()> {
        self.consumed = self
            .consumed
            .checked_add(byte_len)
            .ok_or_else(|| anyhow!("header section exceeds configured limit"))?;
        ensure!(
            self.consumed <= self.max_bytes,
            "header section exceeds configured limit of {} bytes",
            self.max_bytes
        );
        Ok(())
    }
}
