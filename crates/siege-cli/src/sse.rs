//! Incremental `text/event-stream` parser.
//!
//! Bytes are fed in whatever chunks the transport delivers; complete blocks
//! come out. Comment lines (keep-alives) and blocks without data are dropped.

/// One dispatched event block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseBlock {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseBlock,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every block it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseBlock> {
        self.buffer.extend_from_slice(chunk);
        let mut blocks = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');
            if let Some(block) = self.line(line) {
                blocks.push(block);
            }
        }
        blocks
    }

    fn line(&mut self, line: &str) -> Option<SseBlock> {
        if line.is_empty() {
            let block = std::mem::take(&mut self.current);
            let dispatch = std::mem::replace(&mut self.has_data, false);
            return dispatch.then_some(block);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.current.id = Some(value.to_string()),
            "event" => self.current.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }
}
