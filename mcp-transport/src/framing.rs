//! Byte-level framing helpers.
//!
//! The stdio transports frame one JSON object per `\n`-terminated line;
//! [`LineBuffer`] holds the bytes that have arrived but not yet formed a
//! complete line. SSE *parsing* is handled by the `eventsource-stream` crate;
//! the server halves emit events through [`format_sse_event`].

/// Accumulates raw bytes and yields complete newline-terminated messages.
/// A trailing `\r` is trimmed so `\r\n` peers interoperate.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete line, leaving any partial tail buffered.
    pub fn next_message(&mut self) -> Option<String> {
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
        line.pop(); // the '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes buffered but not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Render one Server-Sent Event. `data` may span multiple lines; each line
/// gets its own `data:` field per the SSE wire format.
pub fn format_sse_event(id: Option<&str>, event: Option<&str>, data: &str) -> String {
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn yields_nothing_until_newline() {
        let mut buf = LineBuffer::new();
        buf.append(b"{\"jsonrpc\":");
        assert_eq!(buf.next_message(), None);
        assert_eq!(buf.pending(), 11);
    }

    #[test]
    fn splits_messages_across_chunks() {
        let mut buf = LineBuffer::new();
        buf.append(b"{\"a\":1}\n{\"b\"");
        assert_eq!(buf.next_message(), Some("{\"a\":1}".to_string()));
        assert_eq!(buf.next_message(), None);
        buf.append(b":2}\n");
        assert_eq!(buf.next_message(), Some("{\"b\":2}".to_string()));
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn trims_carriage_return() {
        let mut buf = LineBuffer::new();
        buf.append(b"{\"a\":1}\r\n");
        assert_eq!(buf.next_message(), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn empty_lines_are_yielded_as_empty_strings() {
        let mut buf = LineBuffer::new();
        buf.append(b"\n\n{\"a\":1}\n");
        assert_eq!(buf.next_message(), Some(String::new()));
        assert_eq!(buf.next_message(), Some(String::new()));
        assert_eq!(buf.next_message(), Some("{\"a\":1}".to_string()));
    }

    #[test]
    fn sse_event_formatting() {
        assert_eq!(
            format_sse_event(Some("7"), Some("message"), "{\"a\":1}"),
            "id: 7\nevent: message\ndata: {\"a\":1}\n\n"
        );
        assert_eq!(
            format_sse_event(None, None, "line1\nline2"),
            "data: line1\ndata: line2\n\n"
        );
    }
}
