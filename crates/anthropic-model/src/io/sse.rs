use std::fmt::{self, Display};
use std::mem;

use super::{Chunks, ChunksError};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ChunksError(ChunksError),
    InvalidPayload,
}

/// One dispatched server-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl Display for SseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event {
            Some(event) => write!(f, "{event}: {}", self.data),
            None => write!(f, "{}", self.data),
        }
    }
}

/// A type for reading server-sent events from a chunk stream.
pub struct Sse {
    // Raw bytes, a multi-byte character may be split across chunks.
    buf: Vec<u8>,
    // Bytes of `buf` already known to contain no frame end.
    scanned: usize,
    // The last byte received was a `cr`, which may pair with a leading `lf`
    // of the next chunk.
    after_cr: bool,
    chunks: Chunks,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            after_cr: false,
            chunks,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, Error> {
        loop {
            // Events already buffered are delivered before reading more.
            if let Some(event) = self.try_parse_event()? {
                return Ok(Some(event));
            }

            let Some(bytes) =
                self.chunks.next_chunk().await.map_err(Error::ChunksError)?
            else {
                // An unterminated trailing event is discarded.
                return Ok(None);
            };
            self.push_chunk(&bytes);
        }
    }

    // Normalizes `cr lf` and lone `cr` line endings to `lf`.
    fn push_chunk(&mut self, bytes: &[u8]) {
        self.buf.reserve(bytes.len());
        for &byte in bytes {
            let after_cr = mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\r' => self.buf.push(b'\n'),
                b'\n' if after_cr => {}
                _ => self.buf.push(byte),
            }
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<SseEvent>, Error> {
        // event         = *( comment / field ) end-of-line
        // comment       = colon *any-char end-of-line
        // field         = 1*name-char [ colon [ space ] *any-char ] end-of-line
        loop {
            let Some(pos) = self.buf[self.scanned..]
                .windows(2)
                .position(|w| w == b"\n\n")
            else {
                // The last byte may still start a frame end.
                self.scanned = self.buf.len().saturating_sub(1);
                return Ok(None);
            };
            let eol_idx = self.scanned + pos;
            self.scanned = 0;

            // Consume the bytes from the buffer.
            let frame: Vec<u8> = self.buf.drain(0..eol_idx + 2).collect();
            let Ok(frame) = str::from_utf8(&frame[0..eol_idx]) else {
                return Err(Error::InvalidPayload);
            };

            // Frames with only comments (keep-alives) carry no event.
            if let Some(event) = parse_frame(frame)? {
                return Ok(Some(event));
            }
        }
    }
}

fn parse_frame(frame: &str) -> Result<Option<SseEvent>, Error> {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in frame.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            return Err(Error::InvalidPayload);
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_owned()),
            "data" => data_lines.push(value),
            // `id` and `retry` are meaningless for a one-shot response.
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    }))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn data(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_owned(),
        }
    }

    #[tokio::test]
    async fn test_normal_events() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data: hello\n\n"),
                Bytes::from_static(b"data: bye\n\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("hello"));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("bye"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_named_events() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(
                b"event: ping\r\ndata: {\"type\": \"ping\"}\r\n\r\n\
                  : keep-alive\n\n\
                  event: message_stop\ndata:{\"type\":\"message_stop\"}\n\n",
            )]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("ping"));
        assert_eq!(event.data, r#"{"type": "ping"}"#);
        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("message_stop"));
        assert_eq!(event.data, r#"{"type":"message_stop"}"#);
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_multiline_data() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"data: a\ndata: b\nid: 7\n\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("a\nb"));
    }

    #[tokio::test]
    async fn test_quirk_streaming() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data:"),
                Bytes::from_static(b" hello\n"),
                Bytes::from_static(b"\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("hello"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cr_line_endings() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"event: ping\rdata: a\r\r"),
                // `cr lf` split across chunks is a single line break.
                Bytes::from_static(b"data: b\r"),
                Bytes::from_static(b"\ndata: c\r"),
                Bytes::from_static(b"\r"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("ping"));
        assert_eq!(event.data, "a");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("b\nc"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_end_across_many_chunks() {
        let mut chunks: Vec<Bytes> = (0..64)
            .map(|_| Bytes::from_static(b"data: 0123456789\n"))
            .collect();
        chunks.push(Bytes::from_static(b"\n"));
        chunks.push(Bytes::from_static(b"data: next\n\n"));
        let mut sse = Sse::new(Chunks::from_vec_deque(chunks.into()));

        let event = sse.next_event().await.unwrap().unwrap();
        assert_eq!(event.data.lines().count(), 64);
        assert!(event.data.lines().all(|line| line == "0123456789"));
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("next"));
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_split_utf8() {
        let text = "data: héllo\n\n".as_bytes();
        // Split inside the two-byte `é`.
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::copy_from_slice(&text[..8]),
                Bytes::copy_from_slice(&text[8..]),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), data("héllo"));
    }

    #[tokio::test]
    async fn test_invalid_data() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"xxxxxx\n\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap_err(), Error::InvalidPayload);

        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"xxxxxx\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap(), None);

        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data: hello\n"),
                Bytes::from_static(b"data: bye\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap(), None);
    }
}
