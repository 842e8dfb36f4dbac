use std::{fmt, mem::take, time::Duration};

use crate::utf8::Utf8Decoder;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum Line<'a> {
    Comment,
    Field { name: &'a str, value: &'a str },
    Empty,
}

impl<'a> Line<'a> {
    /// `line` must not contain '\r' or '\n'.
    fn from_str(line: &'a str) -> Self {
        match line.split_once(':') {
            Some(("", _)) => Self::Comment,
            Some((name, value)) => Self::Field {
                name,
                value: value.strip_prefix(' ').unwrap_or(value),
            },
            None if line.is_empty() => Self::Empty,
            None => Self::Field {
                name: line,
                value: "",
            },
        }
    }
}

/// A complete server-sent event carrying data.
#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct Event {
    pub kind: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl Event {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Writes the event in wire form, terminating blank line included.
    pub fn write_to(&self, out: &mut impl fmt::Write) -> fmt::Result {
        if let Some(kind) = &self.kind {
            writeln!(out, "event: {kind}")?;
        }
        for line in self.data.split('\n') {
            if line.is_empty() {
                out.write_str("data\n")?;
            } else {
                writeln!(out, "data: {line}")?;
            }
        }
        if let Some(id) = &self.id {
            writeln!(out, "id: {id}")?;
        }
        out.write_char('\n')
    }
}

/// Item produced by [`EventParser`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Parsed {
    Event(Event),
    /// The stream asked clients to wait this long before reconnecting.
    ReconnectInterval(Duration),
}

/// Fields of the event currently being assembled.
#[derive(Default, Debug)]
struct PendingEvent {
    kind: Option<String>,
    data: Option<String>,
    id: Option<String>,
}

/// Push parser for `text/event-stream` bodies.
///
/// Chunks may split events, lines and even characters at arbitrary points;
/// everything not yet terminated is kept until the next [`feed`](Self::feed).
#[derive(Default, Debug)]
pub struct EventParser {
    decoder: Utf8Decoder,
    line: String,
    event: PendingEvent,
    /// The previous chunk ended with '\r' that may be the first half of "\r\n".
    after_cr: bool,
    started: bool,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `bytes` and calls `on_event` for every event completed by them, in order.
    pub fn feed(&mut self, bytes: &[u8], mut on_event: impl FnMut(Parsed)) {
        let text = self.decoder.decode(bytes);
        let mut rest = text.as_str();
        if rest.is_empty() {
            return;
        }
        if !self.started {
            self.started = true;
            rest = rest.strip_prefix('\u{feff}').unwrap_or(rest);
        }
        if take(&mut self.after_cr) {
            rest = rest.strip_prefix('\n').unwrap_or(rest);
        }

        while let Some(i) = rest.find(['\r', '\n']) {
            let (head, tail) = rest.split_at(i);
            rest = if tail.starts_with("\r\n") {
                &tail[2..]
            } else {
                if tail == "\r" {
                    self.after_cr = true;
                }
                &tail[1..]
            };

            if self.line.is_empty() {
                self.process_line(head, &mut on_event);
            } else {
                let mut line = take(&mut self.line);
                line.push_str(head);
                self.process_line(&line, &mut on_event);
            }
        }
        self.line.push_str(rest);
    }

    fn process_line(&mut self, line: &str, on_event: &mut impl FnMut(Parsed)) {
        match Line::from_str(line) {
            Line::Comment => (),
            Line::Empty => {
                let event = take(&mut self.event);
                if let Some(data) = event.data {
                    on_event(Parsed::Event(Event {
                        kind: event.kind,
                        data,
                        id: event.id,
                    }));
                }
            }
            Line::Field { name, value } => match name {
                "event" => self.event.kind = Some(value.to_owned()),
                "data" => match &mut self.event.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.event.data = Some(value.to_owned()),
                },
                "id" => {
                    if !value.contains('\0') {
                        self.event.id = Some(value.to_owned());
                    }
                }
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        on_event(Parsed::ReconnectInterval(Duration::from_millis(ms)));
                    }
                }
                _ => log::trace!("Ignoring unknown event-stream field {name:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> Vec<Parsed> {
        let mut parser = EventParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            parser.feed(chunk, |event| events.push(event));
        }
        events
    }

    fn parse(data: &str) -> Vec<Parsed> {
        parse_chunks([data.as_bytes()])
    }

    fn data_event(data: &str) -> Parsed {
        Parsed::Event(Event::data(data))
    }

    #[test]
    fn data() {
        let data = &"
data

data
data

data:
"[1..];

        assert_eq!(parse(data), [data_event(""), data_event("\n")]);
    }

    #[test]
    fn comment_and_id() {
        let data = &"
: test stream

data: first event
id: 1

data:second event
id

data:  third event
"[1..];

        assert_eq!(
            parse(data),
            [
                Parsed::Event(Event {
                    data: "first event".into(),
                    id: Some("1".into()),
                    ..Default::default()
                }),
                Parsed::Event(Event {
                    data: "second event".into(),
                    id: Some("".into()),
                    ..Default::default()
                }),
            ]
        );
    }

    #[test]
    fn multiline_data() {
        let data = &"
data: YHOO
data: +2
data: 10

"[1..];

        assert_eq!(parse(data), [data_event("YHOO\n+2\n10")]);
    }

    #[test]
    fn block_without_data() {
        assert_eq!(parse("event: ping\nid: 7\n\ndata: x\n\n"), [data_event("x")]);
    }

    #[test]
    fn retry_is_reported_separately() {
        assert_eq!(
            parse("retry: 1500\n\nretry: soon\ndata: a\n\n"),
            [
                Parsed::ReconnectInterval(Duration::from_millis(1500)),
                data_event("a"),
            ]
        );
    }

    #[test]
    fn split_event() {
        let chunks: [&[u8]; 2] = [b"event: push\ndata", b": 123456\nid: 1\n\n"];

        let mut parser = EventParser::new();
        let mut events = Vec::new();

        parser.feed(chunks[0], |event| events.push(event));
        assert!(events.is_empty());

        parser.feed(chunks[1], |event| events.push(event));
        assert_eq!(
            events,
            [Parsed::Event(Event {
                kind: Some("push".into()),
                data: "123456".into(),
                id: Some("1".into()),
            })]
        );
    }

    #[test]
    fn split_char() {
        let chunks: [&[u8]; 2] = [b"data: \xd0\x90\xd0", b"\x91\xd0\x92\n\n"];
        assert_eq!(parse_chunks(chunks), [data_event("АБВ")]);
    }

    #[test]
    fn crlf_line_endings() {
        let chunks: [&[u8]; 3] = [b"data: a\r", b"\n\r", b"\ndata: b\r\r"];
        assert_eq!(parse_chunks(chunks), [data_event("a"), data_event("b")]);
    }

    #[test]
    fn byte_order_mark() {
        assert_eq!(parse("\u{feff}data: a\n\n"), [data_event("a")]);
    }

    #[test]
    fn nothing_before_blank_line() {
        assert!(parse("data: {\"choices\": []}\n").is_empty());
    }

    #[test]
    fn any_split_gives_same_events() {
        let payload = concat!(
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "event: message\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"Привет\"}}]}\r\n\r\n",
            "retry: 3000\n",
            "data: first\ndata: second 😀\nid: 42\n\n",
            "data: [DONE]\n\n",
        )
        .as_bytes();
        let whole = parse_chunks([payload]);
        assert_eq!(whole.len(), 5);

        for i in 0..=payload.len() {
            let (a, b) = payload.split_at(i);
            assert_eq!(parse_chunks([a, b]), whole, "split at {i}");
        }
        for size in 1..8 {
            assert_eq!(parse_chunks(payload.chunks(size)), whole, "chunk size {size}");
        }
    }

    #[test]
    fn written_event_parses_back() {
        let event = Event {
            kind: Some("update".into()),
            data: "line one\n\nline three".into(),
            id: Some("9".into()),
        };
        let mut text = String::new();
        event.write_to(&mut text).unwrap();
        assert_eq!(
            text,
            "event: update\ndata: line one\ndata\ndata: line three\nid: 9\n\n"
        );
        assert_eq!(parse(&text), [Parsed::Event(event)]);
    }
}
