//! Byte scanner for surrogate markup.
//!
//! Each pass walks the input once, left to right. The first closing delimiter after an
//! opening one ends the construct; an opening delimiter without a closing one is left
//! as literal text.

/// Position of `needle` in `haystack` at or after `from`.
pub fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle, 0).is_some()
}

/// Remove every `open … close` block (inclusive).
pub fn strip_blocks(input: &[u8], open: &[u8], close: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;
    while let Some(start) = find(input, open, pos) {
        let Some(end) = find(input, close, start + open.len()) else {
            break;
        };
        out.extend_from_slice(&input[pos..start]);
        pos = end + close.len();
    }
    out.extend_from_slice(&input[pos..]);
    out
}

/// Remove every `open` tag that has at least one byte before its closing `>`.
pub fn strip_tags(input: &[u8], open: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;
    let mut search = 0;
    while let Some(start) = find(input, open, search) {
        let body = start + open.len();
        match find(input, b">", body) {
            Some(end) if end > body => {
                out.extend_from_slice(&input[pos..start]);
                pos = end + 1;
                search = pos;
            }
            Some(_) => search = body,
            None => break,
        }
    }
    out.extend_from_slice(&input[pos..]);
    out
}

/// A recognized tag: byte range in the input and its raw attribute text.
#[derive(Debug, PartialEq, Eq)]
pub struct Tag<'a> {
    pub start: usize,
    pub end: usize,
    pub attributes: &'a [u8],
}

/// Next `open` tag followed by whitespace and ended by the earliest of `closers`.
pub fn next_tag<'a>(input: &'a [u8], from: usize, open: &[u8], closers: &[&[u8]]) -> Option<Tag<'a>> {
    let mut search = from;
    loop {
        let start = find(input, open, search)?;
        let body = start + open.len();
        if !input.get(body).is_some_and(|b| b.is_ascii_whitespace()) {
            search = body;
            continue;
        }
        let closing = closers
            .iter()
            .filter_map(|closer| find(input, closer, body).map(|pos| (pos, closer.len())))
            .min_by_key(|(pos, _)| *pos);
        let (close_at, close_len) = closing?;
        return Some(Tag {
            start,
            end: close_at + close_len,
            attributes: trim_ascii(&input[body..close_at]),
        });
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

/// `name="value"` pairs in attribute text; anything else is skipped.
pub fn attributes(raw: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < raw.len() {
        let name_start = pos;
        while pos < raw.len() && (raw[pos].is_ascii_alphanumeric() || matches!(raw[pos], b'-' | b'_' | b':')) {
            pos += 1;
        }
        if pos == name_start {
            pos += 1;
            continue;
        }
        let name = &raw[name_start..pos];
        if raw.get(pos) != Some(&b'=') || raw.get(pos + 1) != Some(&b'"') {
            continue;
        }
        let value_start = pos + 2;
        let Some(value_end) = find(raw, b"\"", value_start) else {
            break;
        };
        out.push((
            String::from_utf8_lossy(name).to_ascii_lowercase(),
            String::from_utf8_lossy(&raw[value_start..value_end]).into_owned(),
        ));
        pos = value_end + 1;
    }
    out
}
