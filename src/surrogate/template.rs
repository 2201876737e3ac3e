//! Deferred include directives stored in processed bodies.
//!
//! A processed body is a template: literal bytes interleaved with `<?include …?>`
//! directives (form-urlencoded arguments). Any `<?` already present in the origin body
//! is written as `<?lit?>` so that it can never be mistaken for a directive.

use url::form_urlencoded;

use super::scanner::find;
use super::SurrogateError;

const OPEN: &[u8] = b"<?";
const CLOSE: &[u8] = b"?>";
const LITERAL: &[u8] = b"<?lit?>";

/// Fragment to resolve when the template is evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub src: String,
    pub alt: Option<String>,
    pub ignore_errors: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a [u8]),
    Include(Include),
}

/// Append origin bytes to a template, defusing directive openers.
pub fn push_literal(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut pos = 0;
    while let Some(at) = find(bytes, OPEN, pos) {
        out.extend_from_slice(&bytes[pos..at]);
        out.extend_from_slice(LITERAL);
        pos = at + OPEN.len();
    }
    out.extend_from_slice(&bytes[pos..]);
}

pub fn push_include(out: &mut Vec<u8>, include: &Include) {
    let mut args = form_urlencoded::Serializer::new(String::new());
    args.append_pair("src", &include.src);
    if let Some(alt) = &include.alt {
        args.append_pair("alt", alt);
    }
    if include.ignore_errors {
        args.append_pair("continue", "1");
    }
    out.extend_from_slice(b"<?include ");
    out.extend_from_slice(args.finish().as_bytes());
    out.extend_from_slice(CLOSE);
}

/// Split a template into literal and include segments.
pub fn parse(template: &[u8]) -> Result<Vec<Segment<'_>>, SurrogateError> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;
    while let Some(open) = find(template, OPEN, pos) {
        let close = find(template, CLOSE, open + OPEN.len()).ok_or(SurrogateError::InvalidTemplate(open))?;
        let directive = &template[open + OPEN.len()..close];

        if directive == b"lit" {
            // Keep the `<?` itself as text.
            if open > text_start {
                segments.push(Segment::Text(&template[text_start..open]));
            }
            segments.push(Segment::Text(OPEN));
        } else if let Some(args) = directive.strip_prefix(b"include ") {
            if open > text_start {
                segments.push(Segment::Text(&template[text_start..open]));
            }
            segments.push(Segment::Include(parse_include(args).ok_or(SurrogateError::InvalidTemplate(open))?));
        } else {
            return Err(SurrogateError::InvalidTemplate(open));
        }

        pos = close + CLOSE.len();
        text_start = pos;
    }
    if text_start < template.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    Ok(segments)
}

fn parse_include(args: &[u8]) -> Option<Include> {
    let mut src = None;
    let mut alt = None;
    let mut ignore_errors = false;
    for (key, value) in form_urlencoded::parse(args) {
        match key.as_ref() {
            "src" => src = Some(value.into_owned()),
            "alt" => alt = Some(value.into_owned()),
            "continue" => ignore_errors = value == "1",
            _ => {}
        }
    }
    Some(Include {
        src: src?,
        alt,
        ignore_errors,
    })
}
