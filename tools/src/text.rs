//! Applying LSP positions and edits to file text.
//!
//! Positions count UTF-16 code units within a line. A column past the end of
//! its line is clamped to the line end; a line past the end of the text is an
//! error. Inserted text takes the file's line ending, so a `\r\n` file stays
//! `\r\n` throughout.

use tether_lsp::{Position, Range, TextEdit};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    #[error("position {line}:{character} is outside the document")]
    OutOfRange { line: u32, character: u32 },
    #[error("edits overlap at byte {at}")]
    Overlapping { at: usize },
}

/// Byte offsets where each line starts.
fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Byte offset of `pos` in `text`.
pub fn offset_at(text: &str, pos: Position) -> Result<usize, TextError> {
    let starts = line_starts(text);
    let out_of_range = TextError::OutOfRange {
        line: pos.line,
        character: pos.character,
    };
    let line = pos.line as usize;
    let start = *starts.get(line).ok_or(out_of_range)?;
    let end = starts.get(line + 1).map_or(text.len(), |next| next - 1);
    let content = text[start..end].strip_suffix('\r').unwrap_or(&text[start..end]);

    let mut units = 0u32;
    for (byte, c) in content.char_indices() {
        if units >= pos.character {
            return Ok(start + byte);
        }
        units += c.len_utf16() as u32;
    }
    Ok(start + content.len())
}

fn byte_range(text: &str, range: Range) -> Result<(usize, usize), TextError> {
    let start = offset_at(text, range.start)?;
    let end = offset_at(text, range.end)?;
    Ok((start, end.max(start)))
}

/// Apply `edits` as one simultaneous change, as `WorkspaceEdit` requires.
pub fn apply_edits(text: &str, edits: &[TextEdit]) -> Result<String, TextError> {
    let mut spans = edits
        .iter()
        .map(|edit| byte_range(text, edit.range).map(|(s, e)| (s, e, edit.new_text.as_str())))
        .collect::<Result<Vec<_>, _>>()?;
    // Stable sort keeps same-position inserts in the order the server sent them.
    spans.sort_by_key(|(start, end, _)| (*start, *end));
    for pair in spans.windows(2) {
        if pair[1].0 < pair[0].1 {
            return Err(TextError::Overlapping { at: pair[1].0 });
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, new_text) in spans {
        out.push_str(&text[cursor..start]);
        out.push_str(new_text);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}

/// `\r\n` when the file's first line break is one, else `\n`.
fn line_ending(text: &str) -> &'static str {
    match text.find('\n') {
        Some(i) if text[..i].ends_with('\r') => "\r\n",
        _ => "\n",
    }
}

/// `body` with every line break rewritten to `eol`.
fn with_line_endings(body: &str, eol: &str) -> String {
    if eol == "\n" {
        return body.replace("\r\n", "\n");
    }
    body.replace("\r\n", "\n").replace('\n', eol)
}

fn terminated(body: &str, eol: &str) -> String {
    let mut body = with_line_endings(body, eol);
    if !body.ends_with('\n') {
        body.push_str(eol);
    }
    body
}

/// Replace the text covered by `range` with `body`.
pub fn replace_range(text: &str, range: Range, body: &str) -> Result<String, TextError> {
    let (start, end) = byte_range(text, range)?;
    let body = with_line_endings(body, line_ending(text));
    Ok(format!("{}{body}{}", &text[..start], &text[end..]))
}

/// Insert `body` as whole lines before the line containing `range.start`.
pub fn insert_before(text: &str, range: Range, body: &str) -> Result<String, TextError> {
    let at = offset_at(
        text,
        Position {
            line: range.start.line,
            character: 0,
        },
    )?;
    let body = terminated(body, line_ending(text));
    Ok(format!("{}{body}{}", &text[..at], &text[at..]))
}

/// Insert `body` as whole lines after the line containing `range.end`.
pub fn insert_after(text: &str, range: Range, body: &str) -> Result<String, TextError> {
    // Validates the end position itself.
    offset_at(text, range.end)?;
    let starts = line_starts(text);
    let next_line = range.end.line as usize + 1;
    let eol = line_ending(text);
    let body = terminated(body, eol);
    match starts.get(next_line) {
        Some(&at) => Ok(format!("{}{body}{}", &text[..at], &text[at..])),
        None if text.is_empty() || text.ends_with('\n') => Ok(format!("{text}{body}")),
        None => Ok(format!("{text}{eol}{body}")),
    }
}
