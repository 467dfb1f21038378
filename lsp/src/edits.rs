//! Applying LSP text edits to a buffer.

use crate::types::{Position, TextEdit};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EditError {
    #[error("edit range ends before it starts at {}:{}", start.line, start.character)]
    InvertedRange { start: Position },
    #[error("overlapping edits at {}:{}", at.line, at.character)]
    Overlapping { at: Position },
}

/// Byte offset of an LSP position. Columns count UTF-16 code units; a column
/// past the end of its line clamps to the line end, a line past the end of
/// the text clamps to the end of the text.
fn offset_of(text: &str, line_starts: &[usize], position: Position) -> usize {
    let Some(&start) = line_starts.get(position.line as usize) else {
        return text.len();
    };
    let line_end = text[start..]
        .find('\n')
        .map_or(text.len(), |i| start + i);
    let line = text[start..line_end]
        .strip_suffix('\r')
        .unwrap_or(&text[start..line_end]);

    let mut units = 0u32;
    for (idx, ch) in line.char_indices() {
        if units >= position.character {
            return start + idx;
        }
        units += u32::try_from(ch.len_utf16()).unwrap_or(2);
    }
    start + line.len()
}

fn line_starts(text: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(text.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Apply `edits` (all relative to the original `text`) and return the result.
pub fn apply_text_edits(text: &str, edits: &[TextEdit]) -> Result<String, EditError> {
    let starts = line_starts(text);
    let mut resolved: Vec<(usize, usize, &TextEdit)> = Vec::with_capacity(edits.len());
    for edit in edits {
        if edit.range.end < edit.range.start {
            return Err(EditError::InvertedRange {
                start: edit.range.start,
            });
        }
        let from = offset_of(text, &starts, edit.range.start);
        let to = offset_of(text, &starts, edit.range.end);
        resolved.push((from, to, edit));
    }
    // Stable: inserts at the same point keep their original order.
    resolved.sort_by_key(|(from, to, _)| (*from, *to));

    for pair in resolved.windows(2) {
        let (_, prev_end, _) = pair[0];
        let (next_start, _, next) = pair[1];
        if prev_end > next_start {
            return Err(EditError::Overlapping {
                at: next.range.start,
            });
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (from, to, edit) in resolved {
        out.push_str(&text[cursor..from]);
        out.push_str(&edit.new_text);
        cursor = to;
    }
    out.push_str(&text[cursor..]);
    Ok(out)
}
