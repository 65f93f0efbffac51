//! Budget-bound text condensing.
//!
//! Budgets are in approximate tokens, four characters each. Output never
//! exceeds `budget * 4` characters.

/// Characters per approximate token.
pub const CHARS_PER_TOKEN: usize = 4;

const MIDDLE_MARKER: &str = "\n\n[... content condensed ...]\n\n";
const SECTIONS_MARKER: &str = "\n[... earlier sections omitted ...]\n";
const SECTION_PREFIX: &str = "## ";

/// Approximate token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Fit `text` into `budget` tokens.
///
/// Text with `## ` sections keeps the first section and as many of the most
/// recent sections as fit. Otherwise the head and tail are kept around a
/// marker.
pub fn summarize(text: &str, budget: usize) -> String {
    let max_chars = budget.saturating_mul(CHARS_PER_TOKEN);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    sectioned(text, max_chars).unwrap_or_else(|| head_and_tail(text, max_chars))
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn head_and_tail(text: &str, max_chars: usize) -> String {
    let marker_len = char_len(MIDDLE_MARKER);
    if max_chars <= marker_len {
        return text.chars().take(max_chars).collect();
    }
    let room = max_chars - marker_len;
    let head_len = room / 2;
    let tail_len = room - head_len;
    let total = char_len(text);

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    format!("{head}{MIDDLE_MARKER}{tail}")
}

/// Split at lines starting with `## `. Text before the first heading is its
/// own section.
fn split_sections(text: &str) -> Vec<&str> {
    let mut starts: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(SECTION_PREFIX) {
            starts.push(offset);
        }
        offset += line.len();
    }
    if starts.is_empty() {
        return Vec::new();
    }
    if starts[0] != 0 {
        starts.insert(0, 0);
    }
    let mut sections = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        sections.push(&text[start..end]);
    }
    sections
}

fn sectioned(text: &str, max_chars: usize) -> Option<String> {
    let sections = split_sections(text);
    let (first, rest) = sections.split_first()?;

    let mut used = char_len(first) + char_len(SECTIONS_MARKER);
    if used > max_chars {
        return None;
    }

    let mut recent: Vec<&str> = Vec::new();
    for section in rest.iter().rev() {
        let len = char_len(section);
        if used + len > max_chars {
            break;
        }
        used += len;
        recent.push(section);
    }
    recent.reverse();

    let mut out = String::with_capacity(used);
    out.push_str(first);
    for section in recent {
        out.push_str(section);
    }
    out.push_str(SECTIONS_MARKER);
    Some(out)
}
