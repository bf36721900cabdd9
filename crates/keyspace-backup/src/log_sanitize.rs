use std::sync::LazyLock;

use regex::Regex;

const MAX_OUTPUT_CHARS: usize = 2048;

static ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    // CSI, OSC (BEL or ST terminated), then any other two-byte escape.
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b.").unwrap()
});

/// Flatten remote command output into one log-safe line: escape sequences
/// and control characters removed, lines joined with ` | `, length capped.
pub fn sanitize_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = ESCAPES.replace_all(&text, "");

    let mut out = String::with_capacity(text.len().min(MAX_OUTPUT_CHARS));
    let mut count = 0usize;
    for line in text.lines() {
        let line = line
            .chars()
            .map(|c| if c == '\t' { ' ' } else { c })
            .filter(|c| !c.is_control() && !is_bidi_control(*c))
            .collect::<String>();
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(" | ");
        }
        for c in line.chars() {
            if count >= MAX_OUTPUT_CHARS {
                out.push_str(" ...[truncated]");
                return out;
            }
            out.push(c);
            count += 1;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
