//! Output cleanup
//!
//! Generation stops *after* a turn marker has been produced, so the raw text
//! usually ends with `\nHuman:` or similar. Markers are removed wherever they
//! occur, not only at the end, together with whatever the model wrote after
//! them on the same line.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Applied in order: User, Human, AI.
    static ref TURN_MARKERS: [Regex; 3] = [
        Regex::new(r"\nUser[^\n]*").unwrap(),
        Regex::new(r"\nHuman:[^\n]*").unwrap(),
        Regex::new(r"\nAI:[^\n]*").unwrap(),
    ];
}

/// Strip turn markers and surrounding whitespace from a generated reply
pub fn sanitize(raw: &str) -> String {
    let mut text = raw.to_string();
    for marker in TURN_MARKERS.iter() {
        text = marker.replace_all(&text, "").into_owned();
    }
    text.trim().to_string()
}
