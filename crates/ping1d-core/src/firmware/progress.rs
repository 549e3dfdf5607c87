//! Flasher output parsing

use regex::Regex;
use std::sync::OnceLock;

fn percent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)\s*%|^\s*(\d+(?:\.\d+)?)\s*$").expect("valid progress regex")
    })
}

/// Extract a 0-100 progress value from one line of flasher output.
///
/// Understands stm32flash's `Wrote address 0x08000100 (2.34%) Done.` lines
/// as well as lines holding only a number.
pub fn parse_progress(line: &str) -> Option<f32> {
    let caps = percent_pattern().captures(line)?;
    let value = caps.get(1).or_else(|| caps.get(2))?;
    value
        .as_str()
        .parse::<f32>()
        .ok()
        .map(|p| p.clamp(0.0, 100.0))
}
