use std::fmt;
use std::io::Write;

use serde_json::Value;

const RESET: &str = "\x1b[0m";

/// Arrays longer than this are cut before printing.
pub const MAX_ARRAY_ITEMS: usize = 100;

/// One of the five console tones. The same letter means a different
/// color depending on the layer: `B` is a blue background but black text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    W,
    G,
    R,
    B,
    Y,
}

impl Tone {
    pub fn from_letter(c: char) -> Option<Tone> {
        match c.to_ascii_uppercase() {
            'W' => Some(Tone::W),
            'G' => Some(Tone::G),
            'R' => Some(Tone::R),
            'B' => Some(Tone::B),
            'Y' => Some(Tone::Y),
            _ => None,
        }
    }

    fn background(self) -> &'static str {
        match self {
            Tone::W => "\x1b[47m",
            Tone::G => "\x1b[42m",
            Tone::R => "\x1b[41m",
            Tone::B => "\x1b[44m",
            Tone::Y => "\x1b[43m",
        }
    }

    fn text(self) -> &'static str {
        match self {
            Tone::W => "\x1b[37m",
            Tone::G => "\x1b[32m",
            Tone::R => "\x1b[31m",
            Tone::B => "\x1b[30m",
            Tone::Y => "\x1b[33m",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Tone::W => 'W',
            Tone::G => 'G',
            Tone::R => 'R',
            Tone::B => 'B',
            Tone::Y => 'Y',
        };
        write!(f, "{c}")
    }
}

/// Every valid (background, text) pair, named by its two letters.
pub const COMBINATIONS: [(Tone, Tone); 19] = [
    (Tone::W, Tone::B),
    (Tone::W, Tone::G),
    (Tone::W, Tone::R),
    (Tone::W, Tone::Y),
    (Tone::G, Tone::B),
    (Tone::G, Tone::W),
    (Tone::G, Tone::R),
    (Tone::G, Tone::Y),
    (Tone::R, Tone::B),
    (Tone::R, Tone::W),
    (Tone::R, Tone::G),
    (Tone::R, Tone::Y),
    (Tone::B, Tone::W),
    (Tone::B, Tone::G),
    (Tone::B, Tone::Y),
    (Tone::Y, Tone::B),
    (Tone::Y, Tone::W),
    (Tone::Y, Tone::G),
    (Tone::Y, Tone::R),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCombination(pub Tone);

impl fmt::Display for InvalidCombination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid color combination: background and text cannot be the same color ({})",
            self.0
        )
    }
}

impl std::error::Error for InvalidCombination {}

/// Colored console writer. Stateless; every call renders and writes a
/// single line to stdout.
pub struct ColorLog;

impl ColorLog {
    /// Renders `parts` into one colored line (trailing newline included).
    pub fn render(bg: Tone, fg: Tone, parts: &[Value]) -> Result<String, InvalidCombination> {
        if bg == fg {
            return Err(InvalidCombination(bg));
        }
        let prefix = format!("{}{}", bg.background(), fg.text());
        let mut out = String::new();
        for part in parts {
            out.push_str(&prefix);
            out.push_str(&format_part(part));
            out.push_str(RESET);
        }
        out.push('\n');
        Ok(out)
    }

    /// Writes a line. Invalid combinations go to stderr and print nothing else.
    pub fn print(bg: Tone, fg: Tone, parts: &[Value]) {
        match Self::render(bg, fg, parts) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(line.as_bytes());
                let _ = stdout.flush();
            }
            Err(e) => eprintln!("{e}"),
        }
    }

    pub fn text(bg: Tone, fg: Tone, text: impl Into<String>) {
        Self::print(bg, fg, &[Value::String(text.into())]);
    }

    pub fn success(text: impl Into<String>) {
        Self::text(Tone::G, Tone::W, text);
    }

    pub fn info(text: impl Into<String>) {
        Self::text(Tone::B, Tone::W, text);
    }

    pub fn warn(text: impl Into<String>) {
        Self::text(Tone::Y, Tone::B, text);
    }

    pub fn error(text: impl Into<String>) {
        Self::text(Tone::R, Tone::W, text);
    }
}

fn format_part(part: &Value) -> String {
    match part {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let shown: Vec<String> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| match item {
                    Value::Object(_) | Value::Array(_) => pretty(item),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            format!("[{}]", shown.join(", "))
        }
        Value::Object(_) => pretty(part),
        other => other.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
