/// Source preparation before a script is compiled.
///
/// Entry points declared with parameters (`function main(sql, argv)`) are
/// rewritten to take none and pull each name from the read-only
/// `__context` table instead. Local entry points become realm globals so
/// the runner can find them. A prologue turns every binding into a
/// chunk-level local; it shares line 1 with the script so error line
/// numbers stay accurate. Text inside strings and comments is never
/// rewritten.
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Name of the read-only binding table inside the realm.
pub const CONTEXT_TABLE: &str = "__context";

static FUNCTION_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)(?:local[ \t]+)?function[ \t]+main[ \t]*\(([^)]*)\)")
        .unwrap_or_else(|e| unreachable!("entry point pattern: {e}"))
});

static ASSIGNED_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([ \t]*)(?:local[ \t]+)?main[ \t]*=[ \t]*function[ \t]*\(([^)]*)\)")
        .unwrap_or_else(|e| unreachable!("entry point pattern: {e}"))
});

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSource {
    pub source: String,
    /// Parameter names the entry point declared, in order
    pub entry_params: Vec<String>,
    pub rewritten: bool,
}

pub fn prepare(source: &str, bindings: &[String]) -> PreparedSource {
    let mut params = Vec::new();
    let mut rewritten = false;

    let mut rewrite = |caps: &Captures, inert: &[Range<usize>], head: &str| -> String {
        let at = caps.get(2).map_or(0, |m| m.start());
        if inert.iter().any(|span| span.contains(&at)) {
            return caps[0].to_string();
        }
        rewritten = true;
        let names = parse_params(&caps[2]);
        let mut out = format!("{}{head}", &caps[1]);
        if !names.is_empty() {
            let values: Vec<String> = names
                .iter()
                .map(|n| format!("{CONTEXT_TABLE}.{n}"))
                .collect();
            out.push_str(&format!(" local {} = {}", names.join(", "), values.join(", ")));
        }
        // Parameter lists may span lines
        out.extend(caps[2].matches('\n'));
        if params.is_empty() {
            params = names;
        }
        out
    };

    let body = strip_shebang(source);
    let inert = inert_spans(&body);
    let body = FUNCTION_MAIN
        .replace_all(&body, |caps: &Captures| rewrite(caps, &inert, "function main()"))
        .into_owned();
    let inert = inert_spans(&body);
    let body = ASSIGNED_MAIN
        .replace_all(&body, |caps: &Captures| rewrite(caps, &inert, "main = function()"))
        .into_owned();

    PreparedSource {
        source: format!("{}{body}", prologue(bindings)),
        entry_params: params,
        rewritten,
    }
}

/// `local a, b = a, b; ` for every binding that is a valid identifier.
pub fn prologue(bindings: &[String]) -> String {
    let names: Vec<&str> = bindings
        .iter()
        .map(String::as_str)
        .filter(|n| is_identifier(n))
        .collect();
    if names.is_empty() {
        return String::new();
    }
    let list = names.join(", ");
    format!("local {list} = {list}; ")
}

/// Byte ranges covered by string literals and comments.
fn inert_spans(src: &str) -> Vec<Range<usize>> {
    let b = src.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < b.len() {
        let start = i;
        match b[i] {
            b'-' if b.get(i + 1) == Some(&b'-') => {
                i += 2;
                match long_bracket(b, i) {
                    Some(level) => i = close_long_bracket(b, i, level),
                    None => {
                        while i < b.len() && b[i] != b'\n' {
                            i += 1;
                        }
                    }
                }
            }
            b'[' => match long_bracket(b, i) {
                Some(level) => i = close_long_bracket(b, i, level),
                None => {
                    i += 1;
                    continue;
                }
            },
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < b.len() && b[i] != quote && b[i] != b'\n' {
                    i += if b[i] == b'\\' { 2 } else { 1 };
                }
                i = (i + 1).min(b.len());
            }
            _ => {
                i += 1;
                continue;
            }
        }
        spans.push(start..i);
    }
    spans
}

/// Level of a `[==[` opener at `i`.
fn long_bracket(b: &[u8], i: usize) -> Option<usize> {
    if b.get(i) != Some(&b'[') {
        return None;
    }
    let level = b[i + 1..].iter().take_while(|&&c| c == b'=').count();
    (b.get(i + 1 + level) == Some(&b'[')).then_some(level)
}

/// Index just past the `]==]` closing the bracket opened at `i`, or the end
/// of input when unterminated.
fn close_long_bracket(b: &[u8], i: usize, level: usize) -> usize {
    let mut close = vec![b']'];
    close.extend(std::iter::repeat(b'=').take(level));
    close.push(b']');
    let body = i + level + 2;
    b[body..]
        .windows(close.len())
        .position(|w| w == close.as_slice())
        .map_or(b.len(), |p| body + p + close.len())
}

fn parse_params(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty() && *p != "..." && is_identifier(p))
        .map(String::from)
        .collect()
}

fn strip_shebang(source: &str) -> String {
    match source.strip_prefix("#!") {
        // Keep the line so numbering does not shift
        Some(rest) => match rest.find('\n') {
            Some(end) => format!("--{}", &rest[end..]),
            None => String::from("--"),
        },
        None => source.to_string(),
    }
}

const KEYWORDS: [&str; 22] = [
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !KEYWORDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_entry_point_parameters_become_context_lookups() {
        let src = "function main(sql, argv)\n  return argv\nend\n";
        let prepared = prepare(src, &[]);
        assert!(prepared.rewritten);
        assert_eq!(prepared.entry_params, vec!["sql", "argv"]);
        assert_eq!(
            prepared.source,
            "function main() local sql, argv = __context.sql, __context.argv\n  return argv\nend\n"
        );
    }

    #[test]
    fn test_local_and_assigned_forms() {
        let prepared = prepare("local function main(date)\nend", &[]);
        assert!(prepared.source.starts_with("function main() local date = __context.date"));

        let prepared = prepare("  local main = function(fs, ...)\n  end", &[]);
        assert!(prepared.source.starts_with("  main = function() local fs = __context.fs"));
        assert_eq!(prepared.entry_params, vec!["fs"]);
    }

    #[test]
    fn test_parameterless_main_is_still_globalized() {
        let prepared = prepare("local function main()\n return 1\nend", &[]);
        assert_eq!(prepared.source, "function main()\n return 1\nend");
        assert!(prepared.entry_params.is_empty());
    }

    #[test]
    fn test_other_functions_untouched() {
        let src = "function mainly(x) end\nlocal function helper_main(y) end\n";
        let prepared = prepare(src, &[]);
        assert!(!prepared.rewritten);
        assert_eq!(prepared.source, src);
    }

    #[test]
    fn test_multiline_parameters_keep_line_numbers() {
        let src = "function main(argv,\n  date)\n  error('boom')\nend\n";
        let prepared = prepare(src, &[]);
        assert_eq!(prepared.entry_params, vec!["argv", "date"]);
        assert_eq!(
            prepared.source,
            "function main() local argv, date = __context.argv, __context.date\n\n  error('boom')\nend\n"
        );
        assert_eq!(prepared.source.lines().nth(2), Some("  error('boom')"));
    }

    #[test]
    fn test_strings_and_comments_are_not_rewritten() {
        let src = "local doc = [[\nfunction main(argv)\n]]\n--[==[\nmain = function(sql)\n]==]\nreturn doc\n";
        let prepared = prepare(src, &[]);
        assert!(!prepared.rewritten);
        assert_eq!(prepared.source, src);

        // An opener inside a quoted string does not start a long string
        let src = "local s = \"[[\"\nfunction main(a)\nend";
        assert!(prepare(src, &[]).rewritten);
    }

    #[test]
    fn test_inert_spans() {
        let src = "a = 'x' -- note\nb = [=[ ]] ]=] c";
        let spans: Vec<&str> = inert_spans(src).into_iter().map(|r| &src[r]).collect();
        assert_eq!(spans, vec!["'x'", "-- note", "[=[ ]] ]=]"]);
        assert_eq!(inert_spans("s = [[open"), vec![4..10]);
    }

    #[test]
    fn test_prologue_shares_first_line() {
        let prepared = prepare("return 1\n", &names(&["sql", "argv", "not-valid", "end"]));
        assert_eq!(prepared.source, "local sql, argv = sql, argv; return 1\n");
        assert_eq!(prepared.source.lines().count(), 1);
    }

    #[test]
    fn test_shebang_is_neutralized() {
        let prepared = prepare("#!/usr/bin/env runcode\nreturn 2\n", &[]);
        assert_eq!(prepared.source, "--\nreturn 2\n");
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("XLSX_CALC"));
        assert!(is_identifier("_private"));
        assert!(!is_identifier("9lives"));
        assert!(!is_identifier("while"));
        assert!(!is_identifier(""));
    }
}
