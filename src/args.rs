/// Command-line argument parsing in the yargs convention.
///
/// The output is a flat JSON object: every `--key`/`-k` becomes a key,
/// positionals are collected under `_` and the program name under `$0`.
/// Dashed keys are mirrored in camelCase (`--dry-run` also sets `dryRun`).
/// The same parser backs the orchestrator's flags and the `args` capability
/// exposed to scripts.
use std::collections::{HashMap, HashSet};

use serde_json::{Map, Number, Value};

pub type ArgMap = Map<String, Value>;

/// Reserved key holding positional arguments.
pub const POSITIONAL_KEY: &str = "_";
/// Reserved key holding the program name.
pub const PROGRAM_KEY: &str = "$0";

#[derive(Debug, Clone, Default)]
pub struct ArgParser {
    strings: HashSet<String>,
    booleans: HashSet<String>,
    aliases: HashMap<String, Vec<String>>,
}

impl ArgParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of `key` are never coerced to numbers or booleans.
    pub fn string(mut self, key: &str) -> Self {
        self.strings.insert(key.to_string());
        self
    }

    /// `key` never consumes the following token.
    pub fn boolean(mut self, key: &str) -> Self {
        self.booleans.insert(key.to_string());
        self
    }

    pub fn alias(mut self, short: &str, long: &str) -> Self {
        self.aliases
            .entry(short.to_string())
            .or_default()
            .push(long.to_string());
        self.aliases
            .entry(long.to_string())
            .or_default()
            .push(short.to_string());
        self
    }

    /// Parses `args` (program name excluded).
    pub fn parse<I, S>(&self, program: &str, args: I) -> ArgMap
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tokens: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        let mut map = ArgMap::new();
        let mut positionals = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];

            if token == "--" {
                positionals.extend(tokens[i + 1..].iter().map(|t| coerce(t)));
                break;
            }

            if let Some(body) = token.strip_prefix("--") {
                if let Some((key, raw)) = body.split_once('=') {
                    self.set(&mut map, key, self.value_for(key, raw));
                } else if let Some(negated) = body.strip_prefix("no-") {
                    self.set(&mut map, negated, Value::Bool(false));
                } else {
                    i += self.take_value(&mut map, body, tokens.get(i + 1));
                }
            } else if token.len() > 1 && token.starts_with('-') && !is_numeric(token) {
                let body = &token[1..];
                if let Some((key, raw)) = body.split_once('=') {
                    self.set(&mut map, key, self.value_for(key, raw));
                } else {
                    let letters: Vec<char> = body.chars().collect();
                    let (last, group) = letters.split_last().map_or((None, &[][..]), |(l, g)| (Some(*l), g));
                    for c in group {
                        self.set(&mut map, &c.to_string(), Value::Bool(true));
                    }
                    if let Some(c) = last {
                        i += self.take_value(&mut map, &c.to_string(), tokens.get(i + 1));
                    }
                }
            } else {
                positionals.push(coerce(token));
            }
            i += 1;
        }

        map.insert(POSITIONAL_KEY.to_string(), Value::Array(positionals));
        map.insert(PROGRAM_KEY.to_string(), Value::String(program.to_string()));
        map
    }

    /// Sets `key` from the next token when it is a value; returns how many
    /// extra tokens were consumed.
    fn take_value(&self, map: &mut ArgMap, key: &str, next: Option<&String>) -> usize {
        if self.declared(&self.booleans, key) {
            self.set(map, key, Value::Bool(true));
            return 0;
        }
        match next {
            Some(value) if !value.starts_with('-') || is_numeric(value) => {
                self.set(map, key, self.value_for(key, value));
                1
            }
            _ => {
                self.set(map, key, Value::Bool(true));
                0
            }
        }
    }

    fn value_for(&self, key: &str, raw: &str) -> Value {
        if self.declared(&self.strings, key) {
            Value::String(raw.to_string())
        } else {
            coerce(raw)
        }
    }

    fn declared(&self, set: &HashSet<String>, key: &str) -> bool {
        set.contains(key)
            || self
                .aliases
                .get(key)
                .is_some_and(|names| names.iter().any(|n| set.contains(n)))
    }

    fn set(&self, map: &mut ArgMap, key: &str, value: Value) {
        let mut keys = vec![key.to_string()];
        if let Some(aliases) = self.aliases.get(key) {
            keys.extend(aliases.iter().cloned());
        }
        if key.contains('-') {
            keys.push(camel_case(key));
        }
        for k in keys {
            match map.get_mut(&k) {
                Some(Value::Array(items)) if !matches!(value, Value::Array(_)) => {
                    items.push(value.clone())
                }
                Some(existing) => {
                    let previous = existing.take();
                    *existing = Value::Array(vec![previous, value.clone()]);
                }
                None => {
                    map.insert(k, value.clone());
                }
            }
        }
    }
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn is_numeric(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() {
        return false;
    }
    // Leading zeros stay strings ("007" is an identifier, not a number)
    if digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.") {
        return false;
    }
    digits
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '+' || c == '-')
        && digits.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '.')
        && s.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Numbers and `true`/`false` become typed JSON values; everything else
/// stays a string.
pub fn coerce(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if is_numeric(raw) {
        if let Ok(n) = raw.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
