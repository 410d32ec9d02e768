/// Sheet reader/writer exposed to scripts as `xlsx` (alias `excel`).
///
/// Sheets are delimited text (RFC 4180 quoting). Cells are JSON values:
/// numeric and boolean text is typed on read, empty cells are `null`.
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};

use super::{CapabilityHandle, CapabilityName, CapabilityProvider};
use crate::config::SpreadsheetConfig;

pub type Row = Vec<Value>;

pub struct Spreadsheet {
    delimiter: char,
}

impl Spreadsheet {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    pub fn parse(&self, text: &str) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut row = Vec::new();
        let mut field = String::new();
        let mut quoted = false;
        let mut field_was_quoted = false;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            if quoted {
                match c {
                    '"' if chars.peek() == Some(&'"') => {
                        field.push('"');
                        chars.next();
                    }
                    '"' => quoted = false,
                    _ => field.push(c),
                }
                continue;
            }
            match c {
                '"' if field.is_empty() => {
                    quoted = true;
                    field_was_quoted = true;
                }
                c if c == self.delimiter => {
                    row.push(cell(std::mem::take(&mut field), field_was_quoted));
                    field_was_quoted = false;
                }
                '\r' if chars.peek() == Some(&'\n') => {}
                '\n' => {
                    row.push(cell(std::mem::take(&mut field), field_was_quoted));
                    field_was_quoted = false;
                    rows.push(std::mem::take(&mut row));
                }
                _ => field.push(c),
            }
        }
        if !field.is_empty() || field_was_quoted || !row.is_empty() {
            row.push(cell(field, field_was_quoted));
            rows.push(row);
        }
        rows
    }

    pub fn render(&self, rows: &[Row]) -> String {
        let mut out = String::new();
        for row in rows {
            let line: Vec<String> = row.iter().map(|v| self.escape(v)).collect();
            out.push_str(&line.join(&self.delimiter.to_string()));
            out.push('\n');
        }
        out
    }

    fn escape(&self, value: &Value) -> String {
        let text = match value {
            Value::Null => return String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.contains(self.delimiter)
            || text.contains('"')
            || text.contains('\n')
            || text.contains('\r')
        {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<Row>> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("cannot read sheet {path}: {e}"))?;
        Ok(self.parse(&text))
    }

    pub async fn write_file(&self, path: &str, rows: &[Row]) -> Result<()> {
        tokio::fs::write(path, self.render(rows)).await?;
        Ok(())
    }
}

/// First row is the header; each following row becomes an object.
/// Columns without a header are named `__EMPTY_<n>`.
pub fn sheet_to_json(rows: &[Row]) -> Vec<Value> {
    let Some((header, body)) = rows.split_first() else {
        return Vec::new();
    };
    let keys: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Null => format!("__EMPTY_{i}"),
            other => other.to_string(),
        })
        .collect();

    body.iter()
        .filter(|row| row.iter().any(|v| !v.is_null()))
        .map(|row| {
            let mut obj = Map::new();
            for (i, value) in row.iter().enumerate() {
                if value.is_null() {
                    continue;
                }
                let key = keys.get(i).cloned().unwrap_or_else(|| format!("__EMPTY_{i}"));
                obj.insert(key, value.clone());
            }
            Value::Object(obj)
        })
        .collect()
}

/// Inverse of `sheet_to_json`. The header lists keys in order of first
/// appearance across all objects.
pub fn json_to_sheet(objects: &[Value]) -> Result<Vec<Row>> {
    let mut header: Vec<String> = Vec::new();
    for obj in objects {
        let map = obj
            .as_object()
            .ok_or_else(|| anyhow!("json_to_sheet expects an array of objects"))?;
        for key in map.keys() {
            if !header.contains(key) {
                header.push(key.clone());
            }
        }
    }

    let mut rows: Vec<Row> = vec![header.iter().map(|k| Value::String(k.clone())).collect()];
    for obj in objects {
        let row: Row = header
            .iter()
            .map(|k| match obj.get(k) {
                Some(v @ (Value::Object(_) | Value::Array(_))) => Value::String(v.to_string()),
                Some(v) => v.clone(),
                None => Value::Null,
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Converts an A1-style reference to zero-based (row, column).
pub fn parse_cell_ref(reference: &str) -> Option<(usize, usize)> {
    let reference = reference.trim().replace('$', "");
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut col = 0usize;
    for c in letters.chars() {
        col = col
            .checked_mul(26)?
            .checked_add((c.to_ascii_uppercase() as u8 - b'A') as usize + 1)?;
    }
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((row - 1, col - 1))
}

fn cell(text: String, quoted: bool) -> Value {
    if quoted {
        Value::String(text)
    } else if text.is_empty() {
        Value::Null
    } else {
        crate::args::coerce(&text)
    }
}

pub struct SpreadsheetProvider {
    config: SpreadsheetConfig,
}

impl SpreadsheetProvider {
    pub fn new(config: SpreadsheetConfig) -> Self {
        Self { config }
    }
}

impl CapabilityProvider for SpreadsheetProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Spreadsheet
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        let mut chars = self.config.delimiter.chars();
        let delimiter = match (chars.next(), chars.next()) {
            (Some(c), None) if c != '"' && c != '\n' => c,
            _ => bail!(
                "sheet delimiter must be a single character, got {:?}",
                self.config.delimiter
            ),
        };
        Ok(CapabilityHandle::Spreadsheet(Arc::new(Spreadsheet::new(
            delimiter,
        ))))
    }
}
