/// Formula evaluation over sheets, exposed to scripts as `xlsx_calc`.
///
/// A cell whose text starts with `=` is a formula. Supported: numbers,
/// A1 references, `+ - * / ^`, parentheses, unary minus and the functions
/// SUM, AVERAGE, MIN, MAX, COUNT, ABS and ROUND. Ranges (`A1:B3`) are only
/// valid as function arguments.
///
/// Evaluation runs on the host, outside the Lua instruction budget, so
/// nesting depth and range size are bounded here.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use super::spreadsheet::{parse_cell_ref, Row};
use super::{CapabilityHandle, CapabilityName, CapabilityProvider};

/// Nested expressions, including formulas reached through cell references.
const MAX_DEPTH: usize = 256;

/// Cells a single range may span.
const MAX_RANGE_CELLS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
    Colon,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(
                    text.parse().map_err(|_| anyhow!("bad number {text:?}"))?,
                ));
            }
            'A'..='Z' | 'a'..='z' | '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' | ';' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            other => bail!("unexpected character {other:?} in formula"),
        }
    }
    Ok(tokens)
}

/// One argument of a function call: a scalar or the cells of a range.
enum Arg {
    Scalar(f64),
    Range(Vec<Option<f64>>),
}

struct Evaluator<'a> {
    rows: &'a [Row],
    cache: HashMap<(usize, usize), f64>,
    visiting: HashSet<(usize, usize)>,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    fn new(rows: &'a [Row]) -> Self {
        Self {
            rows,
            cache: HashMap::new(),
            visiting: HashSet::new(),
            depth: 0,
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            bail!("#VALUE! formula nested deeper than {MAX_DEPTH} levels");
        }
        self.depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn formula(&mut self, src: &str) -> Result<f64> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let value = parser.expr(self)?;
        if parser.pos != parser.tokens.len() {
            bail!("unexpected trailing input in formula {src:?}");
        }
        Ok(value)
    }

    /// Numeric value of a cell for arithmetic; empty counts as zero.
    fn cell(&mut self, pos: (usize, usize)) -> Result<f64> {
        match self.cell_numeric(pos)? {
            Some(v) => Ok(v),
            None => match self.raw(pos) {
                Value::Null => Ok(0.0),
                other => bail!("#VALUE! {} is not a number ({other})", cell_name(pos)),
            },
        }
    }

    /// Numeric value, or `None` for empty and text cells.
    fn cell_numeric(&mut self, pos: (usize, usize)) -> Result<Option<f64>> {
        if let Some(v) = self.cache.get(&pos) {
            return Ok(Some(*v));
        }
        let value = match self.raw(pos) {
            Value::String(s) if s.starts_with('=') => {
                if !self.visiting.insert(pos) {
                    bail!("circular reference at {}", cell_name(pos));
                }
                let result = self.formula(&s[1..]);
                self.visiting.remove(&pos);
                let v = result?;
                self.cache.insert(pos, v);
                Some(v)
            }
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
            _ => None,
        };
        Ok(value)
    }

    fn raw(&self, (row, col): (usize, usize)) -> Value {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Cells outside the grid are empty, so only the overlap is visited.
    fn range(&mut self, from: (usize, usize), to: (usize, usize)) -> Result<Vec<Option<f64>>> {
        let (r0, r1) = (from.0.min(to.0), from.0.max(to.0));
        let (c0, c1) = (from.1.min(to.1), from.1.max(to.1));
        let span = (r1 - r0 + 1).saturating_mul(c1 - c0 + 1);
        if span > MAX_RANGE_CELLS {
            bail!(
                "#REF! range {}:{} spans {span} cells (limit {MAX_RANGE_CELLS})",
                cell_name(from),
                cell_name(to)
            );
        }
        let mut out = Vec::new();
        let last_row = r1.min(self.rows.len().saturating_sub(1));
        for r in r0..=last_row {
            let width = self.rows.get(r).map_or(0, Vec::len);
            if width == 0 || c0 >= width {
                continue;
            }
            for c in c0..=c1.min(width - 1) {
                out.push(self.cell_numeric((r, c))?);
            }
        }
        Ok(out)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            other => bail!("expected {token:?}, found {other:?}"),
        }
    }

    fn expr(&mut self, ev: &mut Evaluator) -> Result<f64> {
        ev.enter()?;
        let value = self.sum(ev);
        ev.leave();
        value
    }

    fn sum(&mut self, ev: &mut Evaluator) -> Result<f64> {
        let mut value = self.term(ev)?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term(ev)?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self, ev: &mut Evaluator) -> Result<f64> {
        let mut value = self.power(ev)?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.power(ev)?;
            value = if op == '*' {
                value * rhs
            } else {
                if rhs == 0.0 {
                    bail!("#DIV/0!");
                }
                value / rhs
            };
        }
        Ok(value)
    }

    fn power(&mut self, ev: &mut Evaluator) -> Result<f64> {
        let base = self.unary(ev)?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            ev.enter()?;
            let exp = self.power(ev);
            ev.leave();
            return Ok(base.powf(exp?));
        }
        Ok(base)
    }

    fn unary(&mut self, ev: &mut Evaluator) -> Result<f64> {
        let sign = match self.peek() {
            Some(Token::Op('-')) => -1.0,
            Some(Token::Op('+')) => 1.0,
            _ => return self.primary(ev),
        };
        self.pos += 1;
        ev.enter()?;
        let value = self.unary(ev);
        ev.leave();
        Ok(sign * value?)
    }

    fn primary(&mut self, ev: &mut Evaluator) -> Result<f64> {
        match self.next() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr(ev)?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.arguments(ev)?;
                    call(&name, args)
                } else {
                    let pos = parse_cell_ref(&name)
                        .ok_or_else(|| anyhow!("#NAME? unknown identifier {name}"))?;
                    ev.cell(pos)
                }
            }
            other => bail!("unexpected token {other:?}"),
        }
    }

    fn arguments(&mut self, ev: &mut Evaluator) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.argument(ev)?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                other => bail!("expected , or ) in argument list, found {other:?}"),
            }
        }
    }

    fn argument(&mut self, ev: &mut Evaluator) -> Result<Arg> {
        if let (Some(Token::Ident(a)), Some(Token::Colon), Some(Token::Ident(b))) = (
            self.tokens.get(self.pos).cloned(),
            self.tokens.get(self.pos + 1).cloned(),
            self.tokens.get(self.pos + 2).cloned(),
        ) {
            let from = parse_cell_ref(&a).ok_or_else(|| anyhow!("bad range start {a}"))?;
            let to = parse_cell_ref(&b).ok_or_else(|| anyhow!("bad range end {b}"))?;
            self.pos += 3;
            return Ok(Arg::Range(ev.range(from, to)?));
        }
        Ok(Arg::Scalar(self.expr(ev)?))
    }
}

fn call(name: &str, args: Vec<Arg>) -> Result<f64> {
    let upper = name.to_ascii_uppercase();
    let numbers = || -> Vec<f64> {
        args.iter()
            .flat_map(|a| match a {
                Arg::Scalar(v) => vec![*v],
                Arg::Range(cells) => cells.iter().flatten().copied().collect(),
            })
            .collect()
    };
    match upper.as_str() {
        "SUM" => Ok(numbers().iter().sum()),
        "AVERAGE" => {
            let n = numbers();
            if n.is_empty() {
                bail!("#DIV/0! AVERAGE of no numbers");
            }
            Ok(n.iter().sum::<f64>() / n.len() as f64)
        }
        "MIN" => Ok(numbers().into_iter().reduce(f64::min).unwrap_or(0.0)),
        "MAX" => Ok(numbers().into_iter().reduce(f64::max).unwrap_or(0.0)),
        "COUNT" => Ok(numbers().len() as f64),
        "ABS" => match args.as_slice() {
            [Arg::Scalar(v)] => Ok(v.abs()),
            _ => bail!("ABS takes one number"),
        },
        "ROUND" => match args.as_slice() {
            [Arg::Scalar(v)] => Ok(v.round()),
            [Arg::Scalar(v), Arg::Scalar(digits)] => {
                let factor = 10f64.powi(*digits as i32);
                Ok((v * factor).round() / factor)
            }
            _ => bail!("ROUND takes a number and optional digits"),
        },
        _ => bail!("#NAME? unknown function {name}"),
    }
}

fn cell_name((row, col): (usize, usize)) -> String {
    let mut letters = String::new();
    let mut n = col + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.insert(0, (b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    format!("{letters}{}", row + 1)
}

fn to_json(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[derive(Default)]
pub struct FormulaEngine;

impl FormulaEngine {
    pub fn new() -> Self {
        Self
    }

    /// Returns a copy of `rows` with every formula cell replaced by its value.
    pub fn recalculate(&self, rows: &[Row]) -> Result<Vec<Row>> {
        let mut ev = Evaluator::new(rows);
        let mut out = rows.to_vec();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if matches!(value, Value::String(s) if s.starts_with('=')) {
                    let v = ev
                        .cell_numeric((r, c))
                        .map_err(|e| anyhow!("{}: {e}", cell_name((r, c))))?
                        .unwrap_or(0.0);
                    out[r][c] = to_json(v);
                }
            }
        }
        Ok(out)
    }

    /// Evaluates a standalone formula (leading `=` optional) against `rows`.
    pub fn evaluate(&self, rows: &[Row], formula: &str) -> Result<Value> {
        let src = formula.strip_prefix('=').unwrap_or(formula);
        let v = Evaluator::new(rows).formula(src)?;
        Ok(to_json(v))
    }
}

pub struct FormulaProvider;

impl CapabilityProvider for FormulaProvider {
    fn name(&self) -> CapabilityName {
        CapabilityName::Formula
    }

    fn acquire(&self) -> Result<CapabilityHandle> {
        Ok(CapabilityHandle::Formula(Arc::new(FormulaEngine::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid() -> Vec<Row> {
        vec![
            vec![json!("item"), json!("qty"), json!("price"), json!("total")],
            vec![json!("a"), json!(2), json!(10), json!("=B2*C2")],
            vec![json!("b"), json!(3), json!(2.5), json!("=B3*C3")],
            vec![json!("sum"), json!("=SUM(B2:B3)"), Value::Null, json!("=SUM(D2:D3)")],
        ]
    }

    #[test]
    fn test_recalculate_nested_references() {
        let out = FormulaEngine::new().recalculate(&grid()).unwrap();
        assert_eq!(out[1][3], json!(20));
        assert_eq!(out[2][3], json!(7.5));
        assert_eq!(out[3][1], json!(5));
        assert_eq!(out[3][3], json!(27.5));
        // Non-formula cells are untouched
        assert_eq!(out[0][0], json!("item"));
    }

    #[test]
    fn test_functions_skip_text_in_ranges() {
        let engine = FormulaEngine::new();
        let rows = grid();
        assert_eq!(engine.evaluate(&rows, "=COUNT(A1:C3)").unwrap(), json!(4));
        assert_eq!(engine.evaluate(&rows, "=AVERAGE(B2:B3)").unwrap(), json!(2.5));
        assert_eq!(engine.evaluate(&rows, "=MAX(C2:C3, 99)").unwrap(), json!(99));
        assert_eq!(engine.evaluate(&rows, "=MIN(C2:C3)").unwrap(), json!(2.5));
        assert_eq!(engine.evaluate(&rows, "ROUND(10/3, 2)").unwrap(), json!(3.33));
    }

    #[test]
    fn test_operator_precedence() {
        let engine = FormulaEngine::new();
        assert_eq!(engine.evaluate(&[], "=1+2*3").unwrap(), json!(7));
        assert_eq!(engine.evaluate(&[], "=(1+2)*3").unwrap(), json!(9));
        assert_eq!(engine.evaluate(&[], "=-2^2").unwrap(), json!(4));
        assert_eq!(engine.evaluate(&[], "=2^3^2").unwrap(), json!(512));
        assert_eq!(engine.evaluate(&[], "=10-4-3").unwrap(), json!(3));
    }

    #[test]
    fn test_errors() {
        let engine = FormulaEngine::new();
        assert!(engine.evaluate(&[], "=1/0").unwrap_err().to_string().contains("#DIV/0!"));
        assert!(engine.evaluate(&[], "=FOO(1)").unwrap_err().to_string().contains("#NAME?"));
        assert!(engine.evaluate(&grid(), "=A2+1").unwrap_err().to_string().contains("#VALUE!"));
        assert!(engine.evaluate(&[], "=1+").is_err());
        assert!(engine.evaluate(&[], "=1 2").is_err());
    }

    #[test]
    fn test_circular_reference_is_reported() {
        let rows = vec![vec![json!("=B1+1"), json!("=A1*2")]];
        let err = FormulaEngine::new().recalculate(&rows).unwrap_err();
        assert!(err.to_string().contains("circular reference"));
    }

    #[test]
    fn test_empty_cells_count_as_zero() {
        let rows = vec![vec![Value::Null, json!("=A1+5")]];
        let out = FormulaEngine::new().recalculate(&rows).unwrap();
        assert_eq!(out[0][1], json!(5));
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let engine = FormulaEngine::new();
        let nested = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = engine.evaluate(&[], &nested).unwrap_err();
        assert!(err.to_string().contains("#VALUE!"));
        assert!(engine.evaluate(&[], &format!("{}1", "-".repeat(100_000))).is_err());
        assert!(engine.evaluate(&[], &format!("{}2", "2^".repeat(100_000))).is_err());

        let shallow = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(engine.evaluate(&[], &shallow).unwrap(), json!(1));
    }

    #[test]
    fn test_long_reference_chain_is_an_error() {
        // A1 = B1 + 1, B1 = C1 + 1, ... the last cell holds 0
        let width = 5_000;
        let mut row: Row = (1..width)
            .map(|c| json!(format!("={}+1", cell_name((0, c)))))
            .collect();
        row.push(json!(0));
        let err = FormulaEngine::new().recalculate(&[row]).unwrap_err();
        assert!(err.to_string().contains("nested deeper"));

        let short = vec![vec![json!("=B1+1"), json!("=C1+1"), json!(0)]];
        assert_eq!(FormulaEngine::new().recalculate(&short).unwrap()[0][0], json!(2));
    }

    #[test]
    fn test_ranges_are_clamped_to_the_grid() {
        let engine = FormulaEngine::new();
        let rows = grid();
        assert_eq!(engine.evaluate(&rows, "=SUM(B2:B500)").unwrap(), json!(5));
        assert_eq!(engine.evaluate(&rows, "=COUNT(A1:Z900)").unwrap(), json!(8));
        assert_eq!(engine.evaluate(&rows, "=COUNT(E1:F2)").unwrap(), json!(0));
        assert_eq!(engine.evaluate(&[], "=SUM(A1:C3)").unwrap(), json!(0));
    }

    #[test]
    fn test_oversized_range_is_rejected() {
        let err = FormulaEngine::new()
            .evaluate(&[vec![json!(1)]], "COUNT(A1:ZZ20000)")
            .unwrap_err();
        assert!(err.to_string().contains("#REF!"));
    }

    #[test]
    fn test_cell_name() {
        assert_eq!(cell_name((0, 0)), "A1");
        assert_eq!(cell_name((9, 26)), "AA10");
    }
}
