// ============================================================================
// Client-side parameter interpolation
// ============================================================================
//
// Replaces `$n` and `?` placeholders outside quoted text with SQL literals,
// for drivers that only speak the simple query protocol.
//
// ============================================================================

use crate::core::{DbError, Result, Value};

/// Render `value` as a SQL literal.
///
/// Negative numbers are parenthesized so that `1-$1` never becomes a `--`
/// comment.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) if *i < 0 => format!("({})", i),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if f.is_nan() => "'NaN'::float8".to_string(),
        Value::Float(f) if f.is_infinite() => {
            if *f > 0.0 {
                "'Infinity'::float8".to_string()
            } else {
                "'-Infinity'::float8".to_string()
            }
        }
        Value::Float(f) if f.is_sign_negative() => format!("({:?})", f),
        Value::Float(f) => format!("{:?}", f),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

/// Substitute positional parameters into `sql`.
pub fn interpolate(sql: &str, params: &[Value]) -> Result<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    let mut next_positional = 0usize;

    while let Some((_, c)) = chars.next() {
        if let Some(open) = quote {
            out.push(c);
            if c == open {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '?' => {
                out.push_str(&literal(param(params, next_positional, "?")?));
                next_positional += 1;
            }
            '$' if chars.peek().is_some_and(|(_, d)| d.is_ascii_digit()) => {
                let mut digits = String::new();
                while let Some((_, d)) = chars.peek().copied() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let index = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .ok_or_else(|| DbError::ParseError(format!("Invalid placeholder: ${}", digits)))?;
                out.push_str(&literal(param(params, index, &format!("${}", digits))?));
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn param<'a>(params: &'a [Value], index: usize, token: &str) -> Result<&'a Value> {
    params.get(index).ok_or_else(|| {
        DbError::ExecutionError(format!("No value bound for parameter {}", token))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals() {
        assert_eq!(literal(&Value::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(literal(&Value::Float(1.0)), "1.0");
        assert_eq!(literal(&Value::Float(f64::NAN)), "'NaN'::float8");
        assert_eq!(literal(&Value::Boolean(false)), "FALSE");
        assert_eq!(literal(&Value::Null), "NULL");
    }

    #[test]
    fn test_dollar_and_question_placeholders() {
        let params = vec![Value::Integer(7), Value::Text("Test".into())];
        assert_eq!(
            interpolate("SELECT * FROM t WHERE id = $1 AND name = $2", &params).unwrap(),
            "SELECT * FROM t WHERE id = 7 AND name = 'Test'"
        );
        assert_eq!(
            interpolate("INSERT INTO t VALUES (?, ?)", &params).unwrap(),
            "INSERT INTO t VALUES (7, 'Test')"
        );
    }

    #[test]
    fn test_placeholders_inside_quotes_are_kept() {
        let params = vec![Value::Integer(1)];
        assert_eq!(
            interpolate("SELECT '$1 ?', \"a?\" FROM t WHERE id = $1", &params).unwrap(),
            "SELECT '$1 ?', \"a?\" FROM t WHERE id = 1"
        );
    }

    #[test]
    fn test_negative_numbers_cannot_open_a_comment() {
        assert_eq!(
            interpolate("SELECT 1-$1", &[Value::Integer(-5)]).unwrap(),
            "SELECT 1-(-5)"
        );
        assert_eq!(
            interpolate("SELECT 2-?", &[Value::Float(-1.5)]).unwrap(),
            "SELECT 2-(-1.5)"
        );
        assert_eq!(literal(&Value::Float(-0.0)), "(-0.0)");
        assert_eq!(literal(&Value::Integer(i64::MIN)), format!("({})", i64::MIN));
        assert_eq!(literal(&Value::Integer(5)), "5");
    }

    #[test]
    fn test_missing_parameter() {
        assert!(interpolate("SELECT $2", &[Value::Integer(1)]).is_err());
    }
}
