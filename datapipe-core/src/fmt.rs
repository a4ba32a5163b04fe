use std::collections::BTreeMap;

use thiserror::Error;

use crate::argval::ArgValue;

/// Errors from the `{field:spec}` mini-formatter.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unknown field '{0}' in template")]
    UnknownField(String),
    #[error("positional field {0} out of range")]
    PositionalOutOfRange(usize),
    #[error("unsupported format spec '{0}'")]
    BadSpec(String),
    #[error("field '{field}' is not formattable with '{spec}'")]
    TypeMismatch { field: String, spec: String },
    #[error("unbalanced braces in template")]
    UnbalancedBrace,
}

/// Render a template with `{}` positional and `{name}` named fields,
/// supporting the spec subset used by argv templates and catalog paths:
/// `{x}`, `{x:d}`, `{x:0Nd}`, `{x:.Nf}`. `{{` and `}}` escape literal
/// braces.
pub fn render_template(
    template: &str,
    args: &[ArgValue],
    kwargs: &BTreeMap<String, ArgValue>,
) -> Result<String, FormatError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_positional = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut field = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    field.push(inner);
                }
                if !closed {
                    return Err(FormatError::UnbalancedBrace);
                }
                let (name, spec) = match field.split_once(':') {
                    Some((name, spec)) => (name, spec),
                    None => (field.as_str(), ""),
                };
                let value = if name.is_empty() {
                    let value = args
                        .get(next_positional)
                        .ok_or(FormatError::PositionalOutOfRange(next_positional))?;
                    next_positional += 1;
                    value
                } else {
                    kwargs
                        .get(name)
                        .ok_or_else(|| FormatError::UnknownField(name.to_string()))?
                };
                out.push_str(&format_value(value, spec, name)?);
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(FormatError::UnbalancedBrace);
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Format a single value under a spec from the supported subset.
pub fn format_value(value: &ArgValue, spec: &str, field: &str) -> Result<String, FormatError> {
    if spec.is_empty() {
        return Ok(display_value(value));
    }

    // {x:.Nf} — fixed-precision float
    if let Some(rest) = spec.strip_prefix('.') {
        if let Some(digits) = rest.strip_suffix('f') {
            let precision: usize = digits
                .parse()
                .map_err(|_| FormatError::BadSpec(spec.to_string()))?;
            let v = value.as_float().ok_or_else(|| FormatError::TypeMismatch {
                field: field.to_string(),
                spec: spec.to_string(),
            })?;
            return Ok(format!("{v:.precision$}"));
        }
    }

    // {x:d} / {x:0Nd} — integers, optionally zero-padded
    if let Some(head) = spec.strip_suffix('d') {
        let v = value.as_int().ok_or_else(|| FormatError::TypeMismatch {
            field: field.to_string(),
            spec: spec.to_string(),
        })?;
        if head.is_empty() {
            return Ok(v.to_string());
        }
        if let Some(width_digits) = head.strip_prefix('0') {
            let width: usize = width_digits
                .parse()
                .map_err(|_| FormatError::BadSpec(spec.to_string()))?;
            return Ok(format!("{v:0width$}"));
        }
    }

    Err(FormatError::BadSpec(spec.to_string()))
}

fn display_value(value: &ArgValue) -> String {
    match value {
        ArgValue::Null => String::new(),
        ArgValue::Bool(v) => v.to_string(),
        ArgValue::Int(v) => v.to_string(),
        ArgValue::Float(v) => v.to_string(),
        ArgValue::Str(v) => v.clone(),
        // containers render as canonical JSON
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwargs(pairs: &[(&str, ArgValue)]) -> BTreeMap<String, ArgValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn named_float_precision() {
        let kw = kwargs(&[("pi", ArgValue::Float(3.14212))]);
        assert_eq!(
            render_template("pi ~ {pi:.4f}", &[], &kw).unwrap(),
            "pi ~ 3.1421"
        );
    }

    #[test]
    fn positional_fields_consume_in_order() {
        let args = vec![ArgValue::Str("a".into()), ArgValue::Int(2)];
        assert_eq!(
            render_template("{}-{}", &args, &BTreeMap::new()).unwrap(),
            "a-2"
        );
    }

    #[test]
    fn zero_padded_int() {
        let kw = kwargs(&[("i", ArgValue::Int(7))]);
        assert_eq!(render_template("file_{i:03d}.txt", &[], &kw).unwrap(), "file_007.txt");
    }

    #[test]
    fn escaped_braces() {
        assert_eq!(
            render_template("{{literal}}", &[], &BTreeMap::new()).unwrap(),
            "{literal}"
        );
    }

    #[test]
    fn unknown_field_errors() {
        let err = render_template("{missing}", &[], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, FormatError::UnknownField(_)));
    }

    #[test]
    fn bad_spec_errors() {
        let kw = kwargs(&[("x", ArgValue::Int(1))]);
        assert!(render_template("{x:^9}", &[], &kw).is_err());
    }
}
