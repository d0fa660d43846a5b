use std::collections::BTreeMap;

use serde_json::Value;

/// Renders engine overrides as CLI flags: `true` becomes a bare `--flag`,
/// other values become `--flag value`. Underscores turn into hyphens.
pub fn to_flags(overrides: &BTreeMap<String, Value>) -> Vec<String> {
    let mut args = Vec::with_capacity(overrides.len() * 2);
    for (key, value) in overrides {
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Bool(true) => args.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => {
                args.push(flag);
                args.push(s.clone());
            }
            other => {
                args.push(flag);
                args.push(other.to_string());
            }
        }
    }
    args
}

/// Inverse of [`to_flags`]: parses trailing `--flag [value]` arguments back into a map.
pub fn parse_flags(args: &[String]) -> Result<BTreeMap<String, Value>, String> {
    let mut overrides = BTreeMap::new();
    let mut iter = args.iter().peekable();

    while let Some(arg) = iter.next() {
        let name = arg
            .strip_prefix("--")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| format!("Invalid override '{}'. Expected --flag [value]", arg))?;

        let (key, inline) = match name.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (name, None),
        };
        let key = key.replace('-', "_");

        let value = match inline {
            Some(v) => parse_scalar(&v),
            None => {
                let takes_value = iter.peek().is_some_and(|next| !is_flag(next));
                match iter.next_if(|_| takes_value) {
                    Some(raw) => parse_scalar(raw),
                    None => Value::Bool(true),
                }
            }
        };
        overrides.insert(key, value);
    }

    Ok(overrides)
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with("--") && arg.len() > 2
}

fn parse_scalar(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    if let Ok(structured @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str::<Value>(raw) {
        return structured;
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn booleans_become_bare_flags() {
        let overrides = BTreeMap::from([
            ("flash_attn".to_string(), json!(true)),
            ("n_gpu_layers".to_string(), json!(99)),
            ("device".to_string(), json!("CUDA1")),
            ("mlock".to_string(), json!(false)),
        ]);
        assert_eq!(
            to_flags(&overrides),
            args(&["--device", "CUDA1", "--flash-attn", "--n-gpu-layers", "99"])
        );
    }

    #[test]
    fn flags_parse_back_into_typed_values() {
        let parsed = parse_flags(&args(&[
            "--flash-attn",
            "--n-gpu-layers",
            "99",
            "--temp",
            "0.25",
            "--device",
            "CUDA1",
            "--seed=7",
            "--no-mmap",
        ]))
        .expect("parse flags");
        assert_eq!(parsed.get("flash_attn"), Some(&json!(true)));
        assert_eq!(parsed.get("n_gpu_layers"), Some(&json!(99)));
        assert_eq!(parsed.get("temp"), Some(&json!(0.25)));
        assert_eq!(parsed.get("device"), Some(&json!("CUDA1")));
        assert_eq!(parsed.get("seed"), Some(&json!(7)));
        assert_eq!(parsed.get("no_mmap"), Some(&json!(true)));
    }

    #[test]
    fn negative_numbers_are_values_not_flags() {
        let parsed = parse_flags(&args(&["--seed", "-1"])).expect("parse flags");
        assert_eq!(parsed.get("seed"), Some(&json!(-1)));
    }

    #[test]
    fn positional_garbage_is_rejected() {
        assert!(parse_flags(&args(&["oops"])).is_err());
        assert!(parse_flags(&args(&["--"])).is_err());
    }
}
