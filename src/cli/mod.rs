//! Shared CLI utilities for the strata-static binary tools.

use std::io::Read;
use std::path::Path;

use serde_json::Value;

use crate::engine::sampler::TokenId;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse comma- or whitespace-separated token ids.
pub fn parse_token_ids(text: &str) -> Result<Vec<TokenId>, String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<TokenId>()
                .map_err(|e| format!("Invalid token id '{}': {}", s, e))
        })
        .collect()
}

/// Read token ids from a literal list, a file, or stdin.
pub fn read_token_ids(
    ids: Option<&str>,
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<Vec<TokenId>, String> {
    let text = if let Some(ids) = ids {
        ids.to_string()
    } else if let Some(path) = file {
        std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read file '{}': {}", path.display(), e))?
    } else if use_stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("Failed to read stdin: {}", e))?;
        buf
    } else {
        return Err("No input provided. Use --token-ids, --file, or --stdin".to_string());
    };
    let ids = parse_token_ids(&text)?;
    if ids.is_empty() {
        return Err("Prompt contains no token ids".to_string());
    }
    Ok(ids)
}

/// Parse a `KEY=VALUE` pipeline property.
///
/// Values that parse as JSON (numbers, booleans, objects) are kept typed;
/// anything else is taken as a string.
pub fn parse_property(text: &str) -> Result<(String, Value), String> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, got '{}'", text))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Empty property name in '{}'", text));
    }
    let value = value.trim();
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_token_ids_mixed_separators() {
        assert_eq!(parse_token_ids("1, 2,3 4\n5").unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_token_ids("").unwrap(), Vec::<TokenId>::new());
    }

    #[test]
    fn test_parse_token_ids_invalid() {
        let err = parse_token_ids("1,x").unwrap_err();
        assert!(err.contains("Invalid token id 'x'"));
    }

    #[test]
    fn test_read_token_ids_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "10 20 30\n").unwrap();
        assert_eq!(read_token_ids(None, Some(&path), false).unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_read_token_ids_errors() {
        assert!(read_token_ids(None, None, false)
            .unwrap_err()
            .contains("No input provided"));
        assert!(read_token_ids(Some(" , "), None, false)
            .unwrap_err()
            .contains("no token ids"));
        assert!(read_token_ids(None, Some(Path::new("/nonexistent/ids.txt")), false)
            .unwrap_err()
            .contains("Failed to read file"));
    }

    #[test]
    fn test_parse_property_typed_values() {
        assert_eq!(
            parse_property("MAX_PROMPT_LEN=256").unwrap(),
            ("MAX_PROMPT_LEN".to_string(), json!(256))
        );
        assert_eq!(
            parse_property("GENERATE_HINT=BEST_PERF").unwrap(),
            ("GENERATE_HINT".to_string(), json!("BEST_PERF"))
        );
        assert_eq!(
            parse_property("++GENERATE_CONFIG={\"NPU_TILES\": 2}").unwrap().1,
            json!({"NPU_TILES": 2})
        );
    }

    #[test]
    fn test_parse_property_rejects_malformed() {
        assert!(parse_property("NO_EQUALS").is_err());
        assert!(parse_property("=1").is_err());
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
