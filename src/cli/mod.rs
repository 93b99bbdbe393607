//! Shared CLI utilities for the strata-qwen2 binaries.

pub mod backend;

use std::io::Read;
use std::path::Path;

use crate::error::InferenceError;

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

/// Parse token ids separated by commas and/or whitespace.
pub fn parse_token_ids(text: &str) -> Result<Vec<i64>, InferenceError> {
    let ids = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| InferenceError::InvalidArgument(format!("invalid token id '{}'", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(&bad) = ids.iter().find(|&&id| id < 0) {
        return Err(InferenceError::InvalidArgument(format!(
            "token ids must be non-negative, got {}",
            bad
        )));
    }
    Ok(ids)
}

/// Read input token ids from one of: inline list, file path, or stdin.
pub fn read_token_ids(
    inline: Option<&str>,
    file: Option<&Path>,
    use_stdin: bool,
) -> Result<Vec<i64>, InferenceError> {
    if let Some(text) = inline {
        return parse_token_ids(text);
    }

    if let Some(path) = file {
        let text = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::InvalidArgument(format!(
                "failed to read token file '{}': {}",
                path.display(),
                e
            ))
        })?;
        return parse_token_ids(&text);
    }

    if use_stdin {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return parse_token_ids(&buf);
    }

    Err(InferenceError::InvalidArgument(
        "no input provided. Use --token-ids, --file, or --stdin".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_ids_commas_and_spaces() {
        assert_eq!(parse_token_ids("5,7, 9").unwrap(), vec![5, 7, 9]);
        assert_eq!(parse_token_ids("1 2\n3\n").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_token_ids_empty() {
        assert!(parse_token_ids("").unwrap().is_empty());
        assert!(parse_token_ids(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_token_ids_rejects_garbage() {
        match parse_token_ids("1,two,3") {
            Err(InferenceError::InvalidArgument(msg)) => assert!(msg.contains("'two'")),
            other => panic!("Expected InvalidArgument, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_token_ids_rejects_negative() {
        assert!(parse_token_ids("1,-1").is_err());
    }

    #[test]
    fn test_read_token_ids_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("ids.txt");
        std::fs::write(&file_path, "151644 872\n198").unwrap();

        let ids = read_token_ids(None, Some(&file_path), false).unwrap();
        assert_eq!(ids, vec![151644, 872, 198]);
    }

    #[test]
    fn test_read_token_ids_inline_takes_priority() {
        let ids = read_token_ids(Some("4"), Some(Path::new("/nonexistent")), false).unwrap();
        assert_eq!(ids, vec![4]);
    }

    #[test]
    fn test_read_token_ids_file_not_found() {
        let result = read_token_ids(None, Some(Path::new("/nonexistent/ids.txt")), false);
        assert!(matches!(result, Err(InferenceError::InvalidArgument(ref m)) if m.contains("failed to read")));
    }

    #[test]
    fn test_read_token_ids_no_source() {
        assert!(read_token_ids(None, None, false).is_err());
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        init_logging(true);
    }
}
