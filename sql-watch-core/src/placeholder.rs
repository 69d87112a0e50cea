//! Placeholder replacement in bootstrap SQL (`${key}` syntax).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::db::{quote_ident, validate_identifier};
use crate::error::{Result, SqlWatchError};

/// Compiled regex for matching `${key}` placeholders.
static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replace all `${key}` placeholders in the given SQL string.
///
/// Lookup is case-insensitive. An unknown key is an error naming the keys
/// that are available.
pub fn replace_placeholders(sql: &str, placeholders: &HashMap<String, String>) -> Result<String> {
    let lower_map: HashMap<String, &String> = placeholders
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();

    let mut result = String::with_capacity(sql.len());
    let mut last_end = 0;

    for caps in PLACEHOLDER_RE.captures_iter(sql) {
        let (Some(full_match), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };

        result.push_str(&sql[last_end..full_match.start()]);
        match lower_map.get(&key.as_str().to_lowercase()) {
            Some(value) => result.push_str(value),
            None => {
                let mut available: Vec<&str> = placeholders.keys().map(|k| k.as_str()).collect();
                available.sort_unstable();
                return Err(SqlWatchError::ConfigError(format!(
                    "Placeholder '{}' not found. Available placeholders: {}",
                    key.as_str(),
                    if available.is_empty() {
                        "(none)".to_string()
                    } else {
                        available.join(", ")
                    }
                )));
            }
        }
        last_end = full_match.end();
    }

    result.push_str(&sql[last_end..]);
    Ok(result)
}

/// Placeholders available to the bootstrap scripts.
///
/// `${schema}` expands to the quoted state schema name.
pub fn schema_placeholders(schema: &str) -> Result<HashMap<String, String>> {
    validate_identifier(schema)?;
    let mut map = HashMap::new();
    map.insert("schema".to_string(), quote_ident(schema));
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_placeholders() {
        let map = schema_placeholders("sql_watch").unwrap();
        let sql = "CREATE SCHEMA IF NOT EXISTS ${schema};";
        assert_eq!(
            replace_placeholders(sql, &map).unwrap(),
            "CREATE SCHEMA IF NOT EXISTS \"sql_watch\";"
        );
    }

    #[test]
    fn test_replace_placeholders_case_insensitive() {
        let map = schema_placeholders("state").unwrap();
        assert_eq!(
            replace_placeholders("SELECT * FROM ${SCHEMA}.run", &map).unwrap(),
            "SELECT * FROM \"state\".run"
        );
    }

    #[test]
    fn test_replace_multiple_same_placeholder() {
        let map = schema_placeholders("s").unwrap();
        assert_eq!(
            replace_placeholders("${schema}.a, ${schema}.b", &map).unwrap(),
            "\"s\".a, \"s\".b"
        );
    }

    #[test]
    fn test_replace_placeholders_missing_key() {
        let map = schema_placeholders("s").unwrap();
        let err = replace_placeholders("SELECT ${table}", &map).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Placeholder 'table' not found. Available placeholders: schema"
        );
    }

    #[test]
    fn test_replace_no_placeholders() {
        let map = HashMap::new();
        assert_eq!(
            replace_placeholders("SELECT $1, $$body$$", &map).unwrap(),
            "SELECT $1, $$body$$"
        );
    }

    #[test]
    fn test_schema_placeholders_rejects_bad_identifier() {
        assert!(schema_placeholders("bad-name").is_err());
        assert!(schema_placeholders("").is_err());
    }
}
