//! Miscellaneous internal helpers (paths/SQL text/C strings).

use std::ffi::{c_char, CStr, CString};
use std::path::Path;

use crate::errors::{Error, Result};

/// Native error text reported when the legacy `TYPES` clause reaches the SQL parser.
///
/// Matching on engine message text is fragile across engine versions; callers that can
/// should use the explicit type declaration API instead.
const TYPES_CLAUSE_ERROR: &str = "near \"TYPES\": syntax error";

/// Native error text reported when the temporary schema tables have not been built yet.
const TEMP_SCHEMA_ERROR: &str = "no such table: temp.schema";

/// Validate a file path for correctness before it reaches the native open call.
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(Error::InvalidArgument(
            "Database path cannot contain null bytes".into(),
        ));
    }
    Ok(())
}

/// Private databases are never shared through the pool.
pub(crate) fn is_private_database(path: &str) -> bool {
    let trimmed = path.trim();
    trimmed.is_empty() || trimmed == ":memory:" || trimmed.contains("mode=memory")
}

/// Key used for the connection pool: the absolute form of `path`, so `./a.db` and `a.db`
/// share one queue.
pub(crate) fn normalize_pool_key(path: &str) -> String {
    let trimmed = path.trim();
    if is_private_database(trimmed) || trimmed.starts_with("file:") {
        return trimmed.to_string();
    }
    std::path::absolute(Path::new(trimmed))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| trimmed.to_string())
}

/// Remove every `[base].` qualifier; the engine has no notion of catalogs.
pub(crate) fn strip_base_schema(sql: &str, base_schema_name: &str) -> String {
    if base_schema_name.is_empty() {
        return sql.to_string();
    }
    let qualifier = format!("[{base_schema_name}].");
    sql.replace(&qualifier, "")
}

pub(crate) fn is_types_clause_error(message: &str) -> bool {
    message.eq_ignore_ascii_case(TYPES_CLAUSE_ERROR)
}

pub(crate) fn is_temp_schema_error(message: &str) -> bool {
    message.len() >= TEMP_SCHEMA_ERROR.len()
        && message.as_bytes()[..TEMP_SCHEMA_ERROR.len()]
            .eq_ignore_ascii_case(TEMP_SCHEMA_ERROR.as_bytes())
}

/// Split a script that starts with a legacy `TYPES ...;` clause into the clause and the rest.
pub(crate) fn split_types_clause(sql: &str) -> (&str, &str) {
    match sql.find(';') {
        Some(pos) => (&sql[..=pos], &sql[pos + 1..]),
        None => (sql, ""),
    }
}

/// Parse `TYPES INTEGER, TEXT, [DATETIME];` into `["INTEGER", "TEXT", "DATETIME"]`.
pub(crate) fn parse_type_definitions(clause: &str) -> Vec<String> {
    let body = clause.trim().trim_end_matches(';').trim();
    let body = match body.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("TYPES") => &body[5..],
        _ => body,
    };
    body.split(',')
        .map(|part| {
            part.trim()
                .trim_start_matches('[')
                .trim_end_matches(']')
                .trim()
                .to_string()
        })
        .filter(|part| !part.is_empty())
        .collect()
}

/// Hex literal used to pass raw key bytes through a pragma.
pub(crate) fn hex_key_literal(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() * 2 + 3);
    out.push_str("x'");
    for byte in key {
        out.push_str(&format!("{byte:02x}"));
    }
    out.push('\'');
    out
}

pub(crate) fn to_cstring(value: &str) -> Result<CString> {
    Ok(CString::new(value)?)
}

/// Copy a NUL-terminated native string, `None` for a null pointer.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid for the call.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}
