//! Allow-list grammars for caller-supplied form fields.
//!
//! Every value that ends up in a child argument vector passes through one of
//! these checks first. None of the grammars admit whitespace, quotes, `$`,
//! `,` or a leading `-`.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ProxyError;

pub type FieldMap = HashMap<String, String>;

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_RUN_PATH_LEN: usize = 512;
const MAX_FILE_NAME_LEN: usize = 255;
const MAX_LIST_LEN: usize = 8192;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("identifier regex"));
static RUN_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_/][A-Za-z0-9_./-]*$").expect("run path regex"));
static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:;|@-]*$").expect("file name regex"));
static SAMPLE_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:;|-]*$").expect("sample list regex"));
static POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.]*:[0-9]{1,12}(-[0-9]{1,12})?$").expect("position regex")
});

/// Returns the raw value of a required field.
pub fn required<'a>(fields: &'a FieldMap, name: &'static str) -> Result<&'a str, ProxyError> {
    match fields.get(name) {
        Some(value) if !value.is_empty() => Ok(value.as_str()),
        Some(_) => Err(ProxyError::invalid(name, "must not be empty")),
        None => Err(ProxyError::invalid(name, "is required")),
    }
}

/// Sequencer, library, project, sample and analysis names.
pub fn identifier(field: &'static str, value: &str) -> Result<String, ProxyError> {
    check_len(field, value, MAX_IDENTIFIER_LEN)?;
    if !IDENTIFIER.is_match(value) {
        return Err(ProxyError::invalid(
            field,
            "expected letters, digits, '_', '.' or '-' starting with a letter or digit",
        ));
    }
    Ok(value.to_string())
}

/// Run folder on the sequencer, relative or absolute, without `..` segments.
pub fn run_path(field: &'static str, value: &str) -> Result<String, ProxyError> {
    check_len(field, value, MAX_RUN_PATH_LEN)?;
    if !RUN_PATH.is_match(value) {
        return Err(ProxyError::invalid(
            field,
            "expected a path made of letters, digits, '_', '.', '-' and '/'",
        ));
    }
    if value.split('/').any(|segment| segment == "..") {
        return Err(ProxyError::invalid(field, "must not contain '..' segments"));
    }
    Ok(value.to_string())
}

/// A single path component used as an output file name.
pub fn file_name(field: &'static str, value: &str) -> Result<String, ProxyError> {
    check_len(field, value, MAX_FILE_NAME_LEN)?;
    if value == "." || value == ".." || !FILE_NAME.is_match(value) {
        return Err(ProxyError::invalid(
            field,
            "expected a file name without '/' starting with a letter or digit",
        ));
    }
    Ok(value.to_string())
}

/// `;`-separated `analysis|sample` entries.
pub fn sample_list(field: &'static str, value: &str) -> Result<String, ProxyError> {
    let value = strip_wrapping_quotes(value);
    check_len(field, value, MAX_LIST_LEN)?;
    if !SAMPLE_LIST.is_match(value) {
        return Err(ProxyError::invalid(
            field,
            "expected entries made of letters, digits and '_.:|-' separated by ';'",
        ));
    }
    if value.split(';').any(str::is_empty) {
        return Err(ProxyError::invalid(field, "contains an empty entry"));
    }
    Ok(value.to_string())
}

/// `;`-separated `chrom:start[-end]` positions.
pub fn position_list(field: &'static str, value: &str) -> Result<String, ProxyError> {
    let value = strip_wrapping_quotes(value);
    check_len(field, value, MAX_LIST_LEN)?;
    if let Some(bad) = value.split(';').find(|item| !POSITION.is_match(item)) {
        return Err(ProxyError::invalid(
            field,
            format!("'{}' is not a chrom:start[-end] position", truncate(bad, 64)),
        ));
    }
    Ok(value.to_string())
}

/// Decimal count bounded by `max`.
pub fn count(field: &'static str, value: &str, max: u32) -> Result<u32, ProxyError> {
    if value.is_empty() || value.len() > 10 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::invalid(field, "expected a decimal number"));
    }
    let parsed: u32 = value
        .parse()
        .map_err(|_| ProxyError::invalid(field, "expected a decimal number"))?;
    if parsed > max {
        return Err(ProxyError::invalid(field, format!("must be at most {max}")));
    }
    Ok(parsed)
}

// List values may arrive wrapped in one pair of double quotes.
fn strip_wrapping_quotes(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ProxyError> {
    if value.is_empty() {
        return Err(ProxyError::invalid(field, "must not be empty"));
    }
    if value.len() > max {
        return Err(ProxyError::invalid(
            field,
            format!("must be at most {max} bytes"),
        ));
    }
    Ok(())
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
