//! Conversion of arbitrary container and service identifiers into DNS names.

/// Compose always suffixes the first replica of a service with this.
const REPLICA_SUFFIX: &str = "-1";

fn is_separator(c: char) -> bool {
    c == '-' || c == '.'
}

/// Turn an identifier into a sequence of valid DNS labels.
///
/// Every run of characters outside `[A-Za-z0-9-.]` becomes a single `.`,
/// runs of `-`/`.` collapse into their first character, and leading or
/// trailing separators are trimmed. The result may be empty, which callers
/// must treat as "no usable name".
///
/// ```
/// use cntdns::normalize::normalize_name;
/// assert_eq!(normalize_name("/shop_api_1"), "shop.api.1");
/// assert_eq!(normalize_name("api--1"), "api-1");
/// ```
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || is_separator(c) {
            c
        } else {
            '.'
        };
        if is_separator(c) && out.ends_with(is_separator) {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(is_separator).to_string()
}

/// Strip the compose replica suffix from an already normalized name.
pub fn strip_replica_suffix(name: &str) -> Option<&str> {
    name.strip_suffix(REPLICA_SUFFIX)
        .map(|stem| stem.trim_end_matches(is_separator))
        .filter(|stem| !stem.is_empty())
}
