//! URL path parsing and assembly helpers.
//!
//! Paths are handled as three pieces: `pathname`, `search` (kept with its
//! leading `?` when non-empty) and `hash` (kept with its leading `#`).

/// A path split into its pathname, search and hash components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParts {
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

/// Split a path string into pathname, search and hash.
///
/// The hash is split off first, then the search, so `?` inside a hash
/// fragment stays part of the hash.
pub fn parse_path(path: &str) -> PathParts {
    let mut parts = PathParts::default();
    let mut rest = path;

    if let Some(idx) = rest.find('#') {
        parts.hash = normalize_piece(&rest[idx..], '#');
        rest = &rest[..idx];
    }
    if let Some(idx) = rest.find('?') {
        parts.search = normalize_piece(&rest[idx..], '?');
        rest = &rest[..idx];
    }
    parts.pathname = rest.to_string();
    parts
}

/// Reassemble a path string from its components.
pub fn create_path(parts: &PathParts) -> String {
    let mut out = parts.pathname.clone();
    out.push_str(&parts.search);
    out.push_str(&parts.hash);
    out
}

// A lone "?" or "#" normalizes to the empty string.
fn normalize_piece(piece: &str, lead: char) -> String {
    if piece.len() <= 1 {
        String::new()
    } else {
        debug_assert!(piece.starts_with(lead));
        piece.to_string()
    }
}

/// Strip `basename` from the front of `pathname`, or `None` when the
/// pathname lives outside the basename. Matching is segment-aligned, so
/// basename `/app` does not strip from `/application`.
pub fn strip_basename(pathname: &str, basename: &str) -> Option<String> {
    if basename == "/" {
        return Some(pathname.to_string());
    }
    if !pathname
        .to_lowercase()
        .starts_with(&basename.to_lowercase())
    {
        return None;
    }
    let next = pathname[basename.len()..].to_string();
    if !next.is_empty() && !next.starts_with('/') {
        return None;
    }
    Some(if next.is_empty() { "/".to_string() } else { next })
}

/// Join two path fragments with exactly one `/` between them.
pub fn join_paths(left: &str, right: &str) -> String {
    let joined = format!("{left}/{right}");
    let mut out = String::with_capacity(joined.len());
    let mut prev_slash = false;
    for ch in joined.chars() {
        if ch == '/' {
            if !prev_slash {
                out.push(ch);
            }
            prev_slash = true;
        } else {
            out.push(ch);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Parse a search string (with or without leading `?`) into key/value pairs.
/// Bare keys parse with an empty value.
pub fn parse_search(search: &str) -> Vec<(String, String)> {
    let trimmed = search.strip_prefix('?').unwrap_or(search);
    if trimmed.is_empty() {
        return Vec::new();
    }
    url::form_urlencoded::parse(trimmed.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Whether a search string carries a bare `index` parameter, which targets
/// the index child instead of the parent layout during submissions.
pub fn has_index_param(search: &str) -> bool {
    parse_search(search)
        .iter()
        .any(|(k, v)| k == "index" && v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_full() {
        let parts = parse_path("/a/b?x=1#frag");
        assert_eq!(parts.pathname, "/a/b");
        assert_eq!(parts.search, "?x=1");
        assert_eq!(parts.hash, "#frag");
    }

    #[test]
    fn test_parse_path_hash_owns_question_mark() {
        let parts = parse_path("/a#frag?notsearch");
        assert_eq!(parts.pathname, "/a");
        assert_eq!(parts.search, "");
        assert_eq!(parts.hash, "#frag?notsearch");
    }

    #[test]
    fn test_parse_path_lone_markers_drop() {
        let parts = parse_path("/a?#");
        assert_eq!(parts.pathname, "/a");
        assert_eq!(parts.search, "");
        assert_eq!(parts.hash, "");
    }

    #[test]
    fn test_create_path_round_trip() {
        let parts = parse_path("/tasks/1?q=2#top");
        assert_eq!(create_path(&parts), "/tasks/1?q=2#top");
    }

    #[test]
    fn test_strip_basename() {
        assert_eq!(strip_basename("/app/tasks", "/app"), Some("/tasks".into()));
        assert_eq!(strip_basename("/app", "/app"), Some("/".into()));
        assert_eq!(strip_basename("/application", "/app"), None);
        assert_eq!(strip_basename("/other", "/app"), None);
        assert_eq!(strip_basename("/anything", "/"), Some("/anything".into()));
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/app", "/tasks"), "/app/tasks");
        assert_eq!(join_paths("/app/", "tasks/"), "/app/tasks");
        assert_eq!(join_paths("/", "/"), "/");
        assert_eq!(join_paths("", "tasks"), "/tasks");
    }

    #[test]
    fn test_has_index_param() {
        assert!(has_index_param("?index"));
        assert!(has_index_param("?a=1&index"));
        assert!(!has_index_param("?index=0"));
        assert!(!has_index_param("?a=1"));
        assert!(!has_index_param(""));
    }
}
