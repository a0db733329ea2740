/// Tokens longer than this are dropped; they are almost always base64 blobs
/// or minified code and only bloat the posting lists.
pub const MAX_TOKEN_CHARS: usize = 40;

/// Split text into lowercase alphanumeric tokens.
///
/// # Examples
///
/// ```
/// use docrecall::text_util::tokenize;
///
/// assert_eq!(tokenize("Cat, sat; MAT!"), vec!["cat", "sat", "mat"]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && t.chars().count() <= MAX_TOKEN_CHARS)
        .map(str::to_lowercase)
        .collect()
}

/// Canonical form of a query used for cache keys: tokens joined by single
/// spaces, so `"Cat  DOG"` and `"cat dog"` share a cache entry.
pub fn normalize_query(query: &str) -> String {
    tokenize(query).join(" ")
}
