//! TiddlyWiki string lists.
//!
//! Fields such as `tags` and `list` hold space-separated titles, with titles
//! containing spaces wrapped in double square brackets:
//! `alpha [[two words]] gamma`.

/// Parses a TiddlyWiki string list into its titles, dropping duplicates.
pub fn parse_string_array(value: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut rest = value;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let (item, remaining) = match bracketed(rest) {
            Some(split) => split,
            None => {
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                rest.split_at(end)
            }
        };
        if !out.iter().any(|existing| existing == item) {
            out.push(item.to_string());
        }
        rest = remaining;
    }
    out
}

/// Splits `[[title]]` off the front of `s` when the closing brackets are
/// followed by whitespace or the end of input.
fn bracketed(s: &str) -> Option<(&str, &str)> {
    let inner = s.strip_prefix("[[")?;
    let close = inner.find("]]")?;
    let after = &inner[close + 2..];
    if after.is_empty() || after.starts_with(char::is_whitespace) {
        Some((&inner[..close], after))
    } else {
        None
    }
}

/// Formats titles as a TiddlyWiki string list.
pub fn stringify_list<S: AsRef<str>>(titles: &[S]) -> String {
    titles
        .iter()
        .map(|title| {
            let title = title.as_ref();
            if title.is_empty() || title.contains(char::is_whitespace) {
                format!("[[{title}]]")
            } else {
                title.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
