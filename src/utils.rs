//! Path and identifier helpers

use std::path::PathBuf;

/// Expand tilde (~) in path
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Check if an identifier is an http(s) URL rather than a local path
pub fn is_url(identifier: &str) -> bool {
    let lower = identifier.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("http://example.com/a.png"));
        assert!(is_url("HTTPS://example.com/a.png"));
        assert!(!is_url("/tmp/a.png"));
        assert!(!is_url("httpfile.png"));
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/tmp/x.png"), PathBuf::from("/tmp/x.png"));
        assert_eq!(expand_tilde("rel/x.png"), PathBuf::from("rel/x.png"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x.png"), home.join("x.png"));
        }
    }
}
