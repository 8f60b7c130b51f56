//! Base-URL helpers for building API endpoints without doubled slashes.

/// Strips trailing slashes.
///
/// ```
/// use toolrelay::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Joins a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use toolrelay::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.example.com/v1"),
            "https://api.example.com/v1"
        );
        assert_eq!(
            normalize_base_url(" https://api.example.com/v1/// "),
            "https://api.example.com/v1"
        );
        assert_eq!(normalize_base_url("///"), "");
    }

    #[test]
    fn test_construct_api_url() {
        for (base, endpoint) in [
            ("http://127.0.0.1:8080/v1", "chat/completions"),
            ("http://127.0.0.1:8080/v1/", "chat/completions"),
            ("http://127.0.0.1:8080/v1", "///chat/completions"),
            ("http://127.0.0.1:8080/v1//", "/chat/completions"),
        ] {
            assert_eq!(
                construct_api_url(base, endpoint),
                "http://127.0.0.1:8080/v1/chat/completions"
            );
        }
    }
}
