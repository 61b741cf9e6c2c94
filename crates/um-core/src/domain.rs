//! Domain resolution: raw page URL to tracking key.

use url::Url;

use crate::types::TrackingKey;

/// Resolves a page URL to the key its time is accounted under.
///
/// Only `http` and `https` pages are trackable. The key is the page host with
/// one leading `www.` removed; scheme, port, path and query are discarded.
/// Anything that fails to parse, or has no usable host, is untrackable.
#[must_use]
pub fn resolve(raw: &str) -> Option<TrackingKey> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    // The parser lower-cases hosts of special schemes.
    let host = url.host_str()?;
    let host = host.strip_prefix("www.").unwrap_or(host);
    TrackingKey::new(host).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> Option<String> {
        resolve(raw).map(String::from)
    }

    #[test]
    fn strips_www_and_discards_path() {
        assert_eq!(key("https://www.example.com/path").as_deref(), Some("example.com"));
        assert_eq!(key("http://example.com/other").as_deref(), Some("example.com"));
    }

    #[test]
    fn both_schemes_map_to_same_key() {
        assert_eq!(resolve("https://www.example.com/path"), resolve("http://example.com/other"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(key("ftp://example.com"), None);
        assert_eq!(key("file:///home/user/index.html"), None);
        assert_eq!(key("chrome://extensions"), None);
        assert_eq!(key("about:blank"), None);
    }

    #[test]
    fn rejects_unparseable_input() {
        assert_eq!(key(""), None);
        assert_eq!(key("not a url"), None);
        assert_eq!(key("https://"), None);
    }

    #[test]
    fn host_is_lower_cased() {
        assert_eq!(key("HTTPS://WWW.Example.COM/").as_deref(), Some("example.com"));
    }

    #[test]
    fn only_one_www_prefix_is_removed() {
        assert_eq!(key("https://www.www.example.com").as_deref(), Some("www.example.com"));
        assert_eq!(key("https://wwwexample.com").as_deref(), Some("wwwexample.com"));
    }

    #[test]
    fn keeps_subdomains_and_drops_port() {
        assert_eq!(key("https://docs.rs:8443/crate").as_deref(), Some("docs.rs"));
        assert_eq!(key("https://mail.google.com/u/0").as_deref(), Some("mail.google.com"));
    }

    #[test]
    fn ip_hosts_are_trackable() {
        assert_eq!(key("http://127.0.0.1:8000/").as_deref(), Some("127.0.0.1"));
        assert_eq!(key("http://[::1]/").as_deref(), Some("[::1]"));
    }
}
