use serde::{Deserialize, Serialize};
use woothee::parser::Parser;

/// Client category detected from the caller-supplied client string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClientKind {
    Bot,
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

/// Normalized client metadata attached to an operation's origin
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientInfo {
    pub kind: ClientKind,
    pub name: Option<String>,
    pub os: Option<String>,
    pub raw: String,
    pub version: Option<String>,
}

/// Classify a client string (typically a User-Agent) into normalized fields
pub fn classify_client(client: &str) -> ClientInfo {
    let parser = Parser::new();

    match parser.parse(client) {
        Some(result) => {
            let kind = match result.category {
                "pc" => ClientKind::Desktop,
                "smartphone" | "mobilephone" => ClientKind::Mobile,
                "tablet" => ClientKind::Tablet,
                "crawler" => ClientKind::Bot,
                _ => ClientKind::Unknown,
            };

            ClientInfo {
                kind,
                name: normalize(result.name),
                os: normalize(result.os),
                raw: client.to_string(),
                version: normalize(result.version),
            }
        }
        None => ClientInfo {
            raw: client.to_string(),
            ..ClientInfo::default()
        },
    }
}

/// Normalize a field value - return None if empty or "UNKNOWN"
fn normalize(value: &str) -> Option<String> {
    if value.is_empty() || value == "UNKNOWN" {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_chrome_windows() {
        let client = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let info = classify_client(client);

        assert_eq!(info.kind, ClientKind::Desktop);
        assert_eq!(info.name.as_deref(), Some("Chrome"));
        assert_eq!(info.os.as_deref(), Some("Windows 10"));
        assert!(info.version.is_some());
    }

    #[test]
    fn test_classify_safari_ios() {
        let client = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
        let info = classify_client(client);

        assert_eq!(info.kind, ClientKind::Mobile);
    }

    #[test]
    fn test_classify_crawler() {
        let client = "Googlebot/2.1 (+http://www.google.com/bot.html)";
        let info = classify_client(client);

        assert_eq!(info.kind, ClientKind::Bot);
    }

    #[test]
    fn test_classify_unknown_client() {
        let client = "SomeUnknownClient/1.0";
        let info = classify_client(client);

        assert_eq!(info.raw, client);
    }

    #[test]
    fn test_classify_empty() {
        let info = classify_client("");

        assert_eq!(info.kind, ClientKind::Unknown);
        assert!(info.name.is_none());
        assert!(info.os.is_none());
        assert!(info.version.is_none());
    }
}
