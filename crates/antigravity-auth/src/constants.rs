//! Antigravity OAuth and Code Assist constants
//!
//! Public OAuth client configuration matching the Antigravity IDE. These
//! values are not secrets — they identify the public client application.
//! The actual secrets (access/refresh tokens) live in the account store.

/// Google's public OAuth client ID for the Antigravity IDE
pub const ANTIGRAVITY_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";

/// Client secret shipped with the public IDE client (not a real secret)
pub const ANTIGRAVITY_CLIENT_SECRET: &str = "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";

/// Token endpoint for refresh-token grants
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// Production Code Assist endpoint
pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";

/// Sandbox Code Assist endpoint (serves the Claude family)
pub const CODE_ASSIST_SANDBOX_ENDPOINT: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";

/// `X-Goog-Api-Client` value asserting the IDE identity.
/// Compatibility-critical: the Code Assist surface rejects unknown clients,
/// so this string must be emitted verbatim on every request.
pub const API_CLIENT_HEADER: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";

/// `Client-Metadata` JSON header, also compatibility-critical.
pub const CLIENT_METADATA_HEADER: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

/// User-Agent matching the pinned IDE build
pub const USER_AGENT: &str = "antigravity/1.15.8 linux/x86_64";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_metadata_is_valid_json() {
        let parsed: serde_json::Value = serde_json::from_str(CLIENT_METADATA_HEADER).unwrap();
        assert_eq!(parsed["ideType"], "IDE_UNSPECIFIED");
        assert_eq!(parsed["platform"], "PLATFORM_UNSPECIFIED");
        assert_eq!(parsed["pluginType"], "GEMINI");
    }

    #[test]
    fn endpoints_are_https() {
        for url in [
            TOKEN_ENDPOINT,
            CODE_ASSIST_ENDPOINT,
            CODE_ASSIST_SANDBOX_ENDPOINT,
        ] {
            assert!(url.starts_with("https://"), "endpoint must be https: {url}");
        }
    }
}
