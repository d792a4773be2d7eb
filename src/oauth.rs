use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::Value;

const OAUTH_BLOCK: &str = "claudeAiOauth";

/// Paths checked, in order, for the account email before falling back to
/// the access token's JWT claims.
const EMAIL_PATHS: &[&[&str]] = &[
    &["email"],
    &["account", "email"],
    &["oauthAccount", "emailAddress"],
    &[OAUTH_BLOCK, "email"],
    &[OAUTH_BLOCK, "account", "email"],
];

/// The CLI's stored OAuth login, as found in the keychain entry or the
/// credentials file.
#[derive(Debug, Clone, Default)]
pub struct OAuthCredentials {
    pub root: Value,
    pub access_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub subscription_type: Option<String>,
    pub rate_limit_tier: Option<String>,
}

impl OAuthCredentials {
    /// Never fails: unreadable input yields credentials with nothing set.
    pub fn parse(data: &[u8]) -> Self {
        let Ok(root) = serde_json::from_slice::<Value>(data) else {
            return Self::default();
        };
        let block = root.get(OAUTH_BLOCK).unwrap_or(&Value::Null);

        let expires_at = ["expiresAt", "expires_at"]
            .iter()
            .find_map(|key| block.get(*key).and_then(json_instant))
            .or_else(|| root.get("expiresAt").and_then(json_instant));
        let scopes = match block.get("scopes") {
            Some(Value::Array(items)) => items.iter().filter_map(json_text).collect(),
            Some(Value::String(joined)) => joined.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };

        Self {
            access_token: text_at(block, &["accessToken"]),
            subscription_type: text_at(block, &["subscriptionType"]),
            rate_limit_tier: text_at(block, &["rateLimitTier"]),
            expires_at,
            scopes,
            root,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|granted| granted == scope)
    }

    /// Credentials without a known expiry count as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at <= now)
    }

    /// Returns the access token only when it carries `required_scope` and
    /// has not expired.
    pub fn usable_token(&self, required_scope: &str, now: DateTime<Utc>) -> Option<&str> {
        if self.is_expired(now) || !self.has_scope(required_scope) {
            return None;
        }
        self.access_token.as_deref()
    }

    pub fn email(&self) -> Option<String> {
        extract_email(&self.root)
    }
}

pub fn extract_email(root: &Value) -> Option<String> {
    EMAIL_PATHS
        .iter()
        .filter_map(|path| text_at(root, path))
        .find_map(|candidate| as_email(&candidate))
        .or_else(|| {
            text_at(root, &[OAUTH_BLOCK, "accessToken"])
                .and_then(|token| jwt_claims(&token))
                .and_then(|claims| {
                    text_at(&claims, &["email"]).or_else(|| text_at(&claims, &["preferred_username"]))
                })
                .and_then(|candidate| as_email(&candidate))
        })
}

/// Decodes the payload segment of a three-part JWT. Signatures are not
/// checked.
fn jwt_claims(token: &str) -> Option<Value> {
    let segments = token.split('.').collect::<Vec<_>>();
    let [_, payload, _] = segments.as_slice() else {
        return None;
    };
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE.decode(payload))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn as_email(candidate: &str) -> Option<String> {
    let email = candidate.trim().to_lowercase();
    (!email.is_empty() && email.contains('@')).then_some(email)
}

fn text_at(root: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(root, |node, key| node.get(*key))
        .and_then(json_text)
}

/// Trimmed string content, or `None` for blanks and non-strings.
pub fn json_text(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Numbers and numeric strings.
pub fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

/// Epoch seconds, epoch milliseconds (either as numbers or numeric strings)
/// or an RFC 3339 string.
pub fn json_instant(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(epoch) = json_number(value) {
        return from_epoch(epoch);
    }
    let raw = value.as_str()?.trim();
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}

// Values above 1e12 are already milliseconds; 1e9..1e12 are seconds.
fn from_epoch(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() {
        return None;
    }
    let millis = match epoch {
        e if e > 1e12 => e,
        e if e > 1e9 => e * 1000.0,
        _ => return None,
    };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credential_json(expires_at_millis: i64, scopes: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "claudeAiOauth": {
                "accessToken": "at-test",
                "refreshToken": "rt-test",
                "expiresAt": expires_at_millis,
                "scopes": scopes,
                "subscriptionType": "max",
                "rateLimitTier": "default_claude_max_20x"
            }
        }))
        .expect("encode")
    }

    #[test]
    fn parses_claude_oauth_block() {
        let parsed = OAuthCredentials::parse(&credential_json(
            1_800_000_000_000,
            &["user:inference", "user:profile"],
        ));
        assert_eq!(parsed.access_token.as_deref(), Some("at-test"));
        assert_eq!(
            parsed.expires_at,
            Utc.timestamp_millis_opt(1_800_000_000_000).single()
        );
        assert!(parsed.has_scope("user:profile"));
        assert_eq!(parsed.subscription_type.as_deref(), Some("max"));
        assert_eq!(parsed.rate_limit_tier.as_deref(), Some("default_claude_max_20x"));
    }

    #[test]
    fn space_separated_scopes_are_split() {
        let parsed = OAuthCredentials::parse(
            br#"{"claudeAiOauth":{"scopes":"user:inference  user:profile"}}"#,
        );
        assert_eq!(parsed.scopes, vec!["user:inference", "user:profile"]);
    }

    #[test]
    fn usable_token_requires_scope_and_future_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let future = now.timestamp_millis() + 60_000;
        let past = now.timestamp_millis() - 60_000;

        let valid = OAuthCredentials::parse(&credential_json(future, &["user:profile"]));
        assert_eq!(valid.usable_token("user:profile", now), Some("at-test"));

        let expired = OAuthCredentials::parse(&credential_json(past, &["user:profile"]));
        assert_eq!(expired.usable_token("user:profile", now), None);

        let unscoped = OAuthCredentials::parse(&credential_json(future, &["user:inference"]));
        assert_eq!(unscoped.usable_token("user:profile", now), None);
    }

    #[test]
    fn garbage_input_yields_empty_credentials() {
        let parsed = OAuthCredentials::parse(b"not json");
        assert!(parsed.access_token.is_none());
        assert!(parsed.scopes.is_empty());
        assert!(parsed.is_expired(Utc::now()));
    }

    #[test]
    fn email_falls_back_to_jwt_claim() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"email":"Person@Example.com"}"#);
        let token = format!("header.{}.signature", payload);
        let root = serde_json::json!({ "claudeAiOauth": { "accessToken": token } });
        assert_eq!(extract_email(&root).as_deref(), Some("person@example.com"));

        let direct = serde_json::json!({ "oauthAccount": { "emailAddress": "me@example.com" } });
        assert_eq!(extract_email(&direct).as_deref(), Some("me@example.com"));

        let two_part = serde_json::json!({ "claudeAiOauth": { "accessToken": format!("h.{}", payload) } });
        assert_eq!(extract_email(&two_part), None);
    }

    #[test]
    fn instants_accept_seconds_millis_and_rfc3339() {
        let expected = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(
            json_instant(&Value::from(expected.timestamp_millis())),
            Some(expected)
        );
        assert_eq!(json_instant(&Value::from(expected.timestamp())), Some(expected));
        assert_eq!(
            json_instant(&Value::from("2026-10-19T12:00:00Z")),
            Some(expected)
        );
        assert_eq!(json_instant(&Value::from("soon")), None);
        assert_eq!(json_instant(&Value::from(42)), None);
    }
}
