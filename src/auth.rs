//! Request authorization: an ordered chain of methods plus the signed
//! cookie that lets a browser session re-enter without re-authenticating.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use hyper::header::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the auth cookie issued on successful web authentication.
pub const AUTH_COOKIE_NAME: &str = "mirage-ecs-auth";

/// Lifetime of an issued auth cookie.
pub const AUTH_COOKIE_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

/// Header carrying the OIDC payload set by a fronting load balancer.
const AMZN_OIDC_DATA_HEADER: &str = "x-amzn-oidc-data";

/// Authorization methods to evaluate, in order. The policy (which kinds
/// apply to API vs web paths) is fixed in the web layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Token,
    Cookie,
    AmznOidc,
    Basic,
}

/// Chain for `/api/*` paths: token only.
pub const API_METHODS: &[MethodKind] = &[MethodKind::Token];

/// Chain for web paths. Basic goes last so its challenge is only emitted
/// when nothing else applied.
pub const WEB_METHODS: &[MethodKind] = &[
    MethodKind::Token,
    MethodKind::Cookie,
    MethodKind::AmznOidc,
    MethodKind::Basic,
];

/// Outcome of evaluating an authorization chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthDecision {
    pub allowed: bool,
    /// Whether the caller should set `WWW-Authenticate: Basic` on the 401.
    pub challenge_basic: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<AuthMethodBasic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<AuthMethodToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amzn_oidc: Option<AuthMethodAmznOidc>,
    #[serde(default)]
    pub cookie_secret: String,
}

impl Auth {
    /// Attach runtime pieces that cannot come from deserialization.
    pub fn finalize(&mut self) {
        if let Some(oidc) = &mut self.amzn_oidc {
            if oidc.verifier.is_none() {
                oidc.verifier = Some(Arc::new(AlbOidcVerifier::new()));
            }
        }
    }

    /// Evaluate `kinds` in order against the request headers.
    ///
    /// The first method that allows wins. A method that errors aborts the
    /// chain with that error. When nothing allows and Basic was in the
    /// chain, the decision asks the caller to emit the Basic challenge.
    pub async fn authorize(&self, headers: &HeaderMap, kinds: &[MethodKind]) -> Result<AuthDecision> {
        let mut basic_in_chain = false;
        for kind in kinds {
            match kind {
                MethodKind::Token => {
                    if let Some(token) = &self.token {
                        if token.matches(headers) {
                            return Ok(AuthDecision { allowed: true, challenge_basic: false });
                        }
                    }
                }
                MethodKind::Cookie => {
                    if let Some(value) = cookie_value(headers, AUTH_COOKIE_NAME) {
                        match self.validate_auth_cookie(&value) {
                            Ok(()) => {
                                debug!("auth cookie succeeded");
                                return Ok(AuthDecision { allowed: true, challenge_basic: false });
                            }
                            Err(e) => warn!(error = %e, "auth cookie failed"),
                        }
                    }
                }
                MethodKind::AmznOidc => {
                    if let Some(oidc) = &self.amzn_oidc {
                        if oidc.matches(headers).await? {
                            return Ok(AuthDecision { allowed: true, challenge_basic: false });
                        }
                    }
                }
                MethodKind::Basic => {
                    basic_in_chain = true;
                    if let Some(basic) = &self.basic {
                        if basic.matches(headers) {
                            return Ok(AuthDecision { allowed: true, challenge_basic: false });
                        }
                    }
                }
            }
        }
        Ok(AuthDecision { allowed: false, challenge_basic: basic_in_chain })
    }

    /// Build the `Set-Cookie` value for a fresh auth cookie, or `None` when
    /// no cookie secret is configured.
    pub fn new_auth_cookie(&self, expire: Duration, domain: &str) -> Result<Option<String>> {
        if self.cookie_secret.is_empty() {
            return Ok(None);
        }
        let expire_at = Utc::now()
            + chrono::TimeDelta::from_std(expire).unwrap_or_else(|_| chrono::TimeDelta::hours(24));
        let claims = AuthCookieClaims { expire_at: expire_at.timestamp() };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.cookie_secret.as_bytes()),
        )
        .context("failed to sign auth cookie")?;
        let expires = expire_at.format("%a, %d %b %Y %H:%M:%S GMT");
        Ok(Some(format!(
            "{AUTH_COOKIE_NAME}={token}; Path=/; Domain={domain}; Expires={expires}; HttpOnly; Secure; SameSite=Lax"
        )))
    }

    /// Validate an auth cookie value issued by `new_auth_cookie`.
    pub fn validate_auth_cookie(&self, value: &str) -> Result<()> {
        if self.cookie_secret.is_empty() {
            bail!("cookie_secret is not set");
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let no_claims: [&str; 0] = [];
        validation.set_required_spec_claims(&no_claims);
        let data = decode::<AuthCookieClaims>(
            value,
            &DecodingKey::from_secret(self.cookie_secret.as_bytes()),
            &validation,
        )
        .context("failed to parse auth cookie")?;
        if Utc::now().timestamp() >= data.claims.expire_at {
            bail!("auth cookie already expired at {}", data.claims.expire_at);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthCookieClaims {
    expire_at: i64,
}

/// Static username/password pair compared against `Authorization: Basic`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMethodBasic {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(skip)]
    expected: OnceLock<String>,
}

impl AuthMethodBasic {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            expected: OnceLock::new(),
        }
    }

    pub fn matches(&self, headers: &HeaderMap) -> bool {
        if self.username.is_empty() || self.password.is_empty() {
            return false;
        }
        let sent = match headers.get(hyper::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        let expected = self.expected.get_or_init(|| {
            format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", self.username, self.password))
            )
        });
        if sent == expected {
            debug!("auth basic succeeded");
            true
        } else {
            warn!("auth basic failed");
            false
        }
    }
}

/// Shared-token header compared verbatim. The header name is arbitrary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMethodToken {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub header: String,
}

impl AuthMethodToken {
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        if self.token.is_empty() || self.header.is_empty() {
            return false;
        }
        let sent = match headers.get(self.header.as_str()).and_then(|v| v.to_str().ok()) {
            Some(v) if !v.is_empty() => v,
            _ => return false,
        };
        if sent == self.token {
            debug!("auth token succeeded");
            true
        } else {
            warn!(header = %self.header, "auth token does not match");
            false
        }
    }
}

/// Matches one claim value: exact match takes precedence over suffix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimMatcher {
    #[serde(default)]
    pub exact: String,
    #[serde(default)]
    pub suffix: String,
}

impl ClaimMatcher {
    pub fn matches(&self, s: &str) -> bool {
        if !self.exact.is_empty() {
            self.exact == s
        } else if !self.suffix.is_empty() {
            s.ends_with(&self.suffix)
        } else {
            false
        }
    }
}

/// Validates the OIDC payload a fronting ALB attaches to each request and
/// matches a named claim against the configured matchers.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthMethodAmznOidc {
    #[serde(default)]
    pub claim: String,
    #[serde(default)]
    pub matchers: Vec<ClaimMatcher>,
    #[serde(skip)]
    pub verifier: Option<Arc<dyn OidcDataVerifier>>,
}

impl std::fmt::Debug for AuthMethodAmznOidc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthMethodAmznOidc")
            .field("claim", &self.claim)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

impl AuthMethodAmznOidc {
    pub async fn matches(&self, headers: &HeaderMap) -> Result<bool> {
        if self.claim.is_empty() {
            return Ok(false);
        }
        let verifier = self
            .verifier
            .as_ref()
            .ok_or_else(|| anyhow!("amzn_oidc verifier is not initialized"))?;
        let data = headers
            .get(AMZN_OIDC_DATA_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let claims = verifier
            .verify(data)
            .await
            .with_context(|| format!("failed to validate {AMZN_OIDC_DATA_HEADER}"))?;
        Ok(self.match_claims(&claims))
    }

    pub fn match_claims(&self, claims: &serde_json::Map<String, serde_json::Value>) -> bool {
        let value = match claims.get(&self.claim) {
            Some(v) => v,
            None => {
                warn!(claim = %self.claim, "claim not found in oidc data");
                return false;
            }
        };
        let value = match value.as_str() {
            Some(s) => s,
            None => {
                warn!(claim = %self.claim, "claim is not a string");
                return false;
            }
        };
        if self.matchers.iter().any(|m| m.matches(value)) {
            debug!(claim = %self.claim, value, "oidc claim matched");
            true
        } else {
            warn!(claim = %self.claim, value, "oidc claim does not match any matchers");
            false
        }
    }
}

/// Verifies an `x-amzn-oidc-data` payload and returns its claims.
#[async_trait]
pub trait OidcDataVerifier: Send + Sync {
    async fn verify(&self, data: &str) -> Result<serde_json::Map<String, serde_json::Value>>;
}

/// Production verifier: ES256 signatures checked against the regional
/// load-balancer public keys, fetched once per key id and cached.
pub struct AlbOidcVerifier {
    client: reqwest::Client,
    keys: DashMap<String, String>,
}

impl AlbOidcVerifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            keys: DashMap::new(),
        }
    }

    async fn public_key_pem(&self, region: &str, kid: &str) -> Result<String> {
        if let Some(pem) = self.keys.get(kid) {
            return Ok(pem.clone());
        }
        let url = format!("https://public-keys.auth.elb.{region}.amazonaws.com/{kid}");
        let pem = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch oidc public key from {url}"))?
            .text()
            .await
            .context("failed to read oidc public key body")?;
        self.keys.insert(kid.to_string(), pem.clone());
        Ok(pem)
    }
}

impl Default for AlbOidcVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OidcDataVerifier for AlbOidcVerifier {
    async fn verify(&self, data: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
        if data.is_empty() {
            bail!("oidc data is empty");
        }
        // The load balancer pads its base64 segments, which strict JWT
        // parsers reject. Strip the padding before handing it over.
        let segments: Vec<&str> = data.split('.').map(|s| s.trim_end_matches('=')).collect();
        if segments.len() != 3 {
            bail!("oidc data is not a JWT");
        }
        let header_json = URL_SAFE_NO_PAD
            .decode(segments[0])
            .context("failed to decode oidc header")?;
        let header: serde_json::Value =
            serde_json::from_slice(&header_json).context("failed to parse oidc header")?;
        let kid = header
            .get("kid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("kid not found in oidc header"))?;
        let signer = header
            .get("signer")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("signer not found in oidc header"))?;
        // signer is the load balancer ARN; the region is its fourth field.
        let region = signer
            .split(':')
            .nth(3)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| anyhow!("cannot determine region from signer {signer}"))?;

        let pem = self.public_key_pem(region, kid).await?;
        let key = DecodingKey::from_ec_pem(pem.as_bytes())
            .context("failed to parse oidc public key")?;
        let token = segments.join(".");
        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            &token,
            &key,
            &Validation::new(Algorithm::ES256),
        )
        .context("failed to verify oidc data")?;
        Ok(data.claims)
    }
}

/// Extract a named cookie from the `Cookie` request header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(hyper::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn test_auth() -> Auth {
        Auth {
            basic: Some(AuthMethodBasic::new("admin", "pass")),
            token: Some(AuthMethodToken {
                token: "secret-token".to_string(),
                header: "x-mirage-token".to_string(),
            }),
            amzn_oidc: None,
            cookie_secret: "test-cookie-secret".to_string(),
        }
    }

    fn basic_header(user: &str, pass: &str) -> HeaderValue {
        let encoded = STANDARD.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
    }

    #[test]
    fn test_basic_matches() {
        let basic = AuthMethodBasic::new("admin", "pass");
        let mut headers = HeaderMap::new();
        assert!(!basic.matches(&headers));
        headers.insert(hyper::header::AUTHORIZATION, basic_header("admin", "pass"));
        assert!(basic.matches(&headers));
        headers.insert(hyper::header::AUTHORIZATION, basic_header("admin", "wrong"));
        assert!(!basic.matches(&headers));

        let empty = AuthMethodBasic::new("", "");
        headers.insert(hyper::header::AUTHORIZATION, basic_header("", ""));
        assert!(!empty.matches(&headers));
    }

    #[test]
    fn test_token_matches() {
        let token = AuthMethodToken {
            token: "mytoken".to_string(),
            header: "Authorization".to_string(),
        };
        let mut headers = HeaderMap::new();
        assert!(!token.matches(&headers));
        headers.insert("authorization", HeaderValue::from_static("mytoken"));
        assert!(token.matches(&headers));
        headers.insert("authorization", HeaderValue::from_static("other"));
        assert!(!token.matches(&headers));

        let empty = AuthMethodToken::default();
        assert!(!empty.matches(&headers));
    }

    #[test]
    fn test_claim_matcher() {
        let exact = ClaimMatcher { exact: "user@example.com".to_string(), suffix: String::new() };
        assert!(exact.matches("user@example.com"));
        assert!(!exact.matches("other@example.com"));

        let suffix = ClaimMatcher { exact: String::new(), suffix: "@example.com".to_string() };
        assert!(suffix.matches("anyone@example.com"));
        assert!(!suffix.matches("anyone@example.org"));

        let neither = ClaimMatcher::default();
        assert!(!neither.matches("anything"));
    }

    #[test]
    fn test_match_claims() {
        let oidc = AuthMethodAmznOidc {
            claim: "email".to_string(),
            matchers: vec![ClaimMatcher {
                exact: String::new(),
                suffix: "@example.com".to_string(),
            }],
            verifier: None,
        };
        let mut claims = serde_json::Map::new();
        claims.insert("email".to_string(), serde_json::json!("dev@example.com"));
        assert!(oidc.match_claims(&claims));

        claims.insert("email".to_string(), serde_json::json!("dev@example.org"));
        assert!(!oidc.match_claims(&claims));

        claims.remove("email");
        assert!(!oidc.match_claims(&claims));

        claims.insert("email".to_string(), serde_json::json!(42));
        assert!(!oidc.match_claims(&claims));
    }

    #[test]
    fn test_cookie_roundtrip() {
        let auth = test_auth();
        let cookie = auth
            .new_auth_cookie(Duration::from_secs(60), ".example.net")
            .unwrap()
            .unwrap();
        assert!(cookie.starts_with("mirage-ecs-auth="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Domain=.example.net"));

        let value = cookie
            .trim_start_matches("mirage-ecs-auth=")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert!(auth.validate_auth_cookie(&value).is_ok());

        // Tampering invalidates the signature.
        let mut tampered = value.clone();
        tampered.push('x');
        assert!(auth.validate_auth_cookie(&tampered).is_err());

        // A different secret fails.
        let other = Auth { cookie_secret: "other-secret".to_string(), ..Auth::default() };
        assert!(other.validate_auth_cookie(&value).is_err());
    }

    #[tokio::test]
    async fn test_cookie_expiry() {
        let auth = test_auth();
        let cookie = auth
            .new_auth_cookie(Duration::from_secs(1), ".example.net")
            .unwrap()
            .unwrap();
        let value = cookie
            .trim_start_matches("mirage-ecs-auth=")
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert!(auth.validate_auth_cookie(&value).is_ok());
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let err = auth.validate_auth_cookie(&value).unwrap_err();
        assert!(err.to_string().contains("expired"), "got: {err}");
    }

    #[test]
    fn test_cookie_without_secret() {
        let auth = Auth::default();
        assert!(auth
            .new_auth_cookie(Duration::from_secs(60), ".example.net")
            .unwrap()
            .is_none());
        assert!(auth.validate_auth_cookie("anything").is_err());
    }

    #[tokio::test]
    async fn test_chain_order_token_wins() {
        let auth = test_auth();
        let mut headers = HeaderMap::new();
        headers.insert("x-mirage-token", HeaderValue::from_static("secret-token"));
        headers.insert(hyper::header::AUTHORIZATION, basic_header("admin", "wrong"));
        let decision = auth.authorize(&headers, WEB_METHODS).await.unwrap();
        assert!(decision.allowed);
        assert!(!decision.challenge_basic);
    }

    #[tokio::test]
    async fn test_chain_none_allowed_challenges_basic() {
        let auth = test_auth();
        let headers = HeaderMap::new();
        let decision = auth.authorize(&headers, WEB_METHODS).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.challenge_basic);

        // API chain never reaches Basic, so no challenge.
        let decision = auth.authorize(&headers, API_METHODS).await.unwrap();
        assert!(!decision.allowed);
        assert!(!decision.challenge_basic);
    }

    #[tokio::test]
    async fn test_api_chain_rejects_basic_credentials() {
        let auth = test_auth();
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::AUTHORIZATION, basic_header("admin", "pass"));
        let decision = auth.authorize(&headers, API_METHODS).await.unwrap();
        assert!(!decision.allowed);

        let decision = auth.authorize(&headers, WEB_METHODS).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_cookie_authorizes_web_chain() {
        let auth = test_auth();
        let cookie = auth
            .new_auth_cookie(Duration::from_secs(60), ".example.net")
            .unwrap()
            .unwrap();
        let value = cookie.split(';').next().unwrap().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::COOKIE, HeaderValue::from_str(&value).unwrap());

        let decision = auth.authorize(&headers, WEB_METHODS).await.unwrap();
        assert!(decision.allowed);

        // The cookie is not part of the API chain.
        let decision = auth.authorize(&headers, API_METHODS).await.unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn test_cookie_value_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::COOKIE,
            HeaderValue::from_static("other=1; mirage-ecs-auth=abc123; more=2"),
        );
        assert_eq!(cookie_value(&headers, AUTH_COOKIE_NAME), Some("abc123".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);

        headers.insert(hyper::header::COOKIE, HeaderValue::from_static("mirage-ecs-auth="));
        assert_eq!(cookie_value(&headers, AUTH_COOKIE_NAME), None);
    }
}
