use anyhow::Context as _;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// RS256 JWT validator backed by a cached JWKS.
#[derive(Clone)]
pub struct OidcValidator {
    inner: Arc<Inner>,
}

struct Inner {
    issuer: String,
    audiences: Vec<String>,
    jwks_uri: String,
    leeway_secs: u64,
    refresh_after: Duration,
    http: reqwest::Client,
    jwks: RwLock<JwksCache>,
}

#[derive(Default)]
struct JwksCache {
    next_refresh_after: Option<Instant>,
    last_refresh_attempt: Option<Instant>,
    keys_by_kid: HashMap<String, DecodingKey>,
}

#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub issuer: String,
    pub audiences: Vec<String>,
    /// When absent, resolved through `<issuer>/.well-known/openid-configuration`.
    pub jwks_uri: Option<String>,
    pub leeway_secs: u64,
    pub jwks_refresh_secs: u64,
}

impl OidcValidator {
    /// Build a validator, running discovery when no JWKS URI is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or returns a non-https JWKS URI.
    pub async fn connect(http: reqwest::Client, settings: OidcSettings) -> anyhow::Result<Self> {
        let jwks_uri = match settings.jwks_uri.clone() {
            Some(v) => {
                if !v.starts_with("https://") {
                    tracing::warn!(
                        jwks_uri = %v,
                        "configured jwks uri is not https; use only for local development"
                    );
                }
                v
            }
            None => discover_jwks_uri(&http, &settings.issuer).await?,
        };
        Ok(Self::new(http, settings, jwks_uri))
    }

    #[must_use]
    pub fn new(http: reqwest::Client, settings: OidcSettings, jwks_uri: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer: settings.issuer,
                audiences: settings.audiences,
                jwks_uri,
                leeway_secs: settings.leeway_secs,
                refresh_after: Duration::from_secs(settings.jwks_refresh_secs.max(5)),
                http,
                jwks: RwLock::new(JwksCache::default()),
            }),
        }
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    /// Validate a JWT and return its claims object.
    ///
    /// # Errors
    ///
    /// Returns an error for unsupported headers, unknown key ids, bad signatures, or failed
    /// `iss`/`aud`/`exp`/`nbf` checks.
    pub async fn validate(&self, jwt: &str) -> anyhow::Result<serde_json::Value> {
        let header = jsonwebtoken::decode_header(jwt).context("decode jwt header")?;
        if jwt_has_crit_header(jwt)? {
            anyhow::bail!("unsupported jwt crit header");
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("missing jwt kid"))?;
        if header.alg != Algorithm::RS256 {
            anyhow::bail!("unsupported jwt alg (expected RS256)");
        }

        if let Some(key) = self.cached_key(kid).await
            && let Ok(claims) = self.decode_with_key(jwt, &key)
        {
            return Ok(claims);
        }

        self.refresh_jwks(kid).await?;
        let key = self
            .cached_key(kid)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown jwt kid"))?;
        self.decode_with_key(jwt, &key)
    }

    fn decode_with_key(&self, jwt: &str, key: &DecodingKey) -> anyhow::Result<serde_json::Value> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.inner.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[self.inner.issuer.as_str()]);
        if self.inner.audiences.is_empty() {
            validation.validate_aud = false;
        } else {
            let aud: Vec<&str> = self.inner.audiences.iter().map(String::as_str).collect();
            validation.set_audience(&aud);
        }

        let data = jsonwebtoken::decode::<serde_json::Value>(jwt, key, &validation)
            .context("decode jwt")?;
        Ok(data.claims)
    }

    async fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        self.inner.jwks.read().await.keys_by_kid.get(kid).cloned()
    }

    async fn refresh_jwks(&self, kid: &str) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut cache = self.inner.jwks.write().await;
        let stale = cache.next_refresh_after.is_none_or(|t| now >= t);
        if !stale && cache.keys_by_kid.contains_key(kid) {
            return Ok(());
        }

        // Random kids must not turn into a refresh storm.
        if let Some(last) = cache.last_refresh_attempt
            && now.duration_since(last) < MIN_REFRESH_INTERVAL
        {
            return Ok(());
        }
        cache.last_refresh_attempt = Some(now);

        let (keys_by_kid, ttl) = fetch_jwks(&self.inner.http, &self.inner.jwks_uri).await?;
        cache.keys_by_kid = keys_by_kid;
        cache.next_refresh_after = Some(now + ttl.unwrap_or(self.inner.refresh_after));
        tracing::debug!(
            jwks_uri = %self.inner.jwks_uri,
            keys = cache.keys_by_kid.len(),
            "refreshed jwks"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

async fn discover_jwks_uri(http: &reqwest::Client, issuer: &str) -> anyhow::Result<String> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let doc: OidcDiscovery = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("GET discovery {url}"))?
        .error_for_status()
        .with_context(|| format!("discovery status {url}"))?
        .json()
        .await
        .context("parse discovery json")?;
    let parsed = reqwest::Url::parse(&doc.jwks_uri).context("parse discovered jwks_uri")?;
    if parsed.scheme() != "https" {
        anyhow::bail!(
            "discovery returned non-https jwks_uri; configure auth.oidc.jwksUri to override"
        );
    }
    Ok(doc.jwks_uri)
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(rename = "use", default)]
    use_: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

async fn fetch_jwks(
    http: &reqwest::Client,
    jwks_uri: &str,
) -> anyhow::Result<(HashMap<String, DecodingKey>, Option<Duration>)> {
    let resp = http
        .get(jwks_uri)
        .send()
        .await
        .with_context(|| format!("GET jwks {jwks_uri}"))?
        .error_for_status()
        .with_context(|| format!("jwks status {jwks_uri}"))?;

    let ttl = max_age(resp.headers());
    let jwks: JwksResponse = resp.json().await.context("parse jwks json")?;

    let mut out = HashMap::new();
    for k in jwks.keys {
        if k.kty != "RSA" || k.use_.as_deref().is_some_and(|u| u != "sig") {
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (k.kid, k.n, k.e) else {
            continue;
        };
        let key = DecodingKey::from_rsa_components(&n, &e).context("build rsa decoding key")?;
        out.insert(kid, key);
    }
    if out.is_empty() {
        anyhow::bail!("jwks contains no usable RSA keys");
    }
    Ok((out, ttl))
}

fn max_age(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let v = headers.get(reqwest::header::CACHE_CONTROL)?.to_str().ok()?;
    v.split(',')
        .map(str::trim)
        .filter_map(|part| part.strip_prefix("max-age="))
        .find_map(|secs| secs.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn jwt_has_crit_header(jwt: &str) -> anyhow::Result<bool> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid jwt (expected 3 parts, got {})", parts.len());
    }
    let header_json = URL_SAFE_NO_PAD
        .decode(parts[0])
        .context("base64url decode jwt header")?;
    let header: serde_json::Value =
        serde_json::from_slice(&header_json).context("parse jwt header json")?;
    let header = header
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("invalid jwt header (expected JSON object)"))?;
    Ok(header.contains_key("crit"))
}
