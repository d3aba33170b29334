//! Policy bundle loader (C2): parse, validate, size-guard, verify signature.
//!
//! Grounded on the general "read boundary, canonicalize, hash" flow the
//! teacher uses for tool signing (`mcp::signing`), narrowed to HMAC-SHA256
//! over a *shallow*, top-level-only canonicalization (spec's design note:
//! deep JCS would break wire compatibility and is explicitly out of scope).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::Value as Json;
use sha2::Sha256;

use crate::errors::LoaderError;
use crate::schema::PolicyBundle;

type HmacSha256 = Hmac<Sha256>;

pub const MAX_BUNDLE_BYTES: u64 = 1024 * 1024;
pub const MAX_DEPTH: u32 = 20;
pub const MAX_RULES: usize = 1000;

/// Where a bundle's bytes come from. An async source is polled once per
/// `reload_policy_async` / `init()` call by the engine; it is not retried
/// internally.
pub enum PolicySource {
    Path(PathBuf),
    Json(String),
    Parsed(Box<PolicyBundle>),
}

/// Loader configuration. `base_dir` anchors the path-traversal guard;
/// `secret` is the shared HMAC key (absent ⇒ signature verification is
/// skipped entirely, matching "verify HMAC-SHA256 signature" being listed
/// as optional in §4.1 step 7).
pub struct LoaderConfig {
    pub base_dir: PathBuf,
    pub max_size_bytes: u64,
    pub secret: Option<Vec<u8>>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_size_bytes: MAX_BUNDLE_BYTES,
            secret: None,
        }
    }
}

/// Loads, validates, and (if a secret is configured) signature-verifies a
/// policy bundle from any of the supported sources.
pub fn load_bundle(source: &PolicySource, config: &LoaderConfig) -> Result<PolicyBundle, LoaderError> {
    match source {
        PolicySource::Path(path) => {
            let bytes = read_guarded_file(path, config)?;
            load_from_bytes(&bytes, config)
        }
        PolicySource::Json(text) => load_from_bytes(text.as_bytes(), config),
        PolicySource::Parsed(bundle) => {
            // Parsed bundles still go through semantic validation and
            // signature verification (re-serialized for canonicalization),
            // but skip the parse/depth/shape steps, which only apply to raw
            // bytes.
            let bundle = (**bundle).clone();
            validate_semantics(&bundle)?;
            if config.secret.is_some() {
                let json = serde_json::to_value(&bundle)
                    .map_err(|e| LoaderError::ParseError(e.to_string()))?;
                verify_signature(&json, config)?;
            }
            Ok(bundle)
        }
    }
}

fn read_guarded_file(path: &Path, config: &LoaderConfig) -> Result<Vec<u8>, LoaderError> {
    let resolved_base = config
        .base_dir
        .canonicalize()
        .unwrap_or_else(|_| config.base_dir.clone());

    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        config.base_dir.join(path)
    };

    // Canonicalize only the containing directory, then rejoin the file
    // name. Canonicalizing the full candidate would follow a symlink in the
    // final component too, so `resolved` would already point at the link's
    // target and the symlink check below would never see a symlink (TOCTOU).
    let file_name = candidate
        .file_name()
        .ok_or_else(|| LoaderError::FileNotFound(path.display().to_string()))?;
    let parent = candidate.parent().unwrap_or_else(|| Path::new("."));
    let resolved_parent = parent
        .canonicalize()
        .map_err(|_| LoaderError::FileNotFound(path.display().to_string()))?;
    let resolved = resolved_parent.join(file_name);

    if !resolved_parent.starts_with(&resolved_base) {
        return Err(LoaderError::PathTraversal(path.display().to_string()));
    }

    let meta = fs::symlink_metadata(&resolved)
        .map_err(|_| LoaderError::FileNotFound(path.display().to_string()))?;
    if meta.file_type().is_symlink() {
        return Err(LoaderError::SymlinkRejected(path.display().to_string()));
    }
    if !meta.file_type().is_file() {
        return Err(LoaderError::NotRegularFile(path.display().to_string()));
    }
    if meta.len() > config.max_size_bytes {
        return Err(LoaderError::TooLarge {
            actual: meta.len(),
            limit: config.max_size_bytes,
        });
    }

    fs::read(&resolved).map_err(LoaderError::Io)
}

fn load_from_bytes(bytes: &[u8], config: &LoaderConfig) -> Result<PolicyBundle, LoaderError> {
    if bytes.len() as u64 > config.max_size_bytes {
        return Err(LoaderError::TooLarge {
            actual: bytes.len() as u64,
            limit: config.max_size_bytes,
        });
    }

    let json: Json = serde_json::from_slice(bytes)
        .map_err(|e| LoaderError::ParseError(e.to_string()))?;

    let depth = structural_depth(&json, 0, MAX_DEPTH + 1);
    if depth > MAX_DEPTH {
        return Err(LoaderError::ExcessiveDepth { limit: MAX_DEPTH });
    }

    let bundle: PolicyBundle = serde_json::from_value(json.clone())
        .map_err(|e| LoaderError::ShapeInvalid {
            field: "<bundle>".to_string(),
            detail: e.to_string(),
        })?;

    if bundle.rules.len() > MAX_RULES {
        return Err(LoaderError::TooManyRules {
            actual: bundle.rules.len(),
            limit: MAX_RULES,
        });
    }

    validate_semantics(&bundle)?;

    if config.secret.is_some() {
        verify_signature(&json, config)?;
    }

    Ok(bundle)
}

/// Computes structural nesting depth, short-circuiting once `limit` is
/// exceeded so a deeply nested attacker payload cannot cause unbounded
/// recursion cost.
fn structural_depth(value: &Json, current: u32, limit: u32) -> u32 {
    if current >= limit {
        return current;
    }
    match value {
        Json::Array(items) => items
            .iter()
            .map(|v| structural_depth(v, current + 1, limit))
            .max()
            .unwrap_or(current + 1),
        Json::Object(map) => map
            .values()
            .map(|v| structural_depth(v, current + 1, limit))
            .max()
            .unwrap_or(current + 1),
        _ => current,
    }
}

fn validate_semantics(bundle: &PolicyBundle) -> Result<(), LoaderError> {
    if bundle.generated_at >= bundle.expires_at {
        return Err(LoaderError::GeneratedAfterExpiry);
    }
    if bundle.expires_at <= Utc::now() {
        return Err(LoaderError::Expired);
    }
    if bundle.rules.len() > MAX_RULES {
        return Err(LoaderError::TooManyRules {
            actual: bundle.rules.len(),
            limit: MAX_RULES,
        });
    }
    Ok(())
}

/// Removes `signature`, sorts *top-level* keys only, and serializes to
/// canonical UTF-8 bytes. Nested object key order is left exactly as parsed
/// — this is the spec's documented divergence from full JCS.
pub fn canonicalize_for_signing(bundle_json: &Json) -> Result<Vec<u8>, LoaderError> {
    let map = bundle_json
        .as_object()
        .ok_or_else(|| LoaderError::ParseError("bundle is not a JSON object".to_string()))?;

    let mut sorted: Vec<(&String, &Json)> = map.iter().filter(|(k, _)| k.as_str() != "signature").collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut out = Vec::new();
    out.push(b'{');
    for (i, (key, value)) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        let key_json = serde_json::to_string(key).map_err(|e| LoaderError::ParseError(e.to_string()))?;
        out.extend_from_slice(key_json.as_bytes());
        out.push(b':');
        let value_json =
            serde_json::to_string(value).map_err(|e| LoaderError::ParseError(e.to_string()))?;
        out.extend_from_slice(value_json.as_bytes());
    }
    out.push(b'}');
    Ok(out)
}

fn hmac_hex(bytes: &[u8], secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(bytes);
    hex::encode(mac.finalize().into_bytes())
}

/// Byte-for-byte comparison with data-independent timing. Never short-
/// circuits on the first mismatch, and always walks the full length of
/// `a` — mismatched lengths are treated as unequal without leaking which
/// byte differed or by how much.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn is_valid_hex_signature(candidate: &str) -> bool {
    candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

fn verify_signature(bundle_json: &Json, config: &LoaderConfig) -> Result<(), LoaderError> {
    let secret = config
        .secret
        .as_ref()
        .expect("verify_signature only called when a secret is configured");

    let candidate = bundle_json
        .get("signature")
        .and_then(Json::as_str)
        .unwrap_or("");

    // Shape-check before decoding; any failure below collapses to the same
    // generic error so a mismatch never discloses which check failed.
    if !is_valid_hex_signature(&candidate.to_lowercase()) {
        return Err(LoaderError::SignatureVerificationFailed);
    }

    let canonical =
        canonicalize_for_signing(bundle_json).map_err(|_| LoaderError::SignatureVerificationFailed)?;
    let expected = hmac_hex(&canonical, secret);

    if constant_time_eq(expected.as_bytes(), candidate.to_lowercase().as_bytes()) {
        Ok(())
    } else {
        Err(LoaderError::SignatureVerificationFailed)
    }
}

/// Computes and writes back a signature into a bundle's JSON representation.
/// Used by operators (and the CLI) to produce a signed bundle offline.
pub fn sign_bundle(bundle: &PolicyBundle, secret: &[u8]) -> Result<Json, LoaderError> {
    let mut json = serde_json::to_value(bundle).map_err(|e| LoaderError::ParseError(e.to_string()))?;
    if let Json::Object(map) = &mut json {
        map.remove("signature");
    }
    let canonical = canonicalize_for_signing(&json)?;
    let signature = hmac_hex(&canonical, secret);
    if let Json::Object(map) = &mut json {
        map.insert("signature".to_string(), Json::String(signature));
    }
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Defaults, Outcome};
    use chrono::Duration;

    fn sample_bundle() -> PolicyBundle {
        PolicyBundle {
            version: "1.0.0".to_string(),
            generated_at: Utc::now() - Duration::hours(1),
            expires_at: Utc::now() + Duration::hours(1),
            rules: vec![],
            defaults: Defaults { outcome: Outcome::Allow },
            signature: None,
        }
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let bundle = sample_bundle();
        let secret = b"top-secret".to_vec();
        let signed = sign_bundle(&bundle, &secret).unwrap();

        let config = LoaderConfig {
            secret: Some(secret),
            ..Default::default()
        };
        let text = serde_json::to_string(&signed).unwrap();
        let loaded = load_from_bytes(text.as_bytes(), &config).unwrap();
        assert_eq!(loaded.version, "1.0.0");
    }

    #[test]
    fn wrong_secret_fails_generically() {
        let bundle = sample_bundle();
        let signed = sign_bundle(&bundle, b"secret-a").unwrap();

        let config = LoaderConfig {
            secret: Some(b"secret-b".to_vec()),
            ..Default::default()
        };
        let text = serde_json::to_string(&signed).unwrap();
        let err = load_from_bytes(text.as_bytes(), &config).unwrap_err();
        assert!(matches!(err, LoaderError::SignatureVerificationFailed));
    }

    #[test]
    fn resigning_with_same_secret_yields_same_signature() {
        let bundle = sample_bundle();
        let secret = b"stable".to_vec();
        let first = sign_bundle(&bundle, &secret).unwrap();
        let second = sign_bundle(&bundle, &secret).unwrap();
        assert_eq!(first["signature"], second["signature"]);
    }

    #[test]
    fn expired_bundle_is_rejected() {
        let mut bundle = sample_bundle();
        bundle.expires_at = Utc::now() - Duration::seconds(1);
        let config = LoaderConfig::default();
        let text = serde_json::to_string(&bundle).unwrap();
        let err = load_from_bytes(text.as_bytes(), &config).unwrap_err();
        assert!(matches!(err, LoaderError::Expired));
    }

    #[test]
    fn rule_count_boundary() {
        let mut bundle = sample_bundle();
        for i in 0..MAX_RULES {
            bundle.rules.push(make_rule(i));
        }
        let config = LoaderConfig::default();
        let text = serde_json::to_string(&bundle).unwrap();
        assert!(load_from_bytes(text.as_bytes(), &config).is_ok());

        bundle.rules.push(make_rule(MAX_RULES));
        let text = serde_json::to_string(&bundle).unwrap();
        let err = load_from_bytes(text.as_bytes(), &config).unwrap_err();
        assert!(matches!(err, LoaderError::TooManyRules { .. }));
    }

    fn make_rule(i: usize) -> crate::schema::PolicyRule {
        use crate::schema::{MatchClause, OneOrMany};
        crate::schema::PolicyRule {
            id: format!("rule-{i}"),
            description: String::new(),
            match_clause: MatchClause {
                tool_name: OneOrMany::One("*".to_string()),
                environment: "*".to_string(),
                agent_type: None,
                trust_level_min: None,
                agent_roles_any: vec![],
                tool_provider: None,
            },
            when: None,
            outcome: Outcome::Allow,
            approver_role: None,
            constraints: None,
        }
    }

    #[test]
    fn depth_boundary() {
        // Build a JSON blob with exactly MAX_DEPTH nested arrays under a
        // field that is otherwise ignored by the bundle shape, to isolate
        // the depth guard from shape validation.
        let mut inner = Json::String("leaf".to_string());
        for _ in 0..MAX_DEPTH {
            inner = Json::Array(vec![inner]);
        }
        let depth = structural_depth(&inner, 0, MAX_DEPTH + 5);
        assert_eq!(depth, MAX_DEPTH);

        inner = Json::Array(vec![inner]);
        let depth = structural_depth(&inner, 0, MAX_DEPTH + 5);
        assert_eq!(depth, MAX_DEPTH + 1);
    }
}
