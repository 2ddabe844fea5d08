//! Credential resolution compatible with Docker's `config.json` layout
//! (§6a of the design doc): a mapping from registry URL to either an inline
//! base64 `user:pass`, or a named credential helper invoked as a
//! subprocess under the fixed `get|store|erase|list` protocol.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::process;

const HELPER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Resolved credential for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub secret: String,
}

/// Shape of `~/.docker/config.json`, trimmed to the fields freightliner
/// consumes.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CredentialFile {
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
    #[serde(default, rename = "credHelpers")]
    pub cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore")]
    pub creds_store: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthEntry {
    #[serde(default)]
    pub auth: Option<String>,
}

impl CredentialFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read credential file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse credential file {}", path.display()))
    }

    /// Resolve credentials for `registry_url` in the order: inline `auths`
    /// entry, then a per-registry helper (`credHelpers`), then the global
    /// helper (`credsStore`). Returns `Ok(None)` if nothing is configured
    /// for this registry.
    pub fn resolve(&self, registry_url: &str) -> Result<Option<Credential>> {
        if let Some(entry) = self.auths.get(registry_url)
            && let Some(auth) = &entry.auth
        {
            return Ok(Some(decode_inline_auth(auth)?));
        }

        if let Some(helper) = self.cred_helpers.get(registry_url) {
            return invoke_helper(helper, registry_url);
        }

        if let Some(helper) = &self.creds_store {
            return invoke_helper(helper, registry_url);
        }

        Ok(None)
    }
}

fn decode_inline_auth(auth: &str) -> Result<Credential> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .context("inline auth value is not valid base64")?;
    let text = String::from_utf8(decoded).context("inline auth value is not valid utf-8")?;
    let (username, secret) = text
        .split_once(':')
        .context("inline auth value is not in 'user:pass' form")?;
    Ok(Credential {
        username: username.to_string(),
        secret: secret.to_string(),
    })
}

/// `[A-Za-z0-9_-]{1,64}`, checked before ever spawning a helper process, to
/// prevent command injection via an attacker-controlled config file.
pub fn validate_helper_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        bail!("invalid credential helper name {name:?}: must match [A-Za-z0-9_-]{{1,64}}");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct HelperGetResponse {
    #[serde(rename = "ServerURL")]
    #[allow(dead_code)]
    server_url: String,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Invoke `docker-credential-<helper> get`, writing `registry_url` on
/// stdin and parsing the `{"ServerURL","Username","Secret"}` response.
fn invoke_helper(helper: &str, registry_url: &str) -> Result<Option<Credential>> {
    validate_helper_name(helper)?;
    let program = format!("docker-credential-{helper}");

    let output = process::run_with_timeout(
        &program,
        &["get"],
        Some(registry_url.as_bytes()),
        Some(HELPER_TIMEOUT),
    )
    .with_context(|| format!("failed to invoke credential helper {program}"))?;

    if output.timed_out {
        bail!("credential helper {program} timed out");
    }

    if output.exit_code != 0 {
        // Helpers exit non-zero (often with "credentials not found" on
        // stderr) when nothing is stored for this URL; treat as "no
        // credential configured" rather than a hard error.
        return Ok(None);
    }

    let parsed: HelperGetResponse = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("credential helper {program} returned invalid JSON"))?;

    Ok(Some(Credential {
        username: parsed.username,
        secret: parsed.secret,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_helper_names() {
        assert!(validate_helper_name("ecr-login").is_ok());
        assert!(validate_helper_name("osxkeychain").is_ok());
        assert!(validate_helper_name("").is_err());
        assert!(validate_helper_name("a".repeat(65).as_str()).is_err());
        assert!(validate_helper_name("rm -rf /").is_err());
        assert!(validate_helper_name("; cat /etc/passwd").is_err());
    }

    #[test]
    fn decodes_inline_auth() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let cred = decode_inline_auth(&encoded).unwrap();
        assert_eq!(cred.username, "alice");
        assert_eq!(cred.secret, "s3cret");
    }

    #[test]
    fn rejects_malformed_inline_auth() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("no-colon-here");
        assert!(decode_inline_auth(&encoded).is_err());
    }

    #[test]
    fn resolves_inline_auth_before_helpers() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:s3cret");
        let mut auths = HashMap::new();
        auths.insert(
            "registry.example.com".to_string(),
            AuthEntry {
                auth: Some(encoded),
            },
        );
        let file = CredentialFile {
            auths,
            cred_helpers: HashMap::new(),
            creds_store: None,
        };
        let cred = file.resolve("registry.example.com").unwrap().unwrap();
        assert_eq!(cred.username, "alice");
    }

    #[test]
    fn returns_none_when_nothing_configured() {
        let file = CredentialFile::default();
        assert!(file.resolve("registry.example.com").unwrap().is_none());
    }

    #[test]
    fn load_parses_docker_config_shaped_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"auths":{"registry.example.com":{"auth":"YWxpY2U6czNjcmV0"}},"credHelpers":{"ecr.amazonaws.com":"ecr-login"}}"#,
        )
        .unwrap();
        let file = CredentialFile::load(&path).unwrap();
        assert_eq!(
            file.cred_helpers.get("ecr.amazonaws.com").unwrap(),
            "ecr-login"
        );
        let cred = file.resolve("registry.example.com").unwrap().unwrap();
        assert_eq!(cred.username, "alice");
    }
}
