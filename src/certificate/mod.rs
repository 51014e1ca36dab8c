// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::{Error, Result};
use crate::exec::ExternalCommand;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

mod lets_encrypt;
mod self_signed;

pub use lets_encrypt::{LetsEncryptIssuer, DEFAULT_LETS_ENCRYPT_ROOT};
pub use self_signed::{SelfSignedIssuer, DEFAULT_SELF_SIGNED_ROOT};

static LOG_TARGET: &str = "certwrap::certificate";

/// Default directory for merged proxy-facing certificates.
pub const DEFAULT_CERT_DIR: &str = "/var/cert";

/// Source file names every strategy writes per domain, merged in this
/// order (key first, then chain).
pub const SOURCE_FILES: [&str; 2] = ["privkey.pem", "fullchain.pem"];

/// Timeout for certificate inspection and self-signed generation.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves the proxy-facing merged certificate path for a domain.
#[derive(Debug, Clone)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The single merged file the proxy consumes for a domain.
    pub fn merged_path(&self, domain: &str) -> PathBuf {
        self.root.join(format!("{domain}.pem"))
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new(DEFAULT_CERT_DIR)
    }
}

/// Parses the `notAfter=...` line emitted by the inspection tool into an
/// absolute time. Returns `None` for any malformed input, the caller
/// treats that as "needs renewal".
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let value = output.trim().split_once('=')?.1.trim();
    // openssl ctime format, e.g. "Jun  1 12:00:00 2026 GMT"
    let parsed =
        NaiveDateTime::parse_from_str(value, "%b %e %H:%M:%S %Y GMT").ok()?;
    Some(parsed.and_utc())
}

/// Pure renewal decision: due once now reaches `not_after - lead`.
pub fn renewal_due(
    not_after: DateTime<Utc>,
    lead: Duration,
    now: DateTime<Utc>,
) -> bool {
    let renew_at = not_after - chrono::Duration::seconds(lead.as_secs() as i64);
    now >= renew_at
}

/// Concatenates a strategy's per-domain key and chain files into the
/// merged target, key first. Collects every missing input before failing
/// so one pass shows the full diagnosis.
pub fn merge_key_and_chain(
    store: &CertStore,
    source_dir: &Path,
    domain: &str,
) -> Result<()> {
    info!(
        target: LOG_TARGET,
        domain,
        "merge key and certificate chain"
    );
    let inputs: Vec<PathBuf> =
        SOURCE_FILES.iter().map(|name| source_dir.join(name)).collect();
    let missing: Vec<String> = inputs
        .iter()
        .filter(|path| !path.exists())
        .map(|path| path.to_string_lossy().to_string())
        .collect();
    if !missing.is_empty() {
        for path in missing.iter() {
            error!(
                target: LOG_TARGET,
                domain,
                path,
                "required certificate file does not exist"
            );
        }
        return Err(Error::MissingInput { files: missing });
    }

    let target = store.merged_path(domain);
    if let Some(dir) = target.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::Io {
            source: e,
            path: dir.to_string_lossy().to_string(),
        })?;
    }
    let mut merged = Vec::new();
    for path in inputs.iter() {
        let data = fs::read(path).map_err(|e| Error::Io {
            source: e,
            path: path.to_string_lossy().to_string(),
        })?;
        merged.extend_from_slice(&data);
    }
    // replace, never append
    let mut file = fs::File::create(&target).map_err(|e| Error::Io {
        source: e,
        path: target.to_string_lossy().to_string(),
    })?;
    file.write_all(&merged).map_err(|e| Error::Io {
        source: e,
        path: target.to_string_lossy().to_string(),
    })?;
    Ok(())
}

/// A closed set of certificate issuance strategies, selected once at
/// startup.
#[derive(Debug)]
pub enum RenewalStrategy {
    SelfSigned(SelfSignedIssuer),
    LetsEncrypt(LetsEncryptIssuer),
}

impl RenewalStrategy {
    fn generate_certificate(
        &self,
        store: &CertStore,
        domain: &str,
    ) -> Result<()> {
        match self {
            RenewalStrategy::SelfSigned(issuer) => {
                issuer.generate_certificate(store, domain)
            },
            RenewalStrategy::LetsEncrypt(issuer) => {
                issuer.generate_certificate(store, domain)
            },
        }
    }

    fn renew_certificate(&self, store: &CertStore, domain: &str) -> Result<()> {
        match self {
            RenewalStrategy::SelfSigned(issuer) => {
                issuer.renew_certificate(store, domain)
            },
            RenewalStrategy::LetsEncrypt(issuer) => {
                issuer.renew_certificate(store, domain)
            },
        }
    }
}

/// Per-process renewal policy, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct RenewalPolicy {
    pub renew_before_expiry: Duration,
}

/// Composes the renewal decision engine, a strategy and the merger over
/// a fixed domain list.
pub struct CertificateManager {
    domains: Vec<String>,
    store: CertStore,
    policy: RenewalPolicy,
    strategy: RenewalStrategy,
    inspect_bin: String,
}

impl CertificateManager {
    pub fn new(
        domains: Vec<String>,
        store: CertStore,
        policy: RenewalPolicy,
        strategy: RenewalStrategy,
    ) -> Self {
        Self {
            domains,
            store,
            policy,
            strategy,
            inspect_bin: "openssl".to_string(),
        }
    }

    /// Reads the encoded not-after time of the merged certificate through
    /// the inspection tool. Any spawn, exit, decode or parse failure
    /// yields `None`.
    fn read_not_after(&self, path: &Path) -> Option<DateTime<Utc>> {
        let cmd = ExternalCommand::new(
            &self.inspect_bin,
            &[
                "x509",
                "-enddate",
                "-noout",
                "-in",
                path.to_string_lossy().as_ref(),
            ],
        );
        let output = match cmd.run_capture(TOOL_TIMEOUT) {
            Ok(output) => output,
            Err(e) => {
                error!(
                    target: LOG_TARGET,
                    error = %e,
                    path = path.to_string_lossy().to_string(),
                    "fail to inspect certificate"
                );
                return None;
            },
        };
        let not_after = parse_not_after(&output);
        if not_after.is_none() {
            error!(
                target: LOG_TARGET,
                output = output.trim(),
                "fail to parse certificate validity time"
            );
        }
        not_after
    }

    /// Whether the domain's certificate is absent, unreadable or inside
    /// its renewal window. Fail-open: untrustworthy state is renewed.
    pub fn needs_renewal(&self, domain: &str) -> bool {
        info!(target: LOG_TARGET, domain, "check certificate validity");
        let path = self.store.merged_path(domain);
        if !path.is_file() {
            info!(target: LOG_TARGET, domain, "no certificate found");
            return true;
        }
        let Some(not_after) = self.read_not_after(&path) else {
            return true;
        };
        let now = Utc::now();
        let renew = renewal_due(not_after, self.policy.renew_before_expiry, now);
        info!(
            target: LOG_TARGET,
            domain,
            expires_at = not_after.to_rfc3339(),
            renew_at = (not_after
                - chrono::Duration::seconds(
                    self.policy.renew_before_expiry.as_secs() as i64,
                ))
            .to_rfc3339(),
            renew,
            "certificate validity checked"
        );
        renew
    }

    /// Offline startup pass: generate every absent or expiring
    /// certificate. Domains are processed independently, one failure is
    /// logged and the pass continues.
    pub fn ensure_all(&self) {
        info!(
            target: LOG_TARGET,
            "generating certificates if required (offline mode)"
        );
        for domain in self.domains.iter() {
            if !self.needs_renewal(domain) {
                continue;
            }
            if let Err(e) = self.strategy.generate_certificate(&self.store, domain)
            {
                error!(
                    target: LOG_TARGET,
                    domain,
                    error = %e,
                    "fail to generate certificate"
                );
            }
        }
    }

    /// Online pass: renew every certificate inside its renewal window and
    /// return how many actually changed. A failed domain is logged,
    /// skipped and retried next cycle.
    pub fn renew_due(&self) -> usize {
        info!(
            target: LOG_TARGET,
            "renewing certificates if required (online mode)"
        );
        let mut changed = 0;
        for domain in self.domains.iter() {
            if !self.needs_renewal(domain) {
                continue;
            }
            match self.strategy.renew_certificate(&self.store, domain) {
                Ok(()) => changed += 1,
                Err(e) => {
                    error!(
                        target: LOG_TARGET,
                        domain,
                        error = %e,
                        "fail to renew certificate"
                    );
                },
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn new_manager(
        domains: &[&str],
        store: CertStore,
        strategy: RenewalStrategy,
    ) -> CertificateManager {
        CertificateManager::new(
            domains.iter().map(|item| item.to_string()).collect(),
            store,
            RenewalPolicy {
                renew_before_expiry: Duration::from_secs(2 * 24 * 3600),
            },
            strategy,
        )
    }

    #[test]
    fn test_merged_path() {
        let store = CertStore::new("/var/cert");
        assert_eq!(
            "/var/cert/example.com.pem",
            store.merged_path("example.com").to_string_lossy()
        );
    }

    #[test]
    fn test_parse_not_after() {
        let not_after =
            parse_not_after("notAfter=Jun  1 12:00:00 2026 GMT\n").unwrap();
        assert_eq!("2026-06-01 12:00:00 UTC", not_after.to_string());

        assert_eq!(true, parse_not_after("").is_none());
        assert_eq!(true, parse_not_after("notAfter=tomorrow").is_none());
        assert_eq!(true, parse_not_after("no equals sign").is_none());
    }

    #[test]
    fn test_renewal_due() {
        let lead = Duration::from_secs(2 * 24 * 3600);
        let now = Utc::now();
        // expires one second inside the renewal window
        let not_after = now + chrono::Duration::seconds(lead.as_secs() as i64 - 1);
        assert_eq!(true, renewal_due(not_after, lead, now));
        // expires one hour beyond the renewal window
        let not_after =
            now + chrono::Duration::seconds(lead.as_secs() as i64 + 3600);
        assert_eq!(false, renewal_due(not_after, lead, now));
    }

    #[test]
    fn test_needs_renewal_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(
            &["example.com"],
            CertStore::new(dir.path()),
            RenewalStrategy::SelfSigned(SelfSignedIssuer::new(
                dir.path().join("src"),
                90,
            )),
        );
        assert_eq!(true, manager.needs_renewal("example.com"));
    }

    #[test]
    fn test_needs_renewal_unparseable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path());
        std::fs::write(store.merged_path("example.com"), "not a certificate")
            .unwrap();
        let manager = new_manager(
            &["example.com"],
            store,
            RenewalStrategy::SelfSigned(SelfSignedIssuer::new(
                dir.path().join("src"),
                90,
            )),
        );
        // inspection fails on garbage input, fail open toward renewal
        assert_eq!(true, manager.needs_renewal("example.com"));
    }

    #[test]
    fn test_merge_key_and_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        let source_dir = dir.path().join("source").join("example.com");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("privkey.pem"), "KEY\n").unwrap();
        std::fs::write(source_dir.join("fullchain.pem"), "CHAIN\n").unwrap();

        merge_key_and_chain(&store, &source_dir, "example.com").unwrap();
        let first =
            std::fs::read_to_string(store.merged_path("example.com")).unwrap();
        assert_eq!("KEY\nCHAIN\n", first);

        // unchanged inputs give byte identical output
        merge_key_and_chain(&store, &source_dir, "example.com").unwrap();
        let second =
            std::fs::read_to_string(store.merged_path("example.com")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_lists_all_missing_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        let source_dir = dir.path().join("source").join("example.com");
        let err = merge_key_and_chain(&store, &source_dir, "example.com")
            .unwrap_err();
        match err {
            Error::MissingInput { files } => assert_eq!(2, files.len()),
            _ => panic!("expected missing input error"),
        }
    }

    #[test]
    fn test_renew_due_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        // a broken issuer binary fails every domain, the pass still
        // visits both and renews nothing
        let issuer = SelfSignedIssuer::new(dir.path().join("src"), 90)
            .with_openssl_bin("certwrap-no-such-tool");
        let manager = new_manager(
            &["a.example.com", "b.example.com"],
            CertStore::new(dir.path().join("cert")),
            RenewalStrategy::SelfSigned(issuer),
        );
        assert_eq!(0, manager.renew_due());
    }

    #[test]
    fn test_renew_due_renews_only_due_domains() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        let src = dir.path().join("src");
        // one day of lifetime left puts the domain inside the two day
        // renewal window, ninety days keeps the other one out of it
        SelfSignedIssuer::new(&src, 1)
            .generate_certificate(&store, "a.example.com")
            .unwrap();
        SelfSignedIssuer::new(&src, 90)
            .generate_certificate(&store, "b.example.com")
            .unwrap();
        let fresh = std::fs::read(store.merged_path("b.example.com")).unwrap();

        let manager = new_manager(
            &["a.example.com", "b.example.com"],
            store.clone(),
            RenewalStrategy::SelfSigned(SelfSignedIssuer::new(&src, 90)),
        );
        assert_eq!(1, manager.renew_due());
        // the renewed domain left the window, the other file is untouched
        assert_eq!(false, manager.needs_renewal("a.example.com"));
        assert_eq!(
            fresh,
            std::fs::read(store.merged_path("b.example.com")).unwrap()
        );
    }

    #[test]
    fn test_ensure_all_generates_missing_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        let issuer = SelfSignedIssuer::new(dir.path().join("src"), 90);
        let manager = new_manager(
            &["a.example.com", "b.example.com"],
            store.clone(),
            RenewalStrategy::SelfSigned(issuer),
        );

        manager.ensure_all();

        for domain in ["a.example.com", "b.example.com"] {
            assert_eq!(true, store.merged_path(domain).is_file());
            // freshly generated certificates are not due again
            assert_eq!(false, manager.needs_renewal(domain));
        }
    }
}
