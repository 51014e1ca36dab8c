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

use super::{merge_key_and_chain, CertStore};
use crate::error::Result;
use crate::exec::{ExternalCommand, FailurePolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

static LOG_TARGET: &str = "certwrap::certificate";

/// Default source root, the ACME client's live directory.
pub const DEFAULT_LETS_ENCRYPT_ROOT: &str = "/etc/letsencrypt/live";

/// Alternate validation port for renewals, the proxy holds :80 and :443
/// while running.
const RENEW_PORT: u16 = 8443;

/// ACME issuance and renewal cover network round trips and challenge
/// validation.
const ACME_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Issues staging certificates through the ACME client in standalone,
/// non-interactive mode.
///
/// Failure policy is asymmetric on purpose: initial generation is best
/// effort (a non-zero exit is logged, the merge step reports missing
/// material and the next cycle retries), while a renewal failure is
/// propagated so the pass never counts a stale certificate as renewed.
#[derive(Debug)]
pub struct LetsEncryptIssuer {
    root: PathBuf,
    email: String,
    force_renewal: bool,
    certbot_bin: String,
}

impl LetsEncryptIssuer {
    pub fn new<P: Into<PathBuf>>(
        root: P,
        email: &str,
        force_renewal: bool,
    ) -> Self {
        Self {
            root: root.into(),
            email: email.to_string(),
            force_renewal,
            certbot_bin: "certbot".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_certbot_bin(mut self, bin: &str) -> Self {
        self.certbot_bin = bin.to_string();
        self
    }

    fn source_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    fn issuance_command(&self, domain: &str, renew: bool) -> ExternalCommand {
        let mut args = vec![
            "certonly".to_string(),
            "--standalone".to_string(),
            "--agree-tos".to_string(),
            "--non-interactive".to_string(),
            "--test-cert".to_string(),
        ];
        if renew {
            args.push("--http-01-port".to_string());
            args.push(RENEW_PORT.to_string());
        }
        args.push("--domain".to_string());
        args.push(domain.to_string());
        args.push("--email".to_string());
        args.push(self.email.clone());
        if self.force_renewal {
            args.push("--force-renewal".to_string());
        }
        ExternalCommand {
            program: self.certbot_bin.clone(),
            args,
        }
    }

    pub fn generate_certificate(
        &self,
        store: &CertStore,
        domain: &str,
    ) -> Result<()> {
        info!(
            target: LOG_TARGET,
            domain,
            "generate stage certificate via acme client"
        );
        self.issuance_command(domain, false)
            .run_with_policy(ACME_TIMEOUT, FailurePolicy::Tolerate)?;
        merge_key_and_chain(store, &self.source_dir(domain), domain)
    }

    pub fn renew_certificate(
        &self,
        store: &CertStore,
        domain: &str,
    ) -> Result<()> {
        info!(
            target: LOG_TARGET,
            domain,
            "renew stage certificate via acme client"
        );
        self.issuance_command(domain, true)
            .run_with_policy(ACME_TIMEOUT, FailurePolicy::Propagate)?;
        merge_key_and_chain(store, &self.source_dir(domain), domain)
    }
}

#[cfg(test)]
mod tests {
    use super::LetsEncryptIssuer;
    use crate::certificate::CertStore;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_issuance_command() {
        let issuer =
            LetsEncryptIssuer::new("/etc/letsencrypt/live", "admin@example.com", false);
        let cmd = issuer.issuance_command("example.com", false);
        assert_eq!(
            "certbot certonly --standalone --agree-tos --non-interactive \
--test-cert --domain example.com --email admin@example.com",
            cmd.to_string()
        );

        let issuer =
            LetsEncryptIssuer::new("/etc/letsencrypt/live", "admin@example.com", true);
        let cmd = issuer.issuance_command("example.com", true);
        assert_eq!(
            "certbot certonly --standalone --agree-tos --non-interactive \
--test-cert --http-01-port 8443 --domain example.com \
--email admin@example.com --force-renewal",
            cmd.to_string()
        );
    }

    #[test]
    fn test_generation_failure_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        // a failing client exit is tolerated on the generation path, the
        // missing material is reported by the merge step instead
        let issuer = LetsEncryptIssuer::new(
            dir.path().join("live"),
            "admin@example.com",
            false,
        )
        .with_certbot_bin("false");

        let err = issuer
            .generate_certificate(&store, "example.com")
            .unwrap_err();
        match err {
            Error::MissingInput { files } => assert_eq!(2, files.len()),
            _ => panic!("expected missing input error"),
        }
    }

    #[test]
    fn test_renewal_failure_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path().join("cert"));
        let issuer = LetsEncryptIssuer::new(
            dir.path().join("live"),
            "admin@example.com",
            false,
        )
        .with_certbot_bin("false");

        let err = issuer.renew_certificate(&store, "example.com").unwrap_err();
        match err {
            Error::CommandFailed { code, .. } => assert_eq!(1, code),
            _ => panic!("expected command failed error"),
        }
    }
}
