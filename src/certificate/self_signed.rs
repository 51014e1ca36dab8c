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

use super::{merge_key_and_chain, CertStore, SOURCE_FILES};
use crate::error::{Error, Result};
use crate::exec::{ExternalCommand, FailurePolicy};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

static LOG_TARGET: &str = "certwrap::certificate";

/// Default source root for self-signed material.
pub const DEFAULT_SELF_SIGNED_ROOT: &str = "/var/self_signed_cert";

const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Issues self-signed certificates through the certificate authority CLI.
///
/// A self-signed certificate has no external renewal concept, renewal is
/// always a full regeneration. Local tool failures are never expected,
/// both paths use the strict failure policy.
#[derive(Debug)]
pub struct SelfSignedIssuer {
    root: PathBuf,
    lifetime_days: u32,
    openssl_bin: String,
}

impl SelfSignedIssuer {
    pub fn new<P: Into<PathBuf>>(root: P, lifetime_days: u32) -> Self {
        Self {
            root: root.into(),
            lifetime_days,
            openssl_bin: "openssl".to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_openssl_bin(mut self, bin: &str) -> Self {
        self.openssl_bin = bin.to_string();
        self
    }

    fn source_dir(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    pub fn generate_certificate(
        &self,
        store: &CertStore,
        domain: &str,
    ) -> Result<()> {
        info!(
            target: LOG_TARGET,
            domain,
            lifetime_days = self.lifetime_days,
            "generate self signed certificate"
        );
        let source_dir = self.source_dir(domain);
        fs::create_dir_all(&source_dir).map_err(|e| Error::Io {
            source: e,
            path: source_dir.to_string_lossy().to_string(),
        })?;
        let cmd = ExternalCommand::new(
            &self.openssl_bin,
            &[
                "req",
                "-new",
                "-nodes",
                "-x509",
                "-subj",
                &format!("/CN={domain}"),
                "-days",
                &self.lifetime_days.to_string(),
                "-keyout",
                source_dir.join(SOURCE_FILES[0]).to_string_lossy().as_ref(),
                "-out",
                source_dir.join(SOURCE_FILES[1]).to_string_lossy().as_ref(),
                "-extensions",
                "v3_ca",
            ],
        );
        cmd.run_with_policy(GENERATE_TIMEOUT, FailurePolicy::Propagate)?;
        merge_key_and_chain(store, &source_dir, domain)
    }

    pub fn renew_certificate(
        &self,
        store: &CertStore,
        domain: &str,
    ) -> Result<()> {
        self.generate_certificate(store, domain)
    }
}
