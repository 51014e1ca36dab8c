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

use certificate::{
    CertStore, CertificateManager, LetsEncryptIssuer, RenewalPolicy,
    RenewalStrategy, SelfSignedIssuer, DEFAULT_CERT_DIR,
};
use clap::{Parser, ValueEnum};
use error::Error;
use process::{ProxyCommand, Supervisor};
use std::time::Duration;
use tracing::error;

mod certificate;
mod error;
mod exec;
mod logger;
mod process;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Generate self-signed certificates locally
    SelfSigned,
    /// Use the ACME staging endpoint
    Stage,
    /// Use the ACME production endpoint (not supported yet)
    Prod,
}

/// A reverse proxy supervisor which keeps TLS certificates fresh.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Certificate mode
    #[arg(long, value_enum)]
    mode: Mode,
    /// Perform a certificate check every INTERVAL
    #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
    cert_check_interval: Duration,
    /// Renew certificates INTERVAL before expiry
    #[arg(long, default_value = "2d", value_parser = humantime::parse_duration)]
    renew_before_expiry: Duration,
    /// Lifetime in days for self-signed certificates, ignored for acme modes
    #[arg(long, default_value = "90")]
    self_signed_lifetime_days: u32,
    /// Email address to register with the acme provider, ignored for
    /// self-signed mode
    #[arg(long, required_if_eq_any([("mode", "stage"), ("mode", "prod")]))]
    email: Option<String>,
    /// Force renewal on the acme provider, ignored for self-signed mode
    #[arg(long)]
    force_renewal: bool,
    /// Directory for merged proxy-facing certificates
    #[arg(long, default_value = DEFAULT_CERT_DIR)]
    cert_dir: String,
    /// The proxy binary to supervise
    #[arg(long, default_value = "haproxy")]
    proxy_bin: String,
    /// The proxy configuration file
    #[arg(long, default_value = "/usr/local/etc/haproxy/haproxy.cfg")]
    proxy_conf: String,
    /// How long a graceful proxy stop may take before a forced kill
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    stop_grace_period: Duration,
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Log in json format
    #[arg(long)]
    log_json: bool,
    /// Domains to manage certificates for
    #[arg(required = true)]
    domains: Vec<String>,
}

fn new_strategy(args: &Args) -> Result<RenewalStrategy, Error> {
    let strategy = match args.mode {
        Mode::SelfSigned => {
            RenewalStrategy::SelfSigned(SelfSignedIssuer::new(
                certificate::DEFAULT_SELF_SIGNED_ROOT,
                args.self_signed_lifetime_days,
            ))
        },
        Mode::Stage => RenewalStrategy::LetsEncrypt(LetsEncryptIssuer::new(
            certificate::DEFAULT_LETS_ENCRYPT_ROOT,
            args.email.as_deref().unwrap_or_default(),
            args.force_renewal,
        )),
        // verify a setup in stage mode first, production issuance is not
        // implemented yet
        Mode::Prod => {
            return Err(Error::UnsupportedMode {
                mode: "prod".to_string(),
            });
        },
    };
    Ok(strategy)
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logger::logger_try_init(logger::LoggerParams {
        level: args.log_level.clone(),
        json: args.log_json,
    })?;

    // fail fast before any resource is acquired
    let strategy = new_strategy(&args)?;
    let manager = CertificateManager::new(
        args.domains.clone(),
        CertStore::new(args.cert_dir.clone()),
        RenewalPolicy {
            renew_before_expiry: args.renew_before_expiry,
        },
        strategy,
    );
    let mut supervisor = Supervisor::new(
        manager,
        ProxyCommand {
            program: args.proxy_bin.clone(),
            args: vec!["-f".to_string(), args.proxy_conf.clone()],
        },
        args.cert_check_interval,
        args.stop_grace_period,
    );
    supervisor.install_signal_handlers()?;
    supervisor.run()?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        println!("{e}");
        error!(error = e.to_string());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{new_strategy, Args, Mode};
    use crate::certificate::RenewalStrategy;
    use crate::error::Error;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_strategy() {
        let args = Args::parse_from([
            "certwrap",
            "--mode",
            "self-signed",
            "example.com",
        ]);
        assert_eq!(Mode::SelfSigned, args.mode);
        let strategy = new_strategy(&args).unwrap();
        assert_eq!(
            true,
            matches!(strategy, RenewalStrategy::SelfSigned(_))
        );

        let args = Args::parse_from([
            "certwrap",
            "--mode",
            "stage",
            "--email",
            "admin@example.com",
            "example.com",
        ]);
        let strategy = new_strategy(&args).unwrap();
        assert_eq!(
            true,
            matches!(strategy, RenewalStrategy::LetsEncrypt(_))
        );
    }

    #[test]
    fn test_prod_mode_is_unsupported() {
        // production issuance fails fast before any resource is acquired
        let args = Args::parse_from([
            "certwrap",
            "--mode",
            "prod",
            "--email",
            "admin@example.com",
            "example.com",
        ]);
        let err = new_strategy(&args).unwrap_err();
        match err {
            Error::UnsupportedMode { mode } => assert_eq!("prod", mode),
            _ => panic!("expected unsupported mode error"),
        }
    }

    #[test]
    fn test_email_required_for_acme_modes() {
        let result = Args::try_parse_from([
            "certwrap",
            "--mode",
            "stage",
            "example.com",
        ]);
        assert_eq!(true, result.is_err());
    }
}
