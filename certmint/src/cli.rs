use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use certmint_core::config::DEFAULT_COMMON_NAME;
use certmint_core::{AuthorityConfig, CaError, CertificateAuthority, FileCache, LoadOptions};

use crate::output;

const DEFAULT_CERTS_DIR: &str = "./ca/certs/";

/// certmint - create a root certificate authority and host certificates signed by it
#[derive(Parser, Debug)]
#[command(name = "certmint")]
#[command(version)]
#[command(about = "Create a root certificate authority and host certificates signed by it")]
pub struct Cli {
    /// Path to the root certificate authority file
    #[arg(value_name = "ROOT_CA_CERT")]
    pub root_ca_cert: PathBuf,

    /// Common name for a newly created root certificate
    #[arg(short = 'c', long, default_value = DEFAULT_COMMON_NAME)]
    pub certname: String,

    /// Directory for host certificates
    #[arg(short = 'd', long, default_value = DEFAULT_CERTS_DIR)]
    pub certs_dir: PathBuf,

    /// Hostname to issue a certificate for
    #[arg(short = 'n', long)]
    pub hostname: Option<String>,

    /// Issue a wildcard certificate for the hostname
    #[arg(short = 'w', long, visible_alias = "wildcard_cert")]
    pub wildcard: bool,

    /// Overwrite an existing root or host certificate
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Show verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Root cert \"{0}\" already exists, use -f to overwrite")]
    RootExists(String),

    #[error("Cert for \"{0}\" already exists, use -f to overwrite")]
    CertExists(String),

    #[error(transparent)]
    Ca(#[from] CaError),
}

impl Cli {
    pub fn run(self) -> Result<(), CliError> {
        match self.hostname.as_deref() {
            Some(hostname) => self.issue_host(hostname),
            None => self.create_root(),
        }
    }

    fn config(&self) -> AuthorityConfig {
        AuthorityConfig::new(self.certname.as_str())
    }

    fn create_root(&self) -> Result<(), CliError> {
        let cache = Arc::new(FileCache::new(&self.certs_dir));
        match CertificateAuthority::create_root(&self.root_ca_cert, self.config(), cache, self.force)
        {
            Ok(ca) => {
                output::success(&format!(
                    "Created new root cert: \"{}\"",
                    ca.root_path().display()
                ));
                Ok(())
            }
            Err(CaError::Conflict(path)) => {
                Err(CliError::RootExists(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn issue_host(&self, hostname: &str) -> Result<(), CliError> {
        let cache = Arc::new(FileCache::new(&self.certs_dir));
        let ca = CertificateAuthority::open(&self.root_ca_cert, self.config(), cache.clone())?;

        let options = LoadOptions {
            wildcard: self.wildcard,
            wildcard_use_parent: false,
            overwrite: self.force,
            exact_host: true,
        };
        let issued = ca.load_cert(hostname, options)?;
        if !issued.created {
            return Err(CliError::CertExists(hostname.to_string()));
        }

        let path = cache.path_for(&issued.cache_key)?;
        output::success(&format!(
            "Created new cert \"{}\" at \"{}\"",
            hostname,
            path.display()
        ));
        output::muted(&format!("Signed by \"{}\"", ca.root_path().display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_only_uses_defaults() {
        let cli = Cli::try_parse_from(["certmint", "my-ca.pem"]).unwrap();
        assert_eq!(cli.root_ca_cert, PathBuf::from("my-ca.pem"));
        assert_eq!(cli.certname, "Root CA");
        assert_eq!(cli.certs_dir, PathBuf::from("./ca/certs/"));
        assert!(cli.hostname.is_none());
        assert!(!cli.wildcard);
        assert!(!cli.force);
        assert!(!cli.verbose);
    }

    #[test]
    fn parses_short_flags() {
        let cli = Cli::try_parse_from([
            "certmint",
            "my-ca.pem",
            "-c",
            "Test CA",
            "-d",
            "/tmp/certs",
            "-n",
            "example.com",
            "-w",
            "-f",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.certname, "Test CA");
        assert_eq!(cli.certs_dir, PathBuf::from("/tmp/certs"));
        assert_eq!(cli.hostname.as_deref(), Some("example.com"));
        assert!(cli.wildcard);
        assert!(cli.force);
        assert!(cli.verbose);
    }

    #[test]
    fn parses_long_flags() {
        let cli = Cli::try_parse_from([
            "certmint",
            "my-ca.pem",
            "--certname",
            "Test CA",
            "--certs-dir",
            "certs",
            "--hostname",
            "example.com",
            "--wildcard",
            "--force",
        ])
        .unwrap();
        assert_eq!(cli.certname, "Test CA");
        assert_eq!(cli.certs_dir, PathBuf::from("certs"));
        assert_eq!(cli.hostname.as_deref(), Some("example.com"));
        assert!(cli.wildcard);
        assert!(cli.force);
    }

    #[test]
    fn wildcard_cert_alias() {
        let cli =
            Cli::try_parse_from(["certmint", "my-ca.pem", "-n", "a.b.com", "--wildcard_cert"])
                .unwrap();
        assert!(cli.wildcard);
    }

    #[test]
    fn root_path_is_required() {
        let err = Cli::try_parse_from(["certmint"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn exists_messages_mention_force() {
        let root = CliError::RootExists("my-ca.pem".to_string()).to_string();
        assert_eq!(root, "Root cert \"my-ca.pem\" already exists, use -f to overwrite");

        let host = CliError::CertExists("example.com".to_string()).to_string();
        assert_eq!(host, "Cert for \"example.com\" already exists, use -f to overwrite");
    }
}
