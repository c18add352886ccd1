//! Client certificates for uploads to `https` endpoints.

use std::path::{Path, PathBuf};

use reqwest::{Certificate, ClientBuilder, Identity, tls::Version};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// `[upload.<name>.tls]`
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Tls {
    /// Client certificate and key presented to the store.
    pub certificates: Vec<CertificatePair>,
    /// PEM roots the server certificate must chain to. When any is given the
    /// built-in roots are no longer trusted.
    pub ca_cert: Vec<PathBuf>,
    /// Rejected when set: the server certificate is checked against the
    /// host of `url`.
    pub server_name: String,
    /// `TLS10`, `TLS11`, `TLS12` or `TLS13`; empty means `TLS13`.
    pub min_version: String,
    pub max_version: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CertificatePair {
    pub key: PathBuf,
    pub cert: PathBuf,
}

impl Tls {
    pub fn validate(&self) -> Result<()> {
        match self.certificates.len() {
            0 => return Err(Error::Tls("no tls certificates provided".to_string())),
            1 => {}
            n => {
                return Err(Error::Tls(format!(
                    "only one client certificate is supported, {n} given"
                )));
            }
        }
        if !self.server_name.is_empty() {
            return Err(Error::Tls(
                "server-name is not supported, use the certificate host name in the url"
                    .to_string(),
            ));
        }
        let (min, max) = self.versions()?;
        if min > max {
            return Err(Error::Tls(format!(
                "min-version {:?} is above max-version {:?}",
                self.min_version, self.max_version
            )));
        }
        Ok(())
    }

    fn versions(&self) -> Result<(Version, Version)> {
        Ok((
            parse_version(&self.min_version)?,
            parse_version(&self.max_version)?,
        ))
    }

    /// Apply these settings to `builder`, reading every PEM file.
    pub(crate) fn configure(&self, builder: ClientBuilder) -> Result<ClientBuilder> {
        self.validate()?;
        let (min, max) = self.versions()?;
        let mut builder = builder
            .use_rustls_tls()
            .min_tls_version(min)
            .max_tls_version(max)
            .danger_accept_invalid_certs(self.insecure_skip_verify);

        if !self.ca_cert.is_empty() {
            builder = builder.tls_built_in_root_certs(false);
        }
        for path in &self.ca_cert {
            let cert = Certificate::from_pem(&read_pem(path)?).map_err(|source| Error::TlsPem {
                path: path.display().to_string(),
                source,
            })?;
            builder = builder.add_root_certificate(cert);
        }

        for pair in &self.certificates {
            let mut pem = read_pem(&pair.cert)?;
            pem.push(b'\n');
            pem.extend(read_pem(&pair.key)?);
            let identity = Identity::from_pem(&pem).map_err(|source| Error::TlsPem {
                path: pair.cert.display().to_string(),
                source,
            })?;
            builder = builder.identity(identity);
        }
        Ok(builder)
    }
}

/// `TLS12`, `TLS 1.2` and `VersionTLS12` are all accepted.
fn parse_version(version: &str) -> Result<Version> {
    let normalized: String = version
        .replace("Version", "")
        .chars()
        .filter(|c| *c != '.' && *c != ' ')
        .collect();
    match normalized.as_str() {
        "TLS10" => Ok(Version::TLS_1_0),
        "TLS11" => Ok(Version::TLS_1_1),
        "TLS12" => Ok(Version::TLS_1_2),
        "TLS13" | "" => Ok(Version::TLS_1_3),
        _ => Err(Error::Tls(format!("unknown TLS version {version:?}"))),
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::TlsFile {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdata(file: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(file)
    }

    fn client_tls() -> Tls {
        Tls {
            certificates: vec![CertificatePair {
                key: testdata("client.key"),
                cert: testdata("client.pem"),
            }],
            ca_cert: vec![testdata("client.pem")],
            min_version: "TLS12".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn versions() {
        assert_eq!(parse_version("").unwrap(), Version::TLS_1_3);
        assert_eq!(parse_version("TLS12").unwrap(), Version::TLS_1_2);
        assert_eq!(parse_version("TLS 1.1").unwrap(), Version::TLS_1_1);
        assert_eq!(parse_version("VersionTLS10").unwrap(), Version::TLS_1_0);
        assert!(matches!(parse_version("SSL3"), Err(Error::Tls(_))));
    }

    #[test]
    fn validation() {
        client_tls().validate().unwrap();

        let no_certs = Tls::default();
        assert!(matches!(no_certs.validate(), Err(Error::Tls(m)) if m.contains("no tls certificates")));

        let mut two = client_tls();
        two.certificates.push(two.certificates[0].clone());
        assert!(matches!(two.validate(), Err(Error::Tls(_))));

        let mut named = client_tls();
        named.server_name = "clickhouse.local".to_string();
        assert!(matches!(named.validate(), Err(Error::Tls(m)) if m.contains("server-name")));

        let mut inverted = client_tls();
        inverted.min_version = "TLS13".to_string();
        inverted.max_version = "TLS12".to_string();
        assert!(matches!(inverted.validate(), Err(Error::Tls(_))));
    }

    #[test]
    fn builds_a_client_with_certificates() {
        let builder = client_tls().configure(reqwest::Client::builder()).unwrap();
        builder.build().unwrap();
    }

    #[test]
    fn unreadable_certificates_are_reported() {
        let mut tls = client_tls();
        tls.certificates[0].key = testdata("missing.key");
        let err = tls.configure(reqwest::Client::builder()).unwrap_err();
        assert!(
            matches!(&err, Error::TlsFile { path, .. } if path.ends_with("missing.key")),
            "{err}"
        );

        let mut tls = client_tls();
        tls.certificates[0].key = testdata("client.pem");
        assert!(matches!(
            tls.configure(reqwest::Client::builder()),
            Err(Error::TlsPem { .. })
        ));
    }
}
