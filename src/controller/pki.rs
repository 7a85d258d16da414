//! Certificates for the proxy admin API
//!
//! The operator keeps one CA in a Secret (created on first start) and signs
//! a leaf certificate per admin Service with it. Proxies require client
//! certificates from that same CA on the admin listener.
//!
//! ```text
//! Operator CA (dataplane-operator-ca)
//!     └── Leaf (<admin-service>.<namespace>.svc)
//! ```

use crate::controller::owned::OwnedObject;
use crate::controller::store::{ClusterStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

/// CA validity (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Leaf validity (1 year)
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Leaves are re-issued once they are this close to expiry
pub const RENEW_BEFORE_DAYS: i64 = 30;

pub const SECRET_CA_CERT_KEY: &str = "ca.crt";
pub const SECRET_TLS_CERT_KEY: &str = "tls.crt";
pub const SECRET_TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("operator CA secret {0} not found")]
    MissingCa(String),

    #[error("secret {secret} is missing {key}")]
    MissingKey { secret: String, key: &'static str },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// CA certificate and key, PEM encoded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateAuthority {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A leaf certificate and its key, PEM encoded
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The parts of a certificate that decide whether it must be re-issued
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub not_after: DateTime<Utc>,
}

impl CertificateAuthority {
    /// Generate a self-signed CA
    pub fn generate(common_name: &str) -> Result<Self, PkiError> {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "dataplane-operator");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load the CA from a `kubernetes.io/tls` Secret
    pub fn from_secret(secret: &Secret) -> Result<Self, PkiError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        Ok(Self {
            cert_pem: secret_value(secret, SECRET_TLS_CERT_KEY).ok_or_else(|| PkiError::MissingKey {
                secret: name.clone(),
                key: SECRET_TLS_CERT_KEY,
            })?,
            key_pem: secret_value(secret, SECRET_TLS_KEY_KEY).ok_or(PkiError::MissingKey {
                secret: name,
                key: SECRET_TLS_KEY_KEY,
            })?,
        })
    }

    pub fn to_secret(&self, namespace: &str, name: &str) -> Secret {
        let data = BTreeMap::from([
            (
                SECRET_CA_CERT_KEY.to_string(),
                ByteString(self.cert_pem.as_bytes().to_vec()),
            ),
            (
                SECRET_TLS_CERT_KEY.to_string(),
                ByteString(self.cert_pem.as_bytes().to_vec()),
            ),
            (
                SECRET_TLS_KEY_KEY.to_string(),
                ByteString(self.key_pem.as_bytes().to_vec()),
            ),
        ]);

        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_string(),
                    "dataplane-operator".to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Issue a leaf usable for both ends of admin API mTLS
    pub fn issue(&self, common_name: &str, dns_names: &[String]) -> Result<IssuedCertificate, PkiError> {
        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let ca_params = CertificateParams::from_ca_cert_pem(&self.cert_pem)?;
        let ca_cert = ca_params.self_signed(&ca_key)?;

        let mut params = CertificateParams::new(dns_names.to_vec())?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &ca_cert, &ca_key)?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// String value of a Secret key
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| String::from_utf8_lossy(&value.0).to_string())
}

/// Read subject common name and expiry from a PEM certificate
pub fn inspect(cert_pem: &str) -> Result<CertificateInfo, PkiError> {
    let pem = pem::parse(cert_pem).map_err(|e| PkiError::Parse(e.to_string()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents())
        .map_err(|e| PkiError::Parse(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| PkiError::Parse("notAfter out of range".to_string()))?;

    Ok(CertificateInfo {
        common_name,
        not_after,
    })
}

/// True if a certificate expiring at `not_after` is due for renewal
pub fn needs_renewal(not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    not_after - now < Duration::days(RENEW_BEFORE_DAYS)
}

/// Load the operator CA created at startup
pub async fn load_ca(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
) -> Result<CertificateAuthority, PkiError> {
    match store.get_secret(namespace, name).await? {
        Some(secret) => CertificateAuthority::from_secret(&secret),
        None => Err(PkiError::MissingCa(format!("{}/{}", namespace, name))),
    }
}

/// Load the operator CA, creating it on first start
pub async fn ensure_ca_secret(
    store: &dyn ClusterStore,
    namespace: &str,
    name: &str,
) -> Result<CertificateAuthority, PkiError> {
    if let Some(secret) = store.get_secret(namespace, name).await? {
        info!(secret = name, namespace = namespace, "Loaded operator CA");
        return CertificateAuthority::from_secret(&secret);
    }

    info!(secret = name, namespace = namespace, "No operator CA found, generating one");
    let ca = CertificateAuthority::generate("dataplane-operator-ca")?;
    match store
        .create_owned(OwnedObject::Secret(ca.to_secret(namespace, name)))
        .await
    {
        Ok(_) => Ok(ca),
        // Another replica won the race; use its CA
        Err(StoreError::Conflict(_)) => match store.get_secret(namespace, name).await? {
            Some(secret) => CertificateAuthority::from_secret(&secret),
            None => Err(StoreError::NotFound(format!("Secret {}/{}", namespace, name)).into()),
        },
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "pki_test.rs"]
mod tests;
