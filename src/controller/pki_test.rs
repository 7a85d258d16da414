#![allow(clippy::unwrap_used)]

use super::*;
use crate::controller::store_mock::MockStore;

#[test]
fn test_issued_leaf_carries_common_name_and_one_year_validity() {
    let ca = CertificateAuthority::generate("test-ca").unwrap();
    let leaf = ca
        .issue(
            "dataplane-admin-edge.default.svc",
            &["dataplane-admin-edge.default.svc".to_string()],
        )
        .unwrap();

    let info = inspect(&leaf.cert_pem).unwrap();
    assert_eq!(
        info.common_name.as_deref(),
        Some("dataplane-admin-edge.default.svc")
    );

    let remaining = info.not_after - Utc::now();
    assert!(remaining > Duration::days(LEAF_VALIDITY_DAYS - 1));
    assert!(!needs_renewal(info.not_after, Utc::now()));
}

#[test]
fn test_needs_renewal_within_window() {
    let now = Utc::now();
    assert!(needs_renewal(now + Duration::days(29), now));
    assert!(needs_renewal(now - Duration::days(1), now));
    assert!(!needs_renewal(now + Duration::days(31), now));
}

#[test]
fn test_ca_round_trips_through_secret() {
    let ca = CertificateAuthority::generate("test-ca").unwrap();
    let secret = ca.to_secret("ops", "ca");

    assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
    assert_eq!(
        secret_value(&secret, SECRET_CA_CERT_KEY),
        Some(ca.cert_pem.clone())
    );
    assert_eq!(CertificateAuthority::from_secret(&secret).unwrap(), ca);
}

#[test]
fn test_from_secret_reports_missing_key() {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("broken".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    let err = CertificateAuthority::from_secret(&secret).unwrap_err();
    assert!(matches!(
        err,
        PkiError::MissingKey {
            key: SECRET_TLS_CERT_KEY,
            ..
        }
    ));
}

#[test]
fn test_inspect_rejects_garbage() {
    assert!(matches!(inspect("not a cert"), Err(PkiError::Parse(_))));
}

#[tokio::test]
async fn test_ensure_ca_secret_creates_once_then_reuses() {
    let store = MockStore::new();

    let first = ensure_ca_secret(&store, "ops", "operator-ca").await.unwrap();
    let second = ensure_ca_secret(&store, "ops", "operator-ca").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.list::<Secret>().len(), 1);
}

#[tokio::test]
async fn test_load_ca_requires_existing_secret() {
    let store = MockStore::new();
    assert!(matches!(
        load_ca(&store, "ops", "operator-ca").await,
        Err(PkiError::MissingCa(_))
    ));

    let created = ensure_ca_secret(&store, "ops", "operator-ca").await.unwrap();
    assert_eq!(load_ca(&store, "ops", "operator-ca").await.unwrap(), created);
}
