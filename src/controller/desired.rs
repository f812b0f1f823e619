//! Desired-state builder for the derived CA bundle config map
//!
//! Pure functions only: everything in here computes values from object
//! snapshots and performs no I/O. The convergence handlers decide what to do
//! with the result.

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Data key holding the CA certificate, in both the source secret and the
/// derived config map.
pub const CA_CERTIFICATE_KEY: &str = "ca.crt";

/// Label value marking a namespace as opted in.
pub const OPT_IN_VALUE: &str = "enabled";

/// Extract the CA payload from the source secret's binary data.
///
/// A secret missing the `ca.crt` key yields an empty payload rather than an
/// error; the handlers then converge every opt-in namespace onto that empty
/// value.
pub fn ca_payload(secret: &Secret) -> String {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(CA_CERTIFICATE_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .unwrap_or_default()
}

/// Build the derived config map for one target namespace.
///
/// The config map carries the CA payload copied verbatim from the secret and
/// a controller owner reference back to the secret, so that ownership
/// conflicts are detectable and cluster garbage collection reaps the config
/// map when the secret goes away.
pub fn config_map(name: &str, namespace: &str, secret: &Secret) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CA_CERTIFICATE_KEY.to_string(), ca_payload(secret));

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![controller_reference(secret)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Controller owner reference pointing at the source secret.
fn controller_reference(secret: &Secret) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Secret".to_string(),
        name: secret.name_any(),
        uid: secret.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// The owner reference marked as controller, if any.
pub fn controller_of(config_map: &ConfigMap) -> Option<&OwnerReference> {
    config_map
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Whether the config map is controlled by this exact secret (uid match).
pub fn is_controlled_by(config_map: &ConfigMap, secret: &Secret) -> bool {
    controller_of(config_map)
        .map(|owner| owner.kind == "Secret" && Some(owner.uid.as_str()) == secret.uid().as_deref())
        .unwrap_or(false)
}

/// Whether the config map is controlled by a secret of the given name.
///
/// Used on paths where the secret snapshot is not available (label removal
/// may race with secret deletion); matching by kind and name is then the
/// strongest check possible.
pub fn is_controlled_by_source(config_map: &ConfigMap, secret_name: &str) -> bool {
    controller_of(config_map)
        .map(|owner| owner.kind == "Secret" && owner.name == secret_name)
        .unwrap_or(false)
}

/// Whether the namespace is currently opted in (`label == "enabled"`).
pub fn is_opt_in(namespace: &Namespace, label: &str) -> bool {
    namespace.labels().get(label).map(String::as_str) == Some(OPT_IN_VALUE)
}

/// Whether the namespace carries the injection label with any non-empty
/// value. Namespace add events are filtered on presence, not on the exact
/// opt-in value.
pub fn has_injection_label(namespace: &Namespace, label: &str) -> bool {
    namespace
        .labels()
        .get(label)
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn test_secret(name: &str, payload: Option<&[u8]>) -> Secret {
        let data = payload.map(|bytes| {
            let mut map = BTreeMap::new();
            map.insert(CA_CERTIFICATE_KEY.to_string(), ByteString(bytes.to_vec()));
            map
        });
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("certs".to_string()),
                uid: Some("uid-1234".to_string()),
                ..Default::default()
            },
            data,
            ..Default::default()
        }
    }

    fn test_namespace(name: &str, label: Option<(&str, &str)>) -> Namespace {
        let labels = label.map(|(key, value)| {
            let mut map = BTreeMap::new();
            map.insert(key.to_string(), value.to_string());
            map
        });
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn config_map_copies_payload_verbatim() {
        let secret = test_secret("ca-source", Some(b"CERT_V1"));
        let cm = config_map("ca-bundle", "apps", &secret);

        assert_eq!(cm.metadata.name.as_deref(), Some("ca-bundle"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("apps"));
        assert_eq!(
            cm.data.unwrap().get(CA_CERTIFICATE_KEY).map(String::as_str),
            Some("CERT_V1")
        );
    }

    #[test]
    fn config_map_records_controller_owner_reference() {
        let secret = test_secret("ca-source", Some(b"CERT_V1"));
        let cm = config_map("ca-bundle", "apps", &secret);

        let owner = controller_of(&cm).expect("controller reference missing");
        assert_eq!(owner.kind, "Secret");
        assert_eq!(owner.name, "ca-source");
        assert_eq!(owner.uid, "uid-1234");
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn missing_data_key_yields_empty_payload() {
        let secret = test_secret("ca-source", None);
        assert_eq!(ca_payload(&secret), "");
    }

    #[test]
    fn ownership_requires_matching_uid() {
        let secret = test_secret("ca-source", Some(b"CERT_V1"));
        let cm = config_map("ca-bundle", "apps", &secret);
        assert!(is_controlled_by(&cm, &secret));

        let mut other = test_secret("ca-source", Some(b"CERT_V1"));
        other.metadata.uid = Some("uid-other".to_string());
        assert!(!is_controlled_by(&cm, &other));
    }

    #[test]
    fn foreign_config_map_is_not_owned() {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("ca-bundle".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let secret = test_secret("ca-source", Some(b"CERT_V1"));
        assert!(!is_controlled_by(&cm, &secret));
        assert!(!is_controlled_by_source(&cm, "ca-source"));
    }

    #[test]
    fn opt_in_requires_exact_value() {
        let label = "ca-bundle-injection";
        assert!(is_opt_in(&test_namespace("a", Some((label, "enabled"))), label));
        assert!(!is_opt_in(&test_namespace("b", Some((label, "disabled"))), label));
        assert!(!is_opt_in(&test_namespace("c", None), label));
    }

    #[test]
    fn injection_label_requires_non_empty_value() {
        let label = "ca-bundle-injection";
        assert!(has_injection_label(
            &test_namespace("a", Some((label, "enabled"))),
            label
        ));
        assert!(has_injection_label(
            &test_namespace("b", Some((label, "anything"))),
            label
        ));
        assert!(!has_injection_label(&test_namespace("c", Some((label, ""))), label));
        assert!(!has_injection_label(&test_namespace("d", None), label));
    }
}
