use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::PostgreSQL;
use crate::resources::common::{cluster_labels, credentials_secret_name, owner_reference};

/// Secret key holding the application user's password
pub const DATABASE_PASSWORD_KEY: &str = "database-password";

/// Secret key holding the repmgr user's password
pub const REPMGR_PASSWORD_KEY: &str = "repmgr-password";

const PASSWORD_LEN: usize = 32;

/// Generate a random alphanumeric password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate the credentials Secret
///
/// The repmgr password is always generated. The database password is taken
/// from `database_password` when the operator is configured with one.
pub fn generate_credentials_secret(cluster: &PostgreSQL, database_password: Option<&str>) -> Secret {
    let cluster_name = cluster.name_any();

    let database_password = database_password
        .map(str::to_string)
        .unwrap_or_else(|| generate_password(PASSWORD_LEN));

    let string_data = BTreeMap::from([
        (DATABASE_PASSWORD_KEY.to_string(), database_password),
        (
            REPMGR_PASSWORD_KEY.to_string(),
            generate_password(PASSWORD_LEN),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(&cluster_name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// Read a key from a Secret's data as UTF-8
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}
