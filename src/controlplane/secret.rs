//! Secret Materializer
//!
//! Builds the mongo admin credential secret for a hub.

use crate::crd::MultiClusterHub;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use rand::rngs::OsRng;
use rand::Rng;
use std::collections::BTreeMap;

use super::resources::attach_owner;

/// Name of the mongo admin secret
pub const MONGO_SECRET_NAME: &str = "mongodb-admin";

/// User stored in the mongo admin secret
pub const MONGO_ADMIN_USER: &str = "some@example.com";

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 16;

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a password of `len` characters, each drawn uniformly from the
/// alphanumeric alphabet using the operating system's secure RNG
pub fn generate_password(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())] as char)
        .collect()
}

/// Build the mongo admin secret in the hub's namespace.
///
/// A missing owner reference is logged and the secret is still returned.
pub fn mongo_secret(hub: &MultiClusterHub) -> Result<Secret> {
    let namespace = hub
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let mut metadata = ObjectMeta {
        name: Some(MONGO_SECRET_NAME.to_string()),
        namespace: Some(namespace),
        ..Default::default()
    };
    attach_owner(hub, &mut metadata);

    Ok(Secret {
        metadata,
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([
            ("user".to_string(), MONGO_ADMIN_USER.to_string()),
            ("password".to_string(), generate_password(PASSWORD_LENGTH)),
        ])),
        ..Default::default()
    })
}
