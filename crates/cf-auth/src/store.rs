//! JSON records over the key-value store

use serde::de::DeserializeOwned;
use serde::Serialize;

use cf_core::traits::KeyValueStore;

use crate::authority::CaClass;
use crate::error::AuthError;

/// A decoded record plus the raw bytes for compare-and-swap
pub(crate) struct Versioned<T> {
    pub value: T,
    pub raw: Vec<u8>,
}

pub(crate) async fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<Versioned<T>>, AuthError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(Versioned {
            value: serde_json::from_slice(&raw)?,
            raw,
        })),
        None => Ok(None),
    }
}

pub(crate) async fn save<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), AuthError> {
    store.put(key, serde_json::to_vec(value)?).await?;
    Ok(())
}

/// Write `value` only if the stored bytes still equal `expected`
pub(crate) async fn swap<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    expected: Option<&[u8]>,
    value: &T,
) -> Result<bool, AuthError> {
    Ok(store
        .compare_and_swap(key, expected, serde_json::to_vec(value)?)
        .await?)
}

pub(crate) fn authority_key(domain: &str, class: CaClass) -> String {
    format!("authorities/{}/{}", domain, class.as_str())
}

pub(crate) const AUTHORITY_PREFIX: &str = "authorities/";

pub(crate) fn user_key(name: &str) -> String {
    format!("users/{}", name)
}

pub(crate) fn signup_key(token: &str) -> String {
    format!("signup/{}", token)
}

pub(crate) fn session_key(session_id: &str) -> String {
    format!("web/sessions/{}", session_id)
}

pub(crate) fn bearer_key(token: &str) -> String {
    format!("web/bearer/{}", token)
}
