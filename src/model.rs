use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Film {
    pub title: String,
    pub year: u16,
    /// Age rating, e.g. "U" or "PG".
    pub age: String,
    pub director: String,
    pub genre: String,
    pub format: String,
    pub description: String,
    pub code: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OwnStatus {
    Owned,
    Wanted,
}

impl Default for OwnStatus {
    fn default() -> Self {
        OwnStatus::Owned
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    pub user_id: u64,
    pub film_id: u64,
    pub own: OwnStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Session {
    pub user_id: u64,
    /// Unix timestamp in seconds.
    pub expires_at: u64,
}

/// Validated account fields, as accepted by registration and account updates.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}
