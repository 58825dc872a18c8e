//! Contains the types of results returned by CRUD operations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bson::Bson;

/// The result of a [`Client::insert`](crate::Client::insert) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertResult {
    /// The `_id` field of the documents inserted, keyed by their position in the batch.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// The result of a [`Client::update`](crate::Client::update) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filters.
    pub matched_count: u64,

    /// The number of documents that were modified by the operation.
    pub modified_count: u64,

    /// The `_id` field of the documents inserted by upserts, keyed by the position of the update
    /// statement in the batch.
    pub upserted_ids: HashMap<usize, Bson>,
}

/// The result of a [`Client::delete`](crate::Client::delete) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// Information about a database.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DatabaseSpecification {
    /// The name of the database.
    pub name: String,

    /// The amount of disk space in bytes that is consumed by the database.
    #[serde(default)]
    pub size_on_disk: u64,

    /// Whether the database has any data.
    #[serde(default)]
    pub empty: bool,
}
