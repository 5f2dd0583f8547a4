//! Cascade deletion of items whose parent collection was deleted.
//!
//! Only one level is followed: collection to item. Deleting a catalog does
//! not reach into its collections.

use crate::entity::{file_stem, split_catalog_collection};
use std::collections::BTreeSet;

/// Canonical path of a deleted key if it denotes a collection.
///
/// A recorded path decides on its own. Without one the file stem must follow
/// the `<catalog>_$_<collection>` convention.
pub fn collection_path(key_stem: &str, recorded_path: Option<&str>) -> Option<String> {
    match recorded_path {
        Some(path) => {
            let (parent, _) = path.rsplit_once('/')?;
            if parent == "collections" || parent.ends_with("/collections") {
                Some(path.to_string())
            } else {
                None
            }
        }
        None => split_catalog_collection(file_stem(key_stem))
            .map(|(catalog, collection)| format!("catalogs/{catalog}/collections/{collection}")),
    }
}

/// Parent path of an item's canonical path (`<parent>/items/<id>`).
pub fn item_parent(path: &str) -> Option<&str> {
    let (rest, _id) = path.rsplit_once('/')?;
    rest.strip_suffix("/items")
}

/// Matches items against the set of deleted collections.
#[derive(Debug, Default)]
pub struct CascadeResolver {
    collections: BTreeSet<String>,
}

impl CascadeResolver {
    /// Build from deleted keys as `(key stem, recorded path)` pairs.
    pub fn new<'a>(deleted: impl IntoIterator<Item = (&'a str, Option<&'a str>)>) -> Self {
        let collections = deleted
            .into_iter()
            .filter_map(|(stem, path)| collection_path(stem, path))
            .collect();
        Self { collections }
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    /// Whether an item at `item_path` lost its parent collection.
    pub fn orphans(&self, item_path: &str) -> bool {
        item_parent(item_path)
            .map(|parent| self.collections.contains(parent))
            .unwrap_or(false)
    }
}
