//! Entity classification and canonical path resolution.
//!
//! Records are STAC-like JSON documents. Their `type` field selects the
//! entity kind and their `parent` link, when present, anchors the canonical
//! path. Entities without a parent fall back to a path derived from the
//! object key so repeated runs converge on the same location.

use crate::KeyFailure;
use serde_json::Value;
use std::fmt;

/// Separator between catalogue and collection in collection file stems.
pub const CATALOG_COLLECTION_SEPARATOR: &str = "_$_";

/// Entity kind, parsed from the record's `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityType {
    Catalog,
    Collection,
    /// STAC `Feature`
    Item,
    Unrecognized(String),
}

impl EntityType {
    pub fn from_type_field(value: &str) -> Self {
        match value {
            "Catalog" => EntityType::Catalog,
            "Collection" => EntityType::Collection,
            "Feature" => EntityType::Item,
            other => EntityType::Unrecognized(other.to_string()),
        }
    }

    /// Path segment used for children of this type.
    pub fn plural(&self) -> Option<&'static str> {
        match self {
            EntityType::Catalog => Some("catalogs"),
            EntityType::Collection => Some("collections"),
            EntityType::Item => Some("items"),
            EntityType::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityType::Catalog => write!(f, "Catalog"),
            EntityType::Collection => write!(f, "Collection"),
            EntityType::Item => write!(f, "Feature"),
            EntityType::Unrecognized(other) => write!(f, "{other}"),
        }
    }
}

/// A record placed at its canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub entity_type: EntityType,
    pub id: String,
    pub parent_path: Option<String>,
    pub canonical_path: String,
    /// Record re-serialised as compact JSON
    pub body: String,
}

/// Normalise a parent href: surrounding slashes and a trailing `.json` go.
pub fn normalize_parent(href: &str) -> Option<String> {
    let trimmed = href.trim_matches('/');
    let trimmed = trimmed.strip_suffix(".json").unwrap_or(trimmed);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Split a `<catalog>_$_<collection>` file stem.
pub fn split_catalog_collection(file_stem: &str) -> Option<(&str, &str)> {
    let (catalog, collection) = file_stem.split_once(CATALOG_COLLECTION_SEPARATOR)?;
    if catalog.is_empty() || collection.is_empty() {
        return None;
    }
    Some((catalog, collection))
}

/// Last path segment of a key stem.
pub fn file_stem(key_stem: &str) -> &str {
    key_stem.rsplit('/').next().unwrap_or(key_stem)
}

/// Canonical path of an entity.
///
/// With a parent the path is `<parent>/<plural>/<id>`. Without one, catalogs
/// and collections fall back to a path derived from the key stem and items
/// cannot be placed.
pub fn resolve_path(
    entity_type: &EntityType,
    parent: Option<&str>,
    id: &str,
    key_stem: &str,
) -> Result<String, KeyFailure> {
    match (entity_type, parent) {
        (EntityType::Unrecognized(other), _) => Err(KeyFailure::Classification(format!(
            "Unrecognised entry type: {other}"
        ))),
        (entity_type, Some(parent)) => {
            // Unrecognized is handled above, every other type has a plural
            let plural = entity_type.plural().unwrap_or("items");
            Ok(format!("{parent}/{plural}/{id}"))
        }
        (EntityType::Item, None) => Err(KeyFailure::Classification(format!(
            "Item {id} is missing the parent link required for items"
        ))),
        (EntityType::Catalog, None) => Ok(format!("catalogs/{key_stem}")),
        (EntityType::Collection, None) => match split_catalog_collection(file_stem(key_stem)) {
            Some((catalog, collection)) => {
                Ok(format!("catalogs/{catalog}/collections/{collection}"))
            }
            None => Ok(format!("collections/{key_stem}")),
        },
    }
}

/// Classifies records of one workspace.
#[derive(Debug, Clone)]
pub struct EntityResolver {
    key_prefix: String,
    access_policy_suffix: String,
}

impl EntityResolver {
    pub fn new(workspace_id: &str, config_dir: &str, access_policy_suffix: &str) -> Self {
        Self {
            key_prefix: format!("{}/{}/", workspace_id, config_dir.trim_matches('/')),
            access_policy_suffix: access_policy_suffix.to_string(),
        }
    }

    /// Listing prefix that holds the workspace's records.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Whether a key is an access-control document rather than an entity.
    pub fn is_access_policy(&self, key: &str) -> bool {
        key.ends_with(&self.access_policy_suffix)
    }

    /// Key relative to the workspace config directory, without `.json`.
    pub fn key_stem<'a>(&self, key: &'a str) -> &'a str {
        let relative = key.strip_prefix(self.key_prefix.as_str()).unwrap_or(key);
        relative.strip_suffix(".json").unwrap_or(relative)
    }

    /// Parse and place one record.
    pub fn resolve(&self, key: &str, body: &[u8]) -> Result<ResolvedEntity, KeyFailure> {
        let record: Value = serde_json::from_slice(body)
            .map_err(|e| KeyFailure::Parse(format!("Unable to parse {key}: {e}")))?;
        let object = record
            .as_object()
            .ok_or_else(|| KeyFailure::Parse(format!("{key} is not a JSON object")))?;

        let entity_type = object
            .get("type")
            .and_then(Value::as_str)
            .map(EntityType::from_type_field)
            .ok_or_else(|| KeyFailure::Classification(format!("{key} has no type field")))?;

        let id = match object.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(KeyFailure::Classification(format!("{key} has no id")));
            }
        };

        let parent_path = object
            .get("links")
            .and_then(Value::as_array)
            .and_then(|links| {
                links
                    .iter()
                    .find(|link| link.get("rel").and_then(Value::as_str) == Some("parent"))
            })
            .and_then(|link| link.get("href"))
            .and_then(Value::as_str)
            .and_then(normalize_parent);

        let canonical_path =
            resolve_path(&entity_type, parent_path.as_deref(), &id, self.key_stem(key))?;

        let body = serde_json::to_string(&record)
            .map_err(|e| KeyFailure::Parse(format!("Unable to serialise {key}: {e}")))?;

        Ok(ResolvedEntity {
            entity_type,
            id,
            parent_path,
            canonical_path,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> EntityResolver {
        EntityResolver::new("alice", "eodh-config", "/access-policy.json")
    }

    #[test]
    fn test_resolve_path_with_parent() {
        let path = resolve_path(&EntityType::Item, Some("catalogs/cat/collections/col"), "i1", "x");
        assert_eq!(path.unwrap(), "catalogs/cat/collections/col/items/i1");

        let path = resolve_path(&EntityType::Collection, Some("catalogs/cat"), "col", "x");
        assert_eq!(path.unwrap(), "catalogs/cat/collections/col");

        let path = resolve_path(&EntityType::Catalog, Some("catalogs/root"), "sub", "x");
        assert_eq!(path.unwrap(), "catalogs/root/catalogs/sub");
    }

    #[test]
    fn test_resolve_path_fallbacks() {
        assert_eq!(
            resolve_path(&EntityType::Catalog, None, "cat", "cat").unwrap(),
            "catalogs/cat"
        );
        assert_eq!(
            resolve_path(&EntityType::Collection, None, "col", "cat_$_col").unwrap(),
            "catalogs/cat/collections/col"
        );
        assert_eq!(
            resolve_path(&EntityType::Collection, None, "col", "loose").unwrap(),
            "collections/loose"
        );
    }

    #[test]
    fn test_item_without_parent_fails() {
        let result = resolve_path(&EntityType::Item, None, "i1", "i1");
        assert!(matches!(result, Err(KeyFailure::Classification(_))));
    }

    #[test]
    fn test_unrecognized_always_fails() {
        let unknown = EntityType::from_type_field("Thing");
        assert!(resolve_path(&unknown, Some("catalogs/cat"), "t", "t").is_err());
        assert!(resolve_path(&unknown, None, "t", "t").is_err());
    }

    #[test]
    fn test_normalize_parent() {
        assert_eq!(
            normalize_parent("/catalogs/cat/collections/col.json").as_deref(),
            Some("catalogs/cat/collections/col")
        );
        assert_eq!(normalize_parent("catalogs/cat/").as_deref(), Some("catalogs/cat"));
        assert_eq!(normalize_parent("/"), None);
    }

    #[test]
    fn test_key_stem() {
        let resolver = resolver();
        assert_eq!(resolver.key_stem("alice/eodh-config/cat_$_col.json"), "cat_$_col");
        assert_eq!(resolver.key_stem("alice/eodh-config/sub/item.json"), "sub/item");
        assert_eq!(resolver.key_prefix(), "alice/eodh-config/");
    }

    #[test]
    fn test_resolve_item_record() {
        let body = br#"{
            "type": "Feature",
            "id": "item-1",
            "links": [
                {"rel": "self", "href": "ignored"},
                {"rel": "parent", "href": "catalogs/cat/collections/col"}
            ]
        }"#;

        let entity = resolver()
            .resolve("alice/eodh-config/item-1.json", body)
            .unwrap();
        assert_eq!(entity.entity_type, EntityType::Item);
        assert_eq!(entity.parent_path.as_deref(), Some("catalogs/cat/collections/col"));
        assert_eq!(entity.canonical_path, "catalogs/cat/collections/col/items/item-1");
        assert!(!entity.body.contains('\n'));
    }

    #[test]
    fn test_resolve_collection_by_key_convention() {
        let body = br#"{"type": "Collection", "id": "col"}"#;
        let entity = resolver()
            .resolve("alice/eodh-config/cat_$_col.json", body)
            .unwrap();
        assert_eq!(entity.canonical_path, "catalogs/cat/collections/col");
    }

    #[test]
    fn test_resolve_failures() {
        let resolver = resolver();

        assert!(matches!(
            resolver.resolve("alice/eodh-config/a.json", b"{not json"),
            Err(KeyFailure::Parse(_))
        ));
        assert!(matches!(
            resolver.resolve("alice/eodh-config/a.json", b"[1, 2]"),
            Err(KeyFailure::Parse(_))
        ));
        assert!(matches!(
            resolver.resolve("alice/eodh-config/a.json", br#"{"type": "Catalog"}"#),
            Err(KeyFailure::Classification(_))
        ));
        assert!(matches!(
            resolver.resolve("alice/eodh-config/a.json", br#"{"type": "Feature", "id": "i"}"#),
            Err(KeyFailure::Classification(_))
        ));
    }

    #[test]
    fn test_access_policy_detection() {
        let resolver = resolver();
        assert!(resolver.is_access_policy("alice/eodh-config/access-policy.json"));
        assert!(!resolver.is_access_policy("alice/eodh-config/cat.json"));
    }
}
