use crate::config::ModelMapEntry;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const ALIAS_OWNER: &str = "github-copilot";

/// One entry of an OpenAI-style `/v1/models` listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: String,
    pub permission: Vec<Value>,
}

impl ModelEntry {
    pub fn new(id: impl Into<String>, owned_by: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "model",
            owned_by: owned_by.into(),
            permission: Vec::new(),
        }
    }
}

/// Static public-name to upstream-name table. Read-only after startup.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    entries: Vec<ModelMapEntry>,
    lookup: HashMap<String, String>,
}

impl ModelRegistry {
    pub fn new(entries: Vec<ModelMapEntry>) -> Self {
        let mut lookup = HashMap::with_capacity(entries.len());
        for entry in &entries {
            // first declaration wins when an alias is listed twice
            lookup
                .entry(entry.logical_model.clone())
                .or_insert_with(|| entry.upstream_model.clone());
        }
        Self {
            inner: Arc::new(Inner { entries, lookup }),
        }
    }

    /// Exact, case-sensitive lookup. Unknown names map to themselves.
    pub fn resolve<'a>(&'a self, public_name: &'a str) -> &'a str {
        self.inner
            .lookup
            .get(public_name)
            .map(String::as_str)
            .unwrap_or(public_name)
    }

    pub fn entries(&self) -> &[ModelMapEntry] {
        &self.inner.entries
    }

    /// Synthetic listing entries for every alias, in declared order.
    pub fn alias_model_entries(&self) -> Vec<ModelEntry> {
        self.inner
            .entries
            .iter()
            .map(|entry| ModelEntry::new(entry.logical_model.clone(), ALIAS_OWNER))
            .collect()
    }
}

/// Builds the `/v1/models` data array: aliases first, then the upstream
/// catalog entries flagged `model_picker_enabled`, in upstream order.
/// Collisions between alias ids and upstream ids are kept as-is.
pub fn merge_model_listing(registry: &ModelRegistry, upstream_catalog: &Value) -> Vec<ModelEntry> {
    let mut data = registry.alias_model_entries();
    let Some(models) = upstream_catalog.get("data").and_then(|v| v.as_array()) else {
        return data;
    };
    for model in models {
        let picker_enabled = model
            .get("model_picker_enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !picker_enabled {
            continue;
        }
        let Some(id) = model.get("id").and_then(|v| v.as_str()) else {
            continue;
        };
        let owned_by = model
            .get("vendor")
            .and_then(|v| v.as_str())
            .unwrap_or(ALIAS_OWNER);
        data.push(ModelEntry::new(id, owned_by));
    }
    data
}

#[cfg(test)]
mod tests {
    use super::{ModelRegistry, merge_model_listing};
    use crate::config::{ModelMapEntry, default_model_map};
    use serde_json::json;

    #[test]
    fn resolve_maps_known_aliases() {
        let registry = ModelRegistry::new(default_model_map());
        assert_eq!(registry.resolve("copilot-opus-45"), "claude-opus-4.5");
        assert_eq!(registry.resolve("copilot-sonnet-4.5"), "claude-sonnet-4.5");
        assert_eq!(registry.resolve("claude-sonnet-4-5"), "claude-sonnet-4.5");
    }

    #[test]
    fn resolve_passes_unknown_names_through() {
        let registry = ModelRegistry::new(default_model_map());
        for name in ["gpt-4o", "", "claude-opus-4.5", "COPILOT-OPUS-45", "copilot-opus"] {
            assert_eq!(registry.resolve(name), name);
        }
    }

    #[test]
    fn duplicate_alias_keeps_first_declaration() {
        let registry = ModelRegistry::new(vec![
            ModelMapEntry::new("a", "first"),
            ModelMapEntry::new("a", "second"),
        ]);
        assert_eq!(registry.resolve("a"), "first");
    }

    #[test]
    fn listing_puts_aliases_first_and_filters_picker_disabled() {
        let registry = ModelRegistry::new(vec![
            ModelMapEntry::new("copilot-opus-45", "claude-opus-4.5"),
            ModelMapEntry::new("gpt-4o", "gpt-4o"),
        ]);
        let catalog = json!({
            "data": [
                { "id": "gpt-4o", "vendor": "Azure OpenAI", "model_picker_enabled": true },
                { "id": "text-embedding-3-small", "model_picker_enabled": false },
                { "id": "claude-opus-4.5", "model_picker_enabled": true },
                { "id": "o1-hidden" }
            ]
        });
        let ids: Vec<(String, String)> = merge_model_listing(&registry, &catalog)
            .into_iter()
            .map(|m| (m.id, m.owned_by))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("copilot-opus-45".to_string(), "github-copilot".to_string()),
                ("gpt-4o".to_string(), "github-copilot".to_string()),
                ("gpt-4o".to_string(), "Azure OpenAI".to_string()),
                ("claude-opus-4.5".to_string(), "github-copilot".to_string()),
            ]
        );
    }

    #[test]
    fn listing_entry_serializes_openai_shape() {
        let registry = ModelRegistry::new(default_model_map());
        let entries = merge_model_listing(&registry, &json!({}));
        assert_eq!(entries.len(), 6);
        assert_eq!(
            serde_json::to_value(&entries[0]).unwrap(),
            json!({
                "id": "copilot-opus-45",
                "object": "model",
                "owned_by": "github-copilot",
                "permission": []
            })
        );
    }
}
