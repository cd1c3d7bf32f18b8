//! Worker-local object cache.
//!
//! The Hub augments events with the guild, channel and user objects it has
//! seen. The Worker keeps the latest copy of each so handlers can look them up
//! without an RPC round trip. Only the dispatch path writes; handlers read.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

#[derive(Default)]
struct Objects {
    guilds: HashMap<String, Value>,
    channels: HashMap<String, Value>,
    users: HashMap<String, Value>,
}

/// Shared read-mostly cache. Clones share state.
#[derive(Clone, Default)]
pub struct ObjectCache {
    objects: Arc<RwLock<Objects>>,
}

fn id_key(object: &Value) -> Option<String> {
    match object.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the objects embedded in one event payload.
    pub(crate) fn observe(&self, data: &Value) {
        let Some(fields) = data.as_object() else {
            return;
        };
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        for (field, object) in fields {
            let Some(id) = id_key(object) else { continue };
            let table = match field.as_str() {
                "guild" => &mut objects.guilds,
                "channel" => &mut objects.channels,
                "user" | "author" => &mut objects.users,
                _ => continue,
            };
            table.insert(id, object.clone());
        }
    }

    pub fn guild(&self, id: &str) -> Option<Value> {
        self.read(|o| o.guilds.get(id).cloned())
    }

    pub fn channel(&self, id: &str) -> Option<Value> {
        self.read(|o| o.channels.get(id).cloned())
    }

    pub fn user(&self, id: &str) -> Option<Value> {
        self.read(|o| o.users.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.read(|o| o.guilds.len() + o.channels.len() + o.users.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&Objects) -> T) -> T {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        f(&objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn observe_picks_up_embedded_objects() {
        let cache = ObjectCache::new();
        cache.observe(&json!({
            "content": "hi",
            "guild": {"id": "1", "name": "g"},
            "channel": {"id": 2, "name": "general"},
            "author": {"id": "3", "name": "alice"},
            "guild_id": "1"
        }));
        assert_eq!(cache.guild("1").unwrap()["name"], json!("g"));
        assert_eq!(cache.channel("2").unwrap()["name"], json!("general"));
        assert_eq!(cache.user("3").unwrap()["name"], json!("alice"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn later_copies_replace_earlier_ones() {
        let cache = ObjectCache::new();
        cache.observe(&json!({"guild": {"id": "1", "name": "old"}}));
        cache.observe(&json!({"guild": {"id": "1", "name": "new"}}));
        assert_eq!(cache.guild("1").unwrap()["name"], json!("new"));
    }

    #[test]
    fn non_objects_are_ignored() {
        let cache = ObjectCache::new();
        cache.observe(&json!("just text"));
        cache.observe(&json!({"guild": "1"}));
        assert!(cache.is_empty());
    }
}
