//! Static event bus for upstream events.
//!
//! Every native event the [`Gateway`][crate::adapter::Gateway] yields passes
//! through [`EventDispatcher::dispatch`], which does two things per event
//! kind:
//!
//! 1. **Local bookkeeping** – keeps the Hub's [`StateCache`] (guilds,
//!    channels, users) consistent, exactly as the default handling of the
//!    upstream client would.
//! 2. **Fan-out** – augments well-known foreign keys with cached objects and
//!    pushes `{type, data}` onto the [`WorkQueue`].
//!
//! | Foreign key | Attached as |
//! |---|---|
//! | `guild_id` | `guild` |
//! | `channel_id` | `channel` |
//! | `user_id` | `user` |

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::queue::{QueuedEvent, WorkQueue};

/// Every upstream event kind the Hub knows how to book-keep.
///
/// Unknown kinds are still forwarded to Workers as [`EventKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ready,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageReactionAdd,
    MessageReactionRemove,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    GuildMemberAdd,
    GuildMemberRemove,
    InteractionCreate,
    Other(String),
}

impl EventKind {
    /// Wire name used in `start` frames.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ready => "ready",
            EventKind::MessageCreate => "message_create",
            EventKind::MessageUpdate => "message_update",
            EventKind::MessageDelete => "message_delete",
            EventKind::MessageReactionAdd => "message_reaction_add",
            EventKind::MessageReactionRemove => "message_reaction_remove",
            EventKind::GuildCreate => "guild_create",
            EventKind::GuildUpdate => "guild_update",
            EventKind::GuildDelete => "guild_delete",
            EventKind::ChannelCreate => "channel_create",
            EventKind::ChannelUpdate => "channel_update",
            EventKind::ChannelDelete => "channel_delete",
            EventKind::GuildMemberAdd => "guild_member_add",
            EventKind::GuildMemberRemove => "guild_member_remove",
            EventKind::InteractionCreate => "interaction_create",
            EventKind::Other(name) => name,
        }
    }

    /// Parse a wire name. Accepts upper-case gateway names (`MESSAGE_CREATE`).
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "ready" => EventKind::Ready,
            "message_create" => EventKind::MessageCreate,
            "message_update" => EventKind::MessageUpdate,
            "message_delete" => EventKind::MessageDelete,
            "message_reaction_add" => EventKind::MessageReactionAdd,
            "message_reaction_remove" => EventKind::MessageReactionRemove,
            "guild_create" => EventKind::GuildCreate,
            "guild_update" => EventKind::GuildUpdate,
            "guild_delete" => EventKind::GuildDelete,
            "channel_create" => EventKind::ChannelCreate,
            "channel_update" => EventKind::ChannelUpdate,
            "channel_delete" => EventKind::ChannelDelete,
            "guild_member_add" => EventKind::GuildMemberAdd,
            "guild_member_remove" => EventKind::GuildMemberRemove,
            "interaction_create" => EventKind::InteractionCreate,
            _ => EventKind::Other(name.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One native event as produced by a gateway adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl GatewayEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State cache
// ─────────────────────────────────────────────────────────────────────────────

/// Hub-local view of upstream objects, keyed by their id rendered as a string.
#[derive(Debug, Default)]
pub struct StateCache {
    guilds: HashMap<String, Value>,
    channels: HashMap<String, Value>,
    users: HashMap<String, Value>,
    me: Option<Value>,
}

/// Render a snowflake (number or string) as a cache key.
pub(crate) fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl StateCache {
    pub fn guild(&self, id: &str) -> Option<&Value> {
        self.guilds.get(id)
    }

    pub fn channel(&self, id: &str) -> Option<&Value> {
        self.channels.get(id)
    }

    pub fn user(&self, id: &str) -> Option<&Value> {
        self.users.get(id)
    }

    /// The user object announced in the last `ready` event.
    pub fn me(&self) -> Option<&Value> {
        self.me.as_ref()
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    fn upsert_user(&mut self, user: &Value) {
        if let Some(id) = user.get("id").and_then(id_key) {
            self.users.insert(id, user.clone());
        }
    }

    fn upsert_channel(&mut self, channel: &Value, guild_id: Option<&Value>) {
        let Some(id) = channel.get("id").and_then(id_key) else {
            return;
        };
        let mut channel = channel.clone();
        if let (Some(gid), Value::Object(map)) = (guild_id, &mut channel) {
            map.entry("guild_id").or_insert_with(|| gid.clone());
        }
        self.channels.insert(id, channel);
    }

    /// Store a guild, splitting embedded channels and members into their own
    /// tables so the stored guild stays small.
    fn upsert_guild(&mut self, guild: &Value) {
        let Some(id) = guild.get("id").and_then(id_key) else {
            return;
        };
        let guild_id = guild.get("id").cloned();
        if let Some(channels) = guild.get("channels").and_then(Value::as_array) {
            for channel in channels {
                self.upsert_channel(channel, guild_id.as_ref());
            }
        }
        if let Some(members) = guild.get("members").and_then(Value::as_array) {
            for member in members {
                if let Some(user) = member.get("user") {
                    self.upsert_user(user);
                }
            }
        }
        let mut stored = guild.clone();
        if let Value::Object(map) = &mut stored {
            map.remove("channels");
            map.remove("members");
        }
        self.guilds.insert(id, stored);
    }

    fn remove_guild(&mut self, id: &str) {
        self.guilds.remove(id);
        self.channels.retain(|_, channel| {
            channel.get("guild_id").and_then(id_key).as_deref() != Some(id)
        });
    }

    /// Apply the default bookkeeping for one event.
    pub fn apply(&mut self, event: &GatewayEvent) {
        let data = &event.data;
        match event.kind {
            EventKind::Ready => {
                if let Some(user) = data.get("user") {
                    self.upsert_user(user);
                    self.me = Some(user.clone());
                }
                if let Some(guilds) = data.get("guilds").and_then(Value::as_array) {
                    for guild in guilds {
                        self.upsert_guild(guild);
                    }
                }
            }
            EventKind::GuildCreate | EventKind::GuildUpdate => self.upsert_guild(data),
            EventKind::GuildDelete => {
                if let Some(id) = data.get("id").and_then(id_key) {
                    self.remove_guild(&id);
                }
            }
            EventKind::ChannelCreate | EventKind::ChannelUpdate => {
                self.upsert_channel(data, data.get("guild_id"));
            }
            EventKind::ChannelDelete => {
                if let Some(id) = data.get("id").and_then(id_key) {
                    self.channels.remove(&id);
                }
            }
            EventKind::MessageCreate | EventKind::MessageUpdate => {
                if let Some(author) = data.get("author") {
                    self.upsert_user(author);
                }
            }
            EventKind::GuildMemberAdd => {
                if let Some(user) = data.get("user") {
                    self.upsert_user(user);
                }
            }
            EventKind::InteractionCreate => {
                if let Some(user) = data.get("member").and_then(|m| m.get("user")).or_else(|| data.get("user")) {
                    self.upsert_user(user);
                }
            }
            EventKind::MessageDelete
            | EventKind::MessageReactionAdd
            | EventKind::MessageReactionRemove
            | EventKind::GuildMemberRemove
            | EventKind::Other(_) => {}
        }
    }

    /// Attach cached objects for well-known foreign keys. Existing keys are
    /// never overwritten.
    pub fn augment(&self, data: &mut Value) {
        let Value::Object(map) = data else {
            return;
        };
        attach(map, "guild_id", "guild", &self.guilds);
        attach(map, "channel_id", "channel", &self.channels);
        attach(map, "user_id", "user", &self.users);
    }
}

fn attach(map: &mut Map<String, Value>, key: &str, target: &str, table: &HashMap<String, Value>) {
    if map.contains_key(target) {
        return;
    }
    let Some(found) = map.get(key).and_then(id_key).and_then(|id| table.get(&id)) else {
        return;
    };
    map.insert(target.to_string(), found.clone());
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Typed dispatcher from upstream events to local bookkeeping and the queue.
///
/// Clone it cheaply – clones share the cache and the queue.
#[derive(Clone)]
pub struct EventDispatcher {
    cache: Arc<RwLock<StateCache>>,
    queue: WorkQueue,
}

impl EventDispatcher {
    pub fn new(queue: WorkQueue) -> Self {
        Self {
            cache: Arc::new(RwLock::new(StateCache::default())),
            queue,
        }
    }

    /// Shared handle to the Hub's state cache.
    pub fn cache(&self) -> Arc<RwLock<StateCache>> {
        Arc::clone(&self.cache)
    }

    /// Book-keep, augment and enqueue one event.
    ///
    /// Returns the event exactly as it was queued.
    pub fn dispatch(&self, event: GatewayEvent) -> QueuedEvent {
        let mut data = event.data.clone();
        if let Ok(mut cache) = self.cache.write() {
            cache.apply(&event);
            cache.augment(&mut data);
        }
        trace!(event = %event.kind, "dispatching upstream event");

        let queued = QueuedEvent {
            event: event.kind.as_str().to_string(),
            data,
        };
        self.queue.push(queued.clone());
        debug!(event = %event.kind, queued = self.queue.len(), "event enqueued");
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> (EventDispatcher, WorkQueue) {
        let queue = WorkQueue::new();
        (EventDispatcher::new(queue.clone()), queue)
    }

    #[test]
    fn event_kind_names_roundtrip() {
        for name in ["ready", "message_create", "guild_member_remove", "interaction_create"] {
            assert_eq!(EventKind::from_name(name).as_str(), name);
        }
        assert_eq!(EventKind::from_name("MESSAGE_CREATE"), EventKind::MessageCreate);
        assert_eq!(
            EventKind::from_name("typing_start"),
            EventKind::Other("typing_start".into())
        );
    }

    #[test]
    fn guild_create_splits_channels_and_members() {
        let mut cache = StateCache::default();
        cache.apply(&GatewayEvent::new(
            EventKind::GuildCreate,
            json!({
                "id": "10",
                "name": "Lobby",
                "channels": [{"id": "20", "name": "general"}],
                "members": [{"user": {"id": "30", "name": "alice"}}]
            }),
        ));
        let guild = cache.guild("10").unwrap();
        assert!(guild.get("channels").is_none());
        assert_eq!(cache.channel("20").unwrap()["guild_id"], json!("10"));
        assert_eq!(cache.user("30").unwrap()["name"], json!("alice"));
    }

    #[test]
    fn guild_delete_drops_its_channels() {
        let mut cache = StateCache::default();
        cache.apply(&GatewayEvent::new(
            EventKind::GuildCreate,
            json!({"id": 10, "channels": [{"id": 20}]}),
        ));
        cache.apply(&GatewayEvent::new(
            EventKind::ChannelCreate,
            json!({"id": 21, "guild_id": 11}),
        ));
        cache.apply(&GatewayEvent::new(EventKind::GuildDelete, json!({"id": 10})));
        assert!(cache.guild("10").is_none());
        assert!(cache.channel("20").is_none());
        assert!(cache.channel("21").is_some());
    }

    #[test]
    fn ready_records_me() {
        let mut cache = StateCache::default();
        cache.apply(&GatewayEvent::new(
            EventKind::Ready,
            json!({"user": {"id": 1, "name": "hub"}}),
        ));
        assert_eq!(cache.me().unwrap()["name"], json!("hub"));
    }

    #[test]
    fn dispatch_augments_foreign_keys_and_enqueues() {
        let (dispatcher, queue) = dispatcher();
        dispatcher.dispatch(GatewayEvent::new(
            EventKind::GuildCreate,
            json!({"id": "10", "name": "Lobby", "channels": [{"id": "20", "name": "general"}]}),
        ));
        let queued = dispatcher.dispatch(GatewayEvent::new(
            EventKind::MessageCreate,
            json!({"content": "hi", "guild_id": "10", "channel_id": "20", "author": {"id": "5"}}),
        ));
        assert_eq!(queued.event, "message_create");
        assert_eq!(queued.data["guild"]["name"], json!("Lobby"));
        assert_eq!(queued.data["channel"]["name"], json!("general"));
        assert_eq!(queue.len(), 2);
        assert_eq!(dispatcher.cache().read().unwrap().user("5").unwrap()["id"], json!("5"));
    }

    #[test]
    fn augment_never_overwrites_existing_keys() {
        let mut cache = StateCache::default();
        cache.apply(&GatewayEvent::new(EventKind::GuildCreate, json!({"id": 1, "name": "cached"})));
        let mut data = json!({"guild_id": 1, "guild": {"name": "inline"}});
        cache.augment(&mut data);
        assert_eq!(data["guild"]["name"], json!("inline"));
    }

    #[test]
    fn unknown_events_are_still_forwarded() {
        let (dispatcher, queue) = dispatcher();
        dispatcher.dispatch(GatewayEvent::new(EventKind::from_name("typing_start"), json!({"x": 1})));
        let queued = queue.try_pop().unwrap();
        assert_eq!(queued.event, "typing_start");
    }
}
