use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use parley_db::Database;
use parley_types::{Capability, CapabilityTier};

use crate::error::{Error, Result};
use crate::store::blocking;

pub const REGISTRATION: &str = "feature_registration";
pub const PRIVATE_CHAT: &str = "feature_private_chat";
pub const MESSAGE_DELETE: &str = "feature_message_delete";

pub const GROUP_CHAT: &str = "feature_group_chat";
pub const AI_BOT: &str = "feature_ai_bot";
pub const AI_SUGGEST: &str = "feature_ai_suggest";
pub const MULTIMEDIA: &str = "feature_multimedia";
pub const MESSAGE_RECALL: &str = "feature_message_recall";

struct Definition {
    key: &'static str,
    label: &'static str,
    default: bool,
}

/// Compiled in, always on, never persisted.
const CORE: &[Definition] = &[
    Definition { key: REGISTRATION, label: "Account registration", default: true },
    Definition { key: PRIVATE_CHAT, label: "Private chat", default: true },
    Definition { key: MESSAGE_DELETE, label: "Delete messages for yourself", default: true },
];

/// Persisted in `settings`; the default applies until the first write.
const OPTIONAL: &[Definition] = &[
    Definition { key: GROUP_CHAT, label: "Group chat", default: true },
    Definition { key: AI_BOT, label: "AI assistant auto-reply", default: true },
    Definition { key: AI_SUGGEST, label: "AI reply suggestions", default: true },
    Definition { key: MULTIMEDIA, label: "Images and voice messages", default: true },
    Definition { key: MESSAGE_RECALL, label: "Message recall", default: true },
];

fn core_def(key: &str) -> Option<&'static Definition> {
    CORE.iter().find(|d| d.key == key)
}

fn optional_def(key: &str) -> Option<&'static Definition> {
    OPTIONAL.iter().find(|d| d.key == key)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Default)]
struct Snapshot {
    generation: u64,
    /// Persisted optional values only.
    values: HashMap<&'static str, bool>,
}

/// Capability evaluation with an in-memory snapshot of the persisted flags.
///
/// Resolution: core keys are always enabled; optional keys use the persisted
/// value, then their compiled-in default. Unknown keys resolve to enabled;
/// this fail-open rule is intentional.
#[derive(Clone)]
pub struct CapabilityGate {
    db: Arc<Database>,
    cache: Arc<RwLock<Snapshot>>,
}

impl CapabilityGate {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Arc::new(RwLock::new(Snapshot::default())),
        }
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        if core_def(key).is_some() {
            return true;
        }
        let Some(def) = optional_def(key) else {
            return true;
        };
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.values.get(def.key).copied().unwrap_or(def.default)
    }

    /// `Policy` failure when `key` is switched off.
    pub fn require(&self, key: &str) -> Result<()> {
        if self.is_enabled(key) {
            Ok(())
        } else {
            Err(Error::feature_disabled(key))
        }
    }

    /// Bumped on every rebuild or toggle.
    pub fn generation(&self) -> u64 {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).generation
    }

    /// Rebuild the snapshot from the store.
    pub async fn load(&self) -> Result<()> {
        let stored = blocking(&self.db, |db| db.all_settings()).await?;

        let mut values = HashMap::new();
        for def in OPTIONAL {
            let Some(raw) = stored.get(def.key) else { continue };
            match parse_flag(raw) {
                Some(flag) => {
                    values.insert(def.key, flag);
                }
                None => warn!("Ignoring unparseable value {:?} for {}", raw, def.key),
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.values = values;
        cache.generation += 1;
        info!("Capabilities loaded (generation {})", cache.generation);
        Ok(())
    }

    /// Store every optional key that has never been written.
    pub async fn seed_defaults(&self) -> Result<()> {
        blocking(&self.db, |db| {
            let now = Utc::now();
            for def in OPTIONAL {
                db.seed_setting(def.key, if def.default { "true" } else { "false" }, now)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn set(&self, key: &str, enabled: bool) -> Result<Capability> {
        if core_def(key).is_some() {
            return Err(Error::Policy(format!("{key} is a core capability and cannot be toggled")));
        }
        let def = optional_def(key).ok_or(Error::NotFound("capability"))?;

        blocking(&self.db, move |db| {
            db.upsert_setting(def.key, if enabled { "true" } else { "false" }, Utc::now())
        })
        .await?;

        {
            let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
            cache.values.insert(def.key, enabled);
            cache.generation += 1;
        }
        info!("Capability {} set to {}", def.key, enabled);

        Ok(Capability {
            key: def.key.to_string(),
            enabled,
            label: def.label.to_string(),
            tier: CapabilityTier::Optional,
        })
    }

    /// Optional capabilities with their current values.
    pub fn optional(&self) -> Vec<Capability> {
        OPTIONAL
            .iter()
            .map(|def| Capability {
                key: def.key.to_string(),
                enabled: self.is_enabled(def.key),
                label: def.label.to_string(),
                tier: CapabilityTier::Optional,
            })
            .collect()
    }

    /// Core followed by optional.
    pub fn all(&self) -> Vec<Capability> {
        CORE.iter()
            .map(|def| Capability {
                key: def.key.to_string(),
                enabled: def.default,
                label: def.label.to_string(),
                tier: CapabilityTier::Core,
            })
            .chain(self.optional())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (CapabilityGate, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        (CapabilityGate::new(db.clone()), db)
    }

    #[tokio::test]
    async fn defaults_apply_before_first_write() {
        let (gate, _) = gate();
        assert!(gate.is_enabled(GROUP_CHAT));
        assert!(gate.is_enabled(REGISTRATION));
        assert!(gate.require(AI_BOT).is_ok());
    }

    #[tokio::test]
    async fn unknown_keys_fail_open() {
        let (gate, _) = gate();
        assert!(gate.is_enabled("feature_does_not_exist"));
    }

    #[tokio::test]
    async fn core_keys_cannot_be_toggled() {
        let (gate, _) = gate();
        assert!(matches!(gate.set(PRIVATE_CHAT, false).await, Err(Error::Policy(_))));
        assert!(gate.is_enabled(PRIVATE_CHAT));
        assert!(matches!(gate.set("feature_nope", false).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn toggle_updates_cache_and_store() {
        let (gate, db) = gate();
        let before = gate.generation();
        gate.set(AI_BOT, false).await.unwrap();
        assert!(!gate.is_enabled(AI_BOT));
        assert!(matches!(gate.require(AI_BOT), Err(Error::Policy(_))));
        assert!(gate.generation() > before);
        assert_eq!(db.get_setting(AI_BOT).unwrap().as_deref(), Some("false"));

        // a fresh gate over the same store sees the persisted value after load
        let other = CapabilityGate::new(db);
        assert!(other.is_enabled(AI_BOT));
        other.load().await.unwrap();
        assert!(!other.is_enabled(AI_BOT));
    }

    #[tokio::test]
    async fn seeding_keeps_existing_values() {
        let (gate, db) = gate();
        db.upsert_setting(MULTIMEDIA, "false", Utc::now()).unwrap();
        gate.seed_defaults().await.unwrap();
        gate.load().await.unwrap();
        assert!(!gate.is_enabled(MULTIMEDIA));
        assert_eq!(db.get_setting(GROUP_CHAT).unwrap().as_deref(), Some("true"));

        let all = gate.all();
        assert_eq!(all.len(), CORE.len() + OPTIONAL.len());
        assert_eq!(all[0].tier, CapabilityTier::Core);
    }
}
