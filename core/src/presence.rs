/// Presence: who is online, as reported by an external collaborator
use std::collections::HashSet;
use std::sync::RwLock;

pub trait Presence: Send + Sync {
    fn is_online(&self, user_id: &str) -> bool;
}

/// Presence table set explicitly by the host application (or a test)
#[derive(Debug, Default)]
pub struct StaticPresence {
    online: RwLock<HashSet<String>>,
}

impl StaticPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: &str, online: bool) {
        if let Ok(mut set) = self.online.write() {
            if online {
                set.insert(user_id.to_string());
            } else {
                set.remove(user_id);
            }
        }
    }
}

impl Presence for StaticPresence {
    fn is_online(&self, user_id: &str) -> bool {
        self.online
            .read()
            .map(|set| set.contains(user_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_presence() {
        let p = StaticPresence::new();
        assert!(!p.is_online("ada"));
        p.set_online("ada", true);
        assert!(p.is_online("ada"));
        p.set_online("ada", false);
        assert!(!p.is_online("ada"));
    }
}
