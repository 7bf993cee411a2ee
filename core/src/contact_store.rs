/// Contact storage: address-book entries kept under `contact:{user_id}`
use crate::error::{ChatError, Result};
use crate::local_store::{decode_record, LocalStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

const CONTACT_PREFIX: &str = "contact:";

pub fn contact_key(user_id: &str) -> String {
    format!("{}{}", CONTACT_PREFIX, user_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    pub display_name: String,
    pub phone_number: Option<String>,
    pub avatar: Option<String>,
    /// Whether the contact has an account on the messenger
    pub registered: bool,
    pub added_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            phone_number: None,
            avatar: None,
            registered: true,
            added_at: Utc::now(),
        }
    }

    fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.display_name.to_lowercase().contains(&q)
            || self
                .phone_number
                .as_deref()
                .map(|p| p.contains(query))
                .unwrap_or(false)
    }
}

/// Read-only lookup used to put names on conversations
pub trait ContactDirectory: Send + Sync {
    fn lookup(&self, user_id: &str) -> Result<Option<Contact>>;

    fn search(&self, query: &str) -> Result<Vec<Contact>>;
}

#[derive(Clone)]
pub struct ContactStore {
    store: LocalStore,
}

impl ContactStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn add_contact(&self, c: &Contact) -> Result<()> {
        if c.user_id.is_empty() {
            return Err(ChatError::Config("contact needs a user id".to_string()));
        }
        debug!("Saving contact {}", c.user_id);
        self.store.set_record(&contact_key(&c.user_id), c)
    }

    /// All contacts, sorted by display name
    pub fn get_contacts(&self) -> Result<Vec<Contact>> {
        let mut out = Vec::new();
        for (key, bytes) in self.store.scan_prefix(CONTACT_PREFIX)? {
            out.push(decode_record::<Contact>(&key, &bytes)?);
        }
        out.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(out)
    }

    pub fn get_contact(&self, user_id: &str) -> Result<Option<Contact>> {
        self.store.get_record(&contact_key(user_id))
    }

    pub fn remove_contact(&self, user_id: &str) -> Result<bool> {
        let key = contact_key(user_id);
        let existed = self.store.get(&key)?.is_some();
        if existed {
            self.store.remove(&key)?;
        }
        Ok(existed)
    }

    /// Case-insensitive match on name, or substring match on phone number
    pub fn search(&self, query: &str) -> Result<Vec<Contact>> {
        let query = query.trim();
        let all = self.get_contacts()?;
        if query.is_empty() {
            return Ok(all);
        }
        Ok(all.into_iter().filter(|c| c.matches(query)).collect())
    }
}

impl ContactDirectory for ContactStore {
    fn lookup(&self, user_id: &str) -> Result<Option<Contact>> {
        self.get_contact(user_id)
    }

    fn search(&self, query: &str) -> Result<Vec<Contact>> {
        ContactStore::search(self, query)
    }
}
