//! Canonical job link -> `(company, role)` ownership.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use jobfit_core::LinkOwner;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The link was unseen and now belongs to the presenting pair.
    Registered,
    /// The presenting pair already owns the link.
    SameOwner,
    /// Another pair owns the link; the registry was left untouched.
    Collision(LinkOwner),
    /// Blank link; never registered.
    Ignored,
}

/// First registration wins. Serializes as `{"link_map": {...}}` in
/// registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkRegistry {
    link_map: IndexMap<String, LinkOwner>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        link: &str,
        company: &str,
        role: &str,
        file: &str,
        timestamp: DateTime<Utc>,
    ) -> LinkOutcome {
        let link = link.trim();
        if link.is_empty() {
            return LinkOutcome::Ignored;
        }
        match self.link_map.get(link) {
            Some(owner) if owner.owns(company, role) => LinkOutcome::SameOwner,
            Some(owner) => LinkOutcome::Collision(owner.clone()),
            None => {
                self.link_map.insert(
                    link.to_string(),
                    LinkOwner {
                        company: company.to_string(),
                        role: role.to_string(),
                        file: file.to_string(),
                        timestamp,
                    },
                );
                LinkOutcome::Registered
            }
        }
    }

    pub fn owner(&self, link: &str) -> Option<&LinkOwner> {
        self.link_map.get(link.trim())
    }

    pub fn links(&self) -> &IndexMap<String, LinkOwner> {
        &self.link_map
    }

    pub fn len(&self) -> usize {
        self.link_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.link_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 3, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = LinkRegistry::new();
        assert_eq!(
            registry.register("http://x/1", "Acme", "Eng", "a.json", ts()),
            LinkOutcome::Registered
        );
        assert_eq!(
            registry.register("http://x/1", "Acme", "Eng", "b.json", ts()),
            LinkOutcome::SameOwner
        );
        match registry.register("http://x/1", "Beta", "Ops", "b.json", ts()) {
            LinkOutcome::Collision(owner) => {
                assert_eq!(owner.company, "Acme");
                assert_eq!(owner.file, "a.json");
            }
            other => panic!("expected collision, got {other:?}"),
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner("http://x/1").unwrap().role, "Eng");
    }

    #[test]
    fn links_are_trimmed_and_blank_links_ignored() {
        let mut registry = LinkRegistry::new();
        assert_eq!(
            registry.register("   ", "Acme", "Eng", "a.json", ts()),
            LinkOutcome::Ignored
        );
        assert_eq!(
            registry.register(" http://x/2 ", "Acme", "Eng", "a.json", ts()),
            LinkOutcome::Registered
        );
        assert!(matches!(
            registry.register("http://x/2", "Beta", "Ops", "b.json", ts()),
            LinkOutcome::Collision(_)
        ));
        assert!(registry.owner("http://x/2").is_some());
    }

    #[test]
    fn serializes_under_link_map_key() {
        let mut registry = LinkRegistry::new();
        registry.register("http://x/1", "Acme", "Eng", "a.json", ts());
        let value = serde_json::to_value(&registry).unwrap();
        assert_eq!(value["link_map"]["http://x/1"]["company"], "Acme");
        assert_eq!(value["link_map"]["http://x/1"]["file"], "a.json");
        assert_eq!(value["link_map"]["http://x/1"]["timestamp"], "2025-11-03T09:30:00Z");
    }
}
