//! Parallel `category -> set<key>` index supporting `clear_category` (§4.F).

use dashmap::DashMap;
use dashmap::DashSet;

#[derive(Default)]
pub struct CategoryIndex {
    by_category: DashMap<String, DashSet<String>>,
}

impl CategoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, category: &str, key: &str) {
        self.by_category.entry(category.to_string()).or_default().insert(key.to_string());
    }

    pub fn remove(&self, category: &str, key: &str) {
        if let Some(set) = self.by_category.get(category) {
            set.remove(key);
        }
    }

    pub fn keys(&self, category: &str) -> Vec<String> {
        self.by_category
            .get(category)
            .map(|set| set.iter().map(|k| k.clone()).collect())
            .unwrap_or_default()
    }

    pub fn take_category(&self, category: &str) -> Vec<String> {
        self.by_category
            .remove(category)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_grouped_by_category() {
        let idx = CategoryIndex::new();
        idx.add("users", "u:1");
        idx.add("users", "u:2");
        idx.add("posts", "p:1");
        let mut users = idx.keys("users");
        users.sort();
        assert_eq!(users, vec!["u:1".to_string(), "u:2".to_string()]);
    }

    #[test]
    fn take_category_clears_the_index() {
        let idx = CategoryIndex::new();
        idx.add("users", "u:1");
        let taken = idx.take_category("users");
        assert_eq!(taken, vec!["u:1".to_string()]);
        assert!(idx.keys("users").is_empty());
    }
}
