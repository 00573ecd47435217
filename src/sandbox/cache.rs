use std::collections::HashMap;
use std::sync::RwLock;

/// Sandbox ID -> private endpoint URL, shared by every caller of a client.
///
/// Entries are only ever added with the endpoint the orchestrator reported
/// and only removed when the sandbox is deleted.
#[derive(Debug, Default)]
pub struct EndpointCache {
    endpoints: RwLock<HashMap<String, String>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sandbox_id: &str) -> Option<String> {
        // A poisoned lock still holds consistent data: writers never panic mid-update
        let guard = self
            .endpoints
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(sandbox_id).cloned()
    }

    pub fn insert(&self, sandbox_id: &str, endpoint: &str) {
        let mut guard = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(sandbox_id.to_string(), endpoint.to_string());
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<String> {
        let mut guard = self
            .endpoints
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(sandbox_id)
    }

    pub fn contains(&self, sandbox_id: &str) -> bool {
        self.get(sandbox_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .map(|guard| guard.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache = EndpointCache::new();
        assert!(cache.get("sb1").is_none());

        cache.insert("sb1", "http://10.11.0.100:49983");
        assert_eq!(cache.get("sb1").as_deref(), Some("http://10.11.0.100:49983"));
        assert!(cache.contains("sb1"));

        assert!(cache.remove("sb1").is_some());
        assert!(cache.remove("sb1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let cache = Arc::new(EndpointCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let id = format!("sb-{}-{}", i, j);
                        cache.insert(&id, "http://10.11.0.2:49983");
                        assert!(cache.get(&id).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
