//! NS response cache.
//!
//! Keyed by (queried name, server label) so the same name asked of two
//! different servers caches independently. TTLs are clamped into the
//! configured `[min, max]` window; entries expire lazily on lookup and can
//! also be removed by the periodic sweep.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct NsKey {
    /// The queried name (fqdn form).
    pub name: String,
    /// The server the query went to, as logged: a hostname or `[ipv6]`.
    pub server: String,
}

#[derive(Debug, Clone)]
pub struct NsEntry {
    pub servers: Vec<String>,
    pub authoritative: bool,
    expires: Instant,
}

pub struct NsCache {
    min_ttl: u32,
    max_ttl: u32,
    entries: Mutex<HashMap<NsKey, NsEntry>>,
}

impl NsCache {
    pub fn new(min_ttl: u32, max_ttl: u32) -> Self {
        Self {
            min_ttl,
            max_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a live entry. Expired entries are removed and reported as a
    /// miss. The returned duration is the remaining lifetime, used only
    /// for logging.
    pub async fn get(&self, key: &NsKey) -> Option<(NsEntry, Duration)> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires > now => {
                let remaining = entry.expires - now;
                Some((entry.clone(), remaining))
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a response under the minimum record TTL, clamped into
    /// `[min_ttl, max_ttl]` (and at least one second, so every entry is
    /// live at insertion).
    pub async fn put(&self, key: NsKey, servers: Vec<String>, authoritative: bool, min_record_ttl: u32) {
        let ttl = min_record_ttl.clamp(self.min_ttl, self.max_ttl).max(1);
        let entry = NsEntry {
            servers,
            authoritative,
            expires: Instant::now() + Duration::from_secs(ttl as u64),
        };
        self.entries.lock().await.insert(key, entry);
    }

    /// Drop every expired entry.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.entries.lock().await.retain(|_, e| e.expires > now);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, server: &str) -> NsKey {
        NsKey {
            name: name.into(),
            server: server.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = NsCache::new(1, 3600);
        let k = key("example.org.", "a.gtld-servers.net.");
        cache
            .put(k.clone(), vec!["ns1.example.org.".into()], false, 2)
            .await;
        assert!(cache.get(&k).await.is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.get(&k).await.is_none(), "expired entry behaves as a miss");
        assert_eq!(cache.len().await, 0, "lazy expiry removed the entry");
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_clamped_to_window() {
        let cache = NsCache::new(60, 120);
        let k = key("example.org.", "srv");
        // a 1-second record TTL must survive to the 60-second floor
        cache.put(k.clone(), vec!["ns.".into()], true, 1).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&k).await.is_some());

        // and a huge TTL must die at the 120-second ceiling
        let k2 = key("other.org.", "srv");
        cache.put(k2.clone(), vec!["ns.".into()], true, 999_999).await;
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(cache.get(&k2).await.is_none());
    }

    #[tokio::test]
    async fn keys_differ_by_server() {
        let cache = NsCache::new(1, 3600);
        cache
            .put(key("example.org.", "a"), vec!["ns-a.".into()], false, 300)
            .await;
        cache
            .put(key("example.org.", "b"), vec!["ns-b.".into()], true, 300)
            .await;

        let (a, _) = cache.get(&key("example.org.", "a")).await.unwrap();
        let (b, _) = cache.get(&key("example.org.", "b")).await.unwrap();
        assert_eq!(a.servers, vec!["ns-a.".to_string()]);
        assert!(!a.authoritative);
        assert_eq!(b.servers, vec!["ns-b.".to_string()]);
        assert!(b.authoritative);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let cache = NsCache::new(1, 3600);
        cache.put(key("a.", "s"), vec![], false, 1).await;
        cache.put(key("b.", "s"), vec![], false, 3600).await;
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.sweep().await;
        assert_eq!(cache.len().await, 1);
    }
}
