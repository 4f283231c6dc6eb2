//! In-memory cache of static sub-resources, keyed by file name.
//!
//! The renderer backend consults [`ResourceCache::lookup`] before a request leaves the
//! browser and feeds successful responses back through [`ResourceCache::store_response`].
//! A hit is answered without touching the network.

use crate::config::CacheConfig;
use crate::metrics;
use crate::utils::lock;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::time::Instant;
use tracing::{debug, info};

fn static_resource_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\.(css|js|png|jpe?g|gif|svg|webp|woff2?|ttc|ttf)$")
            .expect("Invalid static resource regex")
    })
}

fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// True when the URL path ends in one of the cacheable extensions.
pub fn is_static_resource(url: &str) -> bool {
    static_resource_regex().is_match(strip_query(url))
}

/// Basename of a URL or path with the query string and fragment removed.
pub fn extract_file_name(url: &str) -> String {
    let path = strip_query(url);
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Headers describing the wire encoding of a body. Cached bodies are stored decoded, so
/// replaying these would make the browser decode or truncate them a second time.
const TRANSPORT_HEADERS: [&str; 3] = ["content-encoding", "content-length", "transfer-encoding"];

/// Drops the headers that no longer describe a decoded body.
pub fn replayable_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| {
            !TRANSPORT_HEADERS
                .iter()
                .any(|transport| name.eq_ignore_ascii_case(transport))
        })
        .collect()
}

/// A cached response, cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResource {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug)]
struct CacheEntry {
    resource: CachedResource,
    usage_count: u64,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    total_bytes: usize,
    config: CacheConfig,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
pub struct ResourceCache {
    inner: Arc<Mutex<CacheState>>,
}

impl ResourceCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                total_bytes: 0,
                config,
                hits: 0,
                misses: 0,
                evictions: 0,
            })),
        }
    }

    /// Returns the cached response for `url` and records the hit.
    ///
    /// Non-static URLs are never looked up and count as neither hit nor miss.
    pub fn lookup(&self, url: &str) -> Option<CachedResource> {
        if !is_static_resource(url) {
            return None;
        }

        let key = extract_file_name(url);
        let mut state = lock(&self.inner);

        match state.entries.get_mut(&key) {
            Some(entry) => {
                entry.usage_count += 1;
                entry.last_used = Instant::now();
                let resource = entry.resource.clone();
                state.hits += 1;
                drop(state);

                debug!("Cache hit: {}", key);
                metrics::record_cache_lookup(true);
                Some(resource)
            }
            None => {
                state.misses += 1;
                drop(state);

                metrics::record_cache_lookup(false);
                None
            }
        }
    }

    /// Stores a network response. Only 2xx responses for static URLs are kept.
    ///
    /// `body` must be the decoded body; encoding and length headers are dropped.
    ///
    /// Returns whether the response was stored. Replacing an existing entry keeps its
    /// usage count and creation time.
    pub fn store_response(
        &self,
        url: &str,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    ) -> bool {
        if !(200..300).contains(&status) || !is_static_resource(url) {
            return false;
        }

        let key = extract_file_name(url);
        let size = body.len();
        let now = Instant::now();
        let resource = CachedResource {
            status,
            headers: replayable_headers(headers),
            body,
        };

        let mut state = lock(&self.inner);
        match state.entries.get_mut(&key) {
            Some(entry) => {
                let previous = entry.resource.body.len();
                entry.resource = resource;
                entry.last_used = now;
                state.total_bytes = state.total_bytes - previous + size;
            }
            None => {
                state.entries.insert(
                    key.clone(),
                    CacheEntry {
                        resource,
                        usage_count: 0,
                        created_at: now,
                        last_used: now,
                    },
                );
                state.total_bytes += size;
            }
        }
        debug!("Cached {} ({} bytes)", key, size);

        if state.entries.len() > state.config.max_items
            || state.total_bytes > state.config.max_bytes
        {
            evict(&mut state);
        }

        true
    }

    pub fn contains(&self, file_name: &str) -> bool {
        lock(&self.inner)
            .entries
            .contains_key(&extract_file_name(file_name))
    }

    /// True iff every named resource is cached. An empty list is trivially cached.
    pub fn check_resources_in_cache<S: AsRef<str>>(&self, file_names: &[S]) -> bool {
        let state = lock(&self.inner);
        file_names
            .iter()
            .all(|name| state.entries.contains_key(&extract_file_name(name.as_ref())))
    }

    /// Runs one eviction pass regardless of the thresholds. Returns the evicted count.
    pub fn cleanup(&self) -> usize {
        let mut state = lock(&self.inner);
        evict(&mut state)
    }

    pub fn reset(&self) {
        let mut state = lock(&self.inner);
        let count = state.entries.len();
        state.entries.clear();
        state.total_bytes = 0;
        info!("Resource cache reset, {} entries dropped", count);
    }

    /// Replaces the thresholds, evicting immediately if the cache is now over them.
    pub fn set_limits(&self, config: CacheConfig) {
        let mut state = lock(&self.inner);
        state.config = config;

        if state.entries.len() > state.config.max_items
            || state.total_bytes > state.config.max_bytes
        {
            evict(&mut state);
        }
    }

    pub fn usage_count(&self, file_name: &str) -> Option<u64> {
        lock(&self.inner)
            .entries
            .get(&extract_file_name(file_name))
            .map(|entry| entry.usage_count)
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.inner);
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Removes `cleanup_ratio` of the entries, least used and oldest first.
///
/// Entries younger than `min_age` sort last and are never removed.
fn evict(state: &mut CacheState) -> usize {
    let now = Instant::now();
    let min_age = state.config.min_age;
    let len = state.entries.len();
    // Float slack so that e.g. 51 * (1/3) keeps 17, not 18.
    let keep = (len as f64 * (1.0 - state.config.cleanup_ratio) - 1e-9)
        .ceil()
        .max(0.0) as usize;
    let target = len.saturating_sub(keep);

    let mut order: Vec<(bool, u64, Instant, String)> = state
        .entries
        .iter()
        .map(|(key, entry)| {
            let young = now.duration_since(entry.created_at) < min_age;
            (young, entry.usage_count, entry.created_at, key.clone())
        })
        .collect();
    order.sort();

    let mut removed = 0;
    for (young, _, _, key) in order {
        if removed >= target || young {
            break;
        }
        if let Some(entry) = state.entries.remove(&key) {
            state.total_bytes -= entry.resource.body.len();
            removed += 1;
        }
    }

    state.evictions += removed as u64;
    if removed > 0 {
        info!(
            "Evicted {} cached resources, {} remain ({})",
            removed,
            state.entries.len(),
            crate::utils::format_bytes(state.total_bytes)
        );
        metrics::record_cache_eviction(removed, state.total_bytes);
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(max_items: usize) -> CacheConfig {
        CacheConfig {
            max_items,
            max_bytes: 1024 * 1024,
            cleanup_ratio: 2.0 / 3.0,
            min_age: Duration::from_secs(30),
        }
    }

    fn store(cache: &ResourceCache, name: &str, size: usize) -> bool {
        cache.store_response(
            &format!("http://127.0.0.1:8080/resources/{name}?v=1"),
            200,
            vec![("content-type".to_string(), "text/plain".to_string())],
            Bytes::from(vec![b'x'; size]),
        )
    }

    #[test]
    fn test_static_resource_detection() {
        assert!(is_static_resource("http://a/b/style.css"));
        assert!(is_static_resource("http://a/b/font.WOFF2?x=1"));
        assert!(is_static_resource("./resources/photo.jpeg#frag"));
        assert!(!is_static_resource("http://a/b/index.html"));
        assert!(!is_static_resource("http://a/api/data.json"));
    }

    #[test]
    fn test_extract_file_name() {
        assert_eq!(extract_file_name("http://a/b/c.js?v=3"), "c.js");
        assert_eq!(extract_file_name("file:///tmp/x/y.png"), "y.png");
        assert_eq!(extract_file_name("plain.css"), "plain.css");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_and_hit_bumps_usage() {
        let cache = ResourceCache::new(config(50));
        assert!(store(&cache, "app.js", 10));
        assert_eq!(cache.usage_count("app.js"), Some(0));

        let hit = cache.lookup("http://other-host/static/app.js").unwrap();
        assert_eq!(hit.body.len(), 10);
        assert_eq!(hit.status, 200);
        assert_eq!(cache.usage_count("app.js"), Some(1));

        assert!(cache.lookup("http://h/missing.js").is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_non_2xx_and_dynamic() {
        let cache = ResourceCache::default();
        assert!(!cache.store_response("http://h/a.css", 404, vec![], Bytes::from_static(b"x")));
        assert!(!cache.store_response("http://h/a.html", 200, vec![], Bytes::from_static(b"x")));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_bytes_tracked_incrementally() {
        let cache = ResourceCache::new(config(50));
        store(&cache, "a.css", 100);
        store(&cache, "b.css", 50);
        assert_eq!(cache.stats().total_bytes, 150);

        store(&cache, "a.css", 30);
        assert_eq!(cache.stats().total_bytes, 80);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_boundary() {
        let cache = ResourceCache::new(config(50));
        for i in 0..50 {
            store(&cache, &format!("r{i}.png"), 1);
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        store(&cache, "r50.png", 1);
        // The entry that triggered the pass is younger than min_age and survives.
        assert!(cache.contains("r50.png"));
        assert_eq!(cache.len(), 17);
        assert_eq!(cache.stats().total_bytes, 17);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_order_prefers_unused_and_old() {
        let cache = ResourceCache::new(config(100));
        for name in ["old.js", "used.js", "newer.js"] {
            store(&cache, name, 1);
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        cache.lookup("http://h/used.js");
        tokio::time::advance(Duration::from_secs(60)).await;

        // 3 entries, ratio 2/3: keep one.
        assert_eq!(cache.cleanup(), 2);
        assert!(cache.contains("used.js"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_young_entries_are_protected() {
        let cache = ResourceCache::new(config(100));
        for i in 0..6 {
            store(&cache, &format!("y{i}.css"), 1);
        }

        assert_eq!(cache.cleanup(), 0);
        assert_eq!(cache.len(), 6);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.cleanup(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_threshold_triggers_eviction() {
        let cache = ResourceCache::new(CacheConfig {
            max_items: 100,
            max_bytes: 100,
            ..config(100)
        });
        store(&cache, "a.png", 60);
        tokio::time::advance(Duration::from_secs(31)).await;
        store(&cache, "b.png", 60);

        assert!(!cache.contains("a.png"));
        assert!(cache.contains("b.png"));
        assert_eq!(cache.stats().total_bytes, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_resources_in_cache() {
        let cache = ResourceCache::default();
        store(&cache, "a.css", 1);
        store(&cache, "b.js", 1);

        assert!(cache.check_resources_in_cache(&["a.css", "b.js"]));
        assert!(cache.check_resources_in_cache(&["./resources/a.css"]));
        assert!(!cache.check_resources_in_cache(&["a.css", "c.png"]));
        assert!(cache.check_resources_in_cache::<&str>(&[]));

        cache.reset();
        assert!(!cache.check_resources_in_cache(&["a.css"]));
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_headers_are_not_replayed() {
        let cache = ResourceCache::default();
        let headers = vec![
            ("Content-Type".to_string(), "text/css".to_string()),
            ("Content-Encoding".to_string(), "gzip".to_string()),
            ("content-length".to_string(), "17".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Cache-Control".to_string(), "max-age=60".to_string()),
        ];
        assert!(cache.store_response(
            "http://v.local/resources/theme.css",
            200,
            headers,
            Bytes::from_static(b"body { margin: 0 }"),
        ));

        let hit = cache.lookup("http://v.local/resources/theme.css").unwrap();
        assert_eq!(
            hit.headers,
            vec![
                ("Content-Type".to_string(), "text/css".to_string()),
                ("Cache-Control".to_string(), "max-age=60".to_string()),
            ]
        );
        assert_eq!(hit.body, Bytes::from_static(b"body { margin: 0 }"));
    }
}
