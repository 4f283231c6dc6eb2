//! Pool of reusable renderer pages.
//!
//! A page is either idle in the pool or checked out to exactly one job. Checked-out
//! pages are plain owned values (`Box<dyn RenderPage>`), so the type system enforces the
//! single-owner half of that rule.

use crate::backend::{BrowserSession, RenderPage};
use crate::config::PagePoolConfig;
use crate::metrics;
use crate::utils::lock;
use crate::RenderError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct IdlePage {
    page: Box<dyn RenderPage>,
    last_used: Instant,
}

struct PoolState {
    idle: VecDeque<IdlePage>,
    config: PagePoolConfig,
    created: u64,
    closed: u64,
    /// Set once the owning browser is gone for good; late releases close their page.
    shut_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub idle_pages: usize,
    pub max_pages: usize,
    pub min_pages: usize,
    pub pages_created: u64,
    pub pages_closed: u64,
}

pub struct PagePool {
    state: Mutex<PoolState>,
}

impl PagePool {
    pub fn new(config: PagePoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                config: config.normalized(),
                created: 0,
                closed: 0,
                shut_down: false,
            }),
        }
    }

    /// Checks out the most recently used idle page, or opens a new one on `session`.
    pub async fn acquire(
        &self,
        session: &dyn BrowserSession,
    ) -> Result<Box<dyn RenderPage>, RenderError> {
        let reused = lock(&self.state).idle.pop_back();
        if let Some(idle) = reused {
            debug!("Reusing pooled page");
            return Ok(idle.page);
        }

        let page = session.new_page().await?;
        lock(&self.state).created += 1;
        Ok(page)
    }

    /// Returns a page after a job.
    ///
    /// The page is cleared first; a page that cannot be cleared is closed. Under
    /// `pressure` (queued or other running jobs) a full pool swaps out its oldest page
    /// instead of dropping the released one. Without pressure a full pool closes the
    /// released page.
    pub async fn release(&self, page: Box<dyn RenderPage>, pressure: bool) {
        if lock(&self.state).shut_down {
            debug!("Page released after pool shutdown, closing it");
            self.close_page(page).await;
            return;
        }

        if let Err(e) = page.reset().await {
            warn!("Page reset failed, closing page: {}", e);
            self.close_page(page).await;
            return;
        }

        let mut to_close = None;
        {
            let mut state = lock(&self.state);
            let now = Instant::now();

            if state.shut_down {
                to_close = Some(page);
            } else if state.idle.len() < state.config.max_pages {
                state.idle.push_back(IdlePage { page, last_used: now });
            } else if pressure {
                to_close = state.idle.pop_front().map(|oldest| oldest.page);
                state.idle.push_back(IdlePage { page, last_used: now });
                debug!("Page pool full, replaced oldest page");
            } else if state.idle.len() >= state.config.min_pages {
                to_close = Some(page);
                debug!("Page pool full and idle, closing released page");
            } else {
                state.idle.push_back(IdlePage { page, last_used: now });
            }

            metrics::set_idle_pages(state.idle.len());
        }

        if let Some(page) = to_close {
            self.close_page(page).await;
        }
    }

    /// Closes a page that must not be reused.
    pub async fn discard(&self, page: Box<dyn RenderPage>) {
        self.close_page(page).await;
    }

    /// Closes every idle page unused for longer than the idle timeout. Returns the count.
    pub async fn cleanup_idle(&self) -> usize {
        let expired: Vec<IdlePage> = {
            let mut state = lock(&self.state);
            let idle_timeout = state.config.idle_timeout;
            let now = Instant::now();

            let (expired, kept): (Vec<IdlePage>, Vec<IdlePage>) = state
                .idle
                .drain(..)
                .partition(|idle| now.duration_since(idle.last_used) > idle_timeout);
            state.idle = kept.into();
            metrics::set_idle_pages(state.idle.len());
            expired
        };

        let count = expired.len();
        for idle in expired {
            self.close_page(idle.page).await;
        }

        if count > 0 {
            info!("Closed {} idle pages", count);
        }
        count
    }

    /// Closes every idle page, used when the owning browser goes away.
    pub async fn drain(&self) -> usize {
        let idle: Vec<IdlePage> = lock(&self.state).idle.drain(..).collect();
        let count = idle.len();

        for entry in idle {
            self.close_page(entry.page).await;
        }
        metrics::set_idle_pages(0);
        count
    }

    /// Drains the pool for good. Pages released afterwards are closed, never pooled.
    pub async fn shut_down(&self) -> usize {
        lock(&self.state).shut_down = true;
        self.drain().await
    }

    pub fn set_limits(&self, config: PagePoolConfig) {
        lock(&self.state).config = config.normalized();
    }

    pub fn len(&self) -> usize {
        lock(&self.state).idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            idle_pages: state.idle.len(),
            max_pages: state.config.max_pages,
            min_pages: state.config.min_pages,
            pages_created: state.created,
            pages_closed: state.closed,
        }
    }

    /// Runs [`PagePool::cleanup_idle`] every `interval` until the pool is dropped.
    pub fn start_idle_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<PagePool> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) => {
                        pool.cleanup_idle().await;
                    }
                    None => break,
                }
            }
        })
    }

    async fn close_page(&self, page: Box<dyn RenderPage>) {
        if let Err(e) = page.close().await {
            debug!("Page close failed: {}", e);
        }
        lock(&self.state).closed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake::{FakeBackend, FakeSession};

    fn pool(max_pages: usize, min_pages: usize) -> PagePool {
        PagePool::new(PagePoolConfig {
            max_pages,
            min_pages,
            idle_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(180),
        })
    }

    fn session() -> (FakeBackend, Arc<FakeSession>) {
        let backend = FakeBackend::new();
        let session = backend.session();
        (backend, session)
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_page() {
        let (backend, session) = session();
        let pool = pool(2, 1);

        let page = pool.acquire(session.as_ref()).await.unwrap();
        pool.release(page, false).await;
        assert_eq!(pool.len(), 1);

        let _page = pool.acquire(session.as_ref()).await.unwrap();
        assert_eq!(backend.stats().pages_created, 1);
        assert_eq!(backend.stats().resets, 1);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_release_policy_at_capacity() {
        let (backend, session) = session();
        let pool = pool(2, 1);

        let mut pages = Vec::new();
        for _ in 0..4 {
            pages.push(pool.acquire(session.as_ref()).await.unwrap());
        }

        pool.release(pages.pop().unwrap(), false).await;
        pool.release(pages.pop().unwrap(), false).await;
        assert_eq!(pool.len(), 2);

        // Full with pressure: oldest swapped out.
        pool.release(pages.pop().unwrap(), true).await;
        assert_eq!(pool.len(), 2);
        assert_eq!(backend.stats().pages_closed, 1);

        // Full without pressure: released page closed.
        pool.release(pages.pop().unwrap(), false).await;
        assert_eq!(pool.len(), 2);
        assert_eq!(backend.stats().pages_closed, 2);
    }

    #[tokio::test]
    async fn test_size_never_exceeds_max_or_grows_by_more_than_one() {
        let (_backend, session) = session();
        let pool = pool(3, 1);

        let mut pages = Vec::new();
        for _ in 0..8 {
            pages.push(pool.acquire(session.as_ref()).await.unwrap());
        }

        let mut previous = pool.len();
        for (i, page) in pages.into_iter().enumerate() {
            pool.release(page, i % 2 == 0).await;
            let size = pool.len();
            assert!(size <= 3);
            assert!(size <= previous + 1);
            previous = size;
        }
    }

    #[tokio::test]
    async fn test_failed_reset_closes_page() {
        let (backend, session) = session();
        let pool = pool(4, 1);
        backend.fail_resets(true);

        let page = pool.acquire(session.as_ref()).await.unwrap();
        pool.release(page, false).await;

        assert!(pool.is_empty());
        assert_eq!(backend.stats().pages_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cleanup() {
        let (backend, session) = session();
        let pool = Arc::new(pool(4, 1));

        let a = pool.acquire(session.as_ref()).await.unwrap();
        let b = pool.acquire(session.as_ref()).await.unwrap();
        pool.release(a, false).await;
        tokio::time::advance(Duration::from_secs(500)).await;
        pool.release(b, false).await;

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(pool.cleanup_idle().await, 1);
        assert_eq!(pool.len(), 1);

        let timer = pool.start_idle_cleanup(Duration::from_secs(180));
        tokio::time::sleep(Duration::from_secs(700)).await;
        assert!(pool.is_empty());
        assert_eq!(backend.stats().pages_closed, 2);
        timer.abort();
    }

    #[tokio::test]
    async fn test_drain_closes_everything() {
        let (backend, session) = session();
        let pool = pool(4, 1);

        let a = pool.acquire(session.as_ref()).await.unwrap();
        let b = pool.acquire(session.as_ref()).await.unwrap();
        pool.release(a, false).await;
        pool.release(b, false).await;

        assert_eq!(pool.drain().await, 2);
        assert!(pool.is_empty());
        assert_eq!(backend.stats().pages_closed, 2);
        assert_eq!(pool.stats().pages_closed, 2);
    }

    #[tokio::test]
    async fn test_release_after_shut_down_closes_page() {
        let (backend, session) = session();
        let pool = pool(4, 1);

        let pooled = pool.acquire(session.as_ref()).await.unwrap();
        let straggler = pool.acquire(session.as_ref()).await.unwrap();
        pool.release(pooled, false).await;

        assert_eq!(pool.shut_down().await, 1);
        pool.release(straggler, true).await;

        assert!(pool.is_empty());
        assert_eq!(backend.stats().pages_closed, 2);
        assert_eq!(backend.stats().resets, 1);
    }
}
