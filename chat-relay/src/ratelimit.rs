use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::Error;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    Outgoing, Service,
    service::{ClientAddr, text_response},
};

pub const DEFAULT_MAX_REQUESTS: usize = 4;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Windows are swept for stale keys once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Limit {
    pub success: bool,
    pub remaining: usize,
}

pub trait RateLimiter: Send + Sync {
    /// Records a request from `key` and tells whether it fits the quota.
    fn limit(&self, key: &str) -> impl Future<Output = Result<Limit, Error>> + Send;
}

impl<L: RateLimiter> RateLimiter for Arc<L> {
    fn limit(&self, key: &str) -> impl Future<Output = Result<Limit, Error>> + Send {
        (**self).limit(key)
    }
}

/// In-memory sliding window log: at most `max_requests` per `window` for each key.
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for SlidingWindow {
    async fn limit(&self, key: &str) -> Result<Limit, Error> {
        let now = Instant::now();
        let mut requests = self.requests.lock().await;

        if requests.len() > SWEEP_THRESHOLD {
            requests.retain(|_, times| {
                times.back().is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let times = requests.entry(key.to_owned()).or_default();
        while times
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            times.pop_front();
        }

        if times.len() < self.max_requests {
            times.push_back(now);
            Ok(Limit {
                success: true,
                remaining: self.max_requests - times.len(),
            })
        } else {
            Ok(Limit {
                success: false,
                remaining: 0,
            })
        }
    }
}

/// Rejects requests over the limiter's quota before they reach `inner`.
///
/// Clients are keyed by peer IP address.
pub struct RateLimited<L, S> {
    limiter: L,
    inner: S,
}

impl<L, S> RateLimited<L, S> {
    pub fn new(limiter: L, inner: S) -> Self {
        Self { limiter, inner }
    }
}

impl<L: RateLimiter, S: Service> Service for RateLimited<L, S> {
    async fn call(&self, req: Request<Incoming>) -> Result<Response<Outgoing>, Error> {
        let key = client_key(&req);
        match self.limiter.limit(&key).await {
            Ok(limit) if limit.success => self.inner.call(req).await,
            Ok(_) => {
                log::info!("Rate limit exceeded for {key}");
                text_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many messages in too short time",
                )
            }
            Err(err) => {
                log::error!("Rate limiter failed for {key}: {err:?}");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Sorry, something went wrong",
                )
            }
        }
    }
}

fn client_key<B>(req: &Request<B>) -> String {
    match req.extensions().get::<ClientAddr>() {
        Some(ClientAddr(addr)) => addr.ip().to_string(),
        None => "127.0.0.1".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quota_per_window() {
        let limiter = SlidingWindow::default();
        for remaining in (0..4).rev() {
            let limit = limiter.limit("10.0.0.1").await.unwrap();
            assert_eq!(
                limit,
                Limit {
                    success: true,
                    remaining
                }
            );
        }
        assert!(!limiter.limit("10.0.0.1").await.unwrap().success);
        assert!(limiter.limit("10.0.0.2").await.unwrap().success);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!limiter.limit("10.0.0.1").await.unwrap().success);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.limit("10.0.0.1").await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(10));
        assert!(limiter.limit("a").await.unwrap().success);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.limit("a").await.unwrap().success);
        tokio::time::advance(Duration::from_secs(6)).await;
        // The first request has left the window, the second has not.
        assert!(limiter.limit("a").await.unwrap().success);
        assert!(!limiter.limit("a").await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_not_counted() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(10));
        assert!(limiter.limit("a").await.unwrap().success);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(!limiter.limit("a").await.unwrap().success);
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.limit("a").await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_keys_are_swept() {
        let limiter = SlidingWindow::new(1, Duration::from_secs(1));
        for i in 0..=SWEEP_THRESHOLD {
            limiter.limit(&i.to_string()).await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.limit("fresh").await.unwrap();
        assert_eq!(limiter.requests.lock().await.len(), 1);
    }

    #[test]
    fn key_from_peer_address() {
        let mut req = Request::new(());
        assert_eq!(client_key(&req), "127.0.0.1");
        req.extensions_mut()
            .insert(ClientAddr("192.168.1.7:51000".parse().unwrap()));
        assert_eq!(client_key(&req), "192.168.1.7");
    }
}
