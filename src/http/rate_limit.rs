//! Per-client-IP token-bucket rate limiting — defense in depth at the HTTP
//! edge, independent of the Dispatch Engine's queue and concurrency-slot
//! gates further in.

use std::collections::HashMap;
use std::future::{ready, Ready};
use std::num::NonZeroU32;
use std::sync::Arc;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpResponse};
use futures_util::future::LocalBoxFuture;
use governor::{Quota, RateLimiter};
use tokio::sync::RwLock;

type Limiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Keyed token-bucket limiter: one bucket per client IP, created lazily.
pub struct KeyedRateLimiter {
    limiters: RwLock<HashMap<String, Arc<Limiter>>>,
    quota: Quota,
    cleanup_threshold: usize,
}

impl KeyedRateLimiter {
    pub fn new(requests_per_window: u32, window: std::time::Duration) -> Self {
        let per_window = NonZeroU32::new(requests_per_window).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / per_window.get())
            .unwrap_or_else(|| Quota::per_minute(per_window))
            .allow_burst(per_window);

        Self {
            limiters: RwLock::new(HashMap::new()),
            quota,
            cleanup_threshold: 10_000,
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        let existing = {
            let limiters = self.limiters.read().await;
            limiters.get(key).cloned()
        };

        let limiter = match existing {
            Some(limiter) => limiter,
            None => {
                let mut limiters = self.limiters.write().await;
                if limiters.len() > self.cleanup_threshold {
                    limiters.clear();
                }
                limiters
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)))
                    .clone()
            }
        };

        limiter.check().is_ok()
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<KeyedRateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(requests_per_window: u32, window: std::time::Duration) -> Self {
        Self {
            limiter: Arc::new(KeyedRateLimiter::new(requests_per_window, window)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + Clone + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service,
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: S,
    limiter: Arc<KeyedRateLimiter>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + Clone + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let limiter = self.limiter.clone();
        let service = self.service.clone();
        let key = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();

        Box::pin(async move {
            if limiter.check(&key).await {
                service.call(req).await
            } else {
                log::warn!("rate limit exceeded for {key}");
                Ok(req.into_response(
                    HttpResponse::TooManyRequests()
                        .json(serde_json::json!({ "error": "rate limit exceeded" }))
                        .map_into_right_body(),
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhausted_quota_rejects_further_requests() {
        let limiter = KeyedRateLimiter::new(2, std::time::Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4").await);
        assert!(limiter.check("1.2.3.4").await);
        assert!(!limiter.check("1.2.3.4").await);
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let limiter = KeyedRateLimiter::new(1, std::time::Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4").await);
        assert!(limiter.check("5.6.7.8").await);
    }
}
