use crate::rate_limit::RateLimiter;
use crate::{CallContext, LimitError, ResilienceError};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Maps request headers to the identity the limiter counts against.
pub type KeyExtractor = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

/// Returns `true` for requests that bypass the limiter (health checks and the like).
pub type Exclusion = Arc<dyn Fn(&Uri) -> bool + Send + Sync>;

/// Default identity: first `X-Forwarded-For` hop, then `X-Real-IP`, else `"anonymous"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    forwarded.or_else(real_ip).unwrap_or("anonymous").to_string()
}

/// A layer that enforces a [`RateLimiter`] per HTTP request.
///
/// Rejected requests never reach the inner service; they get `429 Too Many Requests` with
/// `Retry-After` (whole seconds, at least 1) and `X-RateLimit-Remaining: 0`. Admitted responses
/// carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`. A failing counter store surfaces as
/// [`ResilienceError::Store`].
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
    key: KeyExtractor,
    exclude: Option<Exclusion>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter, key: Arc::new(client_ip), exclude: None }
    }

    pub fn with_key_extractor<F>(mut self, key: F) -> Self
    where
        F: Fn(&HeaderMap) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(key);
        self
    }

    /// Skip the limiter for requests whose URI matches `predicate`.
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Uri) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Arc::new(predicate));
        self
    }
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("limiter", &self.limiter)
            .field("exclude", &self.exclude.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<dyn RateLimiter>,
    key: KeyExtractor,
    exclude: Option<Exclusion>,
}

impl<S: fmt::Debug> fmt::Debug for RateLimitService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

fn too_many_requests<B: Default>(wait: Duration, limit: u64) -> Response<B> {
    let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let mut response = Response::new(B::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(http::header::RETRY_AFTER, HeaderValue::from(retry_after.max(1)));
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u64));
    response
}

impl<S, B, ResBody> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    B: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        // Take the service that was driven to readiness and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if self.exclude.as_ref().is_some_and(|skip| skip(req.uri())) {
            return Box::pin(async move { inner.call(req).await.map_err(ResilienceError::Inner) });
        }

        let limiter = self.limiter.clone();
        let identity = (self.key)(req.headers());
        Box::pin(async move {
            let limit = limiter.stats().limit;
            match limiter.allow(&CallContext::background(), &identity).await {
                Ok(remaining) => {
                    let mut response = inner.call(req).await.map_err(ResilienceError::Inner)?;
                    let headers = response.headers_mut();
                    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
                    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
                    Ok(response)
                }
                Err(LimitError::Exceeded { wait, .. }) => Ok(too_many_requests(wait, limit)),
                Err(other) => Err(other.into()),
            }
        })
    }
}
