//! Reusable objects and bounded outbound connections.
//!
//! [`ObjectPool`] hands out [`Pooled`] guards that return their value on
//! drop, so an early `?` or a cancelled future can never leak an entry.
//! [`ConnectionPool`] shares one keep-alive HTTP client and caps concurrent
//! requests per destination host with a semaphore.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use relay_core::config::PoolConfig;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid destination URL '{0}'")]
    InvalidUrl(String),

    #[error("Connection pool for '{0}' is closed")]
    Closed(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    /// Returned while the pool was full.
    pub discarded: u64,
    pub idle: usize,
}

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    capacity: usize,
    create: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

/// A bounded pool of reusable values.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    /// `reset` runs on every value as it comes back.
    pub fn new<C, R>(capacity: usize, create: C, reset: R) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                create: Box::new(create),
                reset: Box::new(reset),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Take an idle value, or create one when none is idle.
    pub fn checkout(&self) -> Pooled<T> {
        let value = match self.inner.idle.lock().pop() {
            Some(value) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.create)()
            }
        };
        Pooled {
            value: Some(value),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// A checked-out value; goes back to its pool on drop.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Keep the value instead of returning it.
    pub fn detach(mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `detach` and `drop` take the value, and both consume the guard.
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after detach"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value accessed after detach"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut value) = self.value.take() else {
            return;
        };
        (self.pool.reset)(&mut value);
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.capacity {
            idle.push(value);
            self.pool.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Permission to hold one outbound connection to a host.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Shared HTTP client plus a per-host concurrency cap.
pub struct ConnectionPool {
    client: reqwest::Client,
    enabled: bool,
    max_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("enabled", &self.enabled)
            .field("max_per_host", &self.max_per_host)
            .field("hosts", &self.hosts.lock().len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig, timeout: Duration) -> Result<Self, PoolError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        builder = if config.enabled {
            builder
                .pool_max_idle_per_host(config.max_connections_per_host)
                .pool_idle_timeout(config.idle_timeout)
        } else {
            builder.pool_max_idle_per_host(0)
        };
        let client = builder.build().map_err(|e| PoolError::Client(e.to_string()))?;
        Ok(Self {
            client,
            enabled: config.enabled,
            max_per_host: config.max_connections_per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Wait for a connection slot to the host of `url`.
    ///
    /// The returned permit releases the slot when dropped. With pooling
    /// disabled this never waits.
    pub async fn acquire(&self, url: &str) -> Result<ConnectionPermit, PoolError> {
        if !self.enabled {
            return Ok(ConnectionPermit { _permit: None });
        }
        let host = host_key(url)?;
        let semaphore = self.semaphore(&host);
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(host))?;
        Ok(ConnectionPermit {
            _permit: Some(permit),
        })
    }

    /// Free slots for the host of `url`; `None` before first use.
    pub fn available(&self, url: &str) -> Option<usize> {
        let host = host_key(url).ok()?;
        self.hosts.lock().get(&host).map(|s| s.available_permits())
    }

    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host))),
        )
    }
}

fn host_key(url: &str) -> Result<String, PoolError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| PoolError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| PoolError::InvalidUrl(url.to_string()))?;
    Ok(match parsed.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
