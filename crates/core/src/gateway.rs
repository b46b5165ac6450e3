//! Bounded, cached, single-flight access to the frame decode backend.
//!
//! Every proxy request funnels through [`FrameDecodeGateway::decode_frame`].
//! Cache hits return immediately. Misses join the in-flight decode for the
//! same key if there is one, otherwise they wait for one of `concurrency`
//! FIFO permits and call the backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use axum::body::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, GatewayError};

pub const DEFAULT_DECODE_CONCURRENCY: usize = 4;
pub const DEFAULT_CACHE_SIZE_BYTES: usize = 512 * 1024 * 1024;

/// A frame extraction request as it arrives on the proxy route.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub src: String,
    /// Position in seconds.
    pub time: f64,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub data: Bytes,
    pub content_type: String,
}

impl DecodedFrame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Backend that turns a [`FrameRequest`] into image bytes.
#[async_trait]
pub trait FrameDecoder: Send + Sync + 'static {
    async fn decode(&self, request: &FrameRequest) -> Result<DecodedFrame, DecodeError>;

    async fn shutdown(&self) -> Result<(), DecodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub concurrency: usize,
    pub cache_size_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_DECODE_CONCURRENCY,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey {
    src: String,
    time_us: i64,
    params_fingerprint: [u8; 32],
}

impl FrameKey {
    pub fn for_request(request: &FrameRequest) -> Self {
        let mut hasher = Sha256::new();
        for (name, value) in &request.params {
            hasher.update(name.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        Self {
            src: request.src.clone(),
            time_us: (request.time * 1_000_000.0).round() as i64,
            params_fingerprint: hasher.finalize().into(),
        }
    }
}

struct CachedFrame {
    frame: DecodedFrame,
    last_used: u64,
}

/// LRU keyed by frame, bounded by resident bytes.
struct FrameCache {
    capacity_bytes: usize,
    resident_bytes: usize,
    clock: u64,
    entries: HashMap<FrameKey, CachedFrame>,
    recency: BTreeMap<u64, FrameKey>,
}

impl FrameCache {
    fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            resident_bytes: 0,
            clock: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, key: &FrameKey) -> Option<DecodedFrame> {
        let now = self.tick();
        let cached = self.entries.get_mut(key)?;
        self.recency.remove(&cached.last_used);
        cached.last_used = now;
        self.recency.insert(now, key.clone());
        Some(cached.frame.clone())
    }

    /// Returns false when the frame alone exceeds the capacity.
    fn insert(&mut self, key: FrameKey, frame: DecodedFrame) -> bool {
        if frame.len() > self.capacity_bytes {
            return false;
        }
        self.remove(&key);

        let now = self.tick();
        self.resident_bytes += frame.len();
        self.recency.insert(now, key.clone());
        self.entries.insert(
            key,
            CachedFrame {
                frame,
                last_used: now,
            },
        );

        while self.resident_bytes > self.capacity_bytes {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.resident_bytes -= evicted.frame.len();
            }
        }
        true
    }

    fn remove(&mut self, key: &FrameKey) {
        if let Some(old) = self.entries.remove(key) {
            self.recency.remove(&old.last_used);
            self.resident_bytes -= old.frame.len();
        }
    }
}

type FlightCell = Arc<OnceCell<Result<DecodedFrame, GatewayError>>>;

/// One requester's share of an in-flight decode. The map entry is dropped
/// once the result is in, or when the last requester gives up before it is.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<FrameKey, FlightCell>>,
    key: &'a FrameKey,
    cell: FlightCell,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(self.in_flight);
        let Some(current) = in_flight.get(self.key) else {
            return;
        };
        // The map holds one reference and this guard another.
        if Arc::ptr_eq(current, &self.cell)
            && (self.cell.initialized() || Arc::strong_count(&self.cell) <= 2)
        {
            in_flight.remove(self.key);
        }
    }
}

struct Availability {
    /// Cancelled when the backend becomes unusable.
    revoked: CancellationToken,
    reason: Option<String>,
}

pub struct FrameDecodeGateway {
    decoder: Arc<dyn FrameDecoder>,
    permits: Semaphore,
    cache: Mutex<FrameCache>,
    in_flight: Mutex<HashMap<FrameKey, FlightCell>>,
    availability: Mutex<Availability>,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FrameDecodeGateway {
    pub fn new(decoder: Arc<dyn FrameDecoder>, settings: GatewaySettings) -> Self {
        Self {
            decoder,
            permits: Semaphore::new(settings.concurrency.max(1)),
            cache: Mutex::new(FrameCache::new(settings.cache_size_bytes)),
            in_flight: Mutex::new(HashMap::new()),
            availability: Mutex::new(Availability {
                revoked: CancellationToken::new(),
                reason: None,
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn is_available(&self) -> bool {
        lock(&self.availability).reason.is_none()
    }

    pub fn cached_bytes(&self) -> usize {
        lock(&self.cache).resident_bytes
    }

    pub async fn decode_frame(&self, request: FrameRequest) -> Result<DecodedFrame, GatewayError> {
        let revoked = {
            let availability = lock(&self.availability);
            if let Some(reason) = &availability.reason {
                return Err(GatewayError::BackendUnavailable(reason.clone()));
            }
            availability.revoked.clone()
        };

        let key = FrameKey::for_request(&request);
        if let Some(frame) = lock(&self.cache).get(&key) {
            debug!(src = %request.src, time = request.time, "Frame cache hit");
            return Ok(frame);
        }

        let cell = lock(&self.in_flight)
            .entry(key.clone())
            .or_default()
            .clone();
        let flight = FlightGuard {
            in_flight: &self.in_flight,
            key: &key,
            cell,
        };

        let result = tokio::select! {
            biased;
            _ = revoked.cancelled() => Err(self.unavailable_error()),
            result = flight.cell.get_or_init(|| self.decode_uncached(&key, &request, &revoked)) => result.clone(),
        };
        result
    }

    async fn decode_uncached(
        &self,
        key: &FrameKey,
        request: &FrameRequest,
        revoked: &CancellationToken,
    ) -> Result<DecodedFrame, GatewayError> {
        // A flight for this key may have completed and left the map between
        // the caller's cache miss and the creation of this cell.
        if let Some(frame) = lock(&self.cache).get(key) {
            debug!(src = %request.src, time = request.time, "Frame cache hit after miss");
            return Ok(frame);
        }

        let _permit = tokio::select! {
            biased;
            _ = revoked.cancelled() => return Err(self.unavailable_error()),
            permit = self.permits.acquire() => permit
                .map_err(|_| GatewayError::BackendUnavailable("gateway closed".to_string()))?,
        };

        debug!(src = %request.src, time = request.time, "Decoding frame");
        match self.decoder.decode(request).await {
            Ok(frame) => {
                if !lock(&self.cache).insert(key.clone(), frame.clone()) {
                    debug!(bytes = frame.len(), "Frame larger than cache; serving uncached");
                }
                Ok(frame)
            }
            Err(DecodeError::Failed(message)) => {
                warn!(src = %request.src, time = request.time, error = %message, "Frame decode failed");
                Err(GatewayError::DecodeFailed(message))
            }
            Err(DecodeError::Fatal(message)) => {
                error!(error = %message, "Frame decode backend failed fatally");
                self.mark_unavailable(message.clone());
                Err(GatewayError::BackendUnavailable(message))
            }
        }
    }

    fn unavailable_error(&self) -> GatewayError {
        let reason = lock(&self.availability)
            .reason
            .clone()
            .unwrap_or_else(|| "decode backend unavailable".to_string());
        GatewayError::BackendUnavailable(reason)
    }

    fn mark_unavailable(&self, reason: String) {
        let mut availability = lock(&self.availability);
        if availability.reason.is_none() {
            availability.reason = Some(reason);
        }
        availability.revoked.cancel();
    }

    /// Makes the gateway usable again after a fatal backend failure. Has no
    /// effect once the gateway has been shut down.
    pub fn restart(&self) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Decode gateway restart requested after shutdown; ignoring");
            return false;
        }
        {
            let mut availability = lock(&self.availability);
            if availability.reason.is_none() {
                return true;
            }
            availability.reason = None;
            availability.revoked = CancellationToken::new();
        }
        lock(&self.in_flight).clear();
        info!("Decode gateway restarted");
        true
    }

    /// Stops the backend and rejects all further requests. Idempotent.
    pub async fn shutdown(&self) -> Result<(), DecodeError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.mark_unavailable("decode gateway shut down".to_string());
        lock(&self.in_flight).clear();
        self.decoder.shutdown().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fake backend whose frames encode their request; counts calls per source.
    pub struct ScriptedDecoder {
        pub delay: Duration,
        pub calls: Mutex<HashMap<String, usize>>,
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
        pub shutdowns: AtomicUsize,
        pub frame_size: usize,
    }

    impl ScriptedDecoder {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                calls: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                frame_size: 0,
            }
        }

        pub fn with_frame_size(mut self, frame_size: usize) -> Self {
            self.frame_size = frame_size;
            self
        }

        pub fn calls_for(&self, src: &str) -> usize {
            lock(&self.calls).get(src).copied().unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            lock(&self.calls).values().sum()
        }
    }

    #[async_trait]
    impl FrameDecoder for ScriptedDecoder {
        async fn decode(&self, request: &FrameRequest) -> Result<DecodedFrame, DecodeError> {
            *lock(&self.calls).entry(request.src.clone()).or_default() += 1;
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if request.src.starts_with("broken") {
                return Err(DecodeError::Failed(format!("cannot decode {}", request.src)));
            }
            if request.src.starts_with("fatal") {
                return Err(DecodeError::Fatal("decoder process exited".to_string()));
            }

            let mut data = format!("{}@{}", request.src, request.time).into_bytes();
            if self.frame_size > 0 {
                data.resize(self.frame_size, b'.');
            }
            Ok(DecodedFrame {
                data: Bytes::from(data),
                content_type: "image/png".to_string(),
            })
        }

        async fn shutdown(&self) -> Result<(), DecodeError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub fn frame_request(src: &str, time: f64) -> FrameRequest {
        FrameRequest {
            src: src.to_string(),
            time,
            params: BTreeMap::new(),
        }
    }
}
