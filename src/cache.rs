use crate::error::{ServerError, ServerResult};
use crate::metrics::{CacheMetrics, CacheStats};
use bytes::Bytes;
use log::debug;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Default cache capacity in bytes
pub const DEFAULT_CAPACITY: usize = 1024 * 1000;

/// Opens the source stream for a key on a cache miss
pub type SourceFactory<'a> = &'a mut dyn FnMut(&Path) -> ServerResult<Box<dyn Read + Send>>;

/// A capacity-bounded byte store keyed by resolved file path.
///
/// Implementations must provide populate-or-join semantics on `write`: for
/// concurrent misses on one key the factory runs at most once at a time,
/// and every other caller for that key waits for the result instead of
/// opening its own source.
pub trait ContentCache: Send + Sync {
    /// Copy the content for `key` into `sink`, calling `populate` at most
    /// once if the key is not resident.
    fn write(&self, key: &Path, sink: &mut dyn Write, populate: SourceFactory<'_>) -> ServerResult<()>;

    /// Drain `source` and store it under `key` if it fits
    fn read(&self, key: &Path, source: &mut dyn Read) -> ServerResult<Bytes>;

    /// Drop `key`; returns whether an entry was resident
    fn del(&self, key: &Path) -> bool;
}

#[derive(Debug, Default)]
struct Flight {
    /// Set by `del` while a population is running
    stale: bool,
}

struct CacheState {
    entries: LruCache<PathBuf, Bytes>,
    size: usize,
    in_flight: HashMap<PathBuf, Flight>,
}

/// In-memory [`ContentCache`] with least-recently-used eviction.
///
/// Entry weight is its byte length. An entry larger than the whole
/// capacity is handed to the caller but not stored.
pub struct StreamCache {
    capacity: usize,
    state: Mutex<CacheState>,
    populated: Condvar,
    metrics: CacheMetrics,
}

impl StreamCache {
    /// Create a cache holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                size: 0,
                in_flight: HashMap::new(),
            }),
            populated: Condvar::new(),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes currently stored
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.state.lock().entries.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    fn store(&self, state: &mut CacheState, key: &Path, bytes: Bytes) {
        if let Some(flight) = state.in_flight.get(key) {
            if flight.stale {
                debug!("Discarding stale population of {}", key.display());
                return;
            }
        }

        if bytes.len() > self.capacity {
            debug!(
                "Not caching {} ({} bytes exceeds capacity {})",
                key.display(),
                bytes.len(),
                self.capacity
            );
            return;
        }

        let len = bytes.len();
        if let Some(previous) = state.entries.put(key.to_path_buf(), bytes) {
            state.size -= previous.len();
        }
        state.size += len;

        while state.size > self.capacity {
            match state.entries.pop_lru() {
                Some((evicted, bytes)) => {
                    state.size -= bytes.len();
                    self.metrics.evictions.increment(1);
                    debug!("Evicted {} from content cache", evicted.display());
                }
                None => break,
            }
        }
    }
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Clears the in-flight marker for a key and wakes joined waiters,
/// whether population succeeded or not.
struct FlightGuard<'a> {
    cache: &'a StreamCache,
    key: &'a Path,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.cache.state.lock().in_flight.remove(self.key);
        self.cache.populated.notify_all();
    }
}

impl ContentCache for StreamCache {
    fn write(&self, key: &Path, sink: &mut dyn Write, populate: SourceFactory<'_>) -> ServerResult<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(bytes) = state.entries.get(key).cloned() {
                drop(state);
                self.metrics.hits.increment(1);
                return sink.write_all(&bytes).map_err(ServerError::Stream);
            }

            if !state.in_flight.contains_key(key) {
                break;
            }

            self.metrics.joins.increment(1);
            self.populated.wait(&mut state);
        }

        state.in_flight.insert(key.to_path_buf(), Flight::default());
        drop(state);

        self.metrics.misses.increment(1);
        debug!("Content cache miss for {}", key.display());

        let guard = FlightGuard { cache: self, key };
        let mut source = populate(key)?;
        let bytes = self.read(key, &mut *source)?;
        drop(guard);

        sink.write_all(&bytes).map_err(ServerError::Stream)
    }

    fn read(&self, key: &Path, source: &mut dyn Read) -> ServerResult<Bytes> {
        let mut buffer = Vec::new();
        source.read_to_end(&mut buffer).map_err(ServerError::Stream)?;
        let bytes = Bytes::from(buffer);

        let mut state = self.state.lock();
        self.store(&mut state, key, bytes.clone());
        Ok(bytes)
    }

    fn del(&self, key: &Path) -> bool {
        let mut state = self.state.lock();

        if let Some(flight) = state.in_flight.get_mut(key) {
            flight.stale = true;
        }

        match state.entries.pop(key) {
            Some(bytes) => {
                state.size -= bytes.len();
                self.metrics.invalidations.increment(1);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    fn source(data: &'static [u8]) -> ServerResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(data)))
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = StreamCache::new(1024);
        let key = Path::new("a.txt");
        let mut opened = 0;

        let mut first = Vec::new();
        cache
            .write(key, &mut first, &mut |_| {
                opened += 1;
                source(b"hello")
            })
            .unwrap();

        let mut second = Vec::new();
        cache
            .write(key, &mut second, &mut |_| {
                opened += 1;
                source(b"changed")
            })
            .unwrap();

        assert_eq!(first, b"hello");
        assert_eq!(second, b"hello");
        assert_eq!(opened, 1);
        assert_eq!(cache.size(), 5);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn test_del_forces_repopulation() {
        let cache = StreamCache::new(1024);
        let key = Path::new("a.txt");

        cache.write(key, &mut Vec::new(), &mut |_| source(b"old")).unwrap();
        assert!(cache.del(key));
        assert!(!cache.del(key));
        assert_eq!(cache.size(), 0);

        let mut out = Vec::new();
        cache.write(key, &mut out, &mut |_| source(b"new")).unwrap();
        assert_eq!(out, b"new");
    }

    #[test]
    fn test_lru_eviction_respects_capacity() {
        let cache = StreamCache::new(10);

        cache.write(Path::new("a"), &mut Vec::new(), &mut |_| source(b"aaaa")).unwrap();
        cache.write(Path::new("b"), &mut Vec::new(), &mut |_| source(b"bbbb")).unwrap();
        // Touch `a` so `b` is the eviction candidate
        cache.write(Path::new("a"), &mut Vec::new(), &mut |_| source(b"xxxx")).unwrap();
        cache.write(Path::new("c"), &mut Vec::new(), &mut |_| source(b"cccc")).unwrap();

        assert!(cache.contains(Path::new("a")));
        assert!(!cache.contains(Path::new("b")));
        assert!(cache.contains(Path::new("c")));
        assert_eq!(cache.size(), 8);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_oversized_entry_is_served_not_stored() {
        let cache = StreamCache::new(4);
        let mut out = Vec::new();

        cache.write(Path::new("big"), &mut out, &mut |_| source(b"too large")).unwrap();

        assert_eq!(out, b"too large");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = StreamCache::new(0);
        let mut out = Vec::new();
        cache.write(Path::new("a"), &mut out, &mut |_| source(b"abc")).unwrap();

        assert_eq!(out, b"abc");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_failed_population_is_not_cached() {
        let cache = StreamCache::new(1024);
        let key = Path::new("a.txt");

        let error = cache
            .write(key, &mut Vec::new(), &mut |_| {
                Err(ServerError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "EACCES")))
            })
            .unwrap_err();
        assert!(matches!(error, ServerError::Io(_)));

        let mut out = Vec::new();
        cache.write(key, &mut out, &mut |_| source(b"ok")).unwrap();
        assert_eq!(out, b"ok");
    }

    struct SlowReader {
        data: Cursor<&'static [u8]>,
        delay: Duration,
    }

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(self.delay);
            self.data.read(buf)
        }
    }

    #[test]
    fn test_concurrent_misses_populate_once() {
        let cache = Arc::new(StreamCache::new(1024));
        let opened = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let opened = opened.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut out = Vec::new();
                    cache
                        .write(Path::new("shared"), &mut out, &mut |_| {
                            opened.fetch_add(1, Ordering::SeqCst);
                            Ok(Box::new(SlowReader {
                                data: Cursor::new(&b"shared bytes"[..]),
                                delay: Duration::from_millis(20),
                            }))
                        })
                        .unwrap();
                    out
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"shared bytes");
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_del_during_population_discards_result() {
        let cache = Arc::new(StreamCache::new(1024));
        let key = Path::new("racy");

        let cache_clone = cache.clone();
        let mut out = Vec::new();
        cache
            .write(key, &mut out, &mut |_| {
                // A change lands while the source is being opened
                cache_clone.del(Path::new("racy"));
                source(b"maybe stale")
            })
            .unwrap();

        assert_eq!(out, b"maybe stale");
        assert!(!cache.contains(key));
    }
}
