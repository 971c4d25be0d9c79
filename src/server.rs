use crate::cache::{ContentCache, StreamCache, DEFAULT_CAPACITY};
use crate::conditional::{evaluate, Freshness, Representation};
use crate::error::{translate_stat_error, ErrorSink, ServerError, ServerResult};
use crate::fs::{FileSystem, LocalFileSystem};
use crate::http::{Request, Response};
use crate::metrics::CacheStats;
use crate::negotiate::{accepts_gzip, negotiate};
use crate::resolve::{resolve, MimeTable};
use crate::watch::WatchRegistry;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// MIME type used by `serve_file_default`
pub const DEFAULT_MIME_TYPE: &str = "text/plain";

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// State shared between a server and every handler it hands out
struct Shared {
    id: u64,
    cache: Arc<dyn ContentCache>,
    fs: Arc<dyn FileSystem>,
    errors: Arc<dyn ErrorSink>,
    registry: Arc<WatchRegistry>,
    /// Paths this instance registered interest in, for `close`
    owned: Mutex<HashSet<PathBuf>>,
}

/// A single file as configured on a handler
#[derive(Debug, Clone)]
struct Target {
    path: PathBuf,
    /// Display form of `path`, used for the entity tag and 404 messages
    name: String,
    mime_type: String,
    max_age: u64,
}

impl Target {
    fn new(path: PathBuf, mime_type: String, max_age: u64) -> Self {
        let name = path.display().to_string();
        Self {
            path,
            name,
            mime_type,
            max_age,
        }
    }
}

impl Shared {
    /// Register interest in `path`; `false` when no watch could be set up
    fn ensure_watch(&self, path: &Path) -> bool {
        match self.registry.watch(path, self.id, self.cache.clone()) {
            Ok(_) => {
                self.owned.lock().insert(path.to_path_buf());
                true
            }
            Err(error) => {
                warn!("Could not watch {}, serving it uncached: {}", path.display(), error);
                false
            }
        }
    }

    /// Run one request through negotiation, conditional evaluation and
    /// delivery. Every failure is returned for the caller to report.
    fn serve(&self, target: &Target, request: &Request, response: &mut Response) -> ServerResult<()> {
        let negotiated = negotiate(&*self.fs, &target.path, accepts_gzip(request))
            .map_err(|error| translate_stat_error(error, &target.name))?;

        // Only files that exist are watched, and only watched files are cached
        let watched = negotiated.metadata.is_regular_file && self.ensure_watch(&negotiated.path);

        let representation = Representation {
            file_name: &target.name,
            mime_type: &target.mime_type,
            max_age: target.max_age,
            content_encoding: negotiated.content_encoding,
        };

        match evaluate(&negotiated.metadata, &representation, request, response)? {
            Freshness::NotModified => {
                debug!("{} not modified", target.name);
                Ok(())
            }
            Freshness::Empty => Ok(()),
            Freshness::Deliver if watched => self.deliver(&negotiated.path, response),
            Freshness::Deliver => self.deliver_uncached(&negotiated.path, response),
        }
    }

    /// Stream the bytes for `key` into the response through the cache.
    ///
    /// The cache calls the factory only on a miss, and at most once per
    /// call, so a single source stream is ever opened here.
    fn deliver(&self, key: &Path, response: &mut Response) -> ServerResult<()> {
        let fs = &self.fs;
        let mut open = |path: &Path| -> ServerResult<Box<dyn Read + Send>> {
            fs.open(path).map_err(ServerError::Stream)
        };

        self.cache.write(key, response, &mut open)?;
        response.end();
        Ok(())
    }

    /// Stream straight from disk. Nothing would invalidate a cached copy
    /// of a file without a watch, so the cache is left out.
    fn deliver_uncached(&self, path: &Path, response: &mut Response) -> ServerResult<()> {
        self.cache.del(path);
        let mut source = self.fs.open(path).map_err(ServerError::Stream)?;
        io::copy(&mut source, response).map_err(ServerError::Stream)?;
        response.end();
        Ok(())
    }

    fn handle(&self, target: &Target, request: &Request, response: &mut Response) {
        if let Err(error) = self.serve(target, request, response) {
            self.errors.report(error, request, response);
        }
    }
}

/// Builder for [`FileServer`]
pub struct FileServerBuilder {
    capacity: usize,
    cache: Option<Arc<dyn ContentCache>>,
    fs: Option<Arc<dyn FileSystem>>,
    registry: Option<Arc<WatchRegistry>>,
}

impl FileServerBuilder {
    fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            cache: None,
            fs: None,
            registry: None,
        }
    }

    /// Byte capacity of the built-in content cache
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Use an external cache instead of the built-in one
    pub fn cache(mut self, cache: Arc<dyn ContentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Use `registry` instead of the process-wide one
    pub fn registry(mut self, registry: Arc<WatchRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the server; `errors` receives every request failure
    pub fn build<S: ErrorSink + 'static>(self, errors: S) -> FileServer {
        let (cache, stream_cache): (Arc<dyn ContentCache>, Option<Arc<StreamCache>>) = match self.cache {
            Some(cache) => (cache, None),
            None => {
                let cache = Arc::new(StreamCache::new(self.capacity));
                (cache.clone(), Some(cache))
            }
        };

        FileServer {
            shared: Arc::new(Shared {
                id: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
                cache,
                fs: self.fs.unwrap_or_else(|| Arc::new(LocalFileSystem)),
                errors: Arc::new(errors),
                registry: self.registry.unwrap_or_else(WatchRegistry::global),
                owned: Mutex::new(HashSet::new()),
            }),
            stream_cache,
        }
    }
}

/// Serves files and directory trees through a shared content cache.
///
/// Handlers returned by [`FileServer::serve_file`] and
/// [`FileServer::serve_directory`] keep the server's cache and watches
/// alive independently of the `FileServer` value itself.
pub struct FileServer {
    shared: Arc<Shared>,
    stream_cache: Option<Arc<StreamCache>>,
}

impl FileServer {
    /// Create a server with the default cache capacity
    pub fn new<S: ErrorSink + 'static>(errors: S) -> Self {
        Self::builder().build(errors)
    }

    /// Create a server whose cache holds at most `capacity` bytes
    pub fn with_capacity<S: ErrorSink + 'static>(errors: S, capacity: usize) -> Self {
        Self::builder().capacity(capacity).build(errors)
    }

    pub fn builder() -> FileServerBuilder {
        FileServerBuilder::new()
    }

    /// Serve a single file.
    ///
    /// The file is watched from this point on so that edits drop it from
    /// the cache; a watch that cannot be set up is retried on each request,
    /// which is served from disk until it succeeds. An empty path is
    /// rejected here rather than per request.
    pub fn serve_file(
        &self,
        file_name: impl AsRef<Path>,
        mime_type: &str,
        max_age: u64,
    ) -> ServerResult<FileHandler> {
        let path = file_name.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ServerError::Config(
                "Must provide a file name to serve_file".to_string(),
            ));
        }

        self.shared.ensure_watch(path);

        Ok(FileHandler {
            shared: self.shared.clone(),
            target: Target::new(path.to_path_buf(), mime_type.to_string(), max_age),
        })
    }

    /// [`FileServer::serve_file`] as `text/plain` with `max-age=0`
    pub fn serve_file_default(&self, file_name: impl AsRef<Path>) -> ServerResult<FileHandler> {
        self.serve_file(file_name, DEFAULT_MIME_TYPE, 0)
    }

    /// Serve every mapped file below `root_directory`.
    ///
    /// Each key of `mime_types` is an extension with its leading period
    /// (`.html`); a key without one fails construction.
    pub fn serve_directory<I, K, V>(
        &self,
        root_directory: impl AsRef<Path>,
        mime_types: I,
        max_age: u64,
    ) -> ServerResult<DirectoryHandler>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let root = root_directory.as_ref();
        if root.as_os_str().is_empty() {
            return Err(ServerError::Config(
                "Must provide a root directory to serve_directory".to_string(),
            ));
        }

        let mime_types = MimeTable::new(mime_types)?;

        Ok(DirectoryHandler {
            shared: self.shared.clone(),
            root: root.to_path_buf(),
            mime_types: Arc::new(mime_types),
            max_age,
        })
    }

    /// Stop watching every path this server registered.
    ///
    /// Subscriptions still wanted by other servers stay open. Returns the
    /// number of subscriptions actually closed.
    pub fn close(&self) -> usize {
        let owned: Vec<PathBuf> = self.shared.owned.lock().drain().collect();
        owned
            .iter()
            .filter(|path| self.shared.registry.release(path, self.shared.id))
            .count()
    }

    /// [`FileServer::close`], then run `on_close`
    pub fn close_then<F: FnOnce()>(&self, on_close: F) {
        self.close();
        on_close();
    }

    /// Counters of the built-in cache; `None` when an external cache was supplied
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.stream_cache.as_ref().map(|cache| cache.stats())
    }
}

/// Request handler for one file
#[derive(Clone)]
pub struct FileHandler {
    shared: Arc<Shared>,
    target: Target,
}

impl FileHandler {
    /// Answer `request`; failures go to the server's error sink
    pub fn handle(&self, request: &Request, response: &mut Response) {
        self.shared.handle(&self.target, request, response);
    }

    pub fn path(&self) -> &Path {
        &self.target.path
    }
}

/// Request handler for a directory tree
#[derive(Clone)]
pub struct DirectoryHandler {
    shared: Arc<Shared>,
    root: PathBuf,
    mime_types: Arc<MimeTable>,
    max_age: u64,
}

impl DirectoryHandler {
    /// Answer `request`, taking the file from the request path
    pub fn handle(&self, request: &Request, response: &mut Response) {
        let path = request.path();
        let relative = path.strip_prefix('/').unwrap_or(path);
        self.handle_path(request, response, relative);
    }

    /// Answer `request` with the file at `relative` below the root.
    ///
    /// Nothing is watched until the file is found on disk.
    pub fn handle_path(&self, request: &Request, response: &mut Response, relative: &str) {
        let resolved = match resolve(&self.root, &self.mime_types, relative) {
            Ok(resolved) => resolved,
            Err(error) => return self.shared.errors.report(error, request, response),
        };

        let target = Target::new(resolved.path, resolved.mime_type, self.max_age);
        self.shared.handle(&target, request, response);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
