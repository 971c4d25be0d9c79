//! File change subscriptions and the registry that deduplicates them.
//!
//! A [`WatchRegistry`] holds at most one live [`Subscription`] per original
//! file path. Each entry tracks the server instances (and their caches)
//! interested in that path; a change event drops the path from every one
//! of those caches. The subscription is closed when its last interested
//! instance lets go, or when the registry is swept at shutdown.

use crate::cache::ContentCache;
use crate::error::{ServerError, ServerResult};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

/// Invoked with the watched path whenever it changes
pub type ChangeHandler = Arc<dyn Fn(&Path) + Send + Sync>;

/// A live change subscription
pub trait Subscription: Send {
    /// Stop delivering events; returns once no handler call is in progress
    fn close(self: Box<Self>);
}

/// Source of change notifications for individual files
pub trait ChangeNotifier: Send + Sync {
    /// Start watching `path`. No event is emitted for the file's current
    /// state, only for later changes.
    fn subscribe(&self, path: &Path, on_change: ChangeHandler) -> ServerResult<Box<dyn Subscription>>;
}

enum Message {
    Event(notify::Result<Event>),
    Stop,
}

/// Handlers keyed by the canonical path of the file they watch
type Routes = Arc<RwLock<HashMap<PathBuf, Vec<Route>>>>;

struct Route {
    id: u64,
    /// Path as given to `subscribe`, passed back to the handler
    target: PathBuf,
    on_change: ChangeHandler,
}

/// The platform watcher and the thread draining its events
struct Backend {
    watcher: RecommendedWatcher,
    /// Subscriptions per watched directory
    directories: HashMap<PathBuf, usize>,
    sender: Sender<Message>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Backend {
    fn start(routes: Routes) -> ServerResult<Self> {
        let (sender, receiver) = channel::unbounded();

        let event_sender = sender.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = event_sender.send(Message::Event(result));
        })?;

        let dispatcher = thread::Builder::new()
            .name("file-watch".to_string())
            .spawn(move || dispatch(receiver, routes))?;

        debug!("Started file watcher");
        Ok(Self {
            watcher,
            directories: HashMap::new(),
            sender,
            dispatcher: Some(dispatcher),
        })
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Stop);
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                warn!("File watch dispatcher panicked");
            }
        }
        debug!("Stopped file watcher");
    }
}

fn dispatch(receiver: Receiver<Message>, routes: Routes) {
    for message in receiver.iter() {
        match message {
            Message::Event(Ok(event)) => {
                if !is_change(&event.kind) {
                    continue;
                }
                let routes = routes.read();
                for path in &event.paths {
                    for route in routes.get(path).into_iter().flatten() {
                        (route.on_change)(&route.target);
                    }
                }
            }
            Message::Event(Err(error)) => warn!("File watch error: {}", error),
            Message::Stop => break,
        }
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

struct NotifierState {
    routes: Routes,
    backend: Mutex<Option<Backend>>,
    next_id: AtomicU64,
}

impl NotifierState {
    fn watch_directory(&self, directory: &Path) -> ServerResult<()> {
        let mut guard = self.backend.lock();
        let backend = match guard.take() {
            Some(backend) => backend,
            None => Backend::start(self.routes.clone())?,
        };
        let backend = guard.insert(backend);

        match backend.directories.get_mut(directory) {
            Some(count) => *count += 1,
            None => {
                if let Err(error) = backend.watcher.watch(directory, RecursiveMode::NonRecursive) {
                    if backend.directories.is_empty() {
                        *guard = None;
                    }
                    return Err(error.into());
                }
                backend.directories.insert(directory.to_path_buf(), 1);
            }
        }
        Ok(())
    }

    fn unwatch_directory(&self, directory: &Path) {
        let mut guard = self.backend.lock();
        let Some(backend) = guard.as_mut() else {
            return;
        };

        let remaining = match backend.directories.get_mut(directory) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return,
        };

        if remaining == 0 {
            backend.directories.remove(directory);
            if let Err(error) = backend.watcher.unwatch(directory) {
                debug!("Unwatching {}: {}", directory.display(), error);
            }
            if backend.directories.is_empty() {
                // Nothing left to watch; stop the watcher thread
                *guard = None;
            }
        }
    }

    fn remove_route(&self, key: &Path, id: u64) {
        let mut routes = self.routes.write();
        if let Some(list) = routes.get_mut(key) {
            list.retain(|route| route.id != id);
            if list.is_empty() {
                routes.remove(key);
            }
        }
    }
}

/// [`ChangeNotifier`] backed by the platform watcher from `notify`.
///
/// One watcher and one dispatcher thread serve every subscription of a
/// notifier, so the number of watched files is not bounded by per-process
/// watcher instance limits. The parent directory of each file is watched
/// rather than the file itself so that editors replacing the file by
/// rename are still seen. The watcher starts with the first subscription
/// and stops when the last one closes.
pub struct FsNotifier {
    state: Arc<NotifierState>,
}

impl FsNotifier {
    pub fn new() -> Self {
        Self {
            state: Arc::new(NotifierState {
                routes: Arc::new(RwLock::new(HashMap::new())),
                backend: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of directories currently handed to the platform watcher
    pub fn watched_directories(&self) -> usize {
        self.state
            .backend
            .lock()
            .as_ref()
            .map_or(0, |backend| backend.directories.len())
    }

    /// Whether the watcher thread is running
    pub fn is_running(&self) -> bool {
        self.state.backend.lock().is_some()
    }
}

impl Default for FsNotifier {
    fn default() -> Self {
        Self::new()
    }
}

struct NotifySubscription {
    id: u64,
    key: PathBuf,
    directory: PathBuf,
    state: Arc<NotifierState>,
}

impl Subscription for NotifySubscription {
    fn close(self: Box<Self>) {
        self.state.remove_route(&self.key, self.id);
        self.state.unwatch_directory(&self.directory);
    }
}

impl ChangeNotifier for FsNotifier {
    fn subscribe(&self, path: &Path, on_change: ChangeHandler) -> ServerResult<Box<dyn Subscription>> {
        let file_name = path
            .file_name()
            .ok_or_else(|| ServerError::Config(format!("Cannot watch {}", path.display())))?;
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        // Events carry the resolved path of the watched directory
        let directory = std::fs::canonicalize(parent)?;
        let key = directory.join(file_name);

        self.state.watch_directory(&directory)?;

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .routes
            .write()
            .entry(key.clone())
            .or_default()
            .push(Route {
                id,
                target: path.to_path_buf(),
                on_change,
            });

        Ok(Box::new(NotifySubscription {
            id,
            key,
            directory,
            state: self.state.clone(),
        }))
    }
}

/// An instance interested in a path, and the cache to invalidate for it
struct Listener {
    owner: u64,
    cache: Arc<dyn ContentCache>,
}

struct WatchEntry {
    subscription: Box<dyn Subscription>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

/// Reference-counted table of file subscriptions, one per path
pub struct WatchRegistry {
    notifier: Arc<dyn ChangeNotifier>,
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
}

static GLOBAL: OnceLock<Arc<WatchRegistry>> = OnceLock::new();

impl WatchRegistry {
    /// Create a registry using `notifier` for new subscriptions
    pub fn new(notifier: Arc<dyn ChangeNotifier>) -> Self {
        Self {
            notifier,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry shared by servers that are not given one.
    ///
    /// It lives until the process exits. Programs embedding the library
    /// should call [`shutdown`] on their way out so its subscriptions are
    /// closed.
    pub fn global() -> Arc<WatchRegistry> {
        GLOBAL
            .get_or_init(|| Arc::new(WatchRegistry::new(Arc::new(FsNotifier::new()))))
            .clone()
    }

    /// Make sure `path` is watched on behalf of `owner`.
    ///
    /// Returns `true` when a new subscription was created. The check and
    /// the subscribe happen under one lock, so concurrent first calls for
    /// a path still produce a single subscription.
    pub fn watch(&self, path: &Path, owner: u64, cache: Arc<dyn ContentCache>) -> ServerResult<bool> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(path) {
            let mut listeners = entry.listeners.write();
            if !listeners.iter().any(|l| l.owner == owner) {
                listeners.push(Listener { owner, cache });
            }
            return Ok(false);
        }

        let listeners = Arc::new(RwLock::new(vec![Listener { owner, cache }]));

        let handler_listeners = listeners.clone();
        let on_change: ChangeHandler = Arc::new(move |changed: &Path| {
            debug!("{} changed, invalidating cached content", changed.display());
            for listener in handler_listeners.read().iter() {
                listener.cache.del(changed);
            }
        });

        let subscription = self.notifier.subscribe(path, on_change)?;
        entries.insert(
            path.to_path_buf(),
            WatchEntry {
                subscription,
                listeners,
            },
        );

        debug!("Watching {} for changes", path.display());
        Ok(true)
    }

    /// Drop `owner`'s interest in `path`.
    ///
    /// Returns `true` when this closed the subscription.
    pub fn release(&self, path: &Path, owner: u64) -> bool {
        let closed = {
            let mut entries = self.entries.lock();
            let now_unused = match entries.get(path) {
                Some(entry) => {
                    let mut listeners = entry.listeners.write();
                    listeners.retain(|l| l.owner != owner);
                    listeners.is_empty()
                }
                None => false,
            };

            if now_unused {
                entries.remove(path)
            } else {
                None
            }
        };

        match closed {
            Some(entry) => {
                entry.subscription.close();
                debug!("Stopped watching {}", path.display());
                true
            }
            None => false,
        }
    }

    /// Close every subscription regardless of owner; returns how many
    pub fn close_all(&self) -> usize {
        let drained: Vec<(PathBuf, WatchEntry)> = self.entries.lock().drain().collect();
        let count = drained.len();

        for (_, entry) in drained {
            entry.subscription.close();
        }

        if count > 0 {
            info!("Closed {} file watches", count);
        }
        count
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last-resort sweep of the process-wide registry, for use on exit
pub fn shutdown() -> usize {
    match GLOBAL.get() {
        Some(registry) => registry.close_all(),
        None => 0,
    }
}
