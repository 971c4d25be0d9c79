//! Serve single files or directory trees with an in-memory content cache
//! that is invalidated when files change, conditional GET via entity tags,
//! and transparent selection of pre-compressed `.gz` siblings.

pub mod acceptor;
pub mod cache;
pub mod conditional;
pub mod config;
pub mod error;
pub mod fs;
pub mod http;
pub mod metrics;
pub mod negotiate;
pub mod resolve;
pub mod server;
pub mod watch;

/// Re-exports of common components for easier access
pub use acceptor::ConnectionAcceptor;
pub use cache::{ContentCache, StreamCache};
pub use config::ServerConfig;
pub use error::{ErrorSink, ServerError, ServerResult};
pub use fs::{FileMetadata, FileSystem, LocalFileSystem};
pub use http::{Method, Request, Response, Status};
pub use metrics::CacheStats;
pub use resolve::MimeTable;
pub use server::{DirectoryHandler, FileHandler, FileServer, FileServerBuilder};
pub use watch::{ChangeNotifier, FsNotifier, Subscription, WatchRegistry};
