use crate::cache::DEFAULT_CAPACITY;
use crate::error::ServerResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default extension table for directory serving
pub fn default_mime_types() -> HashMap<String, String> {
    let entries: &[(&str, &str)] = &[
        // Text types
        (".html", "text/html"),
        (".htm", "text/html"),
        (".css", "text/css"),
        (".js", "text/javascript"),
        (".mjs", "text/javascript"),
        (".txt", "text/plain"),
        (".md", "text/markdown"),
        (".csv", "text/csv"),
        // Application types
        (".json", "application/json"),
        (".xml", "application/xml"),
        (".pdf", "application/pdf"),
        (".wasm", "application/wasm"),
        (".map", "application/json"),
        // Image types
        (".png", "image/png"),
        (".jpg", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".gif", "image/gif"),
        (".svg", "image/svg+xml"),
        (".webp", "image/webp"),
        (".ico", "image/x-icon"),
        // Font types
        (".ttf", "font/ttf"),
        (".otf", "font/otf"),
        (".woff", "font/woff"),
        (".woff2", "font/woff2"),
    ];

    entries
        .iter()
        .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
        .collect()
}

/// Configuration for the file server binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub worker_threads: usize,
    pub max_header_size: usize,

    // Serving configuration
    pub root_directory: PathBuf,
    pub cache_capacity: usize,
    pub max_age: u64,
    pub mime_types: HashMap<String, String>,

    /// Seconds between cache statistics log lines; 0 disables them
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 8080,
            worker_threads: num_cpus::get(),
            max_header_size: 16 * 1024, // 16 KB

            root_directory: PathBuf::from("static"),
            cache_capacity: DEFAULT_CAPACITY,
            max_age: 0,
            mime_types: default_mime_types(),

            stats_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the number of worker threads
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the directory to serve
    pub fn with_root_directory<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root_directory = root.into();
        self
    }

    /// Set the content cache capacity in bytes
    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set the Cache-Control max-age sent with every file
    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::MimeTable;

    #[test]
    fn test_default_mime_types_are_valid() {
        let table = MimeTable::new(default_mime_types()).unwrap();
        assert_eq!(table.get(".html"), Some("text/html"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "port": 9000, "root_directory": "public" }"#).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.root_directory, PathBuf::from("public"));
        assert_eq!(config.cache_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.socket_address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");

        let config = ServerConfig::new()
            .with_address("0.0.0.0", 3000)
            .with_max_age(300)
            .with_cache_capacity(4096);
        config.save_to_json_file(&path).unwrap();

        let loaded = ServerConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.socket_address(), "0.0.0.0:3000");
        assert_eq!(loaded.max_age, 300);
        assert_eq!(loaded.cache_capacity, 4096);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = ServerConfig::from_json_file("/definitely/not/here.json");
        assert!(matches!(result, Err(crate::error::ServerError::Io(_))));
    }
}
