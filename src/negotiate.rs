use crate::fs::{FileMetadata, FileSystem};
use crate::http::Request;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// Suffix of the pre-compressed sibling of a file
pub const GZIP_SUFFIX: &str = ".gz";

/// Value of the Content-Encoding header for a pre-compressed sibling
pub const GZIP_ENCODING: &str = "gzip";

/// Which physical file a request ends up being served from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub path: PathBuf,
    pub metadata: FileMetadata,
    /// Set when the compressed sibling was chosen
    pub content_encoding: Option<&'static str>,
}

/// Whether the client advertises gzip support
pub fn accepts_gzip(request: &Request) -> bool {
    request
        .get_header("accept-encoding")
        .map(|value| value.contains(GZIP_ENCODING))
        .unwrap_or(false)
}

/// The compressed sibling of `path` (`foo.txt` -> `foo.txt.gz`)
pub fn gzip_variant(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(GZIP_SUFFIX);
    PathBuf::from(name)
}

/// Pick the file to serve.
///
/// The compressed sibling is only probed when the client accepts gzip, and a
/// failed probe silently falls back to the original. A stat failure on the
/// original is returned as is.
pub fn negotiate(fs: &dyn FileSystem, path: &Path, accepts_gzip: bool) -> io::Result<Negotiated> {
    if accepts_gzip {
        let variant = gzip_variant(path);
        if let Ok(metadata) = fs.stat(&variant) {
            return Ok(Negotiated {
                path: variant,
                metadata,
                content_encoding: Some(GZIP_ENCODING),
            });
        }
    }

    let metadata = fs.stat(path)?;
    Ok(Negotiated {
        path: path.to_path_buf(),
        metadata,
        content_encoding: None,
    })
}
