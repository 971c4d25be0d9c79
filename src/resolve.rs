use crate::error::{ServerError, ServerResult};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Extension-to-MIME-type table for directory serving.
///
/// Every key starts with `.`; this is checked once, at construction.
#[derive(Debug, Clone, Default)]
pub struct MimeTable {
    types: HashMap<String, String>,
}

impl MimeTable {
    /// Validate and build a table
    pub fn new<I, K, V>(entries: I) -> ServerResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut types = HashMap::new();
        for (extension, mime_type) in entries {
            let extension = extension.into();
            if !extension.starts_with('.') {
                return Err(ServerError::Config(format!(
                    "Extension found without a leading period (\".\"): {}",
                    extension
                )));
            }
            types.insert(extension, mime_type.into());
        }
        Ok(Self { types })
    }

    /// Look up the MIME type for an extension such as `.html`
    pub fn get(&self, extension: &str) -> Option<&str> {
        self.types.get(extension).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A request path that passed the directory guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub path: PathBuf,
    pub mime_type: String,
}

/// Lowercased extension of `path` including the leading `.`, or empty
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default()
}

/// Lexically normalise a path, folding `.` and `..` segments.
///
/// `..` above a relative start is kept; `..` above the filesystem root is
/// dropped.
pub fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Join `relative` onto `root` the way a URL path would be joined.
///
/// Leading separators on `relative` do not make it absolute.
pub fn join(root: &Path, relative: &str) -> PathBuf {
    let mut joined = root.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        joined.push(segment);
    }
    normalize(&joined)
}

/// Resolve a directory-relative request path against `root`.
///
/// An unmapped extension is reported with the joined path; an escape from
/// the root is reported with the caller's relative path only, so absolute
/// locations never end up in the message.
pub fn resolve(root: &Path, mime_types: &MimeTable, relative: &str) -> ServerResult<Resolved> {
    let joined = join(root, relative);

    let extension = extension_of(&joined);
    let mime_type = match mime_types.get(&extension) {
        Some(mime_type) => mime_type.to_string(),
        None => return Err(ServerError::not_found(joined.display())),
    };

    let root = normalize(root);
    let contained = match joined.strip_prefix(&root) {
        Ok(rest) => !rest.components().any(|c| c == Component::ParentDir),
        Err(_) => root == Path::new(".") && !joined.starts_with(".."),
    };
    if !contained {
        return Err(ServerError::not_found(relative));
    }

    Ok(Resolved {
        path: joined,
        mime_type,
    })
}
