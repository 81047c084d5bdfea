//! Model allow-list loaded from a plain-text file.
//!
//! One bare model id per line. Blank lines and lines starting with `#` are
//! ignored. An empty filter means "no filtering": every model passes.

use std::collections::HashSet;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Model filter file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read model filter {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Immutable set of allowed bare model ids.
#[derive(Debug, Clone, Default)]
pub struct ModelFilter {
    models: HashSet<String>,
}

impl ModelFilter {
    /// A filter that lets every model through.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Read the filter file at `path`.
    ///
    /// A missing file yields [`FilterError::NotFound`]; callers treat that as
    /// "no filter configured". Any other I/O failure is returned as
    /// [`FilterError::Io`].
    pub fn load(path: &Path) -> Result<Self, FilterError> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FilterError::NotFound(path.to_path_buf()),
            _ => FilterError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        Self::from_reader(BufReader::new(file)).map_err(|source| FilterError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut models = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            models.insert(line.to_string());
        }
        Ok(Self { models })
    }

    /// Whether `bare_id` is listed, or the filter is empty.
    pub fn allows(&self, bare_id: &str) -> bool {
        self.models.is_empty() || self.models.contains(bare_id)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Sorted entries, for logging.
    pub fn entries(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = self.models.iter().map(String::as_str).collect();
        entries.sort_unstable();
        entries
    }
}

impl<S: Into<String>> FromIterator<S> for ModelFilter {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            models: iter.into_iter().map(Into::into).collect(),
        }
    }
}
