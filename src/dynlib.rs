//! Shared-object loading for external client libraries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// A loaded shared object plus the path it came from.
///
/// The library stays mapped as long as any clone is alive; symbol tables
/// bound from it hold a reference so function pointers never outlive the
/// mapping.
#[derive(Clone, Debug)]
pub struct DynLib {
    lib: Arc<Library>,
    path: PathBuf,
}

impl DynLib {
    /// Open a shared object. With `unlink_after_load`, the filesystem entry
    /// is removed once the library is mapped; this is how per-thread library
    /// copies avoid littering the temp directory while keeping their own
    /// loader namespace.
    pub fn open(path: &Path, unlink_after_load: bool) -> ClientResult<DynLib> {
        let lib = unsafe { Library::new(path) }
            .map_err(|err| ClientError::LibraryNotFound(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), unlink_after_load, "loaded client library");
        if unlink_after_load {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %err, "failed to unlink library copy");
            }
        }
        Ok(DynLib {
            lib: Arc::new(lib),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a required entry point.
    ///
    /// # Safety
    /// `T` must be the function-pointer type the library exports under
    /// `name`.
    pub(crate) unsafe fn required<T: Copy>(&self, name: &'static str) -> ClientResult<T> {
        self.lib
            .get::<T>(name.as_bytes())
            .map(|symbol| *symbol)
            .map_err(|_| ClientError::SymbolMissing(name))
    }

    /// Resolve an optional entry point; `None` marks a missing capability.
    ///
    /// # Safety
    /// `T` must be the function-pointer type the library exports under
    /// `name`.
    pub(crate) unsafe fn optional<T: Copy>(&self, name: &'static str) -> Option<T> {
        let symbol = self.lib.get::<T>(name.as_bytes()).ok()?;
        Some(*symbol)
    }
}

/// Clone a client library into the temp directory so another worker thread
/// can load it under a distinct loader namespace. The copy is opened with
/// unlink-after-load, so nothing is left behind.
pub(crate) fn copy_library(path: &Path) -> ClientResult<PathBuf> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("client");
    let prefix = format!("{stem}-");
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix).suffix(&suffix);
    let file = builder.tempfile()?;
    std::fs::copy(path, file.path())?;
    let (_, copy_path) = file
        .keep()
        .map_err(|err| ClientError::Io(err.to_string()))?;
    debug!(original = %path.display(), copy = %copy_path.display(), "copied client library");
    Ok(copy_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_path() {
        let err = DynLib::open(Path::new("/nonexistent/libstrata_c.so"), false).unwrap_err();
        match err {
            ClientError::LibraryNotFound(msg) => assert!(msg.contains("libstrata_c.so")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn copy_library_clones_contents() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("libclient.so");
        std::fs::write(&original, b"not really elf").unwrap();

        let copy = copy_library(&original).unwrap();
        assert_ne!(copy, original);
        assert_eq!(std::fs::read(&copy).unwrap(), b"not really elf");
        std::fs::remove_file(copy).unwrap();
    }
}
