//! Registry entries for the client implementations in the pool.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::error::ClientResult;
use crate::traits::ClientApi;
use crate::version::{protocol_version_from_client_version, ProtocolVersion};

/// Immutable description of where a client implementation came from.
#[derive(Debug, Clone)]
pub struct ClientDesc {
    pub lib_path: PathBuf,
    pub external: bool,
}

/// A client implementation in the candidate pool: its descriptor, the api
/// handle driving it, and the liveness state the selection logic consults.
pub struct ClientInfo {
    desc: ClientDesc,
    pub api: Arc<dyn ClientApi>,
    /// Which per-thread copy this is; 0 for the primary and the local client.
    pub thread_index: usize,
    protocol_version: OnceLock<ProtocolVersion>,
    // Sticky: a client that failed once is never selected again.
    failed: AtomicBool,
}

impl ClientInfo {
    /// The client compiled into this process.
    pub fn local(api: Arc<dyn ClientApi>) -> ClientInfo {
        ClientInfo {
            desc: ClientDesc {
                lib_path: PathBuf::from("local"),
                external: false,
            },
            api,
            thread_index: 0,
            protocol_version: OnceLock::new(),
            failed: AtomicBool::new(false),
        }
    }

    /// A client loaded from an external shared library.
    pub fn external(api: Arc<dyn ClientApi>, lib_path: PathBuf, thread_index: usize) -> ClientInfo {
        ClientInfo {
            desc: ClientDesc {
                lib_path,
                external: true,
            },
            api,
            thread_index,
            protocol_version: OnceLock::new(),
            failed: AtomicBool::new(false),
        }
    }

    pub fn desc(&self) -> &ClientDesc {
        &self.desc
    }

    pub fn is_external(&self) -> bool {
        self.desc.external
    }

    /// Probe the client's version string for its protocol version. The
    /// result is cached; a client only ever reports one protocol.
    pub fn load_protocol_version(&self) -> ClientResult<ProtocolVersion> {
        if let Some(version) = self.protocol_version.get() {
            return Ok(*version);
        }
        let reported = self.api.client_version();
        let version = protocol_version_from_client_version(&reported)?;
        Ok(*self.protocol_version.get_or_init(|| version))
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version.get().copied()
    }

    pub fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            warn!(path = %self.desc.lib_path.display(), "client marked failed");
        }
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Whether this client should displace `other` as the candidate for
    /// their (shared) normalized protocol version. A local build is
    /// preferred over an external library; otherwise the incumbent wins.
    pub fn can_replace(&self, other: &ClientInfo) -> bool {
        if self.failed() {
            return false;
        }
        match (self.protocol_version(), other.protocol_version()) {
            (Some(mine), Some(theirs)) if mine.normalized() == theirs.normalized() => {
                other.failed() || (!self.is_external() && other.is_external())
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInfo")
            .field("desc", &self.desc)
            .field("thread_index", &self.thread_index)
            .field("protocol_version", &self.protocol_version.get())
            .field("failed", &self.failed())
            .finish()
    }
}
