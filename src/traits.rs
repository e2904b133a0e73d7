//! The uniform client interface.
//!
//! Every client implementation, whether compiled in locally or loaded from
//! an external shared library, provides the full `Api`/`Database`/
//! `Transaction` operation set through these traits. The multi-version
//! layer implements the same traits on top, so swapping the backing client
//! is invisible to callers.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{ClientError, ClientResult};
use crate::options::{
    ConflictRangeKind, DatabaseOption, MutationType, NetworkOption, StreamingMode,
    TransactionOption,
};
use crate::version::ProtocolVersion;

/// Async result of a client operation. Always `'static`: implementations
/// copy whatever they need out of borrowed arguments before returning.
pub type KvFuture<T> = BoxFuture<'static, ClientResult<T>>;

/// Hook invoked on a client's network thread right before it exits.
pub type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// One key-value pair from a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A page of range results plus whether more data is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    pub more: bool,
}

/// Key selector resolving to the first key `offset` keys past the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelector {
    pub key: Vec<u8>,
    pub or_equal: bool,
    pub offset: i32,
}

impl KeySelector {
    /// The first key greater than or equal to `key`.
    pub fn first_greater_or_equal(key: impl Into<Vec<u8>>) -> KeySelector {
        KeySelector {
            key: key.into(),
            or_equal: false,
            offset: 1,
        }
    }

    /// The first key strictly greater than `key`.
    pub fn first_greater_than(key: impl Into<Vec<u8>>) -> KeySelector {
        KeySelector {
            key: key.into(),
            or_equal: true,
            offset: 1,
        }
    }

    /// The last key less than or equal to `key`.
    pub fn last_less_or_equal(key: impl Into<Vec<u8>>) -> KeySelector {
        KeySelector {
            key: key.into(),
            or_equal: true,
            offset: 0,
        }
    }
}

/// Row and byte limits for one range read.
#[derive(Debug, Clone, Copy)]
pub struct RangeLimits {
    /// Maximum rows to return; zero means unlimited.
    pub limit: i32,
    /// Soft cap on returned bytes; zero means client default.
    pub target_bytes: i32,
    pub mode: StreamingMode,
    /// Iteration counter for [`StreamingMode::Iterator`].
    pub iteration: i32,
}

impl Default for RangeLimits {
    fn default() -> Self {
        RangeLimits {
            limit: 0,
            target_bytes: 0,
            mode: StreamingMode::WantAll,
            iteration: 0,
        }
    }
}

impl RangeLimits {
    pub fn rows(limit: i32) -> RangeLimits {
        RangeLimits {
            limit,
            ..RangeLimits::default()
        }
    }
}

/// One client implementation's process-level surface.
pub trait ClientApi: Send + Sync {
    /// Select the api version the application was written against. Must be
    /// called before any network call.
    fn select_api_version(&self, version: i32) -> ClientResult<()>;

    /// The client's version string, `"<semver>,<source-id>,<protocol-hex>"`.
    fn client_version(&self) -> String;

    fn set_network_option(&self, option: NetworkOption, value: Option<&[u8]>) -> ClientResult<()>;

    fn setup_network(&self) -> ClientResult<()>;

    /// Runs the client's network loop on the calling thread until
    /// [`stop_network`](ClientApi::stop_network) is called.
    fn run_network(&self) -> ClientResult<()>;

    fn stop_network(&self) -> ClientResult<()>;

    fn create_database(&self, cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>>;

    /// Register a hook to run on the network thread right before it exits.
    fn add_network_thread_completion_hook(&self, hook: CompletionHook) -> ClientResult<()>;
}

/// One client implementation's connection to a cluster.
pub trait ClientDatabase: Send + Sync {
    fn create_transaction(&self) -> ClientResult<Arc<dyn ClientTransaction>>;

    fn set_option(&self, option: DatabaseOption, value: Option<&[u8]>) -> ClientResult<()>;

    /// Load factor of the client's network thread, in `[0, 1]`.
    fn get_main_thread_busyness(&self) -> f64;

    /// Protocol version reported by the coordinator this client is connected
    /// to. With `expected` set, the future only completes once the reported
    /// version differs from it. Clients at releases 5.0 and older cannot
    /// answer this and fail with `UnsupportedOperation`.
    fn get_server_protocol(
        &self,
        expected: Option<ProtocolVersion>,
    ) -> KvFuture<ProtocolVersion>;

    fn reboot_worker(&self, address: &[u8], check: bool, duration_secs: i32) -> KvFuture<i64>;

    fn force_recovery_with_data_loss(&self, dcid: &[u8]) -> KvFuture<()>;

    fn create_snapshot(&self, uid: &[u8], command: &[u8]) -> KvFuture<()>;
}

/// One client implementation's transaction.
pub trait ClientTransaction: Send + Sync {
    fn set_read_version(&self, version: i64);

    fn get_read_version(&self) -> KvFuture<i64>;

    fn get(&self, key: &[u8], snapshot: bool) -> KvFuture<Option<Vec<u8>>>;

    fn get_key(&self, selector: &KeySelector, snapshot: bool) -> KvFuture<Vec<u8>>;

    fn get_range(
        &self,
        begin: &KeySelector,
        end: &KeySelector,
        limits: RangeLimits,
        snapshot: bool,
        reverse: bool,
    ) -> KvFuture<RangeResult>;

    fn get_addresses_for_key(&self, key: &[u8]) -> KvFuture<Vec<String>>;

    fn get_versionstamp(&self) -> KvFuture<Vec<u8>>;

    fn get_estimated_range_size_bytes(&self, begin: &[u8], end: &[u8]) -> KvFuture<i64>;

    fn get_range_split_points(
        &self,
        begin: &[u8],
        end: &[u8],
        chunk_size: i64,
    ) -> KvFuture<Vec<Vec<u8>>>;

    fn set(&self, key: &[u8], value: &[u8]);

    fn clear(&self, key: &[u8]);

    fn clear_range(&self, begin: &[u8], end: &[u8]);

    fn atomic_op(&self, key: &[u8], param: &[u8], operation: MutationType);

    fn watch(&self, key: &[u8]) -> KvFuture<()>;

    fn add_conflict_range(
        &self,
        begin: &[u8],
        end: &[u8],
        kind: ConflictRangeKind,
    ) -> ClientResult<()>;

    fn commit(&self) -> KvFuture<()>;

    fn get_committed_version(&self) -> ClientResult<i64>;

    fn get_approximate_size(&self) -> KvFuture<i64>;

    fn set_option(&self, option: TransactionOption, value: Option<&[u8]>) -> ClientResult<()>;

    /// Ask the client's retry policy whether `error` is retryable; success
    /// means the transaction was reset and the caller should loop.
    fn on_error(&self, error: ClientError) -> KvFuture<()>;

    fn reset(&self);

    fn cancel(&self);
}

pub(crate) fn ready_ok<T: Send + 'static>(value: T) -> KvFuture<T> {
    Box::pin(std::future::ready(Ok(value)))
}

pub(crate) fn ready_err<T: Send + 'static>(error: ClientError) -> KvFuture<T> {
    Box::pin(std::future::ready(Err(error)))
}
