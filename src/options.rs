//! Option enums shared between the facade and every loaded client.
//!
//! The integer codes are part of the C ABI and never change between
//! releases; the facade passes them through to the bound client untouched.

use crate::error::{ClientError, ClientResult};

/// Process-wide network options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum NetworkOption {
    TraceEnable = 30,
    TraceLogGroup = 33,
    Knob = 40,
    DisableMultiVersionClientApi = 60,
    CallbacksOnExternalThreads = 61,
    ExternalClientLibrary = 62,
    ExternalClientDirectory = 63,
    DisableLocalClient = 64,
    ClientThreadsPerVersion = 65,
    ExternalClient = 66,
}

impl NetworkOption {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Resolve an environment-variable suffix (the part after the
    /// `STRATA_NETWORK_OPTION_` prefix) to an option.
    pub fn from_env_name(name: &str) -> Option<NetworkOption> {
        Some(match name {
            "TRACE_ENABLE" => NetworkOption::TraceEnable,
            "TRACE_LOG_GROUP" => NetworkOption::TraceLogGroup,
            "KNOB" => NetworkOption::Knob,
            "DISABLE_MULTI_VERSION_CLIENT_API" => NetworkOption::DisableMultiVersionClientApi,
            "CALLBACKS_ON_EXTERNAL_THREADS" => NetworkOption::CallbacksOnExternalThreads,
            "EXTERNAL_CLIENT_LIBRARY" => NetworkOption::ExternalClientLibrary,
            "EXTERNAL_CLIENT_DIRECTORY" => NetworkOption::ExternalClientDirectory,
            "DISABLE_LOCAL_CLIENT" => NetworkOption::DisableLocalClient,
            "CLIENT_THREADS_PER_VERSION" => NetworkOption::ClientThreadsPerVersion,
            "EXTERNAL_CLIENT" => NetworkOption::ExternalClient,
            _ => return None,
        })
    }
}

/// Per-database options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum DatabaseOption {
    LocationCacheSize = 10,
    MaxWatches = 20,
    MachineId = 21,
    DatacenterId = 22,
    TransactionTimeout = 500,
    TransactionRetryLimit = 501,
    TransactionMaxRetryDelay = 502,
}

impl DatabaseOption {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Database options in the 500 range set a default for every transaction
    /// created afterwards; this maps them to the transaction option they
    /// stand in for.
    pub fn transaction_default(self) -> Option<TransactionOption> {
        Some(match self {
            DatabaseOption::TransactionTimeout => TransactionOption::Timeout,
            DatabaseOption::TransactionRetryLimit => TransactionOption::RetryLimit,
            DatabaseOption::TransactionMaxRetryDelay => TransactionOption::MaxRetryDelay,
            _ => return None,
        })
    }
}

/// Per-transaction options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum TransactionOption {
    CausalReadRisky = 10,
    NextWriteNoWriteConflictRange = 30,
    ReadYourWritesDisable = 51,
    Timeout = 500,
    RetryLimit = 501,
    MaxRetryDelay = 502,
    SizeLimit = 503,
    SnapshotRywEnable = 600,
    SnapshotRywDisable = 601,
}

impl TransactionOption {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Atomic mutation kinds accepted by `atomic_op`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MutationType {
    Add = 2,
    BitAnd = 6,
    BitOr = 7,
    BitXor = 8,
    AppendIfFits = 9,
    Max = 12,
    Min = 13,
    SetVersionstampedKey = 14,
    SetVersionstampedValue = 15,
    ByteMin = 16,
    ByteMax = 17,
    CompareAndClear = 20,
}

impl MutationType {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Streaming behavior for range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StreamingMode {
    WantAll = -2,
    Iterator = -1,
    Exact = 0,
    Small = 1,
    Medium = 2,
    Large = 3,
    Serial = 4,
}

impl StreamingMode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Conflict range flavors for `add_conflict_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ConflictRangeKind {
    Read = 0,
    Write = 1,
}

impl ConflictRangeKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// An insertion-ordered option list where setting an option again replaces
/// its value in place instead of appending a duplicate.
#[derive(Debug, Clone, Default)]
pub struct UniqueOrderedOptions<T: Copy + Eq> {
    entries: Vec<(T, Option<Vec<u8>>)>,
}

impl<T: Copy + Eq> UniqueOrderedOptions<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn set(&mut self, option: T, value: Option<Vec<u8>>) {
        match self.entries.iter_mut().find(|(opt, _)| *opt == option) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((option, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (T, Option<&[u8]>)> + '_ {
        self.entries
            .iter()
            .map(|(opt, value)| (*opt, value.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Prefix for environment variables mapped to network options on
/// `setup_network`.
pub const NETWORK_OPTION_ENV_PREFIX: &str = "STRATA_NETWORK_OPTION_";

/// Collect network options from the process environment.
///
/// Returned in a deterministic order (by option code, then value) since the
/// environment itself has none.
pub(crate) fn network_options_from_env() -> ClientResult<Vec<(NetworkOption, Vec<u8>)>> {
    let mut out = Vec::new();
    for (name, value) in std::env::vars() {
        let Some(suffix) = name.strip_prefix(NETWORK_OPTION_ENV_PREFIX) else {
            continue;
        };
        let option = NetworkOption::from_env_name(suffix).ok_or_else(|| {
            ClientError::InvalidOptionValue(format!("unknown network option variable {name}"))
        })?;
        out.push((option, value.into_bytes()));
    }
    out.sort_by(|a, b| (a.0.code(), &a.1).cmp(&(b.0.code(), &b.1)));
    Ok(out)
}
