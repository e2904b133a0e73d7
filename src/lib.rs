//! Multi-version client facade for the strata key-value store.
//!
//! Applications link one release of the client library but talk to clusters
//! running any release: the facade loads additional client implementations
//! from external shared libraries, watches the cluster's wire protocol
//! version, and transparently rebinds databases and transactions to
//! whichever client speaks it. Upgrading or downgrading a cluster never
//! requires restarting the application.
//!
//! Typical use:
//!
//! ```ignore
//! let api = MultiVersionApi::create(local_client)?;
//! api.select_api_version(700)?;
//! api.set_network_option(NetworkOption::ExternalClientLibrary,
//!     Some(b"/opt/strata/libstrata_c_6.2.so"))?;
//! api.setup_network()?;
//! let network = {
//!     let api = api.clone();
//!     std::thread::spawn(move || api.run_network())
//! };
//!
//! let db = api.create_database("/etc/strata/cluster")?;
//! let tr = db.create_transaction()?;
//! tr.set(b"key", b"value");
//! tr.commit().await?;
//! ```

pub mod api;
pub mod capi;
pub mod client;
pub mod database;
pub mod dlclient;
pub mod dynlib;
pub mod error;
pub(crate) mod future;
pub mod options;
pub mod sim;
pub mod traits;
pub mod transaction;
pub mod version;

pub use api::MultiVersionApi;
pub use client::{ClientDesc, ClientInfo};
pub use database::MultiVersionDatabase;
pub use dlclient::{DlApi, DlDatabase, DlTransaction};
pub use dynlib::DynLib;
pub use error::{codes, ClientError, ClientResult};
pub use options::{
    ConflictRangeKind, DatabaseOption, MutationType, NetworkOption, StreamingMode,
    TransactionOption, UniqueOrderedOptions, NETWORK_OPTION_ENV_PREFIX,
};
pub use traits::{
    ClientApi, ClientDatabase, ClientTransaction, CompletionHook, KeySelector, KeyValue, KvFuture,
    RangeLimits, RangeResult,
};
pub use transaction::MultiVersionTransaction;
pub use version::{
    ProtocolVersion, DIRECT_DATABASE_API_VERSION, MAX_SUPPORTED_API_VERSION,
    MIN_SUPPORTED_API_VERSION,
};
