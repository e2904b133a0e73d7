//! Process-wide lifecycle: api-version selection, network setup and
//! shutdown, environment option ingestion, and the external client pool
//! with its per-thread library copies.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::client::{ClientDesc, ClientInfo};
use crate::database::MultiVersionDatabase;
use crate::dlclient::DlApi;
use crate::dynlib::copy_library;
use crate::error::{ClientError, ClientResult};
use crate::options::{network_options_from_env, NetworkOption};
use crate::traits::{ClientApi, ClientDatabase, CompletionHook};
use crate::version::{MAX_SUPPORTED_API_VERSION, MIN_SUPPORTED_API_VERSION};

// One live manager per process; released when the handle drops.
static API_SLOT_TAKEN: AtomicBool = AtomicBool::new(false);

struct ApiInner {
    external_client_descriptions: BTreeMap<PathBuf, ClientDesc>,
    /// Client implementations injected directly instead of being loaded
    /// from a shared library. Used by simulations and tests.
    injected_clients: BTreeMap<PathBuf, Arc<dyn ClientApi>>,
    /// One ClientInfo per library per worker thread, built at setup.
    external_clients: BTreeMap<PathBuf, Vec<Arc<ClientInfo>>>,
    /// Network options to replay, in order, on every client.
    options: Vec<(NetworkOption, Option<Vec<u8>>)>,
    /// Option values already applied from environment variables; explicit
    /// duplicates of these are silently dropped.
    env_options: BTreeMap<NetworkOption, BTreeSet<Vec<u8>>>,
    env_options_loaded: bool,
    hooks: Vec<CompletionHook>,
    thread_count: usize,
    next_thread: usize,
}

/// The multi-version client api: chooses between the locally compiled
/// client and any number of dynamically loaded ones.
///
/// Created once per process with [`MultiVersionApi::create`]; the handle
/// owns the network runtime and the client pool, and releases the process
/// slot when dropped.
pub struct MultiVersionApi {
    local_client: Arc<ClientInfo>,
    api_version: AtomicI32,
    network_setup_started: AtomicBool,
    network_setup_done: AtomicBool,
    network_running: AtomicBool,
    callbacks_on_main_thread: AtomicBool,
    local_client_disabled: AtomicBool,
    bypass_multi_client: AtomicBool,
    external_client: AtomicBool,
    singleton: bool,
    inner: Mutex<ApiInner>,
    runtime: Mutex<Option<Runtime>>,
}

impl MultiVersionApi {
    /// Create the process-wide api manager around the locally compiled
    /// client. Fails with `AlreadyInitialized` if another handle is alive.
    pub fn create(local_client: Arc<dyn ClientApi>) -> ClientResult<Arc<MultiVersionApi>> {
        if API_SLOT_TAKEN.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyInitialized);
        }
        Ok(Arc::new(Self::build(local_client, true)))
    }

    /// An api manager that skips the process-singleton check. Intended for
    /// tests and embedded simulations that need several managers in one
    /// process.
    pub fn isolated(local_client: Arc<dyn ClientApi>) -> Arc<MultiVersionApi> {
        Arc::new(Self::build(local_client, false))
    }

    fn build(local_client: Arc<dyn ClientApi>, singleton: bool) -> MultiVersionApi {
        MultiVersionApi {
            local_client: Arc::new(ClientInfo::local(local_client)),
            api_version: AtomicI32::new(0),
            network_setup_started: AtomicBool::new(false),
            network_setup_done: AtomicBool::new(false),
            network_running: AtomicBool::new(false),
            callbacks_on_main_thread: AtomicBool::new(true),
            local_client_disabled: AtomicBool::new(false),
            bypass_multi_client: AtomicBool::new(false),
            external_client: AtomicBool::new(false),
            singleton,
            inner: Mutex::new(ApiInner {
                external_client_descriptions: BTreeMap::new(),
                injected_clients: BTreeMap::new(),
                external_clients: BTreeMap::new(),
                options: Vec::new(),
                env_options: BTreeMap::new(),
                env_options_loaded: false,
                hooks: Vec::new(),
                thread_count: 1,
                next_thread: 0,
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Whether future callbacks must be marshalled back to the caller's
    /// runtime rather than run on client-internal threads.
    pub fn callbacks_on_main_thread(&self) -> bool {
        self.callbacks_on_main_thread.load(Ordering::SeqCst)
    }

    /// Restrict this process to the local client; external libraries are
    /// ignored and databases bypass the version monitor.
    pub fn disable_multi_version_client_api(&self) -> ClientResult<()> {
        if self.network_setup_started.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }
        self.bypass_multi_client.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Register an external client library shipped with another release.
    pub fn add_external_library(&self, path: &Path) -> ClientResult<()> {
        if self.network_setup_started.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }
        let mut inner = self.inner.lock();
        if inner
            .external_client_descriptions
            .insert(
                path.to_path_buf(),
                ClientDesc {
                    lib_path: path.to_path_buf(),
                    external: true,
                },
            )
            .is_none()
        {
            info!(path = %path.display(), "registered external client library");
        }
        Ok(())
    }

    /// Register every shared library in `dir` as an external client.
    pub fn add_external_library_directory(&self, dir: &Path) -> ClientResult<()> {
        let extension = std::env::consts::DLL_EXTENSION;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                self.add_external_library(&path)?;
            }
        }
        Ok(())
    }

    /// Register a client implementation directly, bypassing dlopen. The
    /// `label` stands in for a library path in the pool. Intended for tests
    /// and embedded simulations.
    pub fn register_injected_client(
        &self,
        label: &str,
        api: Arc<dyn ClientApi>,
    ) -> ClientResult<()> {
        if self.network_setup_started.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }
        let path = PathBuf::from(label);
        let mut inner = self.inner.lock();
        inner.external_client_descriptions.insert(
            path.clone(),
            ClientDesc {
                lib_path: path.clone(),
                external: true,
            },
        );
        inner.injected_clients.insert(path, api);
        Ok(())
    }

    /// Select the api version the application targets. May be called more
    /// than once with the same value; must precede `setup_network`.
    pub fn select_api_version(&self, version: i32) -> ClientResult<()> {
        if self.network_setup_started.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }
        if !(MIN_SUPPORTED_API_VERSION..=MAX_SUPPORTED_API_VERSION).contains(&version) {
            return Err(ClientError::ApiVersionNotSupported(version));
        }
        match self
            .api_version
            .compare_exchange(0, version, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => self.local_client.api.select_api_version(version),
            Err(existing) if existing == version => Ok(()),
            Err(_) => Err(ClientError::ApiVersionAlreadySet),
        }
    }

    /// Set a network option. Options the facade itself consumes are routed
    /// here; everything else is queued (pre-setup) or applied to every
    /// client (post-setup).
    pub fn set_network_option(
        &self,
        option: NetworkOption,
        value: Option<&[u8]>,
    ) -> ClientResult<()> {
        self.set_network_option_from(option, value, false)
    }

    fn set_network_option_from(
        &self,
        option: NetworkOption,
        value: Option<&[u8]>,
        from_env: bool,
    ) -> ClientResult<()> {
        match option {
            NetworkOption::DisableMultiVersionClientApi => self.disable_multi_version_client_api(),
            NetworkOption::CallbacksOnExternalThreads => {
                self.callbacks_on_main_thread.store(false, Ordering::SeqCst);
                Ok(())
            }
            NetworkOption::ExternalClient => {
                self.external_client.store(true, Ordering::SeqCst);
                Ok(())
            }
            NetworkOption::ExternalClientLibrary => {
                let path = utf8_value(option, value)?;
                self.add_external_library(Path::new(&path))
            }
            NetworkOption::ExternalClientDirectory => {
                let path = utf8_value(option, value)?;
                self.add_external_library_directory(Path::new(&path))
            }
            NetworkOption::DisableLocalClient => {
                if self.network_setup_started.load(Ordering::SeqCst) {
                    return Err(ClientError::NetworkAlreadySetup);
                }
                self.local_client_disabled.store(true, Ordering::SeqCst);
                Ok(())
            }
            NetworkOption::ClientThreadsPerVersion => {
                if self.network_setup_started.load(Ordering::SeqCst) {
                    return Err(ClientError::NetworkAlreadySetup);
                }
                let count: usize = utf8_value(option, value)?
                    .parse()
                    .map_err(|_| invalid_value(option))?;
                if count == 0 {
                    return Err(invalid_value(option));
                }
                self.inner.lock().thread_count = count;
                Ok(())
            }
            _ => self.forward_network_option(option, value, from_env),
        }
    }

    /// Record a pass-through option and, once the network is up, apply it
    /// to every live client immediately.
    fn forward_network_option(
        &self,
        option: NetworkOption,
        value: Option<&[u8]>,
        from_env: bool,
    ) -> ClientResult<()> {
        let owned = value.map(|v| v.to_vec());
        {
            let mut inner = self.inner.lock();
            let dedup_key = owned.clone().unwrap_or_default();
            if from_env {
                inner
                    .env_options
                    .entry(option)
                    .or_default()
                    .insert(dedup_key);
            } else if inner
                .env_options
                .get(&option)
                .is_some_and(|values| values.contains(&dedup_key))
            {
                debug!(?option, "option already applied from environment");
                return Ok(());
            }
            inner.options.push((option, owned.clone()));
        }

        if self.network_setup_done.load(Ordering::SeqCst) {
            if !self.local_client_disabled.load(Ordering::SeqCst) {
                apply_network_option(&self.local_client, option, value)?;
            }
            let clients: Vec<Arc<ClientInfo>> = {
                let inner = self.inner.lock();
                inner.external_clients.values().flatten().cloned().collect()
            };
            for client in clients {
                if !client.failed() {
                    apply_network_option(&client, option, value)?;
                }
            }
        }
        Ok(())
    }

    fn load_environment_options(&self) -> ClientResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.env_options_loaded {
                return Ok(());
            }
            inner.env_options_loaded = true;
        }
        for (option, value) in network_options_from_env()? {
            debug!(?option, "applying network option from environment");
            self.set_network_option_from(option, Some(&value), true)?;
        }
        Ok(())
    }

    /// Load every configured client, replay recorded options, and set up
    /// each client's network. Fails atomically: a failing local client or
    /// external library aborts the whole setup.
    pub fn setup_network(&self) -> ClientResult<()> {
        self.load_environment_options()?;
        if self.network_setup_started.swap(true, Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }
        match self.setup_network_impl() {
            Ok(()) => {
                self.network_setup_done.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.network_setup_started.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn setup_network_impl(&self) -> ClientResult<()> {
        let api_version = self.api_version.load(Ordering::SeqCst);
        if api_version == 0 {
            return Err(ClientError::ApiVersionNotSet);
        }

        let (descriptions, injected, thread_count, options, hooks) = {
            let inner = self.inner.lock();
            (
                inner.external_client_descriptions.clone(),
                inner.injected_clients.clone(),
                inner.thread_count,
                inner.options.clone(),
                inner.hooks.clone(),
            )
        };

        let local_disabled = self.local_client_disabled.load(Ordering::SeqCst);
        if descriptions.is_empty() || self.external_client.load(Ordering::SeqCst) {
            // Nothing to choose between, or this library is itself loaded as
            // an external client of another facade: act as a plain client.
            if local_disabled {
                return Err(ClientError::NoClientsAvailable);
            }
            debug!("bypassing the multi-version layer");
            self.bypass_multi_client.store(true, Ordering::SeqCst);
        }

        if !local_disabled {
            self.prepare_client(&self.local_client, None, &options, &hooks)?;
        }

        let descriptions = if self.bypass_multi_client.load(Ordering::SeqCst) {
            BTreeMap::new()
        } else {
            descriptions
        };
        let mut external_clients = BTreeMap::new();
        for (path, _desc) in descriptions {
            if let Some(api) = injected.get(&path) {
                let info = Arc::new(ClientInfo::external(api.clone(), path.clone(), 0));
                self.prepare_client(&info, Some(api_version), &options, &hooks)?;
                external_clients.insert(path, vec![info]);
                continue;
            }

            // One copy of the library per worker thread: loaded clients keep
            // thread-local state inside themselves, so each thread gets its
            // own mapping. Copies are unlinked once loaded.
            let mut infos = Vec::with_capacity(thread_count);
            for thread_index in 0..thread_count {
                let (lib_path, unlink) = if thread_index == 0 {
                    (path.clone(), false)
                } else {
                    (copy_library(&path)?, true)
                };
                let api: Arc<dyn ClientApi> = Arc::new(DlApi::load(&lib_path, unlink)?);
                let info = Arc::new(ClientInfo::external(api, path.clone(), thread_index));
                self.prepare_client(&info, Some(api_version), &options, &hooks)?;
                infos.push(info);
            }
            external_clients.insert(path, infos);
        }
        self.inner.lock().external_clients = external_clients;

        // The network runtime: a single worker thread on which every
        // database state machine and version monitor runs.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("strata-main")
            .enable_all()
            .build()?;
        *self.runtime.lock() = Some(runtime);
        info!(api_version, "network setup complete");
        Ok(())
    }

    fn prepare_client(
        &self,
        client: &Arc<ClientInfo>,
        select_version: Option<i32>,
        options: &[(NetworkOption, Option<Vec<u8>>)],
        hooks: &[CompletionHook],
    ) -> ClientResult<()> {
        if let Some(version) = select_version {
            client.api.select_api_version(version)?;
        }
        if let Err(err) = client.load_protocol_version() {
            warn!(path = %client.desc().lib_path.display(), %err,
                "client version probe failed during setup");
            client.mark_failed();
        }
        for (option, value) in options {
            apply_network_option(client, *option, value.as_deref())?;
        }
        for hook in hooks {
            client.api.add_network_thread_completion_hook(hook.clone())?;
        }
        client.api.setup_network()
    }

    /// Run every client's network loop: one dedicated thread per external
    /// client, the local client on the calling thread. Blocks until
    /// [`stop_network`](MultiVersionApi::stop_network).
    pub fn run_network(&self) -> ClientResult<()> {
        if !self.network_setup_done.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkNotSetup);
        }
        if self.network_running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::NetworkAlreadySetup);
        }

        let externals: Vec<Arc<ClientInfo>> = {
            let inner = self.inner.lock();
            inner
                .external_clients
                .values()
                .flatten()
                .filter(|client| !client.failed())
                .cloned()
                .collect()
        };

        let mut joins = Vec::with_capacity(externals.len());
        for (index, info) in externals.into_iter().enumerate() {
            let client = info.clone();
            let join = std::thread::Builder::new()
                .name(format!("strata-net-{index}"))
                .spawn(move || {
                    if let Err(err) = client.api.run_network() {
                        error!(path = %client.desc().lib_path.display(), %err,
                            "external client network loop failed");
                        client.mark_failed();
                    }
                })
                .map_err(|err| ClientError::Io(err.to_string()))?;
            joins.push((info, join));
        }

        let local_result = if self.local_client_disabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.local_client.api.run_network()
        };

        for (info, join) in joins {
            if join.join().is_err() {
                // A panicking external client must not tear down the rest.
                error!(path = %info.desc().lib_path.display(),
                    "external client network thread panicked");
                info.mark_failed();
            }
        }
        self.network_running.store(false, Ordering::SeqCst);
        local_result
    }

    /// Ask every client, failed ones included, to stop its network loop.
    /// Idempotent.
    pub fn stop_network(&self) -> ClientResult<()> {
        if !self.network_setup_done.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkNotSetup);
        }
        if !self.local_client_disabled.load(Ordering::SeqCst) {
            if let Err(err) = self.local_client.api.stop_network() {
                warn!(%err, "local client stop failed");
            }
        }
        let clients: Vec<Arc<ClientInfo>> = {
            let inner = self.inner.lock();
            inner.external_clients.values().flatten().cloned().collect()
        };
        for client in clients {
            if let Err(err) = client.api.stop_network() {
                warn!(path = %client.desc().lib_path.display(), %err, "client stop failed");
            }
        }
        Ok(())
    }

    /// Open a database whose backing client follows the cluster's protocol
    /// version. Requires a completed `setup_network`.
    pub fn create_database(&self, cluster_file: &str) -> ClientResult<Arc<MultiVersionDatabase>> {
        if !self.network_setup_done.load(Ordering::SeqCst) {
            return Err(ClientError::NetworkNotSetup);
        }
        if self.bypass_multi_client.load(Ordering::SeqCst) {
            let db = self.local_client.api.create_database(cluster_file)?;
            return Ok(MultiVersionDatabase::from_existing(db));
        }

        let clients = {
            let mut inner = self.inner.lock();
            let thread_count = inner.thread_count.max(1);
            let index = inner.next_thread;
            inner.next_thread = (index + 1) % thread_count;

            let mut clients = Vec::new();
            if !self.local_client_disabled.load(Ordering::SeqCst) {
                clients.push(self.local_client.clone());
            }
            for copies in inner.external_clients.values() {
                if copies.is_empty() {
                    continue;
                }
                clients.push(copies[index % copies.len()].clone());
            }
            clients
        };

        // A local-client connection used purely for protocol probing until
        // a compatible client that can probe on its own is bound.
        let monitor_db = match self.local_client.api.create_database(cluster_file) {
            Ok(db) => Some(db),
            Err(err) => {
                warn!(%err, "could not open version-monitor connection");
                None
            }
        };

        let handle = {
            let runtime = self.runtime.lock();
            runtime
                .as_ref()
                .map(|rt| rt.handle().clone())
                .ok_or(ClientError::NetworkNotSetup)?
        };
        Ok(MultiVersionDatabase::new(
            clients,
            cluster_file,
            monitor_db,
            handle,
        ))
    }

    /// Register a hook to run on each client's network thread as it exits.
    /// Propagated to clients added later as well.
    pub fn add_network_thread_completion_hook(&self, hook: CompletionHook) -> ClientResult<()> {
        let clients: Vec<Arc<ClientInfo>> = {
            let mut inner = self.inner.lock();
            inner.hooks.push(hook.clone());
            inner.external_clients.values().flatten().cloned().collect()
        };
        self.local_client
            .api
            .add_network_thread_completion_hook(hook.clone())?;
        for client in clients {
            client.api.add_network_thread_completion_hook(hook.clone())?;
        }
        Ok(())
    }

    /// The local client's version string.
    pub fn client_version(&self) -> String {
        self.local_client.api.client_version()
    }
}

impl Drop for MultiVersionApi {
    fn drop(&mut self) {
        if self.network_setup_done.load(Ordering::SeqCst) {
            let _ = self.stop_network();
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        if self.singleton {
            API_SLOT_TAKEN.store(false, Ordering::SeqCst);
        }
    }
}

impl ClientApi for MultiVersionApi {
    fn select_api_version(&self, version: i32) -> ClientResult<()> {
        MultiVersionApi::select_api_version(self, version)
    }

    fn client_version(&self) -> String {
        MultiVersionApi::client_version(self)
    }

    fn set_network_option(&self, option: NetworkOption, value: Option<&[u8]>) -> ClientResult<()> {
        MultiVersionApi::set_network_option(self, option, value)
    }

    fn setup_network(&self) -> ClientResult<()> {
        MultiVersionApi::setup_network(self)
    }

    fn run_network(&self) -> ClientResult<()> {
        MultiVersionApi::run_network(self)
    }

    fn stop_network(&self) -> ClientResult<()> {
        MultiVersionApi::stop_network(self)
    }

    fn create_database(&self, cluster_file: &str) -> ClientResult<Arc<dyn ClientDatabase>> {
        let db: Arc<dyn ClientDatabase> = MultiVersionApi::create_database(self, cluster_file)?;
        Ok(db)
    }

    fn add_network_thread_completion_hook(&self, hook: CompletionHook) -> ClientResult<()> {
        MultiVersionApi::add_network_thread_completion_hook(self, hook)
    }
}

fn apply_network_option(
    client: &Arc<ClientInfo>,
    option: NetworkOption,
    value: Option<&[u8]>,
) -> ClientResult<()> {
    match client.api.set_network_option(option, value) {
        Ok(()) | Err(ClientError::UnsupportedOption) => Ok(()),
        Err(err) => Err(err),
    }
}

fn utf8_value(option: NetworkOption, value: Option<&[u8]>) -> ClientResult<String> {
    let bytes = value.ok_or_else(|| invalid_value(option))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid_value(option))
}

fn invalid_value(option: NetworkOption) -> ClientError {
    ClientError::InvalidOptionValue(format!("{option:?}"))
}
