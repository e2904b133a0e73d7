//! End-to-end scenarios driven through the public api: probing, binding,
//! client swaps on cluster upgrades, sticky options, legacy probing, and
//! network lifecycle.

use std::sync::Arc;
use std::time::Duration;

use strata_client::sim::{SimClient, SimCluster};
use strata_client::{
    ClientDatabase, ClientError, ClientTransaction, DatabaseOption, MultiVersionApi,
    MultiVersionDatabase, NetworkOption, ProtocolVersion, TransactionOption,
};

const API_VERSION: i32 = 700;

fn api_with_clients(
    local: Arc<SimClient>,
    externals: &[(&str, Arc<SimClient>)],
) -> Arc<MultiVersionApi> {
    let api = MultiVersionApi::isolated(local);
    api.select_api_version(API_VERSION).unwrap();
    for (label, client) in externals {
        api.register_injected_client(label, client.clone()).unwrap();
    }
    api.setup_network().unwrap();
    api
}

async fn wait_for_bind(db: &MultiVersionDatabase, version: ProtocolVersion) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while db.current_protocol_version() != Some(version) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("database never bound to {version}"));
}

/// Retry loop in the shape applications are expected to use.
async fn run_transactional(
    transaction: &dyn ClientTransaction,
    body: impl Fn(&dyn ClientTransaction),
) {
    for _ in 0..50 {
        body(transaction);
        match transaction.commit().await {
            Ok(()) => return,
            Err(err) => transaction
                .on_error(err)
                .await
                .expect("non-retryable transaction error"),
        }
    }
    panic!("transaction retry loop did not converge");
}

#[tokio::test]
async fn probe_then_bind() {
    let cluster = SimCluster::new(ProtocolVersion::V7_0);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
    let external = SimClient::builder(cluster.clone(), ProtocolVersion::V7_0).build();

    let api = api_with_clients(local, &[("libstrata_c_7.0.so", external)]);
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V7_0).await;

    let transaction = db.create_transaction().unwrap();
    let version = transaction.get_read_version().await.unwrap();
    assert!(version > 0);
    assert_eq!(
        transaction.get(b"missing", false).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn swap_mid_transaction_cancels_and_retry_succeeds() {
    let cluster = SimCluster::new(ProtocolVersion::V6_2);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_0).build();
    let client_a = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
    let client_b = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();

    let api = api_with_clients(
        local,
        &[
            ("liba.so", client_a.clone()),
            ("libb.so", client_b.clone()),
        ],
    );
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V6_2).await;

    let transaction = db.create_transaction().unwrap();
    transaction.set(b"x", b"1");

    // The cluster upgrades underneath the live transaction.
    cluster.set_protocol_version(ProtocolVersion::V6_3);
    wait_for_bind(&db, ProtocolVersion::V6_3).await;

    let commit_error = transaction.commit().await.unwrap_err();
    assert!(
        matches!(
            commit_error,
            ClientError::ClusterVersionChanged | ClientError::TransactionCancelled
        ),
        "unexpected commit error: {commit_error}"
    );

    // The application-style retry re-runs the body against the new client.
    transaction.on_error(commit_error).await.unwrap();
    run_transactional(transaction.as_ref(), |t| t.set(b"x", b"1")).await;
    assert_eq!(cluster.get(b"x"), Some(b"1".to_vec()));
    assert!(!client_b.created_transactions().is_empty());
}

#[tokio::test]
async fn sticky_options_survive_swap() {
    let cluster = SimCluster::new(ProtocolVersion::V6_2);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_0).build();
    let client_a = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
    let client_b = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();

    let api = api_with_clients(
        local,
        &[
            ("liba.so", client_a.clone()),
            ("libb.so", client_b.clone()),
        ],
    );
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V6_2).await;

    let transaction = db.create_transaction().unwrap();
    transaction
        .set_option(TransactionOption::Timeout, Some(b"5000".as_slice()))
        .unwrap();
    transaction
        .set_option(TransactionOption::RetryLimit, Some(b"3".as_slice()))
        .unwrap();

    cluster.set_protocol_version(ProtocolVersion::V6_3);
    wait_for_bind(&db, ProtocolVersion::V6_3).await;

    // Any operation now fails over; the retry loop rebinds and replays.
    let err = transaction.get_read_version().await.unwrap_err();
    transaction.on_error(err).await.unwrap();
    transaction.get_read_version().await.unwrap();

    let inner = client_b
        .created_transactions()
        .pop()
        .expect("no transaction created on the new client");
    let options: Vec<_> = inner
        .recorded_options()
        .into_iter()
        .map(|(option, value)| (option, value.unwrap()))
        .collect();
    assert_eq!(
        options,
        vec![
            (TransactionOption::Timeout, b"5000".to_vec()),
            (TransactionOption::RetryLimit, b"3".to_vec()),
        ]
    );
}

#[tokio::test]
async fn unsupported_optional_operation() {
    let cluster = SimCluster::new(ProtocolVersion::V6_2);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_0).build();
    let old = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2)
        .without_versionstamp()
        .build();

    let api = api_with_clients(local, &[("libold.so", old)]);
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V6_2).await;

    let transaction = db.create_transaction().unwrap();
    assert!(matches!(
        transaction.get_versionstamp().await,
        Err(ClientError::UnsupportedOperation)
    ));
    // The transaction is still usable for supported operations.
    transaction.get_read_version().await.unwrap();
}

#[tokio::test]
async fn legacy_client_binds_via_grv_probe() {
    let cluster = SimCluster::new(ProtocolVersion::V5_0);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3)
        .without_protocol_query()
        .build();
    let legacy = SimClient::builder(cluster.clone(), ProtocolVersion::V5_0)
        .without_protocol_query()
        .build();

    let api = api_with_clients(local, &[("libv5.so", legacy.clone())]);
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V5_0).await;

    let transaction = db.create_transaction().unwrap();
    run_transactional(transaction.as_ref(), |t| t.set(b"legacy", b"yes")).await;
    assert_eq!(cluster.get(b"legacy"), Some(b"yes".to_vec()));

    // Closing stops the probe monitors within bounded time.
    db.close();
}

#[tokio::test]
async fn legacy_probe_backs_off_until_cluster_reachable() {
    let cluster = SimCluster::new(ProtocolVersion::V5_0);
    cluster.set_reachable(false);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3)
        .without_protocol_query()
        .build();
    let legacy = SimClient::builder(cluster.clone(), ProtocolVersion::V5_0)
        .without_protocol_query()
        .build();

    let api = api_with_clients(local, &[("libv5.so", legacy)]);
    let db = api.create_database("c.cluster").unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(db.current_protocol_version(), None);

    cluster.set_reachable(true);
    wait_for_bind(&db, ProtocolVersion::V5_0).await;
}

#[tokio::test]
async fn environment_options_are_deduplicated() {
    std::env::set_var("STRATA_NETWORK_OPTION_TRACE_LOG_GROUP", "upgrade-test");
    let cluster = SimCluster::new(ProtocolVersion::V6_3);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();

    let api = MultiVersionApi::isolated(local.clone());
    api.select_api_version(API_VERSION).unwrap();
    api.setup_network().unwrap();
    std::env::remove_var("STRATA_NETWORK_OPTION_TRACE_LOG_GROUP");

    // Same (option, value) again: the client must see it exactly once.
    api.set_network_option(
        NetworkOption::TraceLogGroup,
        Some(b"upgrade-test".as_slice()),
    )
    .unwrap();
    let seen: Vec<_> = local
        .recorded_network_options()
        .into_iter()
        .filter(|(option, _)| *option == NetworkOption::TraceLogGroup)
        .collect();
    assert_eq!(
        seen,
        vec![(
            NetworkOption::TraceLogGroup,
            Some(b"upgrade-test".to_vec())
        )]
    );

    // A different value is not deduplicated.
    api.set_network_option(NetworkOption::TraceLogGroup, Some(b"other".as_slice()))
        .unwrap();
    let seen = local.recorded_network_options();
    assert!(seen.contains(&(NetworkOption::TraceLogGroup, Some(b"other".to_vec()))));
}

#[tokio::test]
async fn stop_network_is_idempotent() {
    let cluster = SimCluster::new(ProtocolVersion::V6_3);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
    let external = SimClient::builder(cluster, ProtocolVersion::V6_2).build();

    let api = api_with_clients(local.clone(), &[("libext.so", external.clone())]);

    let runner = {
        let api = api.clone();
        std::thread::spawn(move || api.run_network())
    };

    for _ in 0..3 {
        api.stop_network().unwrap();
    }
    runner.join().unwrap().unwrap();
    assert!(local.network_stopped());
    assert!(external.network_stopped());
    assert_eq!(local.stop_calls(), 3);
}

#[tokio::test]
async fn completion_hooks_run_on_network_exit() {
    let cluster = SimCluster::new(ProtocolVersion::V6_3);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();
    let external = SimClient::builder(cluster, ProtocolVersion::V6_2).build();

    let api = api_with_clients(local, &[("libext.so", external)]);
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = fired.clone();
    api.add_network_thread_completion_hook(Arc::new(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }))
    .unwrap();

    let runner = {
        let api = api.clone();
        std::thread::spawn(move || api.run_network())
    };
    api.stop_network().unwrap();
    runner.join().unwrap().unwrap();

    // Once per client network thread: the local one and the external one.
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn first_registered_client_wins_at_equal_normalized_version() {
    let cluster = SimCluster::new(ProtocolVersion::V6_2);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_0).build();
    let first = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
    let second = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();

    // BTreeMap iteration over labels preserves our registration intent:
    // "a-first" sorts (and is registered) before "b-second".
    let api = api_with_clients(
        local,
        &[
            ("a-first.so", first.clone()),
            ("b-second.so", second.clone()),
        ],
    );
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V6_2).await;

    let transaction = db.create_transaction().unwrap();
    transaction.get_read_version().await.unwrap();
    assert!(!first.created_transactions().is_empty());
    assert!(second.created_transactions().is_empty());
}

#[tokio::test]
async fn database_options_recorded_before_bind_reach_new_databases() {
    let cluster = SimCluster::new(ProtocolVersion::V6_2);
    let local = SimClient::builder(cluster.clone(), ProtocolVersion::V6_0).build();
    let client_a = SimClient::builder(cluster.clone(), ProtocolVersion::V6_2).build();
    let client_b = SimClient::builder(cluster.clone(), ProtocolVersion::V6_3).build();

    let api = api_with_clients(
        local,
        &[
            ("liba.so", client_a),
            ("libb.so", client_b.clone()),
        ],
    );
    let db = api.create_database("c.cluster").unwrap();
    wait_for_bind(&db, ProtocolVersion::V6_2).await;

    db.set_option(
        DatabaseOption::TransactionTimeout,
        Some(b"9000".as_slice()),
    )
    .unwrap();

    cluster.set_protocol_version(ProtocolVersion::V6_3);
    wait_for_bind(&db, ProtocolVersion::V6_3).await;

    // A transaction created after the swap observes the recorded default.
    let transaction = db.create_transaction().unwrap();
    transaction.get_read_version().await.unwrap();
    let inner = client_b
        .created_transactions()
        .pop()
        .expect("no transaction on new client");
    assert_eq!(
        inner.recorded_options().first(),
        Some(&(TransactionOption::Timeout, Some(b"9000".to_vec())))
    );
}
