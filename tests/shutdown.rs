mod common;

use common::{init_logging, FakeRuntime};
use sandterm::{errors::SessionError, Config, Supervisor};
use std::{collections::HashSet, time::Duration};

#[tokio::test]
async fn shutdown_destroys_sessions_and_strays() {
    init_logging();
    let runtime = FakeRuntime::new();
    let config = Config {
        pool_size: 1,
        ..Config::default()
    };
    let supervisor = Supervisor::new(&config, runtime.clone());
    let registry = supervisor.registry();

    let first = registry.create_session("a").await.unwrap();
    let second = registry.create_session("b").await.unwrap();
    supervisor.pool().quiesce().await;
    // the refilled fresh container belongs to no session
    assert_eq!(supervisor.pool().fresh_count(), 1);
    assert_eq!(runtime.create_count(), 3);

    supervisor.shutdown().await;

    assert!(registry.is_empty());
    assert!(supervisor.pool().list_all_ids().is_empty());
    for id in runtime.created() {
        assert_eq!(runtime.destroy_count(&id), 1, "container {}", id);
    }
    let destroyed: HashSet<_> = runtime.destroyed().into_iter().collect();
    assert!(destroyed.contains(&first.container_id));
    assert!(destroyed.contains(&second.container_id));
    assert_eq!(destroyed.len(), 3);
}

#[tokio::test]
async fn shutdown_waits_for_warming_containers() {
    init_logging();
    let runtime = FakeRuntime::new();
    runtime.create_delay(Duration::from_millis(20));
    let config = Config {
        pool_size: 2,
        ..Config::default()
    };
    let supervisor = Supervisor::new(&config, runtime.clone());

    supervisor.start();
    tokio::task::yield_now().await;
    supervisor.shutdown().await;

    assert_eq!(runtime.create_count(), 2);
    assert_eq!(runtime.destroyed().len(), 2);
    assert!(supervisor.pool().list_all_ids().is_empty());
}

#[tokio::test]
async fn shutdown_with_nothing_running() {
    init_logging();
    let runtime = FakeRuntime::new();
    let supervisor = Supervisor::new(&Config::default(), runtime.clone());
    supervisor.shutdown().await;
    assert!(runtime.destroyed().is_empty());
}

#[tokio::test]
async fn nothing_is_created_after_shutdown() {
    init_logging();
    let runtime = FakeRuntime::new();
    let config = Config {
        pool_size: 1,
        ..Config::default()
    };
    let supervisor = Supervisor::new(&config, runtime.clone());
    supervisor.shutdown().await;
    let created = runtime.create_count();

    assert!(matches!(
        supervisor.registry().create_session("late").await,
        Err(SessionError::ShuttingDown)
    ));
    supervisor.pool().spawn_warm();
    supervisor.pool().warm().await;
    supervisor.pool().quiesce().await;

    assert_eq!(runtime.create_count(), created);
    assert!(supervisor.pool().list_all_ids().is_empty());
}

#[tokio::test]
async fn shutdown_reclaims_a_session_being_created() {
    init_logging();
    let runtime = FakeRuntime::new();
    runtime.create_delay(Duration::from_millis(20));
    let supervisor = Supervisor::new(&Config::default(), runtime.clone());
    let registry = supervisor.registry();

    let creating = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.create_session("a").await })
    };
    tokio::task::yield_now().await;
    supervisor.shutdown().await;

    let session = creating.await.unwrap().unwrap();
    assert!(registry.is_empty());
    assert!(supervisor.pool().list_all_ids().is_empty());
    assert_eq!(runtime.destroy_count(&session.container_id), 1);
    for id in runtime.created() {
        assert_eq!(runtime.destroy_count(&id), 1, "container {}", id);
    }
}

#[tokio::test]
async fn shutdown_forgets_containers_that_fail_to_destroy() {
    init_logging();
    let runtime = FakeRuntime::new();
    let config = Config {
        pool_size: 1,
        ..Config::default()
    };
    let supervisor = Supervisor::new(&config, runtime.clone());
    let registry = supervisor.registry();
    registry.create_session("a").await.unwrap();
    supervisor.pool().quiesce().await;
    runtime.fail_destroy(true);

    supervisor.shutdown().await;

    assert!(registry.is_empty());
    assert!(supervisor.pool().list_all_ids().is_empty());
    assert_eq!(runtime.destroyed().len(), runtime.create_count());
    for id in runtime.created() {
        assert_eq!(runtime.destroy_count(&id), 1, "container {}", id);
    }
}
