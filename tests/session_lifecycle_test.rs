use std::sync::Arc;
use std::time::Duration;
use wagate::protocol::mock::{MockBehavior, MockFactory};
use wagate::protocol::{ProtoError, ProtocolEvent};
use wagate::session::ConnectionState;
use wagate::store::{InstanceStore, MemoryStore};
use wagate::types::{AccountId, Contact, InstanceId, NewInstance, ProfilePicture};
use wagate::{GatewayConfig, InstanceManager, SessionError};

const JID: &str = "5511999990000@s.whatsapp.net";

struct Gateway {
    manager: InstanceManager,
    store: MemoryStore,
    factory: MockFactory,
}

fn gateway_with(factory: MockFactory, config: GatewayConfig) -> Gateway {
    let store = MemoryStore::new();
    let manager = InstanceManager::new(
        Arc::new(store.clone()),
        Arc::new(factory.clone()),
        config,
    );
    Gateway {
        manager,
        store,
        factory,
    }
}

fn gateway() -> Gateway {
    gateway_with(
        MockFactory::new(),
        GatewayConfig {
            ready_timeout: Duration::from_secs(2),
            write_retry_backoff: Duration::from_millis(1),
            ..Default::default()
        },
    )
}

async fn add_instance(gw: &Gateway, account: i32, token: &str, identity: Option<&str>) -> InstanceId {
    let row = gw
        .store
        .insert_instance(NewInstance {
            account_id: account,
            name: format!("instance {token}"),
            token: token.to_string(),
            events: "All".to_string(),
            ..Default::default()
        })
        .await
        .expect("Failed to insert instance");
    if let Some(identity) = identity {
        gw.store.update_pairing(row.id, identity).await.unwrap();
        gw.store.update_connected(row.id, false).await.unwrap();
    }
    row.id
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}

#[tokio::test]
async fn test_unpaired_instance_pairs() {
    let gw = gateway();
    add_instance(&gw, 1, "T1", None).await;
    let id = gw.manager.resolve(AccountId(1), "T1").await.unwrap();

    let status = gw.manager.status(id).await.unwrap();
    assert_eq!(status.state, ConnectionState::AwaitingPairing);
    assert!(!status.logged_in);

    assert_eq!(gw.manager.qr_code(id).await.unwrap(), Some("qr-1-1".to_string()));

    let handle = gw.manager.registry().get(id).unwrap();
    gw.factory.client(id).unwrap().pair(JID).await;
    let state = handle.wait_until(|s| s == ConnectionState::Connected).await;
    assert_eq!(state, ConnectionState::Connected);

    assert_eq!(gw.manager.qr_code(id).await.unwrap(), None);
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.pairing_identity(), Some(JID));
    assert!(row.connected);

    let status = gw.manager.status(id).await.unwrap();
    assert!(status.connected);
    assert!(status.logged_in);
    assert_eq!(gw.factory.created(), 1);
}

#[tokio::test]
async fn test_paired_instance_connects_directly() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;

    let status = gw.manager.status(id).await.unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert!(status.logged_in);

    let client = gw.factory.client(id).unwrap();
    assert_eq!(client.spec().pairing_identity.as_deref(), Some(JID));
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert!(row.connected);
    assert_eq!(row.qr_code(), None);
}

#[tokio::test]
async fn test_qr_rotation_keeps_latest() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;
    gw.manager.status(id).await.unwrap();

    let client = gw.factory.client(id).unwrap();
    let handle = gw.manager.registry().get(id).unwrap();
    client.emit(ProtocolEvent::QrIssued("second".into())).await;
    client.emit(ProtocolEvent::QrIssued("third".into())).await;

    let store = gw.store.clone();
    eventually(|| {
        let store = store.clone();
        async move {
            let row = store.get_instance(id).await.unwrap().unwrap();
            row.qr_code() == Some("third")
        }
    })
    .await;

    // A duplicate QR delivered after pairing must not resurface.
    client.pair(JID).await;
    client.emit(ProtocolEvent::QrIssued("stale".into())).await;
    client.emit(ProtocolEvent::Connected).await;
    handle.wait_until(|s| s == ConnectionState::Connected).await;
    eventually(|| {
        let store = store.clone();
        async move {
            let row = store.get_instance(id).await.unwrap().unwrap();
            row.pairing_identity() == Some(JID)
        }
    })
    .await;
    assert_eq!(gw.manager.qr_code(id).await.unwrap(), None);
}

#[tokio::test]
async fn test_resolve_hides_foreign_instances() {
    let gw = gateway();
    add_instance(&gw, 1, "T1", None).await;

    let foreign = gw.manager.resolve(AccountId(2), "T1").await;
    let unknown = gw.manager.resolve(AccountId(1), "missing").await;
    assert!(matches!(foreign, Err(SessionError::NotFound)));
    assert!(matches!(unknown, Err(SessionError::NotFound)));
    assert_eq!(gw.factory.created(), 0);
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;
    gw.manager.status(id).await.unwrap();

    gw.manager.logout(id).await.unwrap();
    assert!(gw.manager.registry().get(id).is_none());
    assert_eq!(gw.factory.client(id).unwrap().logout_calls(), 1);

    gw.manager.logout(id).await.unwrap();

    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.pairing_identity(), None);
    assert_eq!(row.qr_code(), None);
    assert!(!row.connected);
}

#[tokio::test]
async fn test_logout_without_running_client() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;

    gw.manager.logout(id).await.unwrap();
    assert_eq!(gw.factory.created(), 0);
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.pairing_identity(), None);
}

#[tokio::test]
async fn test_protocol_logout_failure_is_surfaced() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;
    gw.manager.status(id).await.unwrap();

    let client = gw.factory.client(id).unwrap();
    client
        .fail_logout(Some(ProtoError::Transport("server unreachable".into())))
        .await;

    let result = gw.manager.logout(id).await;
    assert!(matches!(result, Err(SessionError::Proto(ProtoError::Transport(_)))));
    assert!(gw.manager.registry().get(id).is_some());
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.pairing_identity(), Some(JID));

    client.fail_logout(None).await;
    gw.manager.logout(id).await.unwrap();
    assert!(gw.manager.registry().get(id).is_none());
}

#[tokio::test]
async fn test_remote_logout_evicts() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;
    gw.manager.status(id).await.unwrap();
    let handle = gw.manager.registry().get(id).unwrap();

    gw.factory.client(id).unwrap().revoke().await;
    let state = handle.wait_until(|s| s == ConnectionState::LoggedOut).await;
    assert_eq!(state, ConnectionState::LoggedOut);
    assert!(gw.manager.registry().get(id).is_none());

    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.pairing_identity(), None);

    // The next request starts over with a fresh, unpaired client.
    let status = gw.manager.status(id).await.unwrap();
    assert_eq!(status.state, ConnectionState::AwaitingPairing);
    assert_eq!(gw.factory.created(), 2);
}

#[tokio::test]
async fn test_status_timeout_is_retryable() {
    let gw = gateway_with(
        MockFactory::new().with_behavior(MockBehavior::Silent),
        GatewayConfig {
            ready_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    );
    let id = add_instance(&gw, 1, "T1", None).await;

    let err = gw.manager.status(id).await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout));
    assert!(err.is_retryable());
    assert_eq!(gw.manager.registry().len(), 1);

    gw.factory
        .client(id)
        .unwrap()
        .emit(ProtocolEvent::QrIssued("qr".into()))
        .await;
    let status = gw.manager.status(id).await.unwrap();
    assert_eq!(status.state, ConnectionState::AwaitingPairing);
    assert_eq!(gw.factory.created(), 1);
}

#[tokio::test]
async fn test_client_creation_failure() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;

    gw.factory.fail_next_creates(1);
    let err = gw.manager.status(id).await.unwrap_err();
    assert!(matches!(err, SessionError::ClientCreationFailed(_)));
    assert!(err.is_retryable());
    assert!(gw.manager.registry().is_empty());

    gw.manager.status(id).await.unwrap();
    assert_eq!(gw.factory.created(), 2);
}

#[tokio::test]
async fn test_contacts_and_groups_require_connection() {
    let gw = gateway();
    let unpaired = add_instance(&gw, 1, "T1", None).await;
    assert!(matches!(
        gw.manager.contacts(unpaired).await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        gw.manager.groups(unpaired).await,
        Err(SessionError::NotConnected)
    ));

    let paired = add_instance(&gw, 1, "T2", Some(JID)).await;
    gw.manager.status(paired).await.unwrap();
    let contact = Contact {
        jid: "5511888880000@s.whatsapp.net".into(),
        push_name: "Ana".into(),
        ..Default::default()
    };
    gw.factory
        .client(paired)
        .unwrap()
        .set_contacts(vec![contact.clone()])
        .await;

    assert_eq!(gw.manager.contacts(paired).await.unwrap(), vec![contact]);
    assert!(gw.manager.groups(paired).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_avatar() {
    let gw = gateway();
    let unpaired = add_instance(&gw, 1, "T1", None).await;
    assert_eq!(gw.manager.avatar(unpaired, JID).await.unwrap(), None);
    assert_eq!(gw.factory.created(), 0);

    let paired = add_instance(&gw, 1, "T2", Some(JID)).await;
    // Not running yet: not found rather than an error.
    assert_eq!(gw.manager.avatar(paired, JID).await.unwrap(), None);

    gw.manager.status(paired).await.unwrap();
    let client = gw.factory.client(paired).unwrap();
    let picture = ProfilePicture {
        id: "1".into(),
        url: "https://pps.example.com/1.jpg".into(),
        direct_path: None,
    };
    client.set_profile_picture(JID, picture.clone()).await;

    assert_eq!(
        gw.manager.avatar(paired, JID).await.unwrap(),
        Some(picture.clone())
    );
    assert_eq!(
        gw.manager.avatar(paired, "nobody@s.whatsapp.net").await.unwrap(),
        None
    );
    assert_eq!(
        gw.manager.own_avatar(AccountId(1), paired).await.unwrap(),
        Some(picture)
    );
    assert!(matches!(
        gw.manager.own_avatar(AccountId(2), paired).await,
        Err(SessionError::NotFound)
    ));

    client
        .fail_profile_picture(Some(ProtoError::Transport("reset".into())))
        .await;
    assert!(matches!(
        gw.manager.avatar(paired, JID).await,
        Err(SessionError::Proto(_))
    ));
}

#[tokio::test]
async fn test_disconnect_and_reconnect_reuse_handle() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", Some(JID)).await;
    gw.manager.status(id).await.unwrap();
    let handle = gw.manager.registry().get(id).unwrap();

    gw.manager.disconnect(id).await.unwrap();
    assert_eq!(handle.state(), ConnectionState::Disconnected);
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert!(!row.connected);
    assert_eq!(row.pairing_identity(), Some(JID));

    // Disconnecting twice is a no-op.
    gw.manager.disconnect(id).await.unwrap();

    gw.manager.connect(id).await.unwrap();
    let state = handle.wait_until(|s| s == ConnectionState::Connected).await;
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(gw.factory.created(), 1);

    // Connecting while connected changes nothing.
    gw.manager.connect(id).await.unwrap();
    assert_eq!(gw.factory.client(id).unwrap().connect_calls(), 2);
}

#[tokio::test]
async fn test_disconnect_without_running_client() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;
    gw.manager.disconnect(id).await.unwrap();
    assert_eq!(gw.factory.created(), 0);

    assert!(matches!(
        gw.manager.disconnect(InstanceId(77)).await,
        Err(SessionError::NotFound)
    ));
}

#[tokio::test]
async fn test_qr_polling_starts_initialization() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;

    assert_eq!(gw.manager.qr_code(id).await.unwrap(), None);

    let manager = &gw.manager;
    eventually(|| async move { manager.qr_code(id).await.unwrap().is_some() }).await;
    assert_eq!(gw.factory.created(), 1);
}

#[tokio::test]
async fn test_warm_up_skips_expired() {
    let gw = gateway();
    add_instance(&gw, 1, "T1", None).await;
    add_instance(&gw, 1, "T2", Some(JID)).await;
    let expired = gw
        .store
        .insert_instance(NewInstance {
            account_id: 2,
            name: "old".into(),
            token: "T3".into(),
            expiration: Some(chrono::Utc::now().timestamp() - 60),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(gw.manager.warm_up().await.unwrap(), 2);

    let registry = gw.manager.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.len() == 2 }
    })
    .await;
    assert_eq!(gw.factory.created_for(expired.id), 0);

    // Already running instances are not started twice.
    assert_eq!(gw.manager.warm_up().await.unwrap(), 0);
}

#[tokio::test]
async fn test_shutdown_disconnects_everything() {
    let gw = gateway();
    let a = add_instance(&gw, 1, "T1", Some(JID)).await;
    let b = add_instance(&gw, 2, "T2", Some("5511777770000@s.whatsapp.net")).await;
    gw.manager.status(a).await.unwrap();
    gw.manager.status(b).await.unwrap();

    gw.manager.shutdown().await;
    assert!(gw.manager.registry().is_empty());

    for id in [a, b] {
        assert_eq!(gw.factory.client(id).unwrap().disconnect_calls(), 1);
        let row = gw.store.get_instance(id).await.unwrap().unwrap();
        assert!(!row.connected);
        assert!(row.pairing_identity().is_some());
    }
}

#[tokio::test]
async fn test_shutdown_clears_pending_qr() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;
    let status = gw.manager.status(id).await.unwrap();
    assert_eq!(status.state, ConnectionState::AwaitingPairing);

    gw.manager.shutdown().await;
    let row = gw.store.get_instance(id).await.unwrap().unwrap();
    assert_eq!(row.qr_code(), None);

    // A restarted gateway whose client has issued nothing yet has no QR.
    let restarted = InstanceManager::new(
        Arc::new(gw.store.clone()),
        Arc::new(MockFactory::new().with_behavior(MockBehavior::Silent)),
        GatewayConfig::default(),
    );
    assert_eq!(restarted.qr_code(id).await.unwrap(), None);
    let registry = restarted.registry().clone();
    eventually(|| {
        let registry = registry.clone();
        async move { registry.get(id).is_some() }
    })
    .await;
    assert_eq!(restarted.qr_code(id).await.unwrap(), None);
}

#[tokio::test]
async fn test_left_over_qr_is_never_served() {
    let gw = gateway();
    let id = add_instance(&gw, 1, "T1", None).await;
    gw.store.update_qr_code(id, "from-a-crashed-process").await.unwrap();

    assert_eq!(gw.manager.qr_code(id).await.unwrap(), None);

    let manager = &gw.manager;
    eventually(|| async move { manager.qr_code(id).await.unwrap().is_some() }).await;
    assert_eq!(gw.manager.qr_code(id).await.unwrap(), Some("qr-1-1".to_string()));
}

#[tokio::test]
async fn test_list_instances_by_account() {
    let gw = gateway();
    add_instance(&gw, 1, "T1", None).await;
    add_instance(&gw, 2, "T2", None).await;
    add_instance(&gw, 1, "T3", None).await;

    let rows = gw.manager.list_instances(AccountId(1)).await.unwrap();
    let tokens: Vec<&str> = rows.iter().map(|row| row.token.as_str()).collect();
    assert_eq!(tokens, vec!["T1", "T3"]);
}
