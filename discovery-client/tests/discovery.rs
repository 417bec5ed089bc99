use std::sync::Arc;
use std::time::Duration;
use discovery_client::{
    DiscoveryClient, DiscoveryConfig, DiscoveryError, MemoryStore, ReadOnlyDiscoveryClient,
    ServiceDiscovery, ServiceHint,
};
use shared::{ServiceRecord, ServiceUri};

const ROOT: &str = "/ness/srvc";

fn config() -> DiscoveryConfig {
    DiscoveryConfig {
        enabled: true,
        ..DiscoveryConfig::default()
    }
}

fn store() -> MemoryStore {
    let store = MemoryStore::new();
    store.put(ROOT, Vec::new());
    store
}

fn user_client(service_type: &str, address: &str) -> ServiceRecord {
    ServiceRecord::for_service("user-client", Some(service_type), service_type, address, 8080).unwrap()
}

/// Gives the loops a few ticks to converge
async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[tokio::test(start_paused = true)]
async fn test_user_client_lookup() {
    let store = store();
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    client.announce(user_client("http", "192.168.1.32")).unwrap();
    client.announce(user_client("https", "192.168.1.33")).unwrap();

    client.start().await;
    settle().await;

    let http = client.find_service_uri("user-client", Some("http"), &[]).unwrap();
    assert_eq!(http.scheme(), "http");
    assert_eq!(http.host_str(), Some("192.168.1.32"));
    assert_eq!(http.port(), Some(8080));

    let https = client.find_service_uri("user-client", Some("https"), &[]).unwrap();
    assert_eq!(https.scheme(), "https");
    assert_eq!(https.host_str(), Some("192.168.1.33"));
    assert_eq!(https.port(), Some(8080));

    assert_eq!(client.find_all_service_information("user-client").len(), 2);
    assert_eq!(
        client
            .find_all_service_information_of_type("user-client", Some("https"))
            .len(),
        1
    );
    assert_eq!(client.find_all_services()["user-client"].len(), 2);

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_world() {
    let client = ServiceDiscovery::read_only(Arc::new(store()), config());
    client.start().await;
    assert!(client.wait_for_world_change(Duration::from_secs(1)).await);

    assert!(matches!(
        client.find_service_uri("user-client", Some("http"), &[]),
        Err(DiscoveryError::ServiceNotAvailable(_))
    ));
    assert!(matches!(
        client.find_service_information("user-client", None, &[]),
        Err(DiscoveryError::ServiceNotAvailable(_))
    ));
    assert!(client.find_all_service_information("user-client").is_empty());
    assert!(client
        .find_all_service_information_of_type("user-client", None)
        .is_empty());
    assert!(client.find_all_services().is_empty());

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_convert_service_uri() {
    let store = store();
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    client
        .announce(ServiceRecord::for_service("follow", Some("test"), "http", "10.0.0.5", 80).unwrap())
        .unwrap();
    client
        .announce(ServiceRecord::for_service("follow", Some("secure"), "https", "10.0.0.6", 8443).unwrap())
        .unwrap();
    client.start().await;
    settle().await;

    let uri = ServiceUri::parse("srvc://follow:test/v1/resource?query#fragment").unwrap();
    let url = client.convert_service_uri(&uri, &[]).unwrap();
    assert_eq!(url.as_str(), "http://10.0.0.5/v1/resource?query#fragment");

    let uri = ServiceUri::parse("srvc://follow:secure/").unwrap();
    let url = client.convert_service_uri(&uri, &[]).unwrap();
    assert_eq!(url.as_str(), "https://10.0.0.6:8443/");

    let uri = ServiceUri::parse("srvc://unknown/").unwrap();
    assert!(matches!(
        client.convert_service_uri(&uri, &[]),
        Err(DiscoveryError::ServiceNotAvailable(_))
    ));

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ipv6_endpoints() {
    let store = store();
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    client
        .announce(ServiceRecord::for_service("v6", Some("http"), "http", "fd00::1", 8080).unwrap())
        .unwrap();
    client
        .announce(ServiceRecord::for_service("v6", Some("web"), "http", "fd00::2", 80).unwrap())
        .unwrap();
    client.start().await;
    settle().await;

    let url = client.find_service_uri("v6", Some("http"), &[]).unwrap();
    assert_eq!(url.host_str(), Some("[fd00::1]"));
    assert_eq!(url.port(), Some(8080));

    let uri = ServiceUri::parse("srvc://v6:http/status?full").unwrap();
    let url = client.convert_service_uri(&uri, &[]).unwrap();
    assert_eq!(url.as_str(), "http://[fd00::1]:8080/status?full");

    let uri = ServiceUri::parse("srvc://v6:web/").unwrap();
    let url = client.convert_service_uri(&uri, &[]).unwrap();
    assert_eq!(url.as_str(), "http://[fd00::2]/");

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_client() {
    let store = store();
    let client = ServiceDiscovery::read_only(Arc::new(store.clone()), DiscoveryConfig::default());
    client.start().await;

    assert!(store.sessions().is_empty());
    assert!(client.wait_for_world_change(Duration::from_millis(1)).await);

    let uri = ServiceUri::parse("srvc://follow/").unwrap();
    assert!(matches!(
        client.convert_service_uri(&uri, &[]),
        Err(DiscoveryError::ServiceNotAvailable(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_clients_see_each_other() {
    let store = store();
    let announcer = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    let reader = ServiceDiscovery::read_only(Arc::new(store.clone()), config());
    let record = user_client("http", "192.168.1.32");

    announcer.announce(record.clone()).unwrap();
    announcer.start().await;
    reader.start().await;
    settle().await;
    assert_eq!(
        reader.find_service_information("user-client", None, &[]).unwrap(),
        record
    );

    announcer.unannounce(&record).unwrap();
    settle().await;
    assert!(reader.find_all_service_information("user-client").is_empty());

    // Ephemeral announcements go away with the session
    announcer.announce(record.clone()).unwrap();
    settle().await;
    assert_eq!(reader.find_all_service_information("user-client").len(), 1);
    announcer.stop().await;
    settle().await;
    assert!(reader.find_all_service_information("user-client").is_empty());

    reader.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reannounce_after_session_expiry() {
    let store = store();
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    let record = user_client("http", "192.168.1.32");
    client.announce(record.clone()).unwrap();
    client.start().await;
    settle().await;

    let node = format!("{}/{}", ROOT, record.announcement_name());
    assert!(store.is_ephemeral(&node));

    store.expire_session(store.sessions()[0]);
    assert!(!store.contains(&node));

    settle().await;
    assert!(store.is_ephemeral(&node));
    assert_eq!(client.find_all_service_information("user-client").len(), 1);

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_static_announcement_outlives_client() {
    let store = store();
    let record =
        ServiceRecord::static_announcement(None, "legacy", None, "http", "10.0.0.9", 80).unwrap();

    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    client.announce(record.clone()).unwrap();
    client.start().await;
    settle().await;
    client.stop().await;

    let node = format!("{}/{}", ROOT, record.announcement_name());
    assert!(store.contains(&node));

    let cleaner = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    cleaner.start().await;
    settle().await;
    assert_eq!(cleaner.find_all_service_information("legacy").len(), 1);

    cleaner.unannounce(&record).unwrap();
    settle().await;
    assert!(!store.contains(&node));
    assert!(cleaner.find_all_service_information("legacy").is_empty());

    cleaner.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_consistent_hash_hint_pins_instance() {
    let store = store();
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config());
    for i in 0..5 {
        let address = format!("10.0.1.{}", i);
        client
            .announce(ServiceRecord::for_service("cache", None, "http", &address, 11211).unwrap())
            .unwrap();
    }
    client.start().await;
    settle().await;

    let hints = [ServiceHint::serves_key("session-1234")];
    let first = client.find_service_information("cache", None, &hints).unwrap();
    for _ in 0..10 {
        assert_eq!(client.find_service_information("cache", None, &hints).unwrap(), first);
    }

    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_announce_disabled_client_stays_silent() {
    let store = store();
    let config = DiscoveryConfig {
        announce_enabled: false,
        ..config()
    };
    let client = ServiceDiscovery::read_write(Arc::new(store.clone()), config);
    client.announce(user_client("http", "192.168.1.32")).unwrap();
    client.start().await;
    settle().await;

    assert!(store.children(ROOT).is_empty());
    client.stop().await;
}
