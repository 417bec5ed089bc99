use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use discovery_client::{ReadOnlyDiscoveryClient, ServiceDiscovery};
use shared::ServiceRecord;

/// One line summary of the state of the world, sorted by service name
pub fn summarize(world: &HashMap<String, Vec<ServiceRecord>>) -> String {
    if world.is_empty() {
        return "no services".to_string();
    }
    let mut names: Vec<&String> = world.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| format!("{}={}", name, world[name].len()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Periodically logs the services the client currently knows about
pub async fn run(client: Arc<ServiceDiscovery>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    let mut last = String::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = summarize(&client.find_all_services());
                if summary != last {
                    tracing::info!("State of the world: {}", summary);
                    last = summary;
                } else {
                    tracing::debug!("State of the world unchanged: {}", summary);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("State logger shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ServiceRecord {
        ServiceRecord::for_service(name, None, "http", "10.0.0.1", 80).unwrap()
    }

    #[test]
    fn test_summarize_sorts_by_name() {
        let world = HashMap::from([
            ("user".to_string(), vec![record("user"), record("user")]),
            ("billing".to_string(), vec![record("billing")]),
        ]);
        assert_eq!(summarize(&world), "billing=1, user=2");
    }

    #[test]
    fn test_summarize_empty_world() {
        assert_eq!(summarize(&HashMap::new()), "no services");
    }
}
