use async_trait::async_trait;
use tracing::{info, trace};
use crate::store::{CreateMode, Session, StoreResult};
use super::CoordinationJob;

/// Creates every missing element of a path as an empty persistent node.
#[derive(Debug, Clone)]
pub struct BuildPathJob {
    path: String,
}

impl BuildPathJob {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl CoordinationJob for BuildPathJob {
    async fn execute(&mut self, session: &dyn Session) -> StoreResult<bool> {
        let mut prefix = String::with_capacity(self.path.len());
        for element in self.path.split('/').filter(|e| !e.trim().is_empty()) {
            prefix.push('/');
            prefix.push_str(element);

            if session.exists(&prefix).await? {
                continue;
            }
            info!("Node {} does not exist, creating", prefix);
            match session.create(&prefix, Vec::new(), CreateMode::Persistent).await {
                Ok(_) => {}
                Err(e) if e.is_node_exists() => trace!("Node {} exists, ignoring", prefix),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
