//! Routes inbound session messages to the manager of their context
//!
//! One router subscribes to the channel; every [`ReplicationManager`] is
//! registered under its context name. A state request for a context nobody
//! manages here is answered with NO_CONTEXT_MANAGER so the requester does not
//! wait for its full timeout.
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::ReplicationManager;
use super::messages::{SessionEvent, SessionMessage};
use crate::error::Result;
use crate::transport::{ClusterChannel, ReceivedMessage};

type Managers = Arc<DashMap<String, Arc<ReplicationManager>>>;

pub struct ClusterRouter {
    channel: Arc<dyn ClusterChannel>,
    managers: Managers,
    route_task: JoinHandle<()>,
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("local", &self.channel.local_member().name())
            .field("contexts", &self.contexts())
            .finish()
    }
}

impl ClusterRouter {
    pub fn start(channel: Arc<dyn ClusterChannel>) -> Self {
        let managers: Managers = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        channel.subscribe(tx);
        let route_task = tokio::spawn(route(rx, managers.clone(), channel.clone()));
        Self {
            channel,
            managers,
            route_task,
        }
    }

    pub fn channel(&self) -> &Arc<dyn ClusterChannel> {
        &self.channel
    }

    pub fn register(&self, manager: Arc<ReplicationManager>) -> Result<()> {
        let context = manager.context_name().to_string();
        if self.managers.contains_key(&context) {
            return Err(crate::config_error!(
                "a manager for context {} is already registered",
                context
            ));
        }
        self.managers.insert(context, manager);
        Ok(())
    }

    pub fn unregister(&self, context: &str) -> Option<Arc<ReplicationManager>> {
        self.managers.remove(context).map(|(_, manager)| manager)
    }

    pub fn manager(&self, context: &str) -> Option<Arc<ReplicationManager>> {
        self.managers.get(context).map(|entry| entry.value().clone())
    }

    pub fn contexts(&self) -> Vec<String> {
        let mut contexts: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        contexts.sort();
        contexts
    }
}

impl Drop for ClusterRouter {
    fn drop(&mut self) {
        self.route_task.abort();
    }
}

async fn route(
    mut rx: mpsc::UnboundedReceiver<ReceivedMessage>,
    managers: Managers,
    channel: Arc<dyn ClusterChannel>,
) {
    while let Some(received) = rx.recv().await {
        let manager = managers
            .get(&received.message.context_name)
            .map(|entry| entry.value().clone());
        match manager {
            Some(manager) => manager.handle_message(received).await,
            None if received.message.event == SessionEvent::GetAllSessions => {
                let reply = SessionMessage::new(
                    SessionEvent::NoContextManager,
                    received.message.context_name.clone(),
                    "NO-CONTEXT-MANAGER",
                    Vec::new(),
                );
                if let Err(e) = channel.send(&reply, &received.sender).await {
                    warn!(
                        "Unable to tell {} that context {} is not managed here: {}",
                        received.sender, received.message.context_name, e
                    );
                }
            }
            None => debug!(
                "No manager for context {}, dropping {}",
                received.message.context_name, received.message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::membership::Member;
    use crate::session::ListenerRegistry;
    use crate::settings::ReplicationConfig;
    use crate::transport::LocalHub;

    fn member(port: i32, id: u8) -> Member {
        Member::new("127.0.0.1".parse().unwrap(), port, [id; 16])
    }

    fn manager(channel: Arc<dyn ClusterChannel>, context: &str) -> Arc<ReplicationManager> {
        let config = ReplicationConfig {
            context_name: context.to_string(),
            state_transfer_timeout: Duration::from_secs(5),
            process_expires_frequency: Duration::ZERO,
            ..ReplicationConfig::default()
        };
        Arc::new(ReplicationManager::new(
            config,
            channel,
            Arc::new(ListenerRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_context_rejected() {
        let hub = LocalHub::new();
        let channel: Arc<dyn ClusterChannel> = Arc::new(hub.join(member(4001, 1)));
        let router = ClusterRouter::start(channel.clone());
        router.register(manager(channel.clone(), "/a")).unwrap();
        assert!(router.register(manager(channel, "/a")).is_err());
        assert_eq!(router.contexts(), vec!["/a".to_string()]);
    }

    #[tokio::test]
    async fn test_unmanaged_context_answers_no_context_manager() {
        let hub = LocalHub::new();
        let a: Arc<dyn ClusterChannel> = Arc::new(hub.join(member(4001, 1)));
        let b: Arc<dyn ClusterChannel> = Arc::new(hub.join(member(4002, 2)));
        let _router_a = ClusterRouter::start(a);

        let router_b = ClusterRouter::start(b.clone());
        let joining = manager(b, "/unknown");
        router_b.register(joining.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), joining.start())
            .await
            .unwrap()
            .unwrap();
        assert!(joining.is_state_transferred());
        assert_eq!(joining.session_count(), 0);
    }
}
