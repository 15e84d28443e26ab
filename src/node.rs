//! A running replication node: cluster channel, membership service and one
//! replication manager, wired together from [`Settings`].
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::heartbeat::{HeartbeatService, MBR_ALL_SEQ};
use crate::membership::Member;
use crate::probe::StaticMembershipProvider;
use crate::replication::{ClusterRouter, ReplicationManager};
use crate::session::ListenerRegistry;
use crate::settings::{MembershipMode, Settings};
use crate::transport::{ClusterChannel, TcpChannel};

/// How this node learns about its peers
#[derive(Debug)]
pub enum MembershipService {
    Heartbeat(Arc<HeartbeatService>),
    Static(Arc<StaticMembershipProvider>),
}

impl MembershipService {
    pub async fn stop(&self) -> Result<()> {
        match self {
            Self::Heartbeat(service) => {
                service.stop(MBR_ALL_SEQ).await?;
            }
            Self::Static(provider) => {
                provider.stop().await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ClusterNode {
    channel: Arc<TcpChannel>,
    membership: MembershipService,
    router: ClusterRouter,
    manager: Arc<ReplicationManager>,
}

impl ClusterNode {
    /// Bring the node up in dependency order: channel, membership, message
    /// routing, then the manager's state transfer.
    pub async fn start(settings: Settings, registry: Arc<ListenerRegistry>) -> Result<Self> {
        settings.validate()?;
        let channel = Arc::new(TcpChannel::start(&settings.local_member).await?);
        let local = channel.local_member();
        info!(
            "[{}] starting node in {} membership mode",
            local, settings.membership_mode
        );

        let membership = match settings.membership_mode {
            MembershipMode::Multicast => {
                let service = Arc::new(HeartbeatService::new(
                    settings.heartbeat.clone(),
                    channel.membership().clone(),
                )?);
                service.start(MBR_ALL_SEQ).await?;
                MembershipService::Heartbeat(service)
            }
            MembershipMode::Static => {
                let provider = Arc::new(StaticMembershipProvider::new(
                    settings.probe.clone(),
                    channel.clone(),
                ));
                let report = provider.start().await?;
                if !report.faulty.is_empty() {
                    warn!(
                        "[{}] {} static member(s) failed the start probe",
                        local,
                        report.faulty.len()
                    );
                }
                MembershipService::Static(provider)
            }
        };

        let cluster: Arc<dyn ClusterChannel> = channel.clone();
        let router = ClusterRouter::start(cluster.clone());
        let manager = Arc::new(ReplicationManager::new(
            settings.replication.clone(),
            cluster,
            registry,
        ));
        channel
            .membership()
            .add_listener(manager.membership_listener())
            .await?;
        router.register(manager.clone())?;
        manager.start().await?;

        Ok(Self {
            channel,
            membership,
            router,
            manager,
        })
    }

    pub fn local_member(&self) -> Member {
        self.channel.local_member()
    }

    pub fn members(&self) -> Arc<Vec<Member>> {
        self.channel.members()
    }

    pub fn manager(&self) -> &Arc<ReplicationManager> {
        &self.manager
    }

    pub fn router(&self) -> &ClusterRouter {
        &self.router
    }

    pub fn membership(&self) -> &MembershipService {
        &self.membership
    }

    /// Stop the manager first so shutdown-time EXPIRED messages still have
    /// peers to go to, then leave the cluster.
    pub async fn shutdown(&self) -> Result<()> {
        let context = self.manager.context_name().to_string();
        if let Err(e) = self.manager.stop().await {
            warn!("Stopping replication for {} failed: {}", context, e);
        }
        self.router.unregister(&context);
        self.membership.stop().await?;
        info!("[{}] node stopped", self.local_member());
        Ok(())
    }
}
