//! Routing between sessions and capability workers.
//!
//! Sessions push [`CapabilityEvent`]s to the worker owning each negotiated
//! capability; workers push [`HostCommand`]s back, which
//! [`route_commands`] delivers to the right session.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::message::{CapabilityDesc, NegotiatedCapability};
use ethwire_services::{CapabilityEvent, HostCommand};

use crate::session::SessionTable;

struct CapabilityRoute {
    versions: Vec<u32>,
    events: mpsc::Sender<CapabilityEvent>,
}

/// Capabilities this node offers, by name, with the worker behind each.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    routes: Arc<BTreeMap<String, CapabilityRoute>>,
}

pub struct RegistryBuilder {
    routes: BTreeMap<String, CapabilityRoute>,
}

impl CapabilityRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { routes: BTreeMap::new() }
    }

    /// What we announce in Hello.
    pub fn local_capabilities(&self) -> Vec<CapabilityDesc> {
        self.routes
            .iter()
            .flat_map(|(name, route)| route.versions.iter().map(move |v| CapabilityDesc::new(name, *v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver an event to the worker behind `capability`.
    /// Returns false if no such worker is registered or it has stopped.
    pub async fn dispatch(&self, capability: &str, event: CapabilityEvent) -> bool {
        match self.routes.get(capability) {
            Some(route) => route.events.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Tell every negotiated capability's worker about a new peer.
    pub async fn activate_session(&self, peer: NodeId, negotiated: &[NegotiatedCapability]) {
        for cap in negotiated {
            let event = CapabilityEvent::Connected { peer, version: cap.version };
            if !self.dispatch(&cap.name, event).await {
                tracing::warn!(peer = %short_id(&peer), capability = %cap.name, "capability worker unavailable");
            }
        }
    }

    pub async fn deactivate_session(&self, peer: NodeId, negotiated: &[NegotiatedCapability]) {
        for cap in negotiated {
            self.dispatch(&cap.name, CapabilityEvent::Disconnected { peer }).await;
        }
    }
}

impl RegistryBuilder {
    /// Register a worker for `name`, announced at each of `versions`.
    pub fn register(mut self, name: &str, versions: &[u32], events: mpsc::Sender<CapabilityEvent>) -> Self {
        self.routes.insert(
            name.to_string(),
            CapabilityRoute {
                versions: versions.to_vec(),
                events,
            },
        );
        self
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            routes: Arc::new(self.routes),
        }
    }
}

/// Deliver capability commands to sessions until shutdown.
pub async fn route_commands(
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    sessions: SessionTable,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("command router shutting down");
                return Ok(());
            }

            command = commands.recv() => {
                match command {
                    Some(command) => route(&sessions, command),
                    None => return Ok(()),
                }
            }
        }
    }
}

fn route(sessions: &SessionTable, command: HostCommand) {
    match command {
        HostCommand::Send {
            peer,
            capability,
            packet_type,
            payload,
        } => match sessions.get(&peer) {
            Some(session) => {
                if !session.send(capability, packet_type, payload) {
                    tracing::debug!(peer = %short_id(&peer), capability, "capability not negotiated, packet dropped");
                }
            }
            None => tracing::trace!(peer = %short_id(&peer), capability, packet_type, "no session, packet dropped"),
        },
        HostCommand::Disconnect { peer, reason } => {
            if let Some(session) = sessions.get(&peer) {
                session.disconnect(reason);
            }
        }
    }
}
