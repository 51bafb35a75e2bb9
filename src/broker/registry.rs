//! Session registry: live sessions, client-id bindings and disable rules.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::broker::session::{ClientSession, Outbox, SessionId, SessionStats};
use crate::core::message::ClientId;

/// Disable rule: an address plus a port, where port 0 matches every port.
pub type DisableRule = (IpAddr, u16);

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<ClientSession>>,
    by_client: DashMap<ClientId, SessionId>,
    disabled: RwLock<HashSet<DisableRule>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection. The session starts disabled when a rule already
    /// covers its peer address, but it is registered either way: disabled
    /// sessions still process control traffic.
    pub fn register(&self, peer: SocketAddr, outbox: Box<dyn Outbox>) -> Arc<ClientSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let enabled = !self.matches_rule(peer);
        let session = Arc::new(ClientSession::new(id, peer, outbox, enabled));
        self.sessions.insert(id, session.clone());
        debug!(session = id, %peer, enabled, "session registered");
        session
    }

    /// Bind a client identity to a session. A later bind of the same
    /// identity wins; the displaced mapping simply stops resolving.
    pub fn bind(&self, session_id: SessionId, client: ClientId) {
        let Some(session) = self.get(session_id) else {
            return;
        };
        if let Some(previous) = session.bind_client(client.clone()) {
            if previous != client {
                self.by_client
                    .remove_if(&previous, |_, bound| *bound == session_id);
            }
        }
        self.by_client.insert(client.clone(), session_id);
        info!(session = session_id, client = %client, "client identified");
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Arc<ClientSession>> {
        let (_, session) = self.sessions.remove(&session_id)?;
        if let Some(client) = session.client() {
            self.by_client
                .remove_if(&client, |_, bound| *bound == session_id);
        }
        Some(session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    pub fn by_client(&self, client: &ClientId) -> Option<Arc<ClientSession>> {
        let session_id = *self.by_client.get(client)?;
        self.get(session_id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Aggregate counters across live sessions.
    pub fn total_stats(&self) -> SessionStats {
        let mut total = SessionStats::default();
        for session in self.sessions.iter() {
            total.merge(&session.stats());
        }
        total
    }

    /// Zero every live session's counters.
    pub fn reset_stats(&self) {
        for session in self.sessions.iter() {
            session.reset_stats();
        }
    }

    fn matches_rule(&self, peer: SocketAddr) -> bool {
        let rules = self.disabled.read();
        rules.contains(&(peer.ip(), peer.port())) || rules.contains(&(peer.ip(), 0))
    }

    /// Add a disable rule and flip every matching live session.
    pub fn disable(&self, addr: IpAddr, port: u16) {
        self.disabled.write().insert((addr, port));
        self.reapply_rules();
        info!(%addr, port, "sends disabled");
    }

    /// Drop a disable rule. Sessions re-enable only when no other rule
    /// still covers them.
    pub fn enable(&self, addr: IpAddr, port: u16) {
        self.disabled.write().remove(&(addr, port));
        self.reapply_rules();
        info!(%addr, port, "sends enabled");
    }

    fn reapply_rules(&self) {
        for session in self.sessions.iter() {
            session.set_enabled(!self.matches_rule(session.peer()));
        }
    }

    pub fn disabled_rules(&self) -> Vec<DisableRule> {
        let mut rules: Vec<DisableRule> = self.disabled.read().iter().copied().collect();
        rules.sort();
        rules
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("bound_clients", &self.by_client.len())
            .field("disable_rules", &self.disabled.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::SendError;
    use bytes::Bytes;

    struct NullOutbox;

    impl Outbox for NullOutbox {
        fn forward(&self, _frame: Bytes) -> Result<(), SendError> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn peer(addr: &str) -> SocketAddr {
        addr.parse().unwrap()
    }

    #[test]
    fn register_bind_and_remove() {
        let registry = SessionRegistry::new();
        let session = registry.register(peer("10.0.0.1:5000"), Box::new(NullOutbox));
        assert!(session.is_enabled());

        registry.bind(session.id(), ClientId::from("orders"));
        assert_eq!(
            registry.by_client(&ClientId::from("orders")).unwrap().id(),
            session.id()
        );

        registry.remove(session.id());
        assert!(registry.by_client(&ClientId::from("orders")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn later_bind_of_same_identity_wins() {
        let registry = SessionRegistry::new();
        let first = registry.register(peer("10.0.0.1:5000"), Box::new(NullOutbox));
        let second = registry.register(peer("10.0.0.2:5000"), Box::new(NullOutbox));

        registry.bind(first.id(), ClientId::from("orders"));
        registry.bind(second.id(), ClientId::from("orders"));
        assert_eq!(
            registry.by_client(&ClientId::from("orders")).unwrap().id(),
            second.id()
        );

        // Removing the displaced session must not drop the new mapping.
        registry.remove(first.id());
        assert_eq!(
            registry.by_client(&ClientId::from("orders")).unwrap().id(),
            second.id()
        );
    }

    #[test]
    fn rebinding_session_releases_old_identity() {
        let registry = SessionRegistry::new();
        let session = registry.register(peer("10.0.0.1:5000"), Box::new(NullOutbox));
        registry.bind(session.id(), ClientId::from("old-name"));
        registry.bind(session.id(), ClientId::from("new-name"));

        assert!(registry.by_client(&ClientId::from("old-name")).is_none());
        assert_eq!(
            registry.by_client(&ClientId::from("new-name")).unwrap().id(),
            session.id()
        );
    }

    #[test]
    fn port_zero_rule_covers_every_port() {
        let registry = SessionRegistry::new();
        let a = registry.register(peer("10.0.0.1:5000"), Box::new(NullOutbox));
        let b = registry.register(peer("10.0.0.1:6000"), Box::new(NullOutbox));
        let other = registry.register(peer("10.0.0.2:5000"), Box::new(NullOutbox));

        registry.disable(peer("10.0.0.1:0").ip(), 0);
        assert!(!a.is_enabled());
        assert!(!b.is_enabled());
        assert!(other.is_enabled());

        registry.enable(peer("10.0.0.1:0").ip(), 0);
        assert!(a.is_enabled());
        assert!(b.is_enabled());
    }

    #[test]
    fn specific_rule_survives_wildcard_removal() {
        let registry = SessionRegistry::new();
        let a = registry.register(peer("10.0.0.1:5000"), Box::new(NullOutbox));
        let b = registry.register(peer("10.0.0.1:6000"), Box::new(NullOutbox));

        let ip = peer("10.0.0.1:0").ip();
        registry.disable(ip, 0);
        registry.disable(ip, 5000);
        registry.enable(ip, 0);

        assert!(!a.is_enabled(), "port-specific rule still applies");
        assert!(b.is_enabled());
    }

    #[test]
    fn new_connection_from_disabled_peer_starts_disabled() {
        let registry = SessionRegistry::new();
        registry.disable(peer("10.0.0.9:0").ip(), 0);
        let session = registry.register(peer("10.0.0.9:7000"), Box::new(NullOutbox));
        assert!(!session.is_enabled());
    }
}
