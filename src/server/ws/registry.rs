//! Live session state.
//!
//! [`ConnectionRegistry`] owns the three coupled maps: sessions by connection
//! id, connection ids by user, and subscriber connection ids by topic. Every
//! mutation goes through one of its methods so the maps never drift apart.
//! Callers hold the surrounding lock only for the duration of a call.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::commands::{ModeChange, PermissionLevel, SessionSummary};
use crate::server::ratelimit::CommandRateLimiter;

/// One authenticated connection.
#[derive(Debug)]
pub struct ConnectedSession {
    pub conn_id: String,
    pub user_id: String,
    pub session_id: String,
    /// Snapshotted at authentication.
    pub permission_level: PermissionLevel,
    pub dangerous_mode: bool,
    pub ai_mode: bool,
    pub topics: BTreeSet<String>,
    pub rate_limiter: CommandRateLimiter,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub recent_commands: VecDeque<String>,
    pub tx: mpsc::UnboundedSender<Message>,
    pub cancel: CancellationToken,
}

/// Toggle snapshot pushed to the client as `state:update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub permission_level: PermissionLevel,
    pub dangerous_mode: bool,
    pub ai_mode: bool,
}

impl ConnectedSession {
    pub fn modes(&self) -> ModeSnapshot {
        ModeSnapshot {
            permission_level: self.permission_level,
            dangerous_mode: self.dangerous_mode,
            ai_mode: self.ai_mode,
        }
    }

    fn summary(&self, now: Instant) -> SessionSummary {
        SessionSummary {
            conn_id: self.conn_id.clone(),
            user_id: self.user_id.clone(),
            permission_level: self.permission_level,
            dangerous_mode: self.dangerous_mode,
            ai_mode: self.ai_mode,
            topics: self.topics.iter().cloned().collect(),
            idle_secs: now.saturating_duration_since(self.last_activity).as_secs(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<String, ConnectedSession>,
    users: HashMap<String, HashSet<String>>,
    topics: HashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: ConnectedSession) {
        let conn_id = session.conn_id.clone();
        // A reused id must not leave stale index entries behind.
        if self.sessions.contains_key(&conn_id) {
            self.remove(&conn_id);
        }
        self.users
            .entry(session.user_id.clone())
            .or_default()
            .insert(conn_id.clone());
        for topic in &session.topics {
            self.topics
                .entry(topic.clone())
                .or_default()
                .insert(conn_id.clone());
        }
        self.sessions.insert(conn_id, session);
    }

    /// Drop a connection from all three maps.
    ///
    /// The session record names the user and topic entries to detach. Without
    /// a record every index entry is swept so no orphan survives.
    pub fn remove(&mut self, conn_id: &str) -> Option<ConnectedSession> {
        let removed = self.sessions.remove(conn_id);
        match &removed {
            Some(session) => {
                detach(&mut self.users, &session.user_id, conn_id);
                for topic in &session.topics {
                    detach(&mut self.topics, topic, conn_id);
                }
            }
            None => {
                self.users.retain(|_, conns| {
                    conns.remove(conn_id);
                    !conns.is_empty()
                });
                self.topics.retain(|_, conns| {
                    conns.remove(conn_id);
                    !conns.is_empty()
                });
            }
        }
        removed
    }

    pub fn get(&self, conn_id: &str) -> Option<&ConnectedSession> {
        self.sessions.get(conn_id)
    }

    pub fn get_mut(&mut self, conn_id: &str) -> Option<&mut ConnectedSession> {
        self.sessions.get_mut(conn_id)
    }

    /// Add `topic` to the session and the global index. `false` if the
    /// connection has no session.
    pub fn subscribe(&mut self, conn_id: &str, topic: &str) -> bool {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return false;
        };
        session.topics.insert(topic.to_string());
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id.to_string());
        true
    }

    /// Remove `topic` from both structures, pruning an emptied topic entry.
    /// Returns whether the session was subscribed.
    pub fn unsubscribe(&mut self, conn_id: &str, topic: &str) -> bool {
        let was_subscribed = self
            .sessions
            .get_mut(conn_id)
            .is_some_and(|session| session.topics.remove(topic));
        if let Some(conns) = self.topics.get_mut(topic) {
            conns.remove(conn_id);
            if conns.is_empty() {
                self.topics.remove(topic);
            }
        }
        was_subscribed
    }

    /// Senders of every connection subscribed to exactly `topic`.
    pub fn subscriber_senders(&self, topic: &str) -> Vec<mpsc::UnboundedSender<Message>> {
        let Some(conns) = self.topics.get(topic) else {
            return Vec::new();
        };
        conns
            .iter()
            .filter_map(|conn_id| self.sessions.get(conn_id))
            .map(|session| session.tx.clone())
            .collect()
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn subscribers(&self, topic: &str) -> Vec<&str> {
        self.topics
            .get(topic)
            .map(|conns| conns.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<&str> {
        self.users
            .get(user_id)
            .map(|conns| conns.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn has_user(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn touch(&mut self, conn_id: &str, now: Instant) {
        if let Some(session) = self.sessions.get_mut(conn_id) {
            session.last_activity = now;
        }
    }

    pub fn apply_mode_change(&mut self, conn_id: &str, change: ModeChange) -> Option<ModeSnapshot> {
        let session = self.sessions.get_mut(conn_id)?;
        if let Some(dangerous) = change.dangerous_mode {
            session.dangerous_mode = dangerous;
        }
        if let Some(ai) = change.ai_mode {
            session.ai_mode = ai;
        }
        Some(session.modes())
    }

    /// Append a command line to the session history, keeping the newest
    /// `limit` entries.
    pub fn record_command(&mut self, conn_id: &str, line: &str, limit: usize) {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return;
        };
        session.recent_commands.push_back(line.to_string());
        while session.recent_commands.len() > limit {
            session.recent_commands.pop_front();
        }
    }

    /// Connection ids idle for longer than `idle_timeout` at `now`.
    pub fn expired(&self, idle_timeout: Duration, now: Instant) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > idle_timeout)
            .map(|s| s.conn_id.clone())
            .collect()
    }

    pub fn summaries(&self, now: Instant) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> =
            self.sessions.values().map(|s| s.summary(now)).collect();
        out.sort_by(|a, b| a.conn_id.cmp(&b.conn_id));
        out
    }
}

/// Remove `conn_id` from one index entry, dropping the entry once empty.
fn detach(index: &mut HashMap<String, HashSet<String>>, key: &str, conn_id: &str) {
    if let Some(conns) = index.get_mut(key) {
        conns.remove(conn_id);
        if conns.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(
        conn_id: &str,
        user_id: &str,
    ) -> (ConnectedSession, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        (
            ConnectedSession {
                conn_id: conn_id.into(),
                user_id: user_id.into(),
                session_id: format!("s-{conn_id}"),
                permission_level: PermissionLevel::Authenticated,
                dangerous_mode: false,
                ai_mode: false,
                topics: BTreeSet::new(),
                rate_limiter: CommandRateLimiter::default(),
                connected_at: now,
                last_activity: now,
                recent_commands: VecDeque::new(),
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn assert_consistent(registry: &ConnectionRegistry) {
        for (topic, conns) in &registry.topics {
            assert!(!conns.is_empty(), "empty entry for {topic}");
            for conn in conns {
                let s = registry.sessions.get(conn).expect("dangling subscriber");
                assert!(s.topics.contains(topic));
            }
        }
        for s in registry.sessions.values() {
            for topic in &s.topics {
                assert!(registry.topics[topic].contains(&s.conn_id));
            }
            assert!(registry.users[&s.user_id].contains(&s.conn_id));
        }
        for (user, conns) in &registry.users {
            assert!(!conns.is_empty(), "empty entry for {user}");
        }
    }

    #[test]
    fn test_subscription_symmetry() {
        let mut registry = ConnectionRegistry::new();
        let (s, _rx) = session("c1", "alice");
        registry.insert(s);

        assert!(registry.subscribe("c1", "price:SOL"));
        assert!(registry.get("c1").unwrap().topics.contains("price:SOL"));
        assert_eq!(registry.subscribers("price:SOL"), vec!["c1"]);
        assert_consistent(&registry);

        assert!(registry.unsubscribe("c1", "price:SOL"));
        assert!(!registry.get("c1").unwrap().topics.contains("price:SOL"));
        assert!(!registry.has_subscribers("price:SOL"));
        assert_eq!(registry.topic_count(), 0);

        assert!(!registry.unsubscribe("c1", "price:SOL"));
        assert_consistent(&registry);
    }

    #[test]
    fn test_subscribe_without_session_is_rejected() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.subscribe("ghost", "price:SOL"));
        assert!(!registry.has_subscribers("price:SOL"));
    }

    #[test]
    fn test_shared_topic_survives_one_unsubscribe() {
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = session("c1", "alice");
        let (b, _rb) = session("c2", "bob");
        registry.insert(a);
        registry.insert(b);
        registry.subscribe("c1", "market:all");
        registry.subscribe("c2", "market:all");
        registry.unsubscribe("c1", "market:all");
        assert_eq!(registry.subscribers("market:all"), vec!["c2"]);
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_cleans_every_index() {
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = session("c1", "alice");
        let (b, _rb) = session("c2", "alice");
        registry.insert(a);
        registry.insert(b);
        registry.subscribe("c1", "price:SOL");
        registry.subscribe("c1", "token:BONK");
        registry.subscribe("c2", "price:SOL");

        let removed = registry.remove("c1").unwrap();
        assert_eq!(removed.topics.len(), 2);
        assert!(registry.has_user("alice"));
        assert_eq!(registry.connections_for_user("alice"), vec!["c2"]);
        assert!(!registry.has_subscribers("token:BONK"));
        assert_eq!(registry.subscribers("price:SOL"), vec!["c2"]);
        assert_consistent(&registry);

        registry.remove("c2");
        assert!(!registry.has_user("alice"));
        assert_eq!(registry.topic_count(), 0);
        assert!(registry.is_empty());

        // Removing twice is harmless
        assert!(registry.remove("c2").is_none());
    }

    #[test]
    fn test_reinserted_conn_id_replaces_index_entries() {
        let mut registry = ConnectionRegistry::new();
        let (first, _r1) = session("c1", "alice");
        let (other, _r2) = session("c2", "dave");
        registry.insert(first);
        registry.insert(other);
        registry.subscribe("c1", "price:SOL");
        registry.subscribe("c2", "market:all");

        let (second, _r3) = session("c1", "bob");
        registry.insert(second);
        assert!(!registry.has_user("alice"));
        assert_eq!(registry.connections_for_user("bob"), vec!["c1"]);
        assert!(!registry.has_subscribers("price:SOL"));
        assert_eq!(registry.subscribers("market:all"), vec!["c2"]);
        assert_eq!(registry.connections_for_user("dave"), vec!["c2"]);
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_sweeps_orphaned_index_entries() {
        let mut registry = ConnectionRegistry::new();
        registry
            .topics
            .entry("price:SOL".into())
            .or_default()
            .insert("orphan".into());
        registry
            .users
            .entry("ghost".into())
            .or_default()
            .insert("orphan".into());
        assert!(registry.remove("orphan").is_none());
        assert_eq!(registry.topic_count(), 0);
        assert!(!registry.has_user("ghost"));
    }

    #[test]
    fn test_mode_change_and_history() {
        let mut registry = ConnectionRegistry::new();
        let (s, _rx) = session("c1", "alice");
        registry.insert(s);

        let snapshot = registry
            .apply_mode_change(
                "c1",
                ModeChange {
                    dangerous_mode: Some(true),
                    ai_mode: None,
                },
            )
            .unwrap();
        assert!(snapshot.dangerous_mode);
        assert!(!snapshot.ai_mode);
        assert!(registry.apply_mode_change("nope", ModeChange::default()).is_none());

        for i in 0..5 {
            registry.record_command("c1", &format!("cmd {i}"), 3);
        }
        let history: Vec<_> = registry.get("c1").unwrap().recent_commands.iter().cloned().collect();
        assert_eq!(history, vec!["cmd 2", "cmd 3", "cmd 4"]);
    }

    #[test]
    fn test_expired_uses_last_activity() {
        let mut registry = ConnectionRegistry::new();
        let (a, _ra) = session("c1", "alice");
        let (b, _rb) = session("c2", "bob");
        registry.insert(a);
        registry.insert(b);

        let later = Instant::now() + Duration::from_secs(100);
        registry.touch("c2", later);
        let expired = registry.expired(Duration::from_secs(50), later);
        assert_eq!(expired, vec!["c1".to_string()]);

        let summaries = registry.summaries(later);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].idle_secs, 0);
        assert!(summaries[0].idle_secs >= 99);
    }

    #[test]
    fn test_subscriber_senders_deliver() {
        let mut registry = ConnectionRegistry::new();
        let (s, mut rx) = session("c1", "alice");
        registry.insert(s);
        registry.subscribe("c1", "price:SOL");
        for tx in registry.subscriber_senders("price:SOL") {
            tx.send(Message::Text("hi".into())).unwrap();
        }
        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));
        assert!(registry.subscriber_senders("price:ETH").is_empty());
    }
}
