use crate::error::{Result, ShardgateError};
use crate::registry::{ConnectionString, HostAndPort};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    #[default]
    PrimaryOnly,
    PrimaryPreferred,
    SecondaryOnly,
    SecondaryPreferred,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Unknown,
    Primary,
    Secondary,
    Unreachable { since: Instant },
}

/// What a response revealed about the host that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostObservation {
    /// Answered `hello` as primary.
    Primary,
    /// Answered `hello` as secondary.
    Secondary,
    /// Answered some other command successfully.
    Reachable,
    NotMaster,
    NetworkError,
}

/// Resolves a read preference to a concrete host of one shard.
#[derive(Debug)]
pub struct HostTargeter {
    conn: ConnectionString,
    states: Mutex<HashMap<HostAndPort, HostState>>,
    changed: Notify,
    cooldown: Duration,
    rotation: AtomicUsize,
}

impl HostTargeter {
    pub fn new(conn: ConnectionString, cooldown: Duration) -> Self {
        let states = conn
            .hosts()
            .iter()
            .map(|h| (h.clone(), HostState::Unknown))
            .collect();
        Self {
            conn,
            states: Mutex::new(states),
            changed: Notify::new(),
            cooldown,
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.conn
    }

    pub fn state_of(&self, host: &HostAndPort) -> Option<HostState> {
        self.states.lock().get(host).copied()
    }

    pub fn on_response(&self, host: &HostAndPort, observation: HostObservation) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(host) else {
            return;
        };
        let next = match (observation, *state) {
            (HostObservation::Primary, _) => HostState::Primary,
            (HostObservation::Secondary, _) => HostState::Secondary,
            (HostObservation::NotMaster, HostState::Primary) => HostState::Secondary,
            (HostObservation::NotMaster, HostState::Unknown) => HostState::Secondary,
            (HostObservation::NotMaster, current) => current,
            (HostObservation::NetworkError, HostState::Unreachable { since }) => {
                HostState::Unreachable { since }
            }
            (HostObservation::NetworkError, _) => HostState::Unreachable {
                since: Instant::now(),
            },
            (HostObservation::Reachable, HostState::Unreachable { .. }) => HostState::Unknown,
            (HostObservation::Reachable, current) => current,
        };
        if next != *state {
            tracing::debug!(%host, from = ?*state, to = ?next, "host state changed");
            *state = next;
            if observation == HostObservation::Primary {
                // At most one primary per shard.
                for (other, s) in states.iter_mut() {
                    if other != host && *s == HostState::Primary {
                        *s = HostState::Unknown;
                    }
                }
            }
            drop(states);
            self.changed.notify_waiters();
        }
    }

    fn usable(&self, state: HostState, now: Instant) -> Option<HostState> {
        match state {
            HostState::Unreachable { since } if now.duration_since(since) < self.cooldown => None,
            HostState::Unreachable { .. } => Some(HostState::Unknown),
            s => Some(s),
        }
    }

    fn select(&self, pref: ReadPreference) -> Option<HostAndPort> {
        let now = Instant::now();
        let states = self.states.lock();
        let mut primary = None;
        let mut secondaries = Vec::new();
        let mut unknown = Vec::new();
        for host in self.conn.hosts() {
            match states.get(host).and_then(|s| self.usable(*s, now)) {
                Some(HostState::Primary) => primary = Some(host.clone()),
                Some(HostState::Secondary) => secondaries.push(host.clone()),
                Some(_) => unknown.push(host.clone()),
                None => {}
            }
        }
        let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
        let pick = |hosts: &[HostAndPort]| -> Option<HostAndPort> {
            (!hosts.is_empty()).then(|| hosts[turn % hosts.len()].clone())
        };
        match pref {
            // With no known primary, an unprobed host may turn out to be it.
            ReadPreference::PrimaryOnly => primary.or_else(|| pick(&unknown)),
            ReadPreference::PrimaryPreferred => primary
                .or_else(|| pick(&secondaries))
                .or_else(|| pick(&unknown)),
            ReadPreference::SecondaryOnly => pick(&secondaries).or_else(|| pick(&unknown)),
            ReadPreference::SecondaryPreferred => pick(&secondaries)
                .or(primary)
                .or_else(|| pick(&unknown)),
            ReadPreference::Nearest => {
                let mut all = secondaries;
                all.extend(primary);
                all.extend(unknown);
                pick(&all)
            }
        }
    }

    /// Next instant a cooling-down host becomes eligible again.
    fn next_cooldown_expiry(&self) -> Option<Instant> {
        self.states
            .lock()
            .values()
            .filter_map(|s| match s {
                HostState::Unreachable { since } => Some(*since + self.cooldown),
                _ => None,
            })
            .min()
    }

    pub async fn find_host(&self, pref: ReadPreference, deadline: Instant) -> Result<HostAndPort> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(host) = self.select(pref) {
                return Ok(host);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ShardgateError::HostUnreachable(format!(
                    "no host of {} matches {pref:?}",
                    self.conn
                )));
            }
            let wake = self
                .next_cooldown_expiry()
                .filter(|t| *t > now)
                .map(|t| t.min(deadline))
                .unwrap_or(deadline);
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs() -> (HostTargeter, HostAndPort, HostAndPort) {
        let conn = ConnectionString::parse("rs0/a:1,b:2").unwrap();
        let a = HostAndPort::new("a", 1);
        let b = HostAndPort::new("b", 2);
        (HostTargeter::new(conn, Duration::from_millis(50)), a, b)
    }

    #[tokio::test]
    async fn primary_moves_on_not_master() {
        let (t, a, b) = rs();
        t.on_response(&a, HostObservation::Primary);
        t.on_response(&b, HostObservation::Secondary);
        let deadline = Instant::now() + Duration::from_millis(100);
        assert_eq!(t.find_host(ReadPreference::PrimaryOnly, deadline).await.unwrap(), a);
        assert_eq!(t.find_host(ReadPreference::SecondaryOnly, deadline).await.unwrap(), b);

        t.on_response(&a, HostObservation::NotMaster);
        assert_eq!(t.state_of(&a), Some(HostState::Secondary));
        t.on_response(&b, HostObservation::Primary);
        assert_eq!(t.find_host(ReadPreference::PrimaryOnly, deadline).await.unwrap(), b);
        assert_eq!(
            t.find_host(ReadPreference::SecondaryPreferred, deadline).await.unwrap(),
            a
        );
    }

    #[tokio::test]
    async fn unreachable_hosts_time_out_then_recover() {
        let (t, a, b) = rs();
        t.on_response(&a, HostObservation::NetworkError);
        t.on_response(&b, HostObservation::NetworkError);
        let short = Instant::now() + Duration::from_millis(10);
        assert!(matches!(
            t.find_host(ReadPreference::PrimaryOnly, short).await,
            Err(ShardgateError::HostUnreachable(_))
        ));
        // After the cool-down the hosts are worth trying again.
        let later = Instant::now() + Duration::from_millis(500);
        assert!(t.find_host(ReadPreference::Nearest, later).await.is_ok());
    }

    #[tokio::test]
    async fn waiters_wake_on_state_change() {
        let (t, a, b) = rs();
        t.on_response(&a, HostObservation::Secondary);
        t.on_response(&b, HostObservation::Secondary);
        let t = std::sync::Arc::new(t);
        let waiter = {
            let t = t.clone();
            tokio::spawn(async move {
                t.find_host(ReadPreference::PrimaryOnly, Instant::now() + Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.on_response(&b, HostObservation::Primary);
        assert_eq!(waiter.await.unwrap().unwrap(), b);
    }
}
