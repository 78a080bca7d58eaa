use crate::catalog::{CatalogClient, ShardEntry};
use crate::error::{Result, ShardgateError};
use crate::namespace::{Namespace, ShardId};
use crate::targeter::{HostObservation, HostTargeter};
use crate::transport::{ShardCommand, ShardRequest, ShardResponse, ShardTransport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ShardgateError::BadValue(format!("host '{s}' is missing a port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ShardgateError::BadValue(format!("invalid port in host '{s}'")))?;
        if host.is_empty() {
            return Err(ShardgateError::BadValue(format!("empty host name in '{s}'")));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// `set/h1:p1,h2:p2` for a replica set or `h1:p1` for a standalone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionString {
    set_name: Option<String>,
    hosts: Vec<HostAndPort>,
}

impl ConnectionString {
    pub fn parse(s: &str) -> Result<Self> {
        let (set_name, rest) = match s.split_once('/') {
            Some((set, rest)) if !set.is_empty() => (Some(set.to_string()), rest),
            Some(_) => {
                return Err(ShardgateError::BadValue(format!(
                    "empty replica set name in '{s}'"
                )))
            }
            None => (None, s),
        };
        let hosts = rest
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(|h| HostAndPort::parse(h.trim()))
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(ShardgateError::BadValue(format!(
                "connection string '{s}' names no hosts"
            )));
        }
        Ok(Self { set_name, hosts })
    }

    pub fn standalone(host: HostAndPort) -> Self {
        Self {
            set_name: None,
            hosts: vec![host],
        }
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn hosts(&self) -> &[HostAndPort] {
        &self.hosts
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(set) = &self.set_name {
            write!(f, "{set}/")?;
        }
        for (i, h) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{h}")?;
        }
        Ok(())
    }
}

/// Immutable shard record plus its host targeter.
#[derive(Debug)]
pub struct Shard {
    entry: ShardEntry,
    targeter: Arc<HostTargeter>,
}

impl Shard {
    fn new(entry: ShardEntry, cooldown: Duration) -> Self {
        let targeter = Arc::new(HostTargeter::new(entry.connection_string.clone(), cooldown));
        Self { entry, targeter }
    }

    pub fn id(&self) -> &ShardId {
        &self.entry.id
    }

    pub fn entry(&self) -> &ShardEntry {
        &self.entry
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.entry.connection_string
    }

    pub fn is_draining(&self) -> bool {
        self.entry.draining
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.entry.max_size_bytes
    }

    pub fn targeter(&self) -> &Arc<HostTargeter> {
        &self.targeter
    }
}

#[derive(Debug, Default)]
struct RegistryData {
    by_id: HashMap<ShardId, Arc<Shard>>,
    by_host: HashMap<HostAndPort, ShardId>,
    by_set_name: HashMap<String, ShardId>,
}

impl RegistryData {
    fn insert(&mut self, shard: Arc<Shard>) {
        let id = shard.id().clone();
        for host in shard.connection_string().hosts() {
            self.by_host.insert(host.clone(), id.clone());
        }
        if let Some(set) = shard.connection_string().set_name() {
            self.by_set_name.insert(set.to_string(), id.clone());
        }
        self.by_id.insert(id, shard);
    }

    fn with(&self, shard: Arc<Shard>) -> Self {
        let mut next = RegistryData::default();
        for s in self.by_id.values() {
            next.insert(s.clone());
        }
        next.insert(shard);
        next
    }

    fn without(&self, id: &ShardId) -> Self {
        let mut next = RegistryData::default();
        for s in self.by_id.values().filter(|s| s.id() != id) {
            next.insert(s.clone());
        }
        next
    }
}

/// Known shards, swapped atomically as a whole on every change.
pub struct ShardRegistry {
    data: RwLock<Arc<RegistryData>>,
    config: Arc<Shard>,
    cooldown: Duration,
}

impl ShardRegistry {
    pub fn new(config_conn: ConnectionString, cooldown: Duration) -> Self {
        let config = Arc::new(Shard::new(
            ShardEntry {
                id: ShardId::config(),
                connection_string: config_conn,
                max_size_bytes: 0,
                draining: false,
            },
            cooldown,
        ));
        Self {
            data: RwLock::new(Arc::new(RegistryData::default())),
            config,
            cooldown,
        }
    }

    fn snapshot(&self) -> Arc<RegistryData> {
        self.data.read().clone()
    }

    pub fn config_shard(&self) -> Arc<Shard> {
        self.config.clone()
    }

    pub fn get_shard(&self, id: &ShardId) -> Result<Arc<Shard>> {
        if id.is_config() {
            return Ok(self.config.clone());
        }
        self.snapshot()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ShardgateError::ShardNotFound(id.to_string()))
    }

    pub fn lookup_by_host(&self, host: &HostAndPort) -> Option<ShardId> {
        if self.config.connection_string().hosts().contains(host) {
            return Some(ShardId::config());
        }
        self.snapshot().by_host.get(host).cloned()
    }

    pub fn lookup_by_set_name(&self, set: &str) -> Option<ShardId> {
        self.snapshot().by_set_name.get(set).cloned()
    }

    /// Data-bearing shards, ordered by id. Excludes the config shard.
    pub fn all_shards(&self) -> Vec<Arc<Shard>> {
        let mut shards: Vec<_> = self.snapshot().by_id.values().cloned().collect();
        shards.sort_by(|a, b| a.id().cmp(b.id()));
        shards
    }

    pub fn all_shard_ids(&self) -> Vec<ShardId> {
        self.all_shards().iter().map(|s| s.id().clone()).collect()
    }

    pub fn add_shard(&self, entry: ShardEntry) -> Result<()> {
        if entry.id.is_config() {
            return Err(ShardgateError::IllegalOperation(
                "the config shard is built in".to_string(),
            ));
        }
        let mut guard = self.data.write();
        if guard.by_id.contains_key(&entry.id) {
            return Err(ShardgateError::IllegalOperation(format!(
                "shard {} already exists",
                entry.id
            )));
        }
        if let Some(host) = entry
            .connection_string
            .hosts()
            .iter()
            .find(|h| guard.by_host.contains_key(*h))
        {
            return Err(ShardgateError::IllegalOperation(format!(
                "host {host} already belongs to another shard"
            )));
        }
        info!(shard = %entry.id, conn = %entry.connection_string, "shard added");
        let shard = Arc::new(Shard::new(entry, self.cooldown));
        *guard = Arc::new(guard.with(shard));
        Ok(())
    }

    /// Replace a shard record, keeping its targeter when the hosts did not change.
    pub fn update_shard(&self, entry: ShardEntry) -> Result<()> {
        let mut guard = self.data.write();
        let current = guard
            .by_id
            .get(&entry.id)
            .cloned()
            .ok_or_else(|| ShardgateError::ShardNotFound(entry.id.to_string()))?;
        let shard = self.carry_over(entry, Some(&current));
        *guard = Arc::new(guard.without(current.id()).with(shard));
        Ok(())
    }

    pub fn remove_shard(&self, id: &ShardId) -> Result<()> {
        if id.is_config() {
            return Err(ShardgateError::IllegalOperation(
                "the config shard cannot be removed".to_string(),
            ));
        }
        let mut guard = self.data.write();
        if !guard.by_id.contains_key(id) {
            return Err(ShardgateError::ShardNotFound(id.to_string()));
        }
        info!(shard = %id, "shard removed");
        *guard = Arc::new(guard.without(id));
        Ok(())
    }

    fn carry_over(&self, entry: ShardEntry, previous: Option<&Arc<Shard>>) -> Arc<Shard> {
        match previous {
            Some(prev) if prev.connection_string() == &entry.connection_string => Arc::new(Shard {
                entry,
                targeter: prev.targeter.clone(),
            }),
            _ => Arc::new(Shard::new(entry, self.cooldown)),
        }
    }

    /// Refetch every shard from the catalog and swap the whole set.
    pub async fn reload(&self, catalog: &dyn CatalogClient) -> Result<()> {
        let entries = catalog.list_shards().await?;
        let current = self.snapshot();
        let mut next = RegistryData::default();
        for entry in entries {
            if entry.id.is_config() {
                continue;
            }
            let prev = current.by_id.get(&entry.id);
            next.insert(self.carry_over(entry, prev));
        }
        debug!(shards = next.by_id.len(), "shard registry reloaded");
        *self.data.write() = Arc::new(next);
        Ok(())
    }

    /// Probe every host with `hello` on an interval, feeding the targeters.
    pub fn spawn_host_monitor(
        self: &Arc<Self>,
        transport: Arc<dyn ShardTransport>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                registry.probe_all(transport.as_ref()).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    pub async fn probe_all(&self, transport: &dyn ShardTransport) {
        let probes = self.all_shards().into_iter().flat_map(|shard| {
            shard
                .connection_string()
                .hosts()
                .to_vec()
                .into_iter()
                .map(move |host| (shard.clone(), host))
        });
        let admin = Namespace::new("admin", "$cmd");
        let futures = probes.map(|(shard, host)| {
            let req = ShardRequest::new(admin.clone(), ShardCommand::Hello);
            async move {
                let observation = match transport.send(&host, req).await {
                    Ok(ShardResponse::Hello { is_primary: true, .. }) => HostObservation::Primary,
                    Ok(ShardResponse::Hello { .. }) => HostObservation::Secondary,
                    Ok(_) => HostObservation::Reachable,
                    Err(e) if e.is_not_master() => HostObservation::NotMaster,
                    Err(_) => HostObservation::NetworkError,
                };
                shard.targeter().on_response(&host, observation);
            }
        });
        futures::future::join_all(futures).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, conn: &str) -> ShardEntry {
        ShardEntry {
            id: id.into(),
            connection_string: ConnectionString::parse(conn).unwrap(),
            max_size_bytes: 0,
            draining: false,
        }
    }

    #[test]
    fn parses_connection_strings() {
        let rs = ConnectionString::parse("rs0/a:1,b:2").unwrap();
        assert_eq!(rs.set_name(), Some("rs0"));
        assert_eq!(rs.hosts().len(), 2);
        assert_eq!(rs.to_string(), "rs0/a:1,b:2");
        let single = ConnectionString::parse("db.local:27018").unwrap();
        assert_eq!(single.hosts()[0], HostAndPort::new("db.local", 27018));
        assert!(ConnectionString::parse("/a:1").is_err());
        assert!(ConnectionString::parse("a").is_err());
    }

    #[test]
    fn maps_ids_hosts_and_set_names() {
        let reg = ShardRegistry::new(ConnectionString::parse("cfg:1").unwrap(), Duration::from_secs(1));
        reg.add_shard(entry("s1", "rs1/a:1,b:1")).unwrap();
        reg.add_shard(entry("s2", "c:1")).unwrap();
        assert_eq!(reg.lookup_by_host(&HostAndPort::new("b", 1)), Some("s1".into()));
        assert_eq!(reg.lookup_by_set_name("rs1"), Some("s1".into()));
        assert_eq!(reg.lookup_by_host(&HostAndPort::new("cfg", 1)), Some(ShardId::config()));
        assert_eq!(reg.all_shard_ids(), vec![ShardId::new("s1"), ShardId::new("s2")]);

        assert!(reg.add_shard(entry("s3", "c:1")).is_err());
        assert!(reg.remove_shard(&ShardId::config()).is_err());
        assert!(reg.get_shard(&ShardId::config()).is_ok());

        let held = reg.get_shard(&"s2".into()).unwrap();
        reg.remove_shard(&"s2".into()).unwrap();
        assert!(matches!(
            reg.get_shard(held.id()),
            Err(ShardgateError::ShardNotFound(_))
        ));
        assert_eq!(reg.lookup_by_host(&HostAndPort::new("c", 1)), None);
    }

    #[test]
    fn update_keeps_targeter_for_same_hosts() {
        let reg = ShardRegistry::new(ConnectionString::parse("cfg:1").unwrap(), Duration::from_secs(1));
        reg.add_shard(entry("s1", "a:1")).unwrap();
        let before = reg.get_shard(&"s1".into()).unwrap();
        let mut draining = entry("s1", "a:1");
        draining.draining = true;
        reg.update_shard(draining).unwrap();
        let after = reg.get_shard(&"s1".into()).unwrap();
        assert!(after.is_draining());
        assert!(!before.is_draining());
        assert!(Arc::ptr_eq(before.targeter(), after.targeter()));
    }
}
