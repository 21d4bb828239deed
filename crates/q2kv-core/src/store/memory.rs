//! In-memory sorted key/value store.
//!
//! Tables are sorted maps keyed by (row, family, qualifier, visibility).
//! Each mutation is applied atomically after passing the table's
//! constraints. Instances are registered by name so that a sink configured
//! with an instance name can locate them.

use super::{BufferedMutationWriter, MutationWriter, StoreConnector, TabletServer};
use crate::config::{StoreConfig, WriterConfig};
use crate::error::{ConnectionError, RejectedMutation};
use crate::mutation::{ColumnVisibility, Mutation};
use crate::visibility::Authorizations;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Sort key of a stored cell.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    /// Row key
    pub row: Bytes,
    /// Column family
    pub family: Bytes,
    /// Column qualifier
    pub qualifier: Bytes,
    /// Visibility expression bytes
    pub visibility: Bytes,
}

/// A stored cell value.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Value bytes
    pub value: Bytes,
    /// Parsed visibility
    pub visibility: ColumnVisibility,
    /// Write time
    pub timestamp: DateTime<Utc>,
}

/// A per-table check run before each mutation is applied.
pub trait Constraint: Send + Sync {
    /// Return a rejection reason, or `None` to accept.
    fn check(&self, mutation: &Mutation) -> Option<String>;
}

impl<F> Constraint for F
where
    F: Fn(&Mutation) -> Option<String> + Send + Sync,
{
    fn check(&self, mutation: &Mutation) -> Option<String> {
        self(mutation)
    }
}

#[derive(Default)]
struct Table {
    cells: RwLock<BTreeMap<CellKey, Cell>>,
    constraints: RwLock<Vec<Arc<dyn Constraint>>>,
}

fn instances() -> &'static DashMap<String, Arc<MemoryStore>> {
    static INSTANCES: OnceLock<DashMap<String, Arc<MemoryStore>>> = OnceLock::new();
    INSTANCES.get_or_init(DashMap::new)
}

/// An in-memory store instance.
pub struct MemoryStore {
    instance: String,
    tables: DashMap<String, Arc<Table>>,
    users: DashMap<String, String>,
}

impl MemoryStore {
    /// Create an unregistered instance with a `root` user and empty password.
    pub fn new(instance: impl Into<String>) -> Self {
        let users = DashMap::new();
        users.insert("root".to_string(), String::new());
        Self {
            instance: instance.into(),
            tables: DashMap::new(),
            users,
        }
    }

    /// Get the registered instance with this name, creating it if needed.
    pub fn register(instance: &str) -> Arc<Self> {
        instances()
            .entry(instance.to_string())
            .or_insert_with(|| {
                info!(instance = %instance, "Registered in-memory store instance");
                Arc::new(Self::new(instance))
            })
            .clone()
    }

    /// Remove a registered instance.
    pub fn unregister(instance: &str) -> Option<Arc<Self>> {
        instances().remove(instance).map(|(_, store)| store)
    }

    /// Find the registered instance named in the store configuration.
    pub fn locate(config: &StoreConfig) -> Result<Arc<Self>> {
        let instance = config.instance.as_deref().unwrap_or_default();
        instances()
            .get(instance)
            .map(|store| Arc::clone(store.value()))
            .ok_or_else(|| {
                ConnectionError::InstanceNotFound {
                    instance: instance.to_string(),
                    servers: config.zk_servers.join(","),
                }
                .into()
            })
    }

    /// Locate the configured instance and authenticate.
    pub fn connect(config: &StoreConfig) -> Result<MemoryConnector> {
        let store = Self::locate(config)?;
        store.connector(
            config.user.as_deref().unwrap_or_default(),
            config.password.as_deref().unwrap_or_default(),
        )
    }

    /// Instance name.
    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    /// Add or replace a user.
    pub fn create_user(&self, user: impl Into<String>, password: impl Into<String>) {
        self.users.insert(user.into(), password.into());
    }

    /// Authenticate and return a connector.
    pub fn connector(self: &Arc<Self>, user: &str, password: &str) -> Result<MemoryConnector> {
        let authenticated = self
            .users
            .get(user)
            .is_some_and(|stored| stored.value() == password);
        if !authenticated {
            return Err(ConnectionError::AuthenticationFailed {
                user: user.to_string(),
            }
            .into());
        }

        Ok(MemoryConnector {
            store: Arc::clone(self),
            user: user.to_string(),
        })
    }

    /// Create an empty table.
    pub fn create_table(&self, table: &str) -> Result<()> {
        match self.tables.entry(table.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ConnectionError::TableExists(table.to_string()).into())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Table::default()));
                debug!(instance = %self.instance, table = %table, "Created table");
                Ok(())
            }
        }
    }

    /// Delete a table and its cells.
    pub fn delete_table(&self, table: &str) -> Result<()> {
        self.tables
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| ConnectionError::TableNotFound(table.to_string()).into())
    }

    /// Whether a table exists.
    pub fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Add a constraint checked before every mutation to the table.
    pub fn add_constraint(&self, table: &str, constraint: Arc<dyn Constraint>) -> Result<()> {
        self.table(table)?.constraints.write().push(constraint);
        Ok(())
    }

    /// All cells of a table visible with the given authorizations, in key
    /// order.
    pub fn scan(&self, table: &str, auths: &Authorizations) -> Result<Vec<(CellKey, Cell)>> {
        let table = self.table(table)?;
        let cells = table.cells.read();
        Ok(cells
            .iter()
            .filter(|(_, cell)| cell.visibility.evaluate(auths))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect())
    }

    /// Number of cells in a table, regardless of visibility.
    pub fn cell_count(&self, table: &str) -> Result<usize> {
        Ok(self.table(table)?.cells.read().len())
    }

    fn table(&self, table: &str) -> Result<Arc<Table>> {
        self.tables
            .get(table)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| ConnectionError::TableNotFound(table.to_string()).into())
    }
}

#[async_trait]
impl TabletServer for MemoryStore {
    async fn apply(&self, table: &str, mutations: Vec<Mutation>) -> Result<Vec<RejectedMutation>> {
        let target = self.table(table)?;
        let constraints = target.constraints.read().clone();
        let mut rejected = Vec::new();

        for mutation in mutations {
            if let Some(reason) = constraints.iter().find_map(|c| c.check(&mutation)) {
                rejected.push(RejectedMutation {
                    row: mutation.row().clone(),
                    reason,
                });
                continue;
            }

            let timestamp = Utc::now();
            let mut cells = target.cells.write();
            for update in mutation.updates() {
                let key = CellKey {
                    row: mutation.row().clone(),
                    family: update.family().clone(),
                    qualifier: update.qualifier().clone(),
                    visibility: update.visibility().expression().clone(),
                };
                cells.insert(
                    key,
                    Cell {
                        value: update.value().clone(),
                        visibility: update.visibility().clone(),
                        timestamp,
                    },
                );
            }
        }

        Ok(rejected)
    }
}

/// An authenticated connection to a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    user: String,
}

impl MemoryConnector {
    /// Authenticated user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The connected store.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.store.table_exists(table))
    }

    async fn create_writer(
        &self,
        table: &str,
        config: &WriterConfig,
    ) -> Result<Box<dyn MutationWriter>> {
        if !self.store.table_exists(table) {
            return Err(ConnectionError::TableNotFound(table.to_string()).into());
        }
        let server: Arc<dyn TabletServer> = Arc::clone(&self.store) as Arc<dyn TabletServer>;
        Ok(Box::new(BufferedMutationWriter::new(table, server, config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn mutation(row: &str, vis: &str, value: &str) -> Mutation {
        let vis = ColumnVisibility::parse(vis.as_bytes().to_vec()).unwrap();
        let mut m = Mutation::new(row.to_string());
        m.put("cf", "cq", &vis, value.to_string());
        m
    }

    #[test]
    fn test_table_lifecycle() {
        let store = MemoryStore::new("test");
        store.create_table("events").unwrap();
        assert!(store.table_exists("events"));
        assert!(matches!(
            store.create_table("events"),
            Err(Error::Connection(ConnectionError::TableExists(_)))
        ));

        store.create_table("audit").unwrap();
        assert_eq!(store.table_names(), vec!["audit", "events"]);

        store.delete_table("events").unwrap();
        assert!(!store.table_exists("events"));
        assert!(store.delete_table("events").is_err());
    }

    #[test]
    fn test_authentication() {
        let store = Arc::new(MemoryStore::new("test"));
        store.create_user("flume", "secret");

        assert!(store.connector("root", "").is_ok());
        assert_eq!(store.connector("flume", "secret").unwrap().user(), "flume");
        assert!(matches!(
            store.connector("flume", "wrong"),
            Err(Error::Connection(ConnectionError::AuthenticationFailed { .. }))
        ));
        assert!(store.connector("nobody", "").is_err());
    }

    #[tokio::test]
    async fn test_apply_and_scan_with_visibility() {
        let store = MemoryStore::new("test");
        store.create_table("events").unwrap();

        let rejected = store
            .apply(
                "events",
                vec![
                    mutation("r1", "", "open"),
                    mutation("r2", "public", "pub"),
                    mutation("r3", "secret&admin", "hidden"),
                ],
            )
            .await
            .unwrap();
        assert!(rejected.is_empty());
        assert_eq!(store.cell_count("events").unwrap(), 3);

        let visible = store.scan("events", &Authorizations::empty()).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0.row.as_ref(), b"r1");

        let visible = store
            .scan("events", &Authorizations::new(["public", "secret", "admin"]))
            .unwrap();
        let rows: Vec<_> = visible.iter().map(|(k, _)| k.row.clone()).collect();
        assert_eq!(rows, vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_constraint_rejects_whole_mutation() {
        let store = MemoryStore::new("test");
        store.create_table("events").unwrap();
        store
            .add_constraint(
                "events",
                Arc::new(|m: &Mutation| {
                    m.updates()
                        .iter()
                        .any(|u| u.value().len() > 4)
                        .then(|| "value too large".to_string())
                }),
            )
            .unwrap();

        let mut big = mutation("r1", "", "ok");
        big.put("cf", "cq2", &ColumnVisibility::empty(), "too long");

        let rejected = store
            .apply("events", vec![big, mutation("r2", "", "ok")])
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].row.as_ref(), b"r1");
        assert_eq!(rejected[0].reason, "value too large");

        let rows: Vec<_> = store
            .scan("events", &Authorizations::empty())
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.row)
            .collect();
        assert_eq!(rows, vec!["r2"]);
    }

    #[tokio::test]
    async fn test_apply_missing_table() {
        let store = MemoryStore::new("test");
        assert!(store.apply("missing", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_connector_requires_table() {
        let store = Arc::new(MemoryStore::new("test"));
        let connector = store.connector("root", "").unwrap();

        assert!(!connector.table_exists("events").await.unwrap());
        assert!(matches!(
            connector
                .create_writer("events", &WriterConfig::default())
                .await,
            Err(Error::Connection(ConnectionError::TableNotFound(_)))
        ));

        store.create_table("events").unwrap();
        let writer = connector
            .create_writer("events", &WriterConfig::default())
            .await
            .unwrap();
        writer.submit(vec![mutation("r1", "", "v")]).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.cell_count("events").unwrap(), 1);
    }

    #[test]
    fn test_registry_locate() {
        let registered = MemoryStore::register("store-registry-test");
        registered.create_user("flume", "pw");

        let config = StoreConfig {
            instance: Some("store-registry-test".into()),
            zk_servers: vec!["zk1:2181".into()],
            user: Some("flume".into()),
            password: Some("pw".into()),
        };
        let located = MemoryStore::locate(&config).unwrap();
        assert!(Arc::ptr_eq(&registered, &located));
        assert!(MemoryStore::connect(&config).is_ok());

        MemoryStore::unregister("store-registry-test");
        assert!(matches!(
            MemoryStore::locate(&config),
            Err(Error::Connection(ConnectionError::InstanceNotFound { .. }))
        ));
    }
}
