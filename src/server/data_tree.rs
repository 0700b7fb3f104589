//! In-memory hierarchical namespace with one-shot watches.
//!
//! Every mutating operation returns the notifications it fired as
//! `(connection_id, WatchedEvent)` pairs; the caller delivers them while it
//! still holds the tree lock so events for a path leave in generation order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::proto::CreateMode;
use crate::proto::ErrorCode;
use crate::proto::EventType;
use crate::proto::Stat;
use crate::proto::WatchedEvent;
use crate::NodePath;

pub(crate) type Notifications = Vec<(u64, WatchedEvent)>;

#[derive(Debug, Clone)]
struct Node {
    data: Option<Vec<u8>>,
    stat: Stat,
}

#[derive(Debug)]
pub(crate) struct DataTree {
    nodes: BTreeMap<String, Node>,
    /// Armed by `get_data`: fire on change and delete
    data_watches: HashMap<String, HashSet<u64>>,
    /// Armed by `exists`: fire on create, change and delete
    exist_watches: HashMap<String, HashSet<u64>>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    pub(crate) fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            NodePath::ROOT.to_string(),
            Node {
                data: None,
                stat: Stat {
                    version: 0,
                    ephemeral_owner: None,
                },
            },
        );
        Self {
            nodes,
            data_watches: HashMap::new(),
            exist_watches: HashMap::new(),
        }
    }

    pub(crate) fn create(
        &mut self,
        path: &NodePath,
        data: Option<Vec<u8>>,
        mode: CreateMode,
        session_id: u64,
    ) -> Result<Notifications, ErrorCode> {
        let parent = path.parent().ok_or(ErrorCode::NodeExists)?;
        match self.nodes.get(parent.as_str()) {
            None => return Err(ErrorCode::NoNode),
            // Ephemeral nodes cannot have children
            Some(node) if node.stat.ephemeral_owner.is_some() => return Err(ErrorCode::BadArguments),
            Some(_) => {}
        }
        if self.nodes.contains_key(path.as_str()) {
            return Err(ErrorCode::NodeExists);
        }

        let ephemeral_owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral => Some(session_id),
        };
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                stat: Stat {
                    version: 0,
                    ephemeral_owner,
                },
            },
        );

        Ok(self.trigger(path.as_str(), EventType::NodeCreated))
    }

    pub(crate) fn get_data(
        &mut self,
        path: &NodePath,
        watch_conn: Option<u64>,
    ) -> Result<(Option<Vec<u8>>, Stat), ErrorCode> {
        let node = self.nodes.get(path.as_str()).ok_or(ErrorCode::NoNode)?;
        let result = (node.data.clone(), node.stat);
        if let Some(conn_id) = watch_conn {
            self.data_watches.entry(path.to_string()).or_default().insert(conn_id);
        }
        Ok(result)
    }

    pub(crate) fn set_data(
        &mut self,
        path: &NodePath,
        data: Option<Vec<u8>>,
    ) -> Result<(Stat, Notifications), ErrorCode> {
        let node = self.nodes.get_mut(path.as_str()).ok_or(ErrorCode::NoNode)?;
        node.data = data;
        node.stat.version += 1;
        let stat = node.stat;

        Ok((stat, self.trigger(path.as_str(), EventType::NodeDataChanged)))
    }

    /// Reports existence and, when asked, arms a watch regardless of the
    /// outcome so the caller hears about a later create.
    pub(crate) fn exists(
        &mut self,
        path: &NodePath,
        watch_conn: Option<u64>,
    ) -> Option<Stat> {
        if let Some(conn_id) = watch_conn {
            self.exist_watches.entry(path.to_string()).or_default().insert(conn_id);
        }
        self.nodes.get(path.as_str()).map(|node| node.stat)
    }

    pub(crate) fn delete(
        &mut self,
        path: &NodePath,
    ) -> Result<Notifications, ErrorCode> {
        if path.is_root() {
            return Err(ErrorCode::BadArguments);
        }
        if !self.nodes.contains_key(path.as_str()) {
            return Err(ErrorCode::NoNode);
        }
        if self.has_children(path) {
            return Err(ErrorCode::NotEmpty);
        }
        self.nodes.remove(path.as_str());
        Ok(self.trigger(path.as_str(), EventType::NodeDeleted))
    }

    /// Removes every ephemeral node owned by `session_id`.
    pub(crate) fn delete_ephemerals(
        &mut self,
        session_id: u64,
    ) -> Notifications {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();

        let mut fired = Vec::new();
        for path in owned {
            self.nodes.remove(&path);
            fired.extend(self.trigger(&path, EventType::NodeDeleted));
        }
        fired
    }

    /// Drops all watches armed through a closed connection.
    pub(crate) fn remove_watches(
        &mut self,
        conn_id: u64,
    ) {
        for table in [&mut self.data_watches, &mut self.exist_watches] {
            table.retain(|_, conns| {
                conns.remove(&conn_id);
                !conns.is_empty()
            });
        }
    }

    pub(crate) fn watch_count(&self) -> usize {
        self.data_watches.values().map(HashSet::len).sum::<usize>()
            + self.exist_watches.values().map(HashSet::len).sum::<usize>()
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn has_children(
        &self,
        path: &NodePath,
    ) -> bool {
        let prefix = format!("{}/", path.as_str());
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key.starts_with(&prefix))
            .unwrap_or(false)
    }

    /// Consumes the one-shot watches `event_type` fires on `path`.
    fn trigger(
        &mut self,
        path: &str,
        event_type: EventType,
    ) -> Notifications {
        let mut conns = self.exist_watches.remove(path).unwrap_or_default();
        if event_type != EventType::NodeCreated {
            if let Some(data_conns) = self.data_watches.remove(path) {
                conns.extend(data_conns);
            }
        }

        let mut fired: Notifications = conns
            .into_iter()
            .map(|conn_id| {
                (
                    conn_id,
                    WatchedEvent {
                        event_type,
                        path: path.to_string(),
                    },
                )
            })
            .collect();
        fired.sort_by_key(|(conn_id, _)| *conn_id);
        fired
    }
}
