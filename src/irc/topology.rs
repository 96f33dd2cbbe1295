//! Topology model: the servers and users announced by the peer.
//!
//! Every server is reachable by hostname and by SID, every user by nick and
//! by UID. Both indices of a pair hold the same `Arc`, so a lookup through
//! either key always sees the same record. The model starts empty for each
//! link session and is rebuilt purely from what the peer bursts to us.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

/// A server in the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub hostname: String,
    pub sid: String,
    /// SID of the server that introduced this one, when known.
    pub uplink: Option<String>,
}

/// A user connected somewhere in the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub nick: String,
    pub uid: String,
    /// Whether the user is connected over TLS (user mode `z`).
    pub encrypted: bool,
    pub server: Arc<Server>,
}

/// Lookup failures. Recoverable: callers log and skip the event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("couldn't find a server called {0} (hostname or SID)")]
    ServerNotFound(String),
    #[error("couldn't find a user called {0} (nick or UID)")]
    UserNotFound(String),
}

/// Shared, lock-protected topology. The decode loop writes, the poller reads.
pub type SharedTopology = Arc<RwLock<Topology>>;

/// The four cross-indexed lookup tables.
#[derive(Debug, Default)]
pub struct Topology {
    servers_by_hostname: HashMap<String, Arc<Server>>,
    servers_by_sid: HashMap<String, Arc<Server>>,
    users_by_nick: HashMap<String, Arc<User>>,
    users_by_uid: HashMap<String, Arc<User>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh, empty model for sharing between tasks.
    pub fn shared() -> SharedTopology {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Register a server introduced directly by the peer.
    ///
    /// See [`Topology::add_server_behind`].
    pub fn add_server(&mut self, hostname: &str, sid: &str) -> Vec<Arc<Server>> {
        self.add_server_behind(hostname, sid, None)
    }

    /// Register a server, overwriting any previous record under either key.
    ///
    /// A second introduction of the same identity is a refresh, never a
    /// conflict. A previous record sharing only one key is evicted from the
    /// other index as well, and users attached to a replaced record follow
    /// the new one. Returns the distinct records replaced: empty for a new
    /// server, two when the hostname and the SID belonged to different ones.
    pub fn add_server_behind(
        &mut self,
        hostname: &str,
        sid: &str,
        uplink: Option<&str>,
    ) -> Vec<Arc<Server>> {
        let server = Arc::new(Server {
            hostname: hostname.to_owned(),
            sid: sid.to_owned(),
            uplink: uplink.map(str::to_owned),
        });

        let by_hostname = self.servers_by_hostname.remove(hostname);
        let by_sid = self.servers_by_sid.remove(sid);

        if let Some(old) = &by_hostname {
            if old.sid != sid {
                self.servers_by_sid.remove(&old.sid);
            }
        }
        if let Some(old) = &by_sid {
            if old.hostname != hostname {
                self.servers_by_hostname.remove(&old.hostname);
            }
        }

        self.servers_by_hostname
            .insert(hostname.to_owned(), Arc::clone(&server));
        self.servers_by_sid.insert(sid.to_owned(), Arc::clone(&server));

        let mut replaced: Vec<Arc<Server>> = by_hostname.into_iter().collect();
        if let Some(old) = by_sid {
            if !replaced.iter().any(|r| Arc::ptr_eq(r, &old)) {
                replaced.push(old);
            }
        }
        if !replaced.is_empty() {
            self.repoint_users(&replaced, &server);
        }

        replaced
    }

    fn repoint_users(&mut self, replaced: &[Arc<Server>], server: &Arc<Server>) {
        let stale: Vec<Arc<User>> = self
            .users_by_uid
            .values()
            .filter(|u| replaced.iter().any(|old| Arc::ptr_eq(&u.server, old)))
            .cloned()
            .collect();

        for user in stale {
            let updated = Arc::new(User {
                server: Arc::clone(server),
                ..(*user).clone()
            });
            self.users_by_nick
                .insert(updated.nick.clone(), Arc::clone(&updated));
            self.users_by_uid.insert(updated.uid.clone(), updated);
        }
    }

    /// Resolve a server by hostname or SID.
    pub fn get_server(&self, hostname_or_sid: &str) -> Result<Arc<Server>, TopologyError> {
        self.servers_by_hostname
            .get(hostname_or_sid)
            .or_else(|| self.servers_by_sid.get(hostname_or_sid))
            .cloned()
            .ok_or_else(|| TopologyError::ServerNotFound(hostname_or_sid.to_owned()))
    }

    /// Remove a server, every server behind it and all of their users.
    ///
    /// A no-op when the server is unknown. Returns the removed servers,
    /// the requested one first.
    pub fn remove_server(&mut self, hostname_or_sid: &str) -> Vec<Arc<Server>> {
        let Ok(root) = self.get_server(hostname_or_sid) else {
            return Vec::new();
        };

        // Walk the uplink tree breadth-first so the split is removed whole.
        let mut removed = vec![root];
        let mut gone: HashSet<String> = HashSet::from([removed[0].sid.clone()]);
        let mut idx = 0;
        while idx < removed.len() {
            let sid = removed[idx].sid.clone();
            let behind: Vec<Arc<Server>> = self
                .servers_by_sid
                .values()
                .filter(|s| s.uplink.as_deref() == Some(sid.as_str()) && !gone.contains(&s.sid))
                .cloned()
                .collect();
            for server in behind {
                gone.insert(server.sid.clone());
                removed.push(server);
            }
            idx += 1;
        }

        for server in &removed {
            self.servers_by_hostname.remove(&server.hostname);
            self.servers_by_sid.remove(&server.sid);
        }

        self.users_by_uid.retain(|_, u| !gone.contains(&u.server.sid));
        self.users_by_nick.retain(|_, u| !gone.contains(&u.server.sid));

        removed
    }

    /// Register a user on a known server.
    ///
    /// Fails without touching the model when the server was never introduced.
    pub fn add_user(
        &mut self,
        nick: &str,
        uid: &str,
        encrypted: bool,
        server_hostname_or_sid: &str,
    ) -> Result<Arc<User>, TopologyError> {
        let server = self.get_server(server_hostname_or_sid)?;

        let user = Arc::new(User {
            nick: nick.to_owned(),
            uid: uid.to_owned(),
            encrypted,
            server,
        });

        if let Some(old) = self.users_by_nick.remove(nick) {
            if old.uid != uid {
                self.users_by_uid.remove(&old.uid);
            }
        }
        if let Some(old) = self.users_by_uid.remove(uid) {
            if old.nick != nick {
                self.users_by_nick.remove(&old.nick);
            }
        }

        self.users_by_nick.insert(nick.to_owned(), Arc::clone(&user));
        self.users_by_uid.insert(uid.to_owned(), Arc::clone(&user));

        Ok(user)
    }

    /// Resolve a user by nick or UID.
    pub fn get_user(&self, nick_or_uid: &str) -> Result<Arc<User>, TopologyError> {
        self.users_by_nick
            .get(nick_or_uid)
            .or_else(|| self.users_by_uid.get(nick_or_uid))
            .cloned()
            .ok_or_else(|| TopologyError::UserNotFound(nick_or_uid.to_owned()))
    }

    /// Users connected to the server with this SID.
    pub fn users_on<'a>(&'a self, sid: &'a str) -> impl Iterator<Item = &'a Arc<User>> + 'a {
        self.users_by_uid.values().filter(move |u| u.server.sid == sid)
    }

    /// Remove a user under both of its keys, whichever one is given.
    pub fn remove_user(&mut self, nick_or_uid: &str) -> Option<Arc<User>> {
        let user = self.get_user(nick_or_uid).ok()?;
        self.users_by_nick.remove(&user.nick);
        self.users_by_uid.remove(&user.uid);
        Some(user)
    }

    /// Move a user to a new nick, keeping its UID.
    pub fn rename_user(
        &mut self,
        nick_or_uid: &str,
        new_nick: &str,
    ) -> Result<Arc<User>, TopologyError> {
        let user = self.get_user(nick_or_uid)?;
        self.users_by_nick.remove(&user.nick);

        // A nick can only belong to one present user; the newest claim wins.
        if let Some(holder) = self.users_by_nick.remove(new_nick) {
            self.users_by_uid.remove(&holder.uid);
        }

        let renamed = Arc::new(User {
            nick: new_nick.to_owned(),
            ..(*user).clone()
        });
        self.users_by_nick
            .insert(new_nick.to_owned(), Arc::clone(&renamed));
        self.users_by_uid
            .insert(renamed.uid.clone(), Arc::clone(&renamed));
        Ok(renamed)
    }

    /// Snapshot of every known server hostname.
    pub fn server_hostnames(&self) -> Vec<String> {
        self.servers_by_hostname.keys().cloned().collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers_by_hostname.len()
    }

    pub fn user_count(&self) -> usize {
        self.users_by_uid.len()
    }

    /// Forget everything, e.g. before relinking.
    pub fn clear(&mut self) {
        self.servers_by_hostname.clear();
        self.servers_by_sid.clear();
        self.users_by_nick.clear();
        self.users_by_uid.clear();
    }
}
