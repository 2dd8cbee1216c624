use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use mwlink_frame::{Direction, EnvelopeDecoder};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pending::PendingTable;
use crate::session::Session;
use crate::sync::lock;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const REGISTRATION_BACKLOG: usize = 64;

/// One-time notification that a previously unseen endpoint connected.
pub struct Registration {
    /// `remote_addr:remote_port` of the connecting bridge.
    pub key: String,
    /// The newly created session.
    pub session: Arc<Session>,
}

/// The session manager: accepts bridge connections and keeps one
/// long-lived [`Session`] per remote endpoint key.
///
/// The key → session directory is the only process-wide mutable
/// structure; its check-and-create is atomic under the directory mutex,
/// so concurrent connections from the same key register exactly once.
pub struct Server {
    listener: TcpListener,
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    registrations: SyncSender<Registration>,
}

impl Server {
    /// Bind the listening address. Returns the server and the channel on
    /// which registrations are delivered, exactly once per distinct key.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<(Self, Receiver<Registration>)> {
        let listener = mwlink_transport::bind(addr)?;
        let (tx, rx) = mpsc::sync_channel(REGISTRATION_BACKLOG);
        Ok((
            Self {
                listener,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                registrations: tx,
            },
            rx,
        ))
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Look up a session by endpoint key.
    pub fn session(&self, key: &str) -> Option<Arc<Session>> {
        lock(&self.sessions).get(key).cloned()
    }

    /// Whether a session exists for `key`.
    pub fn has_session(&self, key: &str) -> bool {
        lock(&self.sessions).contains_key(key)
    }

    /// Accept connections forever on the calling thread.
    ///
    /// Returns only if the listener itself fails. Accept errors on
    /// individual connections are logged and do not stop the loop.
    pub fn run(&self) {
        info!("session manager accepting connections");
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "bridge connected");
                    if let Err(err) = self.handle_connection(stream, peer.to_string()) {
                        warn!(%peer, error = %err, "connection setup failed");
                    }
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
    }

    /// Run the accept loop on its own thread, keeping the handle usable
    /// for directory lookups.
    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    fn handle_connection(&self, stream: TcpStream, key: String) -> Result<()> {
        let (session, created) = self.session_for(&key);
        if created {
            info!(key = %key, "session registered");
            let registration = Registration {
                key: key.clone(),
                session: Arc::clone(&session),
            };
            if self.registrations.try_send(registration).is_err() {
                warn!(key = %key, "registration dropped (receiver backlog)");
            }
        }

        let writer = stream.try_clone()?;
        let table = PendingTable::new(Box::new(writer));
        session.attach(table.clone());

        thread::spawn(move || {
            read_responses(stream, &table);
            table.close();
            if session.detach_if(&table) {
                info!(key = %session.key(), "transport detached");
            }
        });
        Ok(())
    }

    /// Atomic check-and-create on the session directory.
    fn session_for(&self, key: &str) -> (Arc<Session>, bool) {
        let mut sessions = lock(&self.sessions);
        match sessions.get(key) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let session = Session::new(key);
                sessions.insert(key.to_string(), Arc::clone(&session));
                (session, true)
            }
        }
    }
}

/// Drain response envelopes from the transport into the table until the
/// stream closes.
fn read_responses(mut stream: TcpStream, table: &PendingTable) {
    let mut decoder = EnvelopeDecoder::new(Direction::Response);
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.extend(&chunk[..n]);
                while let Some(frame) = decoder.decode() {
                    table.complete(frame.id, frame.payload);
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "transport read failed");
                break;
            }
        }
    }
}
