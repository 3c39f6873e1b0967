//! A single room actor and the handles used to talk to it.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use packsync_shared::{ChangeKind, ServerMessage, SessionId, TripId, PROTOCOL_VERSION};

use super::{room_name, NotifyAck, RoomError, RoomResult};

/// Commands processed by the room actor, strictly in arrival order
enum RoomCommand {
    Connect {
        reply: oneshot::Sender<SessionHandle>,
    },
    Disconnect {
        session_id: SessionId,
    },
    Notify {
        kind: ChangeKind,
        reply: oneshot::Sender<NotifyAck>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    /// Stop the actor if it has no sessions; replies whether it stopped
    StopIfIdle {
        reply: oneshot::Sender<bool>,
    },
}

/// Everything a connection handler needs after joining a room
pub struct SessionHandle {
    pub session_id: SessionId,
    pub trip_id: TripId,
    /// Outbound messages for this session, starting with `Welcome`
    pub outbound: mpsc::UnboundedReceiver<ServerMessage>,
    /// Sender into the same outbound queue, for direct replies such as `Pong`
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

struct Session {
    tx: mpsc::UnboundedSender<ServerMessage>,
    opened_at: Instant,
}

/// The state owned by a room actor task
struct Room {
    trip_id: TripId,
    sessions: HashMap<SessionId, Session>,
}

impl Room {
    fn connect(&mut self) -> SessionHandle {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, outbound) = mpsc::unbounded_channel();

        // Queued before the session becomes visible to notify, so it is always first
        let _ = tx.send(ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
            trip_id: self.trip_id.clone(),
            server_time: chrono::Utc::now().timestamp(),
        });

        self.sessions.insert(
            session_id.clone(),
            Session {
                tx: tx.clone(),
                opened_at: Instant::now(),
            },
        );

        info!(
            "Session {} opened in {} ({} sessions)",
            session_id,
            room_name(&self.trip_id),
            self.sessions.len()
        );

        SessionHandle {
            session_id,
            trip_id: self.trip_id.clone(),
            outbound,
            sender: tx,
        }
    }

    fn disconnect(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            info!(
                "Session {} closed in {} after {}s ({} sessions)",
                session_id,
                room_name(&self.trip_id),
                session.opened_at.elapsed().as_secs(),
                self.sessions.len()
            );
        }
    }

    fn notify(&self, kind: ChangeKind) -> NotifyAck {
        let msg = ServerMessage::Changed {
            trip_id: self.trip_id.clone(),
            kind,
            server_time: chrono::Utc::now().timestamp(),
        };

        let mut ack = NotifyAck::default();
        for (session_id, session) in &self.sessions {
            match session.tx.send(msg.clone()) {
                Ok(()) => ack.delivered += 1,
                Err(_) => {
                    // The transport close event removes the session, not this
                    debug!("Dropping notification for dead session {}", session_id);
                    ack.failed += 1;
                }
            }
        }

        debug!(
            "Broadcast {:?} in {}: {} delivered, {} failed",
            kind,
            room_name(&self.trip_id),
            ack.delivered,
            ack.failed
        );
        ack
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                RoomCommand::Connect { reply } => {
                    let handle = self.connect();
                    if let Err(handle) = reply.send(handle) {
                        // Caller went away before the reply; undo the registration
                        self.disconnect(&handle.session_id);
                    }
                }
                RoomCommand::Disconnect { session_id } => self.disconnect(&session_id),
                RoomCommand::Notify { kind, reply } => {
                    let _ = reply.send(self.notify(kind));
                }
                RoomCommand::SessionCount { reply } => {
                    let _ = reply.send(self.sessions.len());
                }
                RoomCommand::StopIfIdle { reply } => {
                    let idle = self.sessions.is_empty();
                    let _ = reply.send(idle);
                    if idle {
                        break;
                    }
                }
            }
        }
        debug!("Room {} stopped", room_name(&self.trip_id));
    }
}

/// Cheap, cloneable address of a running room actor
#[derive(Clone)]
pub struct RoomHandle {
    name: String,
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Spawn a new room actor for a trip
    pub fn spawn(trip_id: &str) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let room = Room {
            trip_id: trip_id.to_string(),
            sessions: HashMap::new(),
        };
        tokio::spawn(room.run(rx));

        debug!("Room {} started", room_name(trip_id));
        Self {
            name: room_name(trip_id),
            commands,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the actor behind this handle has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Whether both handles address the same actor
    pub fn same_actor(&self, other: &RoomHandle) -> bool {
        self.commands.same_channel(&other.commands)
    }

    /// Register a new session with a fresh id
    pub async fn connect(&self) -> RoomResult<SessionHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Connect { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Remove a session; unknown or already removed ids are ignored
    pub fn disconnect(&self, session_id: &str) {
        // A stopped room has no sessions left to remove
        let _ = self.send(RoomCommand::Disconnect {
            session_id: session_id.to_string(),
        });
    }

    /// Push a change notification to every session in the room
    pub async fn notify(&self, kind: ChangeKind) -> RoomResult<NotifyAck> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Notify { kind, reply })?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn session_count(&self) -> RoomResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::SessionCount { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Ask the actor to stop if it is empty; returns whether it stopped
    pub async fn stop_if_idle(&self) -> RoomResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::StopIfIdle { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    fn send(&self, command: RoomCommand) -> RoomResult<()> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> RoomError {
        RoomError::Closed(self.name.clone())
    }
}
