//! TCP front end for the payee
//!
//! Every live session registers its [`CloseHandle`] in [`Sessions`] under
//! the peer address, so the payee can settle any connected channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bitcoin::PublicKey;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

use super::{CloseHandle, HandlerFactory, ServerConnection, ServerContext, ServerStateMachine};
use crate::config::ServerConfig;
use crate::errors::{ProtocolError, Result};

/// Close handles of the sessions a listener is running
#[derive(Clone, Default)]
pub struct Sessions(Arc<Mutex<HashMap<SocketAddr, CloseHandle>>>);

impl Sessions {
    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, CloseHandle>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, peer: SocketAddr, handle: CloseHandle) { self.handles().insert(peer, handle); }

    fn remove(&self, peer: &SocketAddr) { self.handles().remove(peer); }

    /// Addresses of the connected payers
    pub fn peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<_> = self.handles().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Settles the channel of `peer`; false if it is not connected
    pub fn close(&self, peer: &SocketAddr) -> bool {
        match self.handles().get(peer) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Settles every connected channel, returning how many were asked to close
    pub fn close_all(&self) -> usize {
        let handles = self.handles();
        for handle in handles.values() {
            handle.close();
        }
        handles.len()
    }
}

/// Accepts payers over TCP, one session task per connection
pub struct ServerListener {
    listener: TcpListener,
    config: ServerConfig,
    context: ServerContext,
    payee_key: PublicKey,
    factory: Arc<dyn HandlerFactory>,
    sessions: Sessions,
}

impl ServerListener {
    /// Binds to `addr`
    ///
    /// Each accepted connection gets its own handler from `factory`.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
        context: ServerContext,
        payee_key: PublicKey,
        factory: Arc<dyn HandlerFactory>,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).await.map_err(|e| ProtocolError::Transport(e.to_string()))?;
        Ok(Self { listener, config, context, payee_key, factory, sessions: Sessions::default() })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(|e| ProtocolError::Transport(e.to_string()))?)
    }

    /// Sessions started by this listener; stays valid after `run` consumes it
    pub fn sessions(&self) -> Sessions { self.sessions.clone() }

    /// Accepts connections forever
    pub async fn run(self) {
        info!(network = %self.config.network, "payment channel server listening");
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            debug!(%peer, "accepted connection");

            let handler = self.factory.create(&peer.to_string());
            let machine = ServerStateMachine::new(
                self.config.clone(),
                self.context.clone(),
                self.payee_key,
                handler,
            );
            let connection = ServerConnection::new(stream, machine);
            self.sessions.insert(peer, connection.close_handle());
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                match connection.run().await {
                    Ok(lifecycle) => debug!(%peer, %lifecycle, "session finished"),
                    Err(e) => warn!(%peer, error = %e, "session failed"),
                }
                sessions.remove(&peer);
            });
        }
    }
}
