// Extension hooks dispatched by the server event loop.
//
// Lifecycle and command callbacks are grouped into typed sets keyed by
// capability rather than a single open-ended dispatch interface. Iteration
// over a capability's registrants is stable: callbacks run in registration
// order, and command handling is first-match-wins in that order.
//
// All hooks run on the event-loop thread with full mutable access to the
// server — they are the re-entrant path into session state, so they must not
// block. Register hooks before `Server::start`; registrations made from
// inside a callback are not retained.

use basalt_protocol::ClientIndex;

use crate::server::Server;

pub type ServerCallback = Box<dyn FnMut(&mut Server) + Send>;
pub type ClientCallback = Box<dyn FnMut(&mut Server, ClientIndex) + Send>;

/// Command handler: returns true if it consumed the command.
pub type CommandCallback = Box<dyn FnMut(&mut Server, ClientIndex, &str) -> bool + Send>;

#[derive(Default)]
pub struct ServerHooks {
    server_start: Vec<ServerCallback>,
    client_joined: Vec<ClientCallback>,
    game_started: Vec<ServerCallback>,
    tick: Vec<ServerCallback>,
    server_empty: Vec<ServerCallback>,
    shutdown: Vec<ServerCallback>,
    command: Vec<CommandCallback>,
}

impl ServerHooks {
    pub fn new() -> ServerHooks {
        ServerHooks::default()
    }

    pub fn on_server_start(&mut self, f: impl FnMut(&mut Server) + Send + 'static) -> &mut Self {
        self.server_start.push(Box::new(f));
        self
    }

    pub fn on_client_joined(
        &mut self,
        f: impl FnMut(&mut Server, ClientIndex) + Send + 'static,
    ) -> &mut Self {
        self.client_joined.push(Box::new(f));
        self
    }

    pub fn on_game_started(&mut self, f: impl FnMut(&mut Server) + Send + 'static) -> &mut Self {
        self.game_started.push(Box::new(f));
        self
    }

    /// Runs once per event-loop iteration, at most once per second when the
    /// queue is idle.
    pub fn on_tick(&mut self, f: impl FnMut(&mut Server) + Send + 'static) -> &mut Self {
        self.tick.push(Box::new(f));
        self
    }

    /// Runs when the last validated connection has left.
    pub fn on_server_empty(&mut self, f: impl FnMut(&mut Server) + Send + 'static) -> &mut Self {
        self.server_empty.push(Box::new(f));
        self
    }

    pub fn on_shutdown(&mut self, f: impl FnMut(&mut Server) + Send + 'static) -> &mut Self {
        self.shutdown.push(Box::new(f));
        self
    }

    /// Register a handler for client-issued `Command` orders. Handlers are
    /// consulted in registration order; the first to return true wins.
    pub fn on_command(
        &mut self,
        f: impl FnMut(&mut Server, ClientIndex, &str) -> bool + Send + 'static,
    ) -> &mut Self {
        self.command.push(Box::new(f));
        self
    }

    pub(crate) fn notify_server_start(&mut self, server: &mut Server) {
        for f in &mut self.server_start {
            f(server);
        }
    }

    pub(crate) fn notify_client_joined(&mut self, server: &mut Server, index: ClientIndex) {
        for f in &mut self.client_joined {
            f(server, index);
        }
    }

    pub(crate) fn notify_game_started(&mut self, server: &mut Server) {
        for f in &mut self.game_started {
            f(server);
        }
    }

    pub(crate) fn notify_tick(&mut self, server: &mut Server) {
        for f in &mut self.tick {
            f(server);
        }
    }

    pub(crate) fn notify_server_empty(&mut self, server: &mut Server) {
        for f in &mut self.server_empty {
            f(server);
        }
    }

    pub(crate) fn notify_shutdown(&mut self, server: &mut Server) {
        for f in &mut self.shutdown {
            f(server);
        }
    }

    pub(crate) fn dispatch_command(
        &mut self,
        server: &mut Server,
        client: ClientIndex,
        command: &str,
    ) -> bool {
        self.command.iter_mut().any(|f| f(server, client, command))
    }
}
