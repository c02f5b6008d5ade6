//! The `CloudState` bootstrap builder: register entities, pick an address,
//! start serving.
//!
//! The server always exposes the discovery service; the per-protocol
//! services are only added when at least one entity of that variant is
//! registered, so the proxy never sees a protocol this process cannot
//! actually serve.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::action::{Action, ActionService};
use crate::discovery::DiscoveryService;
use crate::entity::EventSourcedEntity;
use crate::error::StartError;
use crate::event_sourced::EventSourcedService;
use crate::function::{FunctionService, StatelessFunction};
use crate::proto::cloudstate::action::action_protocol_server::ActionProtocolServer;
use crate::proto::cloudstate::entity_discovery_server::EntityDiscoveryServer;
use crate::proto::cloudstate::eventsourced::event_sourced_server::EventSourcedServer;
use crate::proto::cloudstate::function::stateless_function_server::StatelessFunctionServer;
use crate::registry::EntityRegistry;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;

/// Entry point for a user function process.
///
/// Collects entity registrations, then assembles the immutable registry and
/// the tonic server in [`CloudState::start`].
///
/// ```no_run
/// # use cloudstate_support::{CloudState, EventSourcedEntity};
/// # async fn run(entity: EventSourcedEntity) -> Result<(), Box<dyn std::error::Error>> {
/// CloudState::new()
///     .register_event_sourced_entity(entity)
///     .port(8080)
///     .start()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct CloudState {
    event_sourced: Vec<EventSourcedEntity>,
    actions: Vec<Action>,
    functions: Vec<StatelessFunction>,
    host: Option<String>,
    port: Option<u16>,
}

impl CloudState {
    /// Create an empty server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event-sourced entity.
    pub fn register_event_sourced_entity(mut self, entity: EventSourcedEntity) -> Self {
        self.event_sourced.push(entity);
        self
    }

    /// Register an action entity.
    pub fn register_action_entity(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Register a stateless function.
    pub fn register_stateless_function(mut self, function: StatelessFunction) -> Self {
        self.functions.push(function);
        self
    }

    /// Set the listen host. Falls back to the `HOST` environment variable,
    /// then `127.0.0.1`.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the listen port. Falls back to the `PORT` environment variable,
    /// then `8080`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Bind the configured address and serve until the process is stopped.
    ///
    /// # Errors
    ///
    /// A [`StartError`] if a registration is invalid, the address does not
    /// resolve, or the transport fails.
    pub async fn start(self) -> Result<(), StartError> {
        let addr = self.listen_address()?;
        let registry = self.build_registry()?;
        tracing::info!(%addr, "starting user function server");
        build_router(registry).serve(addr).await?;
        Ok(())
    }

    /// Serve on an already-bound listener. Useful for tests and for
    /// embedding, where the caller owns the socket.
    ///
    /// # Errors
    ///
    /// A [`StartError`] if a registration is invalid or the transport fails.
    pub async fn serve_on(self, listener: TcpListener) -> Result<(), StartError> {
        let registry = self.build_registry()?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "starting user function server");
        }
        build_router(registry)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await?;
        Ok(())
    }

    fn build_registry(self) -> Result<Arc<EntityRegistry>, StartError> {
        Ok(Arc::new(EntityRegistry::build(
            self.event_sourced,
            self.actions,
            self.functions,
        )?))
    }

    fn listen_address(&self) -> Result<SocketAddr, StartError> {
        let host = match &self.host {
            Some(host) => host.clone(),
            None => std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        };
        let port = match self.port {
            Some(port) => port,
            None => match std::env::var("PORT") {
                Ok(value) => parse_port(value)?,
                Err(_) => DEFAULT_PORT,
            },
        };
        let value = format!("{host}:{port}");
        value
            .parse()
            .map_err(|source| StartError::InvalidAddress { value, source })
    }
}

fn parse_port(value: String) -> Result<u16, StartError> {
    value
        .parse()
        .map_err(|source| StartError::InvalidPort { value, source })
}

fn build_router(registry: Arc<EntityRegistry>) -> Router {
    let mut router = Server::builder().add_service(EntityDiscoveryServer::new(
        DiscoveryService::new(Arc::clone(&registry)),
    ));
    if registry.has_event_sourced() {
        router = router.add_service(EventSourcedServer::new(EventSourcedService::new(
            Arc::clone(&registry),
        )));
    }
    if registry.has_actions() {
        router = router.add_service(ActionProtocolServer::new(ActionService::new(Arc::clone(
            &registry,
        ))));
    }
    if registry.has_functions() {
        router = router.add_service(StatelessFunctionServer::new(FunctionService::new(
            Arc::clone(&registry),
        )));
    }
    router
}
