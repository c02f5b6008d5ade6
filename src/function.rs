//! The stateless-function protocol: a structural twin of the action
//! protocol with its own wire messages and proxy routing.
//!
//! All execution machinery lives in [`crate::action`]; this module supplies
//! the entity definition, its builder, and the tonic adapter mapping the
//! function wire messages onto the shared core.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use crate::action::{
    item_stream, run_stream, run_stream_in, run_stream_out, run_unary, CommandStream, ItemSink,
    OutItem, StatelessCommand, StatelessCore, StatelessCoreBuilder, StatelessReply, UnaryCall,
};
use crate::codec::{Payload, TypeRegistry};
use crate::context::ActionContext;
use crate::dispatch::ParamRole;
use crate::error::{HandlerError, ProtocolError, RegistrationError};
use crate::proto::cloudstate::client_action;
use crate::proto::cloudstate::function::stateless_function_server::StatelessFunction as StatelessFunctionProtocol;
use crate::proto::cloudstate::function::{function_reply, FunctionCommand, FunctionReply};
use crate::registry::EntityRegistry;

/// Fully qualified name of the stateless-function protocol service,
/// reported to the proxy during discovery.
pub const STATELESS_FUNCTION_ENTITY_TYPE: &str = "cloudstate.function.StatelessFunction";

/// A stateless function entity definition.
///
/// Assemble with [`StatelessFunction::builder`] and register on
/// [`CloudState`](crate::CloudState).
pub struct StatelessFunction {
    pub(crate) core: Arc<StatelessCore>,
}

impl StatelessFunction {
    /// Start building a function for the given fully qualified service name.
    pub fn builder(service_name: impl Into<String>) -> StatelessFunctionBuilder {
        StatelessFunctionBuilder {
            core: StatelessCoreBuilder::new(service_name.into()),
        }
    }

    /// The fully qualified service name this function serves.
    pub fn service_name(&self) -> &str {
        &self.core.service_name
    }

    pub(crate) fn types(&self) -> &TypeRegistry {
        &self.core.types
    }

    pub(crate) fn descriptor_set(&self) -> &[u8] {
        &self.core.descriptor_set
    }
}

/// Builder for [`StatelessFunction`]. Registration rules are identical to
/// [`crate::ActionBuilder`].
pub struct StatelessFunctionBuilder {
    core: StatelessCoreBuilder,
}

impl StatelessFunctionBuilder {
    /// Attach the serialized `google.protobuf.FileDescriptorSet` for this
    /// function's service proto, served to the proxy during discovery.
    pub fn descriptor_set(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.core.descriptor_set(bytes.into());
        self
    }

    /// Register a unary handler. `T` is the expected command payload type.
    ///
    /// # Errors
    ///
    /// * [`RegistrationError::DuplicateStatelessHandler`] if the name is taken.
    /// * [`RegistrationError::Signature`] if the role declaration is invalid.
    pub fn unary_handler<T, F>(
        mut self,
        name: impl Into<String>,
        roles: impl Into<Vec<ParamRole>>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut UnaryCall<'_>) -> Result<Option<Payload>, HandlerError> + Send + Sync + 'static,
    {
        self.core.unary::<T, F>(name.into(), roles.into(), f)?;
        Ok(self)
    }

    /// Register a client-streaming handler.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateStatelessHandler`] if the name is taken.
    pub fn stream_in_handler<T, F>(
        mut self,
        name: impl Into<String>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut CommandStream, &mut ActionContext) -> Result<Option<Payload>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.core.stream_in::<T, F>(name.into(), f)?;
        Ok(self)
    }

    /// Register a server-streaming handler.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateStatelessHandler`] if the name is taken.
    pub fn stream_out_handler<T, F>(
        mut self,
        name: impl Into<String>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&Payload, &ItemSink) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.core.stream_out::<T, F>(name.into(), f)?;
        Ok(self)
    }

    /// Register a bidirectional handler.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::DuplicateStatelessHandler`] if the name is taken.
    pub fn stream_handler<T, F>(
        mut self,
        name: impl Into<String>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut CommandStream, &ItemSink) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.core.stream::<T, F>(name.into(), f)?;
        Ok(self)
    }

    /// Finish the definition.
    pub fn build(self) -> StatelessFunction {
        StatelessFunction {
            core: self.core.build(),
        }
    }
}

impl StatelessReply for FunctionReply {
    fn from_item(item: OutItem) -> Self {
        let response = match item.action {
            client_action::Action::Failure(f) => function_reply::Response::Failure(f),
            client_action::Action::Reply(r) => function_reply::Response::Reply(r),
            client_action::Action::Forward(f) => function_reply::Response::Forward(f),
        };
        FunctionReply {
            response: Some(response),
            side_effects: item.side_effects,
        }
    }
}

impl StatelessCommand for FunctionCommand {
    fn take_payload(&mut self) -> Option<prost_types::Any> {
        self.payload.take()
    }
}

/// gRPC service routing function protocol calls to registered
/// [`StatelessFunction`]s.
pub(crate) struct FunctionService {
    registry: Arc<EntityRegistry>,
}

impl FunctionService {
    pub(crate) fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    fn lookup(&self, service_name: &str) -> Result<Arc<StatelessCore>, Status> {
        self.registry
            .function(service_name)
            .map(|function| Arc::clone(&function.core))
            .ok_or_else(|| ProtocolError::UnknownService(service_name.to_string()).into_status())
    }
}

#[tonic::async_trait]
impl StatelessFunctionProtocol for FunctionService {
    async fn handle_unary(
        &self,
        request: Request<FunctionCommand>,
    ) -> Result<Response<FunctionReply>, Status> {
        let command = request.into_inner();
        let core = self.lookup(&command.service_name)?;
        let item = run_unary(&self.registry, core, command.name, command.payload).await?;
        Ok(Response::new(FunctionReply::from_item(item)))
    }

    async fn handle_streamed_in(
        &self,
        request: Request<Streaming<FunctionCommand>>,
    ) -> Result<Response<FunctionReply>, Status> {
        let mut inbound = request.into_inner();
        let priming = inbound
            .message()
            .await?
            .ok_or_else(|| ProtocolError::EmptyMessage.into_status())?;
        let core = self.lookup(&priming.service_name)?;
        let item =
            run_stream_in(Arc::clone(&self.registry), core, priming.name, inbound).await?;
        Ok(Response::new(FunctionReply::from_item(item)))
    }

    type handleStreamedOutStream = Pin<Box<dyn Stream<Item = Result<FunctionReply, Status>> + Send>>;

    async fn handle_streamed_out(
        &self,
        request: Request<FunctionCommand>,
    ) -> Result<Response<Self::handleStreamedOutStream>, Status> {
        let command = request.into_inner();
        let core = self.lookup(&command.service_name)?;
        let rx = run_stream_out(&self.registry, core, command.name, command.payload).await?;
        Ok(Response::new(item_stream(rx)))
    }

    type handleStreamedStream = Pin<Box<dyn Stream<Item = Result<FunctionReply, Status>> + Send>>;

    async fn handle_streamed(
        &self,
        request: Request<Streaming<FunctionCommand>>,
    ) -> Result<Response<Self::handleStreamedStream>, Status> {
        let mut inbound = request.into_inner();
        let priming = inbound
            .message()
            .await?
            .ok_or_else(|| ProtocolError::EmptyMessage.into_status())?;
        let core = self.lookup(&priming.service_name)?;
        let rx = run_stream(Arc::clone(&self.registry), core, priming.name, inbound);
        Ok(Response::new(item_stream(rx)))
    }
}
