//! The action protocol: stateless, transient entities, plus the shared
//! machinery the stateless-function protocol reuses.
//!
//! Actions have no entity state, no replay, and no persistence. They
//! support all four gRPC call shapes, keyed by handler category at
//! registration: unary, client-streaming, server-streaming, and
//! bidirectional. For the shapes whose inbound side is a stream, the proxy
//! sends one priming message first, carrying only the target service and
//! command name; payloads follow in subsequent messages.
//!
//! Handlers are synchronous and run on blocking tasks. Streaming handlers
//! pull inbound payloads from a [`CommandStream`] and push outbound items
//! through an [`ItemSink`]; both sides are bounded channels, and closing
//! the gRPC stream closes the channels, which is the only cancellation
//! signal a handler observes.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};

use crate::codec::{Payload, TypeRegistry};
use crate::context::ActionContext;
use crate::dispatch::{HandlerKind, ParamRole, Signature};
use crate::entity::{declared, declared_mut};
use crate::error::{HandlerError, ProtocolError, RegistrationError};
use crate::proto::cloudstate::action::action_protocol_server::ActionProtocol;
use crate::proto::cloudstate::action::{action_response, ActionCommand, ActionResponse};
use crate::proto::cloudstate::{client_action, SideEffect};
use crate::registry::EntityRegistry;

/// Fully qualified name of the action protocol service, reported to the
/// proxy during discovery.
pub const ACTION_ENTITY_TYPE: &str = "cloudstate.action.ActionProtocol";

const CHANNEL_BUFFER: usize = 16;

/// Pull side of the inbound payload channel, handed to client-streaming and
/// bidirectional handlers.
pub struct CommandStream {
    receiver: mpsc::Receiver<Payload>,
}

impl CommandStream {
    /// Block until the next inbound payload arrives.
    ///
    /// Returns `None` once the caller's request stream has ended or the
    /// call was cancelled; the handler should finish when it sees `None`.
    pub fn next(&mut self) -> Option<Payload> {
        self.receiver.blocking_recv()
    }
}

/// One fully built outgoing item, protocol-variant neutral. The adapters
/// map it onto their concrete response message.
#[derive(Debug)]
pub(crate) struct OutItem {
    pub(crate) action: client_action::Action,
    pub(crate) side_effects: Vec<SideEffect>,
}

/// Push side of the outbound item channel, handed to server-streaming and
/// bidirectional handlers.
///
/// Every item is built through a fresh context: a failed item becomes a
/// `Failure` item on the stream and does not affect items sent after it.
pub struct ItemSink {
    command_name: String,
    sender: mpsc::Sender<Result<OutItem, Status>>,
}

impl ItemSink {
    /// Send one reply item carrying `message`.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] once the outbound stream has closed; the handler
    /// should stop producing when sends start failing.
    pub fn send<T>(&self, message: T) -> Result<(), HandlerError>
    where
        T: prost::Name + Send + Sync + 'static,
    {
        let ctx = ActionContext::new(&self.command_name);
        self.send_outcome(ctx, Some(Payload::new(message)))
    }

    /// Send one failure item with the given description.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] once the outbound stream has closed.
    pub fn fail(&self, description: impl Into<String>) -> Result<(), HandlerError> {
        let mut ctx = ActionContext::new(&self.command_name);
        ctx.fail(description);
        self.send_outcome(ctx, None)
    }

    /// A fresh context for building one item with side effects or a
    /// forward; finish it with [`ItemSink::send_outcome`].
    pub fn context(&self) -> ActionContext {
        ActionContext::new(&self.command_name)
    }

    /// Build and send one item from a context and an optional reply payload.
    ///
    /// A context with neither errors, reply, nor forward produces nothing
    /// and the call is a no-op.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] if the item is contradictory (reply and forward
    /// at once) or the outbound stream has closed.
    pub fn send_outcome(
        &self,
        ctx: ActionContext,
        result: Option<Payload>,
    ) -> Result<(), HandlerError> {
        let item = match build_item(ctx, result.as_ref(), true) {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(()),
            Err(err) => return Err(HandlerError::new(err.to_string())),
        };
        self.sender
            .blocking_send(Ok(item))
            .map_err(|_| HandlerError::new("output stream closed"))
    }

    fn send_status(&self, status: Status) {
        let _ = self.sender.blocking_send(Err(status));
    }
}

/// Call scope for a unary stateless handler: the declared subset of the
/// decoded payload and the action context.
pub struct UnaryCall<'a> {
    payload: Option<&'a Payload>,
    context: Option<&'a mut ActionContext>,
}

impl UnaryCall<'_> {
    /// Borrow the decoded command payload, downcast to its concrete type.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] if the handler did not declare
    /// [`ParamRole::Payload`] or the downcast type is wrong.
    pub fn payload<P: 'static>(&self) -> Result<&P, HandlerError> {
        self.payload
            .ok_or_else(|| HandlerError::new("handler did not declare the payload parameter"))?
            .downcast_ref::<P>()
            .ok_or_else(|| HandlerError::new("payload value does not have the expected type"))
    }

    /// Borrow the action context for failing, forwarding, or side effects.
    pub fn ctx(&mut self) -> Result<&mut ActionContext, HandlerError> {
        self.context
            .as_deref_mut()
            .ok_or_else(|| HandlerError::new("handler did not declare the context parameter"))
    }
}

type UnaryFn =
    Box<dyn Fn(&mut UnaryCall<'_>) -> Result<Option<Payload>, HandlerError> + Send + Sync>;
type StreamInFn = Box<
    dyn Fn(&mut CommandStream, &mut ActionContext) -> Result<Option<Payload>, HandlerError>
        + Send
        + Sync,
>;
type StreamOutFn = Box<dyn Fn(&Payload, &ItemSink) -> Result<(), HandlerError> + Send + Sync>;
type StreamFn =
    Box<dyn Fn(&mut CommandStream, &ItemSink) -> Result<(), HandlerError> + Send + Sync>;

pub(crate) struct UnaryHandler {
    signature: Signature,
    func: UnaryFn,
}

impl UnaryHandler {
    fn invoke(
        &self,
        payload: &Payload,
        context: &mut ActionContext,
    ) -> Result<Option<Payload>, HandlerError> {
        let mut call = UnaryCall {
            payload: declared(&self.signature, ParamRole::Payload, payload),
            context: declared_mut(&self.signature, ParamRole::Context, context),
        };
        (self.func)(&mut call)
    }
}

/// The handler registries and metadata shared by the action and
/// stateless-function protocol variants. The variants differ only in wire
/// message types and routing; everything else lives here.
pub(crate) struct StatelessCore {
    pub(crate) service_name: String,
    pub(crate) descriptor_set: Vec<u8>,
    pub(crate) types: TypeRegistry,
    unary: HashMap<String, UnaryHandler>,
    stream_in: HashMap<String, StreamInFn>,
    stream_out: HashMap<String, StreamOutFn>,
    stream: HashMap<String, StreamFn>,
}

/// Accumulates registrations for a [`StatelessCore`]. Wrapped by the public
/// `ActionBuilder` and `StatelessFunctionBuilder`.
pub(crate) struct StatelessCoreBuilder {
    core: StatelessCore,
}

impl StatelessCoreBuilder {
    pub(crate) fn new(service_name: String) -> Self {
        Self {
            core: StatelessCore {
                service_name,
                descriptor_set: Vec::new(),
                types: TypeRegistry::new(),
                unary: HashMap::new(),
                stream_in: HashMap::new(),
                stream_out: HashMap::new(),
                stream: HashMap::new(),
            },
        }
    }

    pub(crate) fn descriptor_set(&mut self, bytes: Vec<u8>) {
        self.core.descriptor_set = bytes;
    }

    pub(crate) fn unary<T, F>(
        &mut self,
        name: String,
        roles: Vec<ParamRole>,
        f: F,
    ) -> Result<(), RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut UnaryCall<'_>) -> Result<Option<Payload>, HandlerError> + Send + Sync + 'static,
    {
        let signature = Signature::validate(roles, HandlerKind::Stateless)?;
        if self.core.unary.contains_key(&name) {
            return Err(RegistrationError::DuplicateStatelessHandler {
                kind: "unary",
                name,
            });
        }
        self.core.types.register::<T>();
        self.core.unary.insert(
            name,
            UnaryHandler {
                signature,
                func: Box::new(f),
            },
        );
        Ok(())
    }

    pub(crate) fn stream_in<T, F>(&mut self, name: String, f: F) -> Result<(), RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut CommandStream, &mut ActionContext) -> Result<Option<Payload>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        if self.core.stream_in.contains_key(&name) {
            return Err(RegistrationError::DuplicateStatelessHandler {
                kind: "stream in",
                name,
            });
        }
        self.core.types.register::<T>();
        self.core.stream_in.insert(name, Box::new(f));
        Ok(())
    }

    pub(crate) fn stream_out<T, F>(&mut self, name: String, f: F) -> Result<(), RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&Payload, &ItemSink) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self.core.stream_out.contains_key(&name) {
            return Err(RegistrationError::DuplicateStatelessHandler {
                kind: "stream out",
                name,
            });
        }
        self.core.types.register::<T>();
        self.core.stream_out.insert(name, Box::new(f));
        Ok(())
    }

    pub(crate) fn stream<T, F>(&mut self, name: String, f: F) -> Result<(), RegistrationError>
    where
        T: prost::Name + Default + Send + Sync + 'static,
        F: Fn(&mut CommandStream, &ItemSink) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self.core.stream.contains_key(&name) {
            return Err(RegistrationError::DuplicateStatelessHandler {
                kind: "stream",
                name,
            });
        }
        self.core.types.register::<T>();
        self.core.stream.insert(name, Box::new(f));
        Ok(())
    }

    pub(crate) fn build(self) -> Arc<StatelessCore> {
        Arc::new(self.core)
    }
}

/// A stateless action entity definition.
///
/// Assemble with [`Action::builder`] and register on
/// [`CloudState`](crate::CloudState).
pub struct Action {
    pub(crate) core: Arc<StatelessCore>,
}

impl Action {
    /// Start building an action for the given fully qualified service name.
    pub fn builder(service_name: impl Into<String>) -> ActionBuilder {
        ActionBuilder {
            core: StatelessCoreBuilder::new(service_name.into()),
        }
    }

    /// The fully qualified service name this action serves.
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

/// Builder for [`Action`]. One handler per command name per call shape; a
/// duplicate is an immediate [`RegistrationError`].
pub struct ActionBuilder {
    core: StatelessCoreBuilder,
}

impl ActionBuilder {
    /// Attach the serialized `google.protobuf.FileDescriptorSet` for this
    /// action's service proto, served to the proxy during discovery.
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

    /// Register a client-streaming handler: consumes inbound payloads of
    /// type `T` from a [`CommandStream`] and produces one reply.
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

    /// Register a server-streaming handler: receives one payload of type
    /// `T` and pushes any number of items through an [`ItemSink`].
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

    /// Register a bidirectional handler: consumes a [`CommandStream`] of
    /// payloads of type `T` and pushes items through an [`ItemSink`].
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
    pub fn build(self) -> Action {
        Action {
            core: self.core.build(),
        }
    }
}

/// Build one outgoing item from a finished context and optional result.
///
/// Failure outcomes drop accumulated side effects; `Ok(None)` means the
/// context produced nothing and nothing should be emitted.
fn build_item(
    mut ctx: ActionContext,
    result: Option<&Payload>,
    allow_no_action: bool,
) -> Result<Option<OutItem>, ProtocolError> {
    let action = ctx.action.create_client_action(result, allow_no_action)?;
    match action.and_then(|a| a.action) {
        None => Ok(None),
        Some(action) => {
            let side_effects = if matches!(action, client_action::Action::Failure(_)) {
                Vec::new()
            } else {
                ctx.action.take_effects()
            };
            Ok(Some(OutItem {
                action,
                side_effects,
            }))
        }
    }
}

/// As [`build_item`], but the handler must have produced a definitive
/// outcome: reply, forward, or failure.
fn single_item(ctx: ActionContext, result: Option<&Payload>) -> Result<OutItem, ProtocolError> {
    match build_item(ctx, result, false)? {
        Some(item) => Ok(item),
        None => Err(ProtocolError::NoOutcome),
    }
}

/// Response message a stateless protocol variant sends on the wire.
pub(crate) trait StatelessReply: Send + 'static {
    fn from_item(item: OutItem) -> Self;
}

impl StatelessReply for ActionResponse {
    fn from_item(item: OutItem) -> Self {
        let response = match item.action {
            client_action::Action::Failure(f) => action_response::Response::Failure(f),
            client_action::Action::Reply(r) => action_response::Response::Reply(r),
            client_action::Action::Forward(f) => action_response::Response::Forward(f),
        };
        ActionResponse {
            response: Some(response),
            side_effects: item.side_effects,
        }
    }
}

/// Inbound command message of a stateless protocol variant.
pub(crate) trait StatelessCommand: Send + 'static {
    fn take_payload(&mut self) -> Option<prost_types::Any>;
}

impl StatelessCommand for ActionCommand {
    fn take_payload(&mut self) -> Option<prost_types::Any> {
        self.payload.take()
    }
}

fn missing_handler(core: &StatelessCore, kind: &str, name: &str) -> Status {
    tracing::error!(
        service_name = %core.service_name,
        command = name,
        kind,
        "no handler registered for command"
    );
    ProtocolError::MissingCommandHandler {
        service: core.service_name.clone(),
        command: name.to_string(),
    }
    .into_status()
}

fn decode_command(
    registry: &EntityRegistry,
    envelope: Option<prost_types::Any>,
) -> Result<Payload, Status> {
    let envelope = envelope.ok_or_else(|| ProtocolError::MissingPayload("command").into_status())?;
    registry
        .types()
        .decode(&envelope)
        .map_err(ProtocolError::into_status)
}

/// Run a unary stateless command to completion.
pub(crate) async fn run_unary(
    registry: &EntityRegistry,
    core: Arc<StatelessCore>,
    name: String,
    envelope: Option<prost_types::Any>,
) -> Result<OutItem, Status> {
    let payload = decode_command(registry, envelope)?;

    tokio::task::spawn_blocking(move || {
        let handler = core
            .unary
            .get(&name)
            .ok_or_else(|| missing_handler(&core, "unary", &name))?;

        let mut ctx = ActionContext::new(&name);
        let result = match handler.invoke(&payload, &mut ctx) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(command = %name, error = %err, "failed to execute command");
                ctx.fail(err.to_string());
                None
            }
        };
        single_item(ctx, result.as_ref()).map_err(ProtocolError::into_status)
    })
    .await
    .map_err(|err| Status::internal(format!("handler task failed: {err}")))?
}

/// Run a client-streaming stateless command: feed inbound payloads to the
/// handler, return its single reply.
pub(crate) async fn run_stream_in<C, S>(
    registry: Arc<EntityRegistry>,
    core: Arc<StatelessCore>,
    name: String,
    mut inbound: S,
) -> Result<OutItem, Status>
where
    C: StatelessCommand,
    S: Stream<Item = Result<C, Status>> + Unpin + Send,
{
    let (payload_tx, payload_rx) = mpsc::channel(CHANNEL_BUFFER);
    let handler_name = name.clone();
    let handler_task = tokio::task::spawn_blocking(move || {
        let handler = core
            .stream_in
            .get(&handler_name)
            .ok_or_else(|| missing_handler(&core, "stream in", &handler_name))?;

        let mut stream = CommandStream {
            receiver: payload_rx,
        };
        let mut ctx = ActionContext::new(&handler_name);
        let result = match handler(&mut stream, &mut ctx) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(command = %handler_name, error = %err, "failed to execute command");
                ctx.fail(err.to_string());
                None
            }
        };
        single_item(ctx, result.as_ref()).map_err(ProtocolError::into_status)
    });

    let mut feed_error: Option<Status> = None;
    while let Some(next) = inbound.next().await {
        let envelope = match next {
            Ok(mut message) => message.take_payload(),
            Err(status) => {
                feed_error = Some(status);
                break;
            }
        };
        match decode_command(&registry, envelope) {
            Ok(payload) => {
                // A closed channel means the handler returned early.
                if payload_tx.send(payload).await.is_err() {
                    break;
                }
            }
            Err(status) => {
                feed_error = Some(status);
                break;
            }
        }
    }
    drop(payload_tx);

    let item = handler_task
        .await
        .map_err(|err| Status::internal(format!("handler task failed: {err}")))??;
    match feed_error {
        Some(status) => Err(status),
        None => Ok(item),
    }
}

/// Run a server-streaming stateless command. Items appear on the returned
/// channel as the handler produces them.
pub(crate) async fn run_stream_out(
    registry: &EntityRegistry,
    core: Arc<StatelessCore>,
    name: String,
    envelope: Option<prost_types::Any>,
) -> Result<mpsc::Receiver<Result<OutItem, Status>>, Status> {
    let payload = decode_command(registry, envelope)?;
    let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

    tokio::task::spawn_blocking(move || {
        let sink = ItemSink {
            command_name: name.clone(),
            sender: tx,
        };
        let handler = match core.stream_out.get(&name) {
            Some(handler) => handler,
            None => {
                sink.send_status(missing_handler(&core, "stream out", &name));
                return;
            }
        };
        if let Err(err) = handler(&payload, &sink) {
            tracing::error!(command = %name, error = %err, "failed to execute command");
            // The error terminates the handler; surface it as a final
            // failure item rather than killing the stream.
            let _ = sink.fail(err.to_string());
        }
    });

    Ok(rx)
}

/// Run a bidirectional stateless command: payloads in, items out, both
/// flowing while the handler runs.
pub(crate) fn run_stream<C, S>(
    registry: Arc<EntityRegistry>,
    core: Arc<StatelessCore>,
    name: String,
    mut inbound: S,
) -> mpsc::Receiver<Result<OutItem, Status>>
where
    C: StatelessCommand,
    S: Stream<Item = Result<C, Status>> + Unpin + Send + 'static,
{
    let (payload_tx, payload_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER);

    let feed_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(next) = inbound.next().await {
            let envelope = match next {
                Ok(mut message) => message.take_payload(),
                Err(status) => {
                    let _ = feed_out.send(Err(status)).await;
                    break;
                }
            };
            match decode_command(&registry, envelope) {
                Ok(payload) => {
                    if payload_tx.send(payload).await.is_err() {
                        break;
                    }
                }
                Err(status) => {
                    let _ = feed_out.send(Err(status)).await;
                    break;
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        let sink = ItemSink {
            command_name: name.clone(),
            sender: out_tx,
        };
        let handler = match core.stream.get(&name) {
            Some(handler) => handler,
            None => {
                sink.send_status(missing_handler(&core, "stream", &name));
                return;
            }
        };
        let mut stream = CommandStream {
            receiver: payload_rx,
        };
        if let Err(err) = handler(&mut stream, &sink) {
            tracing::error!(command = %name, error = %err, "failed to execute command");
            let _ = sink.fail(err.to_string());
        }
    });

    out_rx
}

/// Map a neutral item channel onto the variant's wire response stream.
pub(crate) fn item_stream<R: StatelessReply>(
    rx: mpsc::Receiver<Result<OutItem, Status>>,
) -> Pin<Box<dyn Stream<Item = Result<R, Status>> + Send>> {
    Box::pin(ReceiverStream::new(rx).map(|item| item.map(R::from_item)))
}

/// gRPC service routing action protocol calls to registered [`Action`]s.
pub(crate) struct ActionService {
    registry: Arc<EntityRegistry>,
}

impl ActionService {
    pub(crate) fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    fn lookup(&self, service_name: &str) -> Result<Arc<StatelessCore>, Status> {
        self.registry
            .action(service_name)
            .map(|action| Arc::clone(&action.core))
            .ok_or_else(|| ProtocolError::UnknownService(service_name.to_string()).into_status())
    }
}

#[tonic::async_trait]
impl ActionProtocol for ActionService {
    async fn handle_unary(
        &self,
        request: Request<ActionCommand>,
    ) -> Result<Response<ActionResponse>, Status> {
        let command = request.into_inner();
        let core = self.lookup(&command.service_name)?;
        let item = run_unary(&self.registry, core, command.name, command.payload).await?;
        Ok(Response::new(ActionResponse::from_item(item)))
    }

    async fn handle_streamed_in(
        &self,
        request: Request<Streaming<ActionCommand>>,
    ) -> Result<Response<ActionResponse>, Status> {
        let mut inbound = request.into_inner();
        // The first message primes the call with the target service and
        // command name; payloads follow.
        let priming = inbound
            .message()
            .await?
            .ok_or_else(|| ProtocolError::EmptyMessage.into_status())?;
        let core = self.lookup(&priming.service_name)?;
        let item =
            run_stream_in(Arc::clone(&self.registry), core, priming.name, inbound).await?;
        Ok(Response::new(ActionResponse::from_item(item)))
    }

    type handleStreamedOutStream = Pin<Box<dyn Stream<Item = Result<ActionResponse, Status>> + Send>>;

    async fn handle_streamed_out(
        &self,
        request: Request<ActionCommand>,
    ) -> Result<Response<Self::handleStreamedOutStream>, Status> {
        let command = request.into_inner();
        let core = self.lookup(&command.service_name)?;
        let rx = run_stream_out(&self.registry, core, command.name, command.payload).await?;
        Ok(Response::new(item_stream(rx)))
    }

    type handleStreamedStream = Pin<Box<dyn Stream<Item = Result<ActionResponse, Status>> + Send>>;

    async fn handle_streamed(
        &self,
        request: Request<Streaming<ActionCommand>>,
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


#[cfg(test)]
mod tests {
    use super::test_fixtures::echo_action;
    use super::*;
    use crate::codec::test_messages::{CounterValue, Increase};

    fn registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::build(Vec::new(), vec![echo_action()], Vec::new())
                .expect("registry should build"),
        )
    }

    fn core(registry: &EntityRegistry) -> Arc<StatelessCore> {
        Arc::clone(
            &registry
                .action("test.counter.Echo")
                .expect("action should be registered")
                .core,
        )
    }

    fn envelope(value: i64) -> Option<prost_types::Any> {
        Some(Payload::new(Increase { value }).to_any())
    }

    fn reply_value(item: &OutItem) -> i64 {
        match &item.action {
            client_action::Action::Reply(reply) => {
                use prost::Message;
                let any = reply.payload.as_ref().expect("reply payload");
                CounterValue::decode(any.value.as_slice())
                    .expect("payload should decode")
                    .value
            }
            other => panic!("expected a Reply, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_handler_name_rejected_per_shape() {
        let result = Action::builder("test.counter.Echo")
            .unary_handler::<Increase, _>("Echo", [ParamRole::Payload], |_| Ok(None))
            .unwrap()
            .unary_handler::<Increase, _>("Echo", [ParamRole::Payload], |_| Ok(None));
        assert!(matches!(
            result,
            Err(RegistrationError::DuplicateStatelessHandler { kind: "unary", ref name })
                if name == "Echo"
        ));

        // The same name under a different call shape is a distinct handler.
        let action = Action::builder("test.counter.Echo")
            .unary_handler::<Increase, _>("Echo", [ParamRole::Payload], |_| Ok(None))
            .unwrap()
            .stream_out_handler::<Increase, _>("Echo", |_, _| Ok(()))
            .unwrap()
            .build();
        assert_eq!(action.service_name(), "test.counter.Echo");
    }

    #[test]
    fn stateless_signature_rejects_state_role() {
        let result = Action::builder("test.counter.Echo")
            .unary_handler::<Increase, _>("Echo", [ParamRole::State], |_| Ok(None));
        assert!(matches!(result, Err(RegistrationError::Signature(_))));
    }

    #[tokio::test]
    async fn unary_reply() {
        let registry = registry();
        let item = run_unary(&registry, core(&registry), "Echo".into(), envelope(9))
            .await
            .expect("unary call should succeed");
        assert_eq!(reply_value(&item), 9);
        assert!(item.side_effects.is_empty());
    }

    #[tokio::test]
    async fn unary_failure_uses_zero_command_id() {
        let registry = registry();
        let item = run_unary(&registry, core(&registry), "Echo".into(), envelope(-1))
            .await
            .expect("failed commands still produce a response");
        match item.action {
            client_action::Action::Failure(failure) => {
                assert_eq!(failure.command_id, 0);
                assert!(failure.description.contains("Cannot echo negative value"));
            }
            other => panic!("expected a Failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unary_unknown_command_is_internal() {
        let registry = registry();
        let status = run_unary(&registry, core(&registry), "Missing".into(), envelope(1))
            .await
            .expect_err("unknown command must fail the call");
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn unary_missing_payload_is_an_error() {
        let registry = registry();
        let status = run_unary(&registry, core(&registry), "Echo".into(), None)
            .await
            .expect_err("a unary command requires a payload");
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn stream_in_sums_inbound_payloads() {
        let registry = registry();
        let commands: Vec<Result<ActionCommand, Status>> = [1, 2, 3]
            .into_iter()
            .map(|value| {
                Ok(ActionCommand {
                    service_name: "test.counter.Echo".into(),
                    name: "Sum".into(),
                    payload: envelope(value),
                })
            })
            .collect();
        let inbound = tokio_stream::iter(commands);

        let item = run_stream_in(Arc::clone(&registry), core(&registry), "Sum".into(), inbound)
            .await
            .expect("stream in call should succeed");
        assert_eq!(reply_value(&item), 6);
    }

    #[tokio::test]
    async fn stream_out_failure_item_does_not_poison_later_items() {
        let registry = registry();
        let mut rx = run_stream_out(&registry, core(&registry), "CountUp".into(), envelope(4))
            .await
            .expect("stream out call should start");

        let mut values = Vec::new();
        let mut failures = 0;
        while let Some(item) = rx.recv().await {
            match item.expect("no stream-level error expected").action {
                client_action::Action::Reply(reply) => {
                    use prost::Message;
                    let any = reply.payload.expect("reply payload");
                    values.push(CounterValue::decode(any.value.as_slice()).unwrap().value);
                }
                client_action::Action::Failure(failure) => {
                    assert!(failure.description.contains("three is unlucky"));
                    failures += 1;
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(values, vec![1, 2, 4]);
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn bidi_doubles_each_inbound_payload() {
        let registry = registry();
        let commands: Vec<Result<ActionCommand, Status>> = [5, 7]
            .into_iter()
            .map(|value| {
                Ok(ActionCommand {
                    service_name: "test.counter.Echo".into(),
                    name: "Double".into(),
                    payload: envelope(value),
                })
            })
            .collect();
        let inbound = tokio_stream::iter(commands);

        let mut rx = run_stream(Arc::clone(&registry), core(&registry), "Double".into(), inbound);
        let mut values = Vec::new();
        while let Some(item) = rx.recv().await {
            values.push(reply_value(&item.expect("no stream-level error expected")));
        }
        assert_eq!(values, vec![10, 14]);
    }

    #[tokio::test]
    async fn streaming_unknown_command_surfaces_status() {
        let registry = registry();
        let inbound = tokio_stream::iter(Vec::<Result<ActionCommand, Status>>::new());
        let mut rx = run_stream(
            Arc::clone(&registry),
            core(&registry),
            "Missing".into(),
            inbound,
        );
        let status = rx
            .recv()
            .await
            .expect("an error item should appear")
            .expect_err("missing handler must be a status");
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
