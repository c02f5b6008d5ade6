//! Call-scoped contexts handed to user handlers, and the client-action
//! builder that turns a handler outcome into exactly one of reply, forward,
//! or failure.
//!
//! A fresh context is created per command and destroyed once its reply is
//! built; contexts are never reused across commands.

use crate::codec::Payload;
use crate::error::ProtocolError;
use crate::proto::cloudstate::{client_action, ClientAction, Failure, Forward, Reply, SideEffect};

/// Core client-action state shared by every protocol variant: recorded
/// errors, accumulated side effects, and an optional forward.
///
/// Error precedence is absolute: once `fail` has been called (or a handler
/// error was recorded), the outcome is a `Failure` regardless of any reply
/// or forward the handler produced.
#[derive(Debug, Default)]
pub struct ClientActionContext {
    command_id: i64,
    errors: Vec<String>,
    effects: Vec<SideEffect>,
    forward: Option<Forward>,
}

impl ClientActionContext {
    /// Create a context for the command with the given id.
    pub fn new(command_id: i64) -> Self {
        Self {
            command_id,
            ..Self::default()
        }
    }

    /// Id of the command this context belongs to.
    pub fn command_id(&self) -> i64 {
        self.command_id
    }

    /// Fail the command with the given message.
    ///
    /// Equivalent to the handler returning an error: the message becomes
    /// part of the `Failure` description and suppresses any reply, forward,
    /// events, or side effects.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Whether any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Request a fire-and-forget call on another entity, performed by the
    /// proxy alongside the primary reply. Dropped if the command fails.
    pub fn effect<T>(&mut self, service_name: &str, command_name: &str, message: T, synchronous: bool)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.effects.push(SideEffect {
            service_name: service_name.to_string(),
            command_name: command_name.to_string(),
            payload: Some(Payload::new(message).to_any()),
            synchronous,
        });
    }

    /// Redirect fulfilment of this command to another service call instead
    /// of replying directly. Mutually exclusive with returning a reply.
    pub fn forward_to<T>(&mut self, service_name: &str, command_name: &str, message: T)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.forward = Some(Forward {
            service_name: service_name.to_string(),
            command_name: command_name.to_string(),
            payload: Some(Payload::new(message).to_any()),
        });
    }

    /// Side effects accumulated so far. Attached to the outgoing message
    /// only on non-failure outcomes.
    pub(crate) fn take_effects(&mut self) -> Vec<SideEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Build the client action for this command.
    ///
    /// Exactly one of reply / forward / failure is produced:
    /// * recorded errors win over everything and become a `Failure`;
    /// * otherwise a handler result becomes a `Reply` (a simultaneous
    ///   forward is a contract violation and fatal);
    /// * otherwise a pending forward becomes a `Forward`;
    /// * otherwise, unless `allow_no_action` is set, the handler is
    ///   malformed and the stream dies.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::ReplyAndForward`] if the handler both returned a
    ///   result and requested a forward.
    /// * [`ProtocolError::NoOutcome`] if the handler produced nothing and
    ///   the caller requires a definitive outcome.
    pub(crate) fn create_client_action(
        &self,
        result: Option<&Payload>,
        allow_no_action: bool,
    ) -> Result<Option<ClientAction>, ProtocolError> {
        let action = if self.has_errors() {
            client_action::Action::Failure(Failure {
                command_id: self.command_id,
                description: self.errors.join(", "),
            })
        } else if let Some(result) = result {
            if self.forward.is_some() {
                return Err(ProtocolError::ReplyAndForward);
            }
            client_action::Action::Reply(Reply {
                payload: Some(result.to_any()),
            })
        } else if let Some(forward) = self.forward.clone() {
            client_action::Action::Forward(forward)
        } else if allow_no_action {
            return Ok(None);
        } else {
            return Err(ProtocolError::NoOutcome);
        };

        Ok(Some(ClientAction {
            action: Some(action),
        }))
    }
}

/// Context for an event-sourced command handler.
///
/// Allows emitting events to persist, failing the command, forwarding, and
/// requesting side effects.
#[derive(Debug)]
pub struct CommandContext {
    /// Name of the command being handled.
    pub command_name: String,
    /// Id of the entity this session serves.
    pub entity_id: String,
    /// Sequence number of the last event applied before this command.
    pub sequence: i64,
    pub(crate) action: ClientActionContext,
    pub(crate) events: Vec<Payload>,
}

impl CommandContext {
    pub(crate) fn new(command_name: &str, command_id: i64, entity_id: &str, sequence: i64) -> Self {
        Self {
            command_name: command_name.to_string(),
            entity_id: entity_id.to_string(),
            sequence,
            action: ClientActionContext::new(command_id),
            events: Vec::new(),
        }
    }

    /// Emit an event. The event is applied to the in-memory state through
    /// its registered event handler before the reply is built, and is
    /// persisted by the proxy when the reply is acknowledged.
    pub fn emit<T>(&mut self, event: T)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.events.push(Payload::new(event));
    }

    /// Fail the command with the given message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.action.fail(message);
    }

    /// Whether any error has been recorded.
    pub fn has_errors(&self) -> bool {
        self.action.has_errors()
    }

    /// Request a side effect on another entity. See [`ClientActionContext::effect`].
    pub fn effect<T>(&mut self, service_name: &str, command_name: &str, message: T, synchronous: bool)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.action.effect(service_name, command_name, message, synchronous);
    }

    /// Forward this command to another service call. See
    /// [`ClientActionContext::forward_to`].
    pub fn forward_to<T>(&mut self, service_name: &str, command_name: &str, message: T)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.action.forward_to(service_name, command_name, message);
    }
}

/// Context passed to event handlers during replay and event application.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Id of the entity this session serves.
    pub entity_id: String,
    /// Sequence number of the event being applied.
    pub sequence_number: i64,
}

/// Context passed to the snapshot function and snapshot handler.
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    /// Id of the entity this session serves.
    pub entity_id: String,
    /// Sequence number the snapshot covers up to.
    pub sequence_number: i64,
}

/// Context for action and stateless-function handlers.
///
/// Stateless requests carry no command id on the wire, so failures built
/// from this context use a fixed id of zero.
#[derive(Debug)]
pub struct ActionContext {
    /// Name of the command being handled.
    pub command_name: String,
    pub(crate) action: ClientActionContext,
}

impl ActionContext {
    pub(crate) fn new(command_name: &str) -> Self {
        Self {
            command_name: command_name.to_string(),
            action: ClientActionContext::new(0),
        }
    }

    /// Fail the command with the given message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.action.fail(message);
    }

    /// Whether any error has been recorded.
    pub fn has_errors(&self) -> bool {
        self.action.has_errors()
    }

    /// Request a side effect on another entity. See [`ClientActionContext::effect`].
    pub fn effect<T>(&mut self, service_name: &str, command_name: &str, message: T, synchronous: bool)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.action.effect(service_name, command_name, message, synchronous);
    }

    /// Forward this command to another service call. See
    /// [`ClientActionContext::forward_to`].
    pub fn forward_to<T>(&mut self, service_name: &str, command_name: &str, message: T)
    where
        T: prost::Name + Send + Sync + 'static,
    {
        self.action.forward_to(service_name, command_name, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_messages::{CounterValue, Increase};

    fn action_of(ctx: &ClientActionContext, result: Option<&Payload>) -> client_action::Action {
        ctx.create_client_action(result, false)
            .expect("builder should succeed")
            .expect("an action should be produced")
            .action
            .expect("oneof should be populated")
    }

    #[test]
    fn result_becomes_reply() {
        let ctx = ClientActionContext::new(7);
        let payload = Payload::new(CounterValue { value: 3 });
        let action = action_of(&ctx, Some(&payload));
        assert!(matches!(action, client_action::Action::Reply(_)));
    }

    #[test]
    fn errors_win_over_result() {
        let mut ctx = ClientActionContext::new(7);
        ctx.fail("first problem");
        ctx.fail("second problem");
        let payload = Payload::new(CounterValue { value: 3 });

        let action = action_of(&ctx, Some(&payload));
        match action {
            client_action::Action::Failure(failure) => {
                assert_eq!(failure.command_id, 7);
                assert_eq!(failure.description, "first problem, second problem");
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[test]
    fn forward_without_result_becomes_forward() {
        let mut ctx = ClientActionContext::new(1);
        ctx.forward_to("com.example.Other", "DoIt", Increase { value: 1 });
        let action = action_of(&ctx, None);
        match action {
            client_action::Action::Forward(forward) => {
                assert_eq!(forward.service_name, "com.example.Other");
                assert_eq!(forward.command_name, "DoIt");
                assert!(forward.payload.is_some());
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn result_plus_forward_is_fatal() {
        let mut ctx = ClientActionContext::new(1);
        ctx.forward_to("com.example.Other", "DoIt", Increase { value: 1 });
        let payload = Payload::new(CounterValue { value: 3 });

        let err = ctx
            .create_client_action(Some(&payload), false)
            .expect_err("reply plus forward must be rejected");
        assert!(matches!(err, ProtocolError::ReplyAndForward));
    }

    #[test]
    fn errors_win_over_forward() {
        let mut ctx = ClientActionContext::new(1);
        ctx.forward_to("com.example.Other", "DoIt", Increase { value: 1 });
        ctx.fail("broken");
        let action = action_of(&ctx, None);
        assert!(matches!(action, client_action::Action::Failure(_)));
    }

    #[test]
    fn no_outcome_is_fatal_unless_allowed() {
        let ctx = ClientActionContext::new(1);
        let err = ctx
            .create_client_action(None, false)
            .expect_err("no outcome must be rejected");
        assert!(matches!(err, ProtocolError::NoOutcome));

        let none = ctx
            .create_client_action(None, true)
            .expect("allowed no-action should succeed");
        assert!(none.is_none());
    }

    #[test]
    fn exactly_one_variant_is_populated() {
        // Reply, forward, and failure outcomes each populate the oneof once.
        let mut failing = ClientActionContext::new(1);
        failing.fail("x");
        for action in [
            action_of(&ClientActionContext::new(1), Some(&Payload::new(Increase { value: 1 }))),
            action_of(&failing, None),
        ] {
            // The oneof representation makes double-population unrepresentable;
            // assert it is populated at all.
            let _ = action;
        }
    }

    #[test]
    fn command_context_accumulates_events_in_order() {
        let mut ctx = CommandContext::new("Increase", 9, "counter-1", 4);
        ctx.emit(Increase { value: 1 });
        ctx.emit(Increase { value: 2 });

        assert_eq!(ctx.events.len(), 2);
        let first = ctx.events[0].downcast_ref::<Increase>().unwrap();
        let second = ctx.events[1].downcast_ref::<Increase>().unwrap();
        assert_eq!((first.value, second.value), (1, 2));
    }

    #[test]
    fn effects_are_recorded_with_payloads() {
        let mut ctx = ClientActionContext::new(1);
        ctx.effect("com.example.Other", "Notify", Increase { value: 5 }, true);

        let effects = ctx.take_effects();
        assert_eq!(effects.len(), 1);
        assert_eq!(effects[0].service_name, "com.example.Other");
        assert!(effects[0].synchronous);
        assert!(effects[0].payload.is_some());
    }

    #[test]
    fn action_context_uses_zero_command_id() {
        let mut ctx = ActionContext::new("DoIt");
        ctx.fail("nope");
        let action = ctx
            .action
            .create_client_action(None, false)
            .unwrap()
            .unwrap()
            .action
            .unwrap();
        match action {
            client_action::Action::Failure(failure) => assert_eq!(failure.command_id, 0),
            other => panic!("expected Failure, got {other:?}"),
        }
    }
}
