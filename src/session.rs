//! The per-stream session state machine for event-sourced entities.
//!
//! One [`Session`] exists per open bidirectional stream. It is fed inbound
//! protocol messages one at a time, in arrival order, and produces at most
//! one outbound message per command. The machine has two phases:
//!
//! * **Uninitiated** -- only `Init` is legal. Resolves the entity, creates
//!   the initial state, optionally restores from a snapshot.
//! * **Ready** -- `Event` messages replay the journal silently; `Command`
//!   messages run a handler, apply the emitted events to the in-memory
//!   state, and acknowledge with a reply carrying the events to persist.
//!
//! Anything else is a structural [`ProtocolError`] that kills the stream.

use std::sync::Arc;

use crate::codec::Payload;
use crate::context::{CommandContext, EventContext, SnapshotContext};
use crate::entity::EventSourcedEntity;
use crate::error::ProtocolError;
use crate::proto::cloudstate::eventsourced::{
    event_sourced_stream_in, event_sourced_stream_out, EventSourcedEvent, EventSourcedInit,
    EventSourcedReply, EventSourcedStreamIn, EventSourcedStreamOut,
};
use crate::proto::cloudstate::Command;
use crate::registry::EntityRegistry;

/// State held once the session has processed its `Init` message.
struct Active {
    entity: Arc<EventSourcedEntity>,
    entity_id: String,
    /// The entity state. Exclusively owned by this session; no other
    /// session or task can observe it.
    state: crate::entity::DynState,
    /// Sequence number of the last event applied to `state`.
    last_sequence: i64,
}

/// The session state machine. See the module docs for the protocol.
pub struct Session {
    registry: Arc<EntityRegistry>,
    active: Option<Active>,
}

impl Session {
    /// Create a session in the uninitiated phase.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            active: None,
        }
    }

    /// Process one inbound message.
    ///
    /// Returns `Ok(Some(reply))` for commands, `Ok(None)` for messages that
    /// produce no output (init, replayed events).
    ///
    /// # Errors
    ///
    /// Any [`ProtocolError`] is fatal for the stream: the caller must stop
    /// feeding this session and surface the error on the transport.
    pub fn handle(
        &mut self,
        message: EventSourcedStreamIn,
    ) -> Result<Option<EventSourcedStreamOut>, ProtocolError> {
        match message.message {
            Some(event_sourced_stream_in::Message::Init(init)) => {
                self.handle_init(init)?;
                Ok(None)
            }
            Some(event_sourced_stream_in::Message::Event(event)) => {
                self.handle_event(event)?;
                Ok(None)
            }
            Some(event_sourced_stream_in::Message::Command(command)) => {
                self.handle_command(command).map(Some)
            }
            None => Err(ProtocolError::EmptyMessage),
        }
    }

    /// Sequence number of the last applied event. Zero before any event.
    pub fn last_sequence(&self) -> i64 {
        self.active.as_ref().map_or(0, |a| a.last_sequence)
    }

    fn handle_init(&mut self, init: EventSourcedInit) -> Result<(), ProtocolError> {
        if self.active.is_some() {
            return Err(ProtocolError::AlreadyInitiated);
        }

        let entity = self
            .registry
            .event_sourced(&init.service_name)
            .ok_or_else(|| ProtocolError::UnknownService(init.service_name.clone()))?;

        let mut state = entity.init_state(&init.entity_id);
        let mut last_sequence = 0;

        if let Some(snapshot) = init.snapshot {
            let envelope = snapshot
                .snapshot
                .ok_or(ProtocolError::MissingPayload("snapshot"))?;
            let payload = self.registry.types().decode(&envelope)?;
            let handler = entity
                .snapshot_handler
                .as_ref()
                .ok_or_else(|| ProtocolError::MissingSnapshotHandler(init.service_name.clone()))?;

            let ctx = SnapshotContext {
                entity_id: init.entity_id.clone(),
                sequence_number: snapshot.snapshot_sequence,
            };
            handler
                .invoke(&mut state, &payload, &ctx)
                .map_err(|e| ProtocolError::SnapshotRestore(e.to_string()))?;
            last_sequence = snapshot.snapshot_sequence;
        }

        tracing::debug!(
            service_name = %init.service_name,
            entity_id = %init.entity_id,
            last_sequence,
            "session initialized"
        );

        self.active = Some(Active {
            entity,
            entity_id: init.entity_id,
            state,
            last_sequence,
        });
        Ok(())
    }

    fn handle_event(&mut self, event: EventSourcedEvent) -> Result<(), ProtocolError> {
        let payload = {
            let envelope = event
                .payload
                .as_ref()
                .ok_or(ProtocolError::MissingPayload("event"))?;
            self.registry.types().decode(envelope)?
        };
        let active = self
            .active
            .as_mut()
            .ok_or(ProtocolError::NotInitiated("event"))?;

        tracing::debug!(
            entity_id = %active.entity_id,
            sequence = event.sequence,
            event_type = %payload.type_name(),
            "replaying event"
        );

        apply_event(active, &payload, event.sequence)?;
        active.last_sequence = event.sequence;
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> Result<EventSourcedStreamOut, ProtocolError> {
        let payload = {
            let envelope = command
                .payload
                .as_ref()
                .ok_or(ProtocolError::MissingPayload("command"))?;
            self.registry.types().decode(envelope)?
        };
        let active = self
            .active
            .as_mut()
            .ok_or(ProtocolError::NotInitiated("command"))?;
        let entity = Arc::clone(&active.entity);

        let handler = entity.command_handlers.get(&command.name).ok_or_else(|| {
            ProtocolError::MissingCommandHandler {
                service: entity.service_name().to_string(),
                command: command.name.clone(),
            }
        })?;

        let _span = tracing::info_span!(
            "command",
            entity_id = %active.entity_id,
            name = %command.name,
            id = command.id,
        )
        .entered();

        let mut ctx = CommandContext::new(
            &command.name,
            command.id,
            &active.entity_id,
            active.last_sequence,
        );

        // A handler error never aborts the stream; it is recorded into the
        // context and becomes the failure description.
        let result = match handler.invoke(&mut active.state, &payload, &mut ctx) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "failed to execute command");
                ctx.fail(e.to_string());
                None
            }
        };

        let client_action = ctx.action.create_client_action(result.as_ref(), false)?;

        let mut reply = EventSourcedReply {
            command_id: command.id,
            client_action,
            side_effects: Vec::new(),
            events: Vec::new(),
            snapshot: None,
        };

        if !ctx.has_errors() {
            // Apply every emitted event through the replay path before the
            // reply is built: acknowledged state must reflect the full batch.
            let snapshot_every = entity.snapshot_every();
            let mut perform_snapshot = false;
            for (i, event) in ctx.events.iter().enumerate() {
                let sequence = active.last_sequence + i as i64 + 1;
                apply_event(active, event, sequence)?;
                // Sticky across the batch: any event landing on the cadence
                // boundary triggers one snapshot for the whole command.
                perform_snapshot = snapshot_every > 0
                    && (perform_snapshot || sequence % snapshot_every == 0);
            }
            active.last_sequence += ctx.events.len() as i64;

            if perform_snapshot {
                let producer = entity.snapshot.as_ref().ok_or_else(|| {
                    ProtocolError::MissingSnapshotFunction(entity.service_name().to_string())
                })?;
                let snapshot_ctx = SnapshotContext {
                    entity_id: active.entity_id.clone(),
                    sequence_number: active.last_sequence,
                };
                let snapshot = producer
                    .invoke(&active.state, &snapshot_ctx)
                    .map_err(|e| ProtocolError::SnapshotProduce(e.to_string()))?;
                reply.snapshot = Some(snapshot.to_any());
            }

            reply.events = ctx.events.iter().map(Payload::to_any).collect();
            reply.side_effects = ctx.action.take_effects();
        }

        Ok(EventSourcedStreamOut {
            message: Some(event_sourced_stream_out::Message::Reply(reply)),
        })
    }
}

/// Apply one event to the session state through its registered handler.
///
/// Used identically for journal replay and for events a command just
/// emitted. A missing handler or a handler failure is structural: there is
/// no command context to absorb it.
fn apply_event(active: &mut Active, payload: &Payload, sequence: i64) -> Result<(), ProtocolError> {
    let entity = Arc::clone(&active.entity);
    let type_name = payload.type_name();

    let handler =
        entity
            .event_handlers
            .get(&type_name)
            .ok_or_else(|| ProtocolError::MissingEventHandler {
                service: entity.service_name().to_string(),
                event_type: type_name.clone(),
            })?;

    let ctx = EventContext {
        entity_id: active.entity_id.clone(),
        sequence_number: sequence,
    };
    handler
        .invoke(&mut active.state, payload, &ctx)
        .map_err(|e| ProtocolError::EventApplication {
            event_type: type_name,
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_messages::{CounterValue, GetCounter, Increase, Increased};
    use crate::entity::test_fixtures::counter_entity;
    use crate::proto::cloudstate::client_action;
    use crate::proto::cloudstate::eventsourced::EventSourcedSnapshot;

    const SERVICE: &str = "test.counter.Counter";

    fn session(snapshot_every: i64) -> Session {
        let registry =
            EntityRegistry::build(vec![counter_entity(snapshot_every)], Vec::new(), Vec::new())
                .expect("registry should build");
        Session::new(Arc::new(registry))
    }

    fn pack<T>(message: T) -> prost_types::Any
    where
        T: prost::Name + Send + Sync + 'static,
    {
        Payload::new(message).to_any()
    }

    fn init_msg(service_name: &str, entity_id: &str) -> EventSourcedStreamIn {
        EventSourcedStreamIn {
            message: Some(event_sourced_stream_in::Message::Init(EventSourcedInit {
                service_name: service_name.to_string(),
                entity_id: entity_id.to_string(),
                snapshot: None,
            })),
        }
    }

    fn init_with_snapshot(sequence: i64, value: i64) -> EventSourcedStreamIn {
        EventSourcedStreamIn {
            message: Some(event_sourced_stream_in::Message::Init(EventSourcedInit {
                service_name: SERVICE.to_string(),
                entity_id: "c-1".to_string(),
                snapshot: Some(EventSourcedSnapshot {
                    snapshot_sequence: sequence,
                    snapshot: Some(pack(CounterValue { value })),
                }),
            })),
        }
    }

    fn event_msg(sequence: i64, value: i64) -> EventSourcedStreamIn {
        EventSourcedStreamIn {
            message: Some(event_sourced_stream_in::Message::Event(EventSourcedEvent {
                sequence,
                payload: Some(pack(Increased { value })),
            })),
        }
    }

    fn command_msg(id: i64, name: &str, payload: prost_types::Any) -> EventSourcedStreamIn {
        EventSourcedStreamIn {
            message: Some(event_sourced_stream_in::Message::Command(Command {
                entity_id: "c-1".to_string(),
                id,
                name: name.to_string(),
                payload: Some(payload),
                streamed: false,
            })),
        }
    }

    fn reply_of(out: Option<EventSourcedStreamOut>) -> EventSourcedReply {
        match out.expect("a command must produce output").message {
            Some(event_sourced_stream_out::Message::Reply(reply)) => reply,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    fn reply_value(reply: &EventSourcedReply) -> i64 {
        match reply.client_action.as_ref().and_then(|a| a.action.as_ref()) {
            Some(client_action::Action::Reply(r)) => {
                let any = r.payload.as_ref().expect("reply payload");
                use prost::Message;
                CounterValue::decode(any.value.as_slice())
                    .expect("payload should decode")
                    .value
            }
            other => panic!("expected a Reply action, got {other:?}"),
        }
    }

    fn failure_of(reply: &EventSourcedReply) -> &crate::proto::cloudstate::Failure {
        match reply.client_action.as_ref().and_then(|a| a.action.as_ref()) {
            Some(client_action::Action::Failure(f)) => f,
            other => panic!("expected a Failure action, got {other:?}"),
        }
    }

    #[test]
    fn init_then_get_returns_initial_state() {
        let mut session = session(0);
        assert!(session.handle(init_msg(SERVICE, "c-1")).unwrap().is_none());

        let reply = reply_of(
            session
                .handle(command_msg(1, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply.command_id, 1);
        assert_eq!(reply_value(&reply), 0);
        assert!(reply.events.is_empty());
    }

    #[test]
    fn init_with_unknown_service_is_fatal() {
        let mut session = session(0);
        let err = session
            .handle(init_msg("test.counter.Missing", "c-1"))
            .expect_err("unknown service must be fatal");
        assert!(matches!(err, ProtocolError::UnknownService(_)));
    }

    #[test]
    fn command_before_init_is_fatal() {
        let mut session = session(0);
        let err = session
            .handle(command_msg(1, "Get", pack(GetCounter {})))
            .expect_err("command before init must be fatal");
        assert!(matches!(err, ProtocolError::NotInitiated("command")));
    }

    #[test]
    fn event_before_init_is_fatal() {
        let mut session = session(0);
        let err = session
            .handle(event_msg(1, 5))
            .expect_err("event before init must be fatal");
        assert!(matches!(err, ProtocolError::NotInitiated("event")));
    }

    #[test]
    fn second_init_is_fatal() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();
        let err = session
            .handle(init_msg(SERVICE, "c-1"))
            .expect_err("a session cannot re-initiate");
        assert!(matches!(err, ProtocolError::AlreadyInitiated));
    }

    #[test]
    fn empty_message_is_fatal() {
        let mut session = session(0);
        let err = session
            .handle(EventSourcedStreamIn { message: None })
            .expect_err("empty message must be fatal");
        assert!(matches!(err, ProtocolError::EmptyMessage));
    }

    #[test]
    fn replay_folds_events_silently() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        for (sequence, value) in [(1, 2), (2, 3), (3, 5)] {
            let out = session.handle(event_msg(sequence, value)).unwrap();
            assert!(out.is_none(), "replay must not produce replies");
        }
        assert_eq!(session.last_sequence(), 3);

        let reply = reply_of(
            session
                .handle(command_msg(1, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 10);
    }

    #[test]
    fn command_applies_emitted_event_before_reply() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let reply = reply_of(
            session
                .handle(command_msg(1, "Increase", pack(Increase { value: 5 })))
                .unwrap(),
        );
        assert_eq!(reply.events.len(), 1);
        assert_eq!(
            reply.events[0].type_url,
            "type.googleapis.com/test.counter.Increased"
        );
        assert_eq!(session.last_sequence(), 1);

        let reply = reply_of(
            session
                .handle(command_msg(2, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 5);
    }

    #[test]
    fn batch_of_n_events_advances_sequence_by_n() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let reply = reply_of(
            session
                .handle(command_msg(1, "IncreaseTwice", pack(Increase { value: 4 })))
                .unwrap(),
        );
        assert_eq!(reply.events.len(), 2);
        assert_eq!(session.last_sequence(), 2);

        let reply = reply_of(
            session
                .handle(command_msg(2, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 8);
    }

    #[test]
    fn failed_command_changes_nothing_and_attaches_nothing() {
        let mut session = session(2);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let reply = reply_of(
            session
                .handle(command_msg(7, "Increase", pack(Increase { value: 0 })))
                .unwrap(),
        );
        let failure = failure_of(&reply);
        assert_eq!(failure.command_id, 7);
        assert!(failure.description.contains("Cannot increase"));
        assert!(reply.events.is_empty());
        assert!(reply.side_effects.is_empty());
        assert!(reply.snapshot.is_none());
        assert_eq!(session.last_sequence(), 0);

        // The session stays open and continues processing.
        let reply = reply_of(
            session
                .handle(command_msg(8, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 0);
    }

    #[test]
    fn handler_error_is_equivalent_to_fail() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let reply = reply_of(
            session
                .handle(command_msg(3, "Explode", pack(GetCounter {})))
                .unwrap(),
        );
        let failure = failure_of(&reply);
        assert_eq!(failure.command_id, 3);
        assert!(failure.description.contains("counter exploded"));
        assert_eq!(session.last_sequence(), 0);
    }

    #[test]
    fn unknown_command_name_is_fatal() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let err = session
            .handle(command_msg(1, "NoSuchCommand", pack(GetCounter {})))
            .expect_err("unknown command must be fatal");
        assert!(matches!(
            err,
            ProtocolError::MissingCommandHandler { ref command, .. } if command == "NoSuchCommand"
        ));
    }

    #[test]
    fn event_with_unregistered_type_is_fatal() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        let any = prost_types::Any {
            type_url: "type.googleapis.com/test.counter.Unknown".to_string(),
            value: Vec::new(),
        };
        let err = session
            .handle(EventSourcedStreamIn {
                message: Some(event_sourced_stream_in::Message::Event(EventSourcedEvent {
                    sequence: 1,
                    payload: Some(any),
                })),
            })
            .expect_err("unknown payload type must be fatal");
        assert!(matches!(err, ProtocolError::UnknownPayloadType(_)));
    }

    #[test]
    fn decodable_event_without_handler_is_fatal() {
        let mut session = session(0);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        // CounterValue is a registered payload type but not an event type.
        let err = session
            .handle(EventSourcedStreamIn {
                message: Some(event_sourced_stream_in::Message::Event(EventSourcedEvent {
                    sequence: 1,
                    payload: Some(pack(CounterValue { value: 1 })),
                })),
            })
            .expect_err("event without a handler must be fatal");
        assert!(matches!(
            err,
            ProtocolError::MissingEventHandler { ref event_type, .. }
                if event_type == "test.counter.CounterValue"
        ));
    }

    #[test]
    fn snapshot_taken_iff_sequence_is_cadence_multiple() {
        let mut session = session(2);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();

        // Sequence 1: not a multiple of 2.
        let reply = reply_of(
            session
                .handle(command_msg(1, "Increase", pack(Increase { value: 1 })))
                .unwrap(),
        );
        assert!(reply.snapshot.is_none());

        // Sequence 2: cadence boundary.
        let reply = reply_of(
            session
                .handle(command_msg(2, "Increase", pack(Increase { value: 1 })))
                .unwrap(),
        );
        let snapshot = reply.snapshot.expect("snapshot should be attached");
        use prost::Message;
        let value = CounterValue::decode(snapshot.value.as_slice()).unwrap();
        assert_eq!(value.value, 2);

        // Sequence 3: past the boundary again.
        let reply = reply_of(
            session
                .handle(command_msg(3, "Increase", pack(Increase { value: 1 })))
                .unwrap(),
        );
        assert!(reply.snapshot.is_none());
    }

    #[test]
    fn cadence_is_sticky_across_a_batch() {
        let mut session = session(2);
        session.handle(init_msg(SERVICE, "c-1")).unwrap();
        session
            .handle(command_msg(1, "Increase", pack(Increase { value: 1 })))
            .unwrap();

        // Batch covers sequences 2 and 3; 2 is a boundary, so the snapshot
        // triggers even though the batch ends past it, and it captures the
        // state after the whole batch.
        let reply = reply_of(
            session
                .handle(command_msg(2, "IncreaseTwice", pack(Increase { value: 10 })))
                .unwrap(),
        );
        let snapshot = reply.snapshot.expect("sticky cadence should snapshot");
        use prost::Message;
        let value = CounterValue::decode(snapshot.value.as_slice()).unwrap();
        assert_eq!(value.value, 21);
        assert_eq!(session.last_sequence(), 3);
    }

    #[test]
    fn snapshot_restore_on_init() {
        let mut session = session(0);
        session.handle(init_with_snapshot(5, 40)).unwrap();
        assert_eq!(session.last_sequence(), 5);

        let reply = reply_of(
            session
                .handle(command_msg(1, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 40);

        // Replay continues from the snapshot's sequence number.
        session.handle(event_msg(6, 2)).unwrap();
        let reply = reply_of(
            session
                .handle(command_msg(2, "Get", pack(GetCounter {})))
                .unwrap(),
        );
        assert_eq!(reply_value(&reply), 42);
        assert_eq!(session.last_sequence(), 6);
    }

    #[test]
    fn replaying_a_commands_events_reproduces_its_state() {
        // Run commands on one session, replay the acknowledged events on a
        // second session: the final states must agree.
        let mut live = session(0);
        live.handle(init_msg(SERVICE, "c-1")).unwrap();

        let mut journal: Vec<prost_types::Any> = Vec::new();
        for (id, value) in [(1, 3), (2, 4), (3, 10)] {
            let reply = reply_of(
                live.handle(command_msg(id, "Increase", pack(Increase { value })))
                    .unwrap(),
            );
            journal.extend(reply.events);
        }

        let mut replayed = session(0);
        replayed.handle(init_msg(SERVICE, "c-2")).unwrap();
        for (i, event) in journal.into_iter().enumerate() {
            replayed
                .handle(EventSourcedStreamIn {
                    message: Some(event_sourced_stream_in::Message::Event(EventSourcedEvent {
                        sequence: i as i64 + 1,
                        payload: Some(event),
                    })),
                })
                .unwrap();
        }

        let live_value = reply_value(&reply_of(
            live.handle(command_msg(9, "Get", pack(GetCounter {})))
                .unwrap(),
        ));
        let replayed_value = reply_value(&reply_of(
            replayed
                .handle(command_msg(9, "Get", pack(GetCounter {})))
                .unwrap(),
        ));
        assert_eq!(live_value, 17);
        assert_eq!(live_value, replayed_value);
    }
}
