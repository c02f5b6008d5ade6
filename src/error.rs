//! Crate-level error types: registration, per-request, and protocol tiers.
//!
//! The protocol distinguishes two failure tiers. A [`HandlerError`] is a
//! per-request failure: it is recorded into the active client-action context
//! and becomes a `Failure` reply tagged with the originating command id; the
//! session stays open. A [`ProtocolError`] is structural: the stream is
//! terminated and the failure surfaces to the transport as a gRPC status.

use tonic::Status;

use crate::dispatch::SignatureError;

/// Error raised while assembling an entity definition.
///
/// Registration is a startup-time concern, so every variant is fatal for
/// configuration: duplicate keys, invalid handler signatures, and missing
/// required pieces all fail immediately rather than at first use.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// A command handler was already registered under this name.
    #[error("command handler already registered for command {0}")]
    DuplicateCommandHandler(String),

    /// An event handler was already registered for this payload type.
    #[error("event handler already registered for event type {0}")]
    DuplicateEventHandler(String),

    /// The entity already has a snapshot function.
    #[error("snapshot function already registered for this entity")]
    DuplicateSnapshot,

    /// The entity already has a snapshot handler.
    #[error("snapshot handler already registered for this entity")]
    DuplicateSnapshotHandler,

    /// A handler was already registered under this name for this call shape.
    #[error("{kind} handler already registered for command {name}")]
    DuplicateStatelessHandler {
        /// Call shape ("unary", "stream", "stream in", "stream out").
        kind: &'static str,
        /// Command name the second registration collided on.
        name: String,
    },

    /// Two entities were registered under the same service name.
    #[error("an entity is already registered for service {0}")]
    DuplicateService(String),

    /// The entity was built without an initial-state function.
    #[error("event sourced entity {0} has no initial state function")]
    MissingInitState(String),

    /// The handler's declared parameter signature is invalid.
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

/// A per-request failure raised by (or on behalf of) a user handler.
///
/// Semantically equivalent to calling `fail()` on the context: the message
/// is recorded and converted into a `Failure` client action. It never
/// terminates the session.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure description recorded into the client-action context.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Error raised while bootstrapping the server.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// An entity definition failed to assemble into the registry.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// The configured or environment-provided port is not a port number.
    #[error("invalid port {value}: {source}")]
    InvalidPort {
        /// The rejected port value.
        value: String,
        /// Underlying parse error.
        source: std::num::ParseIntError,
    },

    /// Host and port did not combine into a listenable socket address.
    #[error("invalid listen address {value}: {source}")]
    InvalidAddress {
        /// The rejected address.
        value: String,
        /// Underlying parse error.
        source: std::net::AddrParseError,
    },

    /// The gRPC server failed to bind or serve.
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

/// A structural protocol failure. Fatal for the stream it occurred on.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The proxy addressed a service name nothing is registered for.
    #[error("no entity registered for service {0}")]
    UnknownService(String),

    /// A non-Init message arrived before the session was initialised.
    #[error("cannot handle {0} before initialization")]
    NotInitiated(&'static str),

    /// A second Init arrived on an already-initialised session.
    #[error("session already initialized, cannot handle a second init")]
    AlreadyInitiated,

    /// The inbound message carried none of the expected variants.
    #[error("empty or unrecognized protocol message")]
    EmptyMessage,

    /// An envelope referenced a payload type absent from the type registry.
    #[error("no type registered for payload type {0}")]
    UnknownPayloadType(String),

    /// An envelope that must carry a payload carried none.
    #[error("missing payload on {0}")]
    MissingPayload(&'static str),

    /// Payload bytes failed to decode into the registered message type.
    #[error("failed to decode payload of type {type_name}: {source}")]
    PayloadDecode {
        /// Fully qualified payload type name.
        type_name: String,
        /// Underlying prost decode error.
        source: prost::DecodeError,
    },

    /// A command named a handler the entity never registered.
    #[error("missing command handler for entity {service} and command {command}")]
    MissingCommandHandler {
        /// Service name of the entity.
        service: String,
        /// Command name that had no handler.
        command: String,
    },

    /// An event's payload type has no registered event handler.
    #[error("missing event handler for entity {service} and event type {event_type}")]
    MissingEventHandler {
        /// Service name of the entity.
        service: String,
        /// Fully qualified payload type of the unhandled event.
        event_type: String,
    },

    /// Snapshot cadence triggered but the entity has no snapshot function.
    #[error("missing snapshot function for entity {0}")]
    MissingSnapshotFunction(String),

    /// Init carried a snapshot but the entity has no snapshot handler.
    #[error("missing snapshot handler for entity {0}")]
    MissingSnapshotHandler(String),

    /// The snapshot handler failed while restoring state at init. There is
    /// no command in flight, so the stream dies.
    #[error("failed to restore state from snapshot: {0}")]
    SnapshotRestore(String),

    /// The snapshot function failed after the cadence triggered.
    #[error("failed to produce snapshot: {0}")]
    SnapshotProduce(String),

    /// A handler both returned a reply and forwarded. A malformed entity
    /// implementation, not a recoverable request failure.
    #[error("both a reply was returned and a forward was requested, choose one or the other")]
    ReplyAndForward,

    /// The handler produced neither a reply nor a forward where one is required.
    #[error("no reply or forward produced by command handler")]
    NoOutcome,

    /// An event handler failed while applying an event. There is no command
    /// context to record the failure into, so the stream dies.
    #[error("event application failed for event type {event_type}: {message}")]
    EventApplication {
        /// Fully qualified payload type of the failing event.
        event_type: String,
        /// Handler failure description.
        message: String,
    },
}

impl ProtocolError {
    /// Convert into the gRPC status surfaced on the transport.
    ///
    /// Unknown services map to `unimplemented` so the proxy can distinguish
    /// a routing mistake from an internal fault; everything else is an
    /// internal error.
    pub fn into_status(self) -> Status {
        match self {
            ProtocolError::UnknownService(_) => Status::unimplemented(self.to_string()),
            _ => Status::internal(self.to_string()),
        }
    }
}
