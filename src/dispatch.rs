//! Handler parameter binding: declared roles, validated at registration.
//!
//! Each handler declares, in its own order, which call-scoped values it
//! wants: the entity state, the decoded payload, and/or the context. The
//! declaration is validated once, when the handler is registered, against
//! the handler kind's maximum arity and allowed role set. At invocation the
//! call scope exposes exactly the declared roles; everything else is
//! withheld.

/// The semantic role a handler parameter binds to.
///
/// Binding is by role, never by position: a command handler that needs no
/// state simply does not declare [`ParamRole::State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// The entity's current state. Only available to event-sourced handlers.
    State,
    /// The decoded command, event, or snapshot payload.
    Payload,
    /// The call-scoped context (command context, event context, ...).
    Context,
}

impl ParamRole {
    fn name(self) -> &'static str {
        match self {
            ParamRole::State => "state",
            ParamRole::Payload => "payload",
            ParamRole::Context => "context",
        }
    }
}

/// The kind of handler a signature is declared for. Determines the maximum
/// parameter count and which roles the call scope can supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Event-sourced command handler: up to state, payload, and context.
    Command,
    /// Event handler: at most two of state, payload, and context.
    Event,
    /// Snapshot producer: at most two of state and context.
    Snapshot,
    /// Snapshot handler: at most two of state, payload, and context.
    SnapshotHandler,
    /// Action / stateless-function handler: at most payload and context.
    Stateless,
}

impl HandlerKind {
    fn max_params(self) -> usize {
        match self {
            HandlerKind::Command => 3,
            HandlerKind::Event | HandlerKind::Snapshot | HandlerKind::SnapshotHandler => 2,
            HandlerKind::Stateless => 2,
        }
    }

    fn allows(self, role: ParamRole) -> bool {
        match self {
            // Stateless protocols have no entity state to bind.
            HandlerKind::Stateless => role != ParamRole::State,
            // The snapshot producer's call scope is just state and context.
            HandlerKind::Snapshot => role != ParamRole::Payload,
            _ => true,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            HandlerKind::Command => "command handler",
            HandlerKind::Event => "event handler",
            HandlerKind::Snapshot => "snapshot function",
            HandlerKind::SnapshotHandler => "snapshot handler",
            HandlerKind::Stateless => "stateless handler",
        }
    }
}

/// An invalid parameter declaration, detected at registration.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// More parameters declared than the handler kind accepts.
    #[error("{kind} accepts at most {max} parameters, {declared} declared")]
    TooManyParameters {
        /// Human description of the handler kind.
        kind: &'static str,
        /// Number of roles declared.
        declared: usize,
        /// Maximum arity for the kind.
        max: usize,
    },

    /// The same role declared more than once.
    #[error("parameter role {role} declared more than once")]
    DuplicateRole {
        /// The repeated role's name.
        role: &'static str,
    },

    /// A role declared that the handler kind's call scope never supplies.
    #[error("{kind} has no {role} value to bind")]
    UnavailableRole {
        /// Human description of the handler kind.
        kind: &'static str,
        /// The unbindable role's name.
        role: &'static str,
    },
}

/// A validated parameter declaration for one handler.
#[derive(Debug, Clone)]
pub struct Signature {
    roles: Vec<ParamRole>,
}

impl Signature {
    /// Validate a declared role list against a handler kind.
    ///
    /// Checks arity, uniqueness, and that every role is bindable for the
    /// kind. Called by the registration API; a failure aborts registration.
    ///
    /// # Errors
    ///
    /// Any [`SignatureError`] variant, depending on which rule is broken.
    pub fn validate(
        roles: impl Into<Vec<ParamRole>>,
        kind: HandlerKind,
    ) -> Result<Self, SignatureError> {
        let roles = roles.into();

        if roles.len() > kind.max_params() {
            return Err(SignatureError::TooManyParameters {
                kind: kind.describe(),
                declared: roles.len(),
                max: kind.max_params(),
            });
        }

        for (i, role) in roles.iter().enumerate() {
            if roles[..i].contains(role) {
                return Err(SignatureError::DuplicateRole { role: role.name() });
            }
            if !kind.allows(*role) {
                return Err(SignatureError::UnavailableRole {
                    kind: kind.describe(),
                    role: role.name(),
                });
            }
        }

        Ok(Self { roles })
    }

    /// Whether this handler declared the given role.
    pub fn declares(&self, role: ParamRole) -> bool {
        self.roles.contains(&role)
    }

    /// The declared roles, in declaration order.
    pub fn roles(&self) -> &[ParamRole] {
        &self.roles
    }
}
