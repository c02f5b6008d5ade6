//! Dynamic payload codec: resolves `google.protobuf.Any` envelopes to
//! concrete message types and packs typed values back into envelopes.
//!
//! Every payload on the wire travels as an `Any` whose `type_url` is
//! `type.googleapis.com/<fully-qualified-type-name>`. The [`TypeRegistry`]
//! maps type names to decoders; [`Payload`] is the decoded, type-erased
//! value handed to user handlers, downcastable to the concrete type.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::error::ProtocolError;

/// Type URL prefix the proxy uses for all payload envelopes.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Object-safe view over a prost message: downcast, re-encode, self-describe.
///
/// Blanket-implemented for every `prost::Name` message, so any generated
/// (or hand-derived) proto type can travel as a [`Payload`].
trait AnyMessage: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn encode_bytes(&self) -> Vec<u8>;
    fn type_name(&self) -> String;
}

impl<T> AnyMessage for T
where
    T: prost::Name + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn type_name(&self) -> String {
        T::full_name()
    }
}

/// A decoded, dynamically typed protocol payload.
///
/// Wraps a concrete prost message behind type erasure so the session and
/// dispatch layers can move payloads around without knowing their types.
/// Handlers recover the concrete type with [`Payload::downcast_ref`].
pub struct Payload {
    inner: Box<dyn AnyMessage>,
}

impl Payload {
    /// Wrap a typed message.
    pub fn new<T>(message: T) -> Self
    where
        T: prost::Name + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(message),
        }
    }

    /// Downcast to the concrete message type, if it matches.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Fully qualified proto type name of the wrapped message.
    pub fn type_name(&self) -> String {
        self.inner.type_name()
    }

    /// Pack into an `Any` envelope using the standard type URL convention.
    pub fn to_any(&self) -> prost_types::Any {
        prost_types::Any {
            type_url: format!("{TYPE_URL_PREFIX}{}", self.inner.type_name()),
            value: self.inner.encode_bytes(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type_name", &self.inner.type_name())
            .finish()
    }
}

/// Decoder function stored per registered type.
type DecodeFn = fn(&[u8]) -> Result<Payload, prost::DecodeError>;

fn decode_as<T>(bytes: &[u8]) -> Result<Payload, prost::DecodeError>
where
    T: prost::Name + Default + Send + Sync + 'static,
{
    T::decode(bytes).map(Payload::new)
}

/// Process-wide registry of payload types the codec can resolve.
///
/// Populated at registration time (entity builders register the payload
/// types their handlers declare) and merged into one immutable registry
/// when the server is assembled. Lookups after that point are concurrent
/// reads behind an `Arc`.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<String, DecodeFn>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under its fully qualified proto name.
    ///
    /// Re-registering the same type is a no-op; the decoder for a given
    /// name is identical wherever it comes from.
    pub fn register<T>(&mut self)
    where
        T: prost::Name + Default + Send + Sync + 'static,
    {
        self.decoders.insert(T::full_name(), decode_as::<T>);
    }

    /// Whether a decoder exists for this fully qualified type name.
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Absorb every registration from `other`. Decoders are plain function
    /// pointers, so copying them is free.
    pub fn merge(&mut self, other: &TypeRegistry) {
        for (name, decoder) in &other.decoders {
            self.decoders.insert(name.clone(), *decoder);
        }
    }

    /// Decode an `Any` envelope into a typed [`Payload`].
    ///
    /// Strips the `type.googleapis.com/` prefix from the envelope's type
    /// URL, resolves the decoder, and parses the payload bytes.
    ///
    /// # Errors
    ///
    /// * [`ProtocolError::UnknownPayloadType`] if no decoder is registered
    ///   for the envelope's type name. Fatal for the stream.
    /// * [`ProtocolError::PayloadDecode`] if the bytes do not parse.
    pub fn decode(&self, envelope: &prost_types::Any) -> Result<Payload, ProtocolError> {
        let type_name = envelope
            .type_url
            .strip_prefix(TYPE_URL_PREFIX)
            .unwrap_or(&envelope.type_url);

        let decoder = self
            .decoders
            .get(type_name)
            .ok_or_else(|| ProtocolError::UnknownPayloadType(type_name.to_string()))?;

        decoder(&envelope.value).map_err(|source| ProtocolError::PayloadDecode {
            type_name: type_name.to_string(),
            source,
        })
    }
}

// Lists type names rather than decoder function pointers.
impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("types", &names)
            .finish()
    }
}
