//! Message codecs and the codec registry.
//!
//! A codec turns a body into wire bytes and back, and produces the value a
//! local consumer receives (`transform`). Built-in system codecs cover the
//! common body types and are resolved by type; user codecs are resolved by
//! name, or by type once registered as a default codec.

mod builtin;

pub use builtin::{
    BoolCodec, BufferCodec, ByteArrayCodec, ByteCodec, CharCodec, DoubleCodec, FloatCodec,
    IntCodec, JsonCodec, LongCodec, NullCodec, ReplyExceptionCodec, ShortCodec, StringCodec,
};

use crate::types::CodecError;
use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Encodes, decodes, and locally transforms one body type.
pub trait MessageCodec: Send + Sync + 'static {
    /// Type accepted from senders.
    type Outgoing: Any + Send + Sync;
    /// Type handed to consumers.
    type Incoming: Any + Send + Sync;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &Self::Outgoing) -> Result<(), CodecError>;

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<Self::Incoming, CodecError>;

    /// Produce the value delivered to a consumer in the same process.
    /// Mutable or aliasable types must return an independent copy.
    fn transform(&self, value: &Self::Outgoing) -> Self::Incoming;

    /// Unique codec name.
    fn name(&self) -> &str;

    /// Reserved id for system codecs; -1 for user codecs.
    fn system_codec_id(&self) -> i8 {
        -1
    }
}

/// A type-erased message body.
pub(crate) type BoxedBody = Box<dyn Any + Send + Sync>;

/// Object-safe view of a [`MessageCodec`].
pub(crate) trait ErasedCodec: Send + Sync {
    fn name(&self) -> &str;
    fn system_codec_id(&self) -> i8;
    fn outgoing_type(&self) -> TypeId;
    fn outgoing_type_name(&self) -> &'static str;
    fn transform_any(&self, body: &(dyn Any + Send + Sync)) -> Result<BoxedBody, CodecError>;
    fn encode_any(&self, buffer: &mut BytesMut, body: &(dyn Any + Send + Sync)) -> Result<(), CodecError>;
    fn decode_any(&self, bytes: &[u8]) -> Result<BoxedBody, CodecError>;
}

impl fmt::Debug for dyn ErasedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("name", &self.name())
            .field("system_codec_id", &self.system_codec_id())
            .finish()
    }
}

struct CodecAdapter<C>(C);

impl<C: MessageCodec> CodecAdapter<C> {
    fn downcast<'a>(&self, body: &'a (dyn Any + Send + Sync)) -> Result<&'a C::Outgoing, CodecError> {
        body.downcast_ref::<C::Outgoing>()
            .ok_or_else(|| CodecError::TypeMismatch {
                codec: self.0.name().to_string(),
                type_name: std::any::type_name::<C::Outgoing>().to_string(),
            })
    }
}

impl<C: MessageCodec> ErasedCodec for CodecAdapter<C> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn system_codec_id(&self) -> i8 {
        self.0.system_codec_id()
    }

    fn outgoing_type(&self) -> TypeId {
        TypeId::of::<C::Outgoing>()
    }

    fn outgoing_type_name(&self) -> &'static str {
        std::any::type_name::<C::Outgoing>()
    }

    fn transform_any(&self, body: &(dyn Any + Send + Sync)) -> Result<BoxedBody, CodecError> {
        let value = self.downcast(body)?;
        let transformed: BoxedBody = Box::new(self.0.transform(value));
        Ok(transformed)
    }

    fn encode_any(&self, buffer: &mut BytesMut, body: &(dyn Any + Send + Sync)) -> Result<(), CodecError> {
        let value = self.downcast(body)?;
        self.0.encode_to_wire(buffer, value)
    }

    fn decode_any(&self, bytes: &[u8]) -> Result<BoxedBody, CodecError> {
        let decoded: BoxedBody = Box::new(self.0.decode_from_wire(bytes)?);
        Ok(decoded)
    }
}

pub(crate) fn erase<C: MessageCodec>(codec: C) -> Arc<dyn ErasedCodec> {
    Arc::new(CodecAdapter(codec))
}

/// A body in wire form, tagged with the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    /// System codec id, or -1 for a user codec.
    pub codec_id: i8,
    /// Set for user codecs only.
    pub codec_name: Option<String>,
    pub bytes: Bytes,
}

/// Registry resolving bodies to codecs.
pub struct CodecManager {
    /// Indexed by system codec id.
    system: Vec<Arc<dyn ErasedCodec>>,
    system_by_type: HashMap<TypeId, usize>,
    user: DashMap<String, Arc<dyn ErasedCodec>>,
    defaults: DashMap<TypeId, Arc<dyn ErasedCodec>>,
}

impl fmt::Debug for CodecManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecManager")
            .field("system", &self.system.len())
            .field("user", &self.user.len())
            .field("defaults", &self.defaults.len())
            .finish()
    }
}

impl Default for CodecManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecManager {
    pub fn new() -> Self {
        let system = builtin::system_codecs();
        let system_by_type = system
            .iter()
            .enumerate()
            .map(|(index, codec)| (codec.outgoing_type(), index))
            .collect();
        Self {
            system,
            system_by_type,
            user: DashMap::new(),
            defaults: DashMap::new(),
        }
    }

    /// Resolve the codec for a body of type `B`.
    ///
    /// An explicit `codec_name` must name a registered user codec accepting
    /// `B`. Otherwise the body type selects a system codec, then a default
    /// codec.
    pub(crate) fn lookup_codec<B: Any>(&self, codec_name: Option<&str>) -> Result<Arc<dyn ErasedCodec>, CodecError> {
        if let Some(name) = codec_name {
            let codec = self
                .user
                .get(name)
                .map(|c| Arc::clone(c.value()))
                .ok_or_else(|| CodecError::UnknownCodec(name.to_string()))?;
            if codec.outgoing_type() != TypeId::of::<B>() {
                return Err(CodecError::TypeMismatch {
                    codec: name.to_string(),
                    type_name: std::any::type_name::<B>().to_string(),
                });
            }
            return Ok(codec);
        }

        let type_id = TypeId::of::<B>();
        if let Some(index) = self.system_by_type.get(&type_id) {
            return Ok(Arc::clone(&self.system[*index]));
        }
        self.defaults
            .get(&type_id)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CodecError::UnknownType(std::any::type_name::<B>().to_string()))
    }

    /// Register a named user codec.
    pub fn register_codec<C: MessageCodec>(&self, codec: C) -> Result<(), CodecError> {
        self.insert_named(erase(codec))
    }

    /// Remove a named user codec. Returns false if it was not registered.
    pub fn unregister_codec(&self, name: &str) -> bool {
        self.user.remove(name).is_some()
    }

    /// Register a codec used implicitly for bodies of its outgoing type.
    /// Its name is registered as well.
    pub fn register_default_codec<C: MessageCodec>(&self, codec: C) -> Result<(), CodecError> {
        let codec = erase(codec);
        let type_id = codec.outgoing_type();
        if codec.system_codec_id() != -1 {
            return Err(CodecError::IllegalCodec(codec.name().to_string()));
        }
        if self.system_by_type.contains_key(&type_id) || self.defaults.contains_key(&type_id) {
            return Err(CodecError::DuplicateDefault(
                codec.outgoing_type_name().to_string(),
            ));
        }
        self.insert_named(Arc::clone(&codec))?;
        match self.defaults.entry(type_id) {
            Entry::Occupied(_) => {
                self.user.remove(codec.name());
                Err(CodecError::DuplicateDefault(
                    codec.outgoing_type_name().to_string(),
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(codec);
                Ok(())
            }
        }
    }

    /// Remove the default codec for `T`, and its name.
    pub fn unregister_default_codec<T: Any>(&self) -> bool {
        match self.defaults.remove(&TypeId::of::<T>()) {
            Some((_, codec)) => {
                self.user.remove(codec.name());
                true
            }
            None => false,
        }
    }

    fn insert_named(&self, codec: Arc<dyn ErasedCodec>) -> Result<(), CodecError> {
        if codec.system_codec_id() != -1 {
            return Err(CodecError::IllegalCodec(codec.name().to_string()));
        }
        if self.system.iter().any(|s| s.name() == codec.name()) {
            return Err(CodecError::DuplicateName(codec.name().to_string()));
        }
        match self.user.entry(codec.name().to_string()) {
            Entry::Occupied(_) => Err(CodecError::DuplicateName(codec.name().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(codec);
                Ok(())
            }
        }
    }

    /// Encode `body` with its resolved codec, for transports.
    pub fn encode_body<B: Any + Send + Sync>(&self, body: &B, codec_name: Option<&str>) -> Result<EncodedBody, CodecError> {
        let codec = self.lookup_codec::<B>(codec_name)?;
        let mut buffer = BytesMut::new();
        codec.encode_any(&mut buffer, body)?;
        let codec_id = codec.system_codec_id();
        Ok(EncodedBody {
            codec_id,
            codec_name: (codec_id == -1).then(|| codec.name().to_string()),
            bytes: buffer.freeze(),
        })
    }

    /// Decode wire bytes with the codec named by id, or by name for user codecs.
    pub fn decode_body(
        &self,
        codec_id: i8,
        codec_name: Option<&str>,
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send + Sync>, CodecError> {
        self.wire_codec(codec_id, codec_name)?.decode_any(bytes)
    }

    pub(crate) fn wire_codec(&self, codec_id: i8, codec_name: Option<&str>) -> Result<Arc<dyn ErasedCodec>, CodecError> {
        if codec_id >= 0 {
            return self
                .system_codec(codec_id)
                .ok_or_else(|| CodecError::UnknownCodec(format!("system codec {}", codec_id)));
        }
        let name = codec_name.unwrap_or_default();
        self.user_codec(name)
            .ok_or_else(|| CodecError::UnknownCodec(name.to_string()))
    }

    pub(crate) fn system_codec(&self, id: i8) -> Option<Arc<dyn ErasedCodec>> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.system.get(index))
            .map(Arc::clone)
    }

    pub(crate) fn user_codec(&self, name: &str) -> Option<Arc<dyn ErasedCodec>> {
        self.user.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Names of all built-in codecs, ordered by system id.
    pub fn system_codec_names(&self) -> Vec<&str> {
        self.system.iter().map(|c| c.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    struct PointCodec(&'static str);

    impl MessageCodec for PointCodec {
        type Outgoing = Point;
        type Incoming = Point;

        fn encode_to_wire(&self, buffer: &mut BytesMut, value: &Point) -> Result<(), CodecError> {
            buffer.put_i32(value.x);
            buffer.put_i32(value.y);
            Ok(())
        }

        fn decode_from_wire(&self, bytes: &[u8]) -> Result<Point, CodecError> {
            if bytes.len() != 8 {
                return Err(CodecError::decode(self.0, "expected 8 bytes"));
            }
            let x = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let y = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            Ok(Point { x, y })
        }

        fn transform(&self, value: &Point) -> Point {
            value.clone()
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct FakeSystemCodec;

    impl MessageCodec for FakeSystemCodec {
        type Outgoing = Point;
        type Incoming = Point;

        fn encode_to_wire(&self, _buffer: &mut BytesMut, _value: &Point) -> Result<(), CodecError> {
            Ok(())
        }

        fn decode_from_wire(&self, _bytes: &[u8]) -> Result<Point, CodecError> {
            Ok(Point { x: 0, y: 0 })
        }

        fn transform(&self, value: &Point) -> Point {
            value.clone()
        }

        fn name(&self) -> &str {
            "fake-system"
        }

        fn system_codec_id(&self) -> i8 {
            3
        }
    }

    #[test]
    fn test_builtin_lookup_by_type() {
        let manager = CodecManager::new();
        assert_eq!(manager.lookup_codec::<String>(None).unwrap().name(), "string");
        assert_eq!(manager.lookup_codec::<Bytes>(None).unwrap().name(), "buffer");
        assert_eq!(manager.lookup_codec::<i64>(None).unwrap().system_codec_id(), 6);
        assert_eq!(manager.lookup_codec::<()>(None).unwrap().system_codec_id(), 0);
    }

    #[test]
    fn test_system_ids_are_dense() {
        let manager = CodecManager::new();
        for (index, name) in manager.system_codec_names().iter().enumerate() {
            let codec = manager.system_codec(index as i8).unwrap();
            assert_eq!(codec.name(), *name);
            assert_eq!(codec.system_codec_id() as usize, index);
        }
        assert!(manager.system_codec(-1).is_none());
    }

    #[test]
    fn test_unknown_type_and_name() {
        let manager = CodecManager::new();
        assert!(matches!(
            manager.lookup_codec::<Point>(None),
            Err(CodecError::UnknownType(_))
        ));
        assert!(matches!(
            manager.lookup_codec::<Point>(Some("point")),
            Err(CodecError::UnknownCodec(_))
        ));
    }

    #[test]
    fn test_named_codec_registration() {
        let manager = CodecManager::new();
        manager.register_codec(PointCodec("point")).unwrap();
        assert_eq!(
            manager.register_codec(PointCodec("point")),
            Err(CodecError::DuplicateName("point".to_string()))
        );
        assert_eq!(
            manager.lookup_codec::<Point>(Some("point")).unwrap().name(),
            "point"
        );
        // Named codecs are not used implicitly
        assert!(manager.lookup_codec::<Point>(None).is_err());
        // Wrong body type for an explicit codec
        assert!(matches!(
            manager.lookup_codec::<String>(Some("point")),
            Err(CodecError::TypeMismatch { .. })
        ));

        assert!(manager.unregister_codec("point"));
        assert!(!manager.unregister_codec("point"));
    }

    #[test]
    fn test_system_codecs_cannot_be_registered() {
        let manager = CodecManager::new();
        assert!(matches!(
            manager.register_codec(FakeSystemCodec),
            Err(CodecError::IllegalCodec(_))
        ));
        assert!(matches!(
            manager.register_default_codec(FakeSystemCodec),
            Err(CodecError::IllegalCodec(_))
        ));
        assert!(matches!(
            manager.register_codec(PointCodec("string")),
            Err(CodecError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_default_codec_lifecycle() {
        let manager = CodecManager::new();
        manager.register_default_codec(PointCodec("point")).unwrap();
        assert_eq!(manager.lookup_codec::<Point>(None).unwrap().name(), "point");
        // The name is taken as well
        assert!(manager.user_codec("point").is_some());

        assert!(matches!(
            manager.register_default_codec(PointCodec("other-point")),
            Err(CodecError::DuplicateDefault(_))
        ));

        assert!(manager.unregister_default_codec::<Point>());
        assert!(manager.user_codec("point").is_none());
        assert!(manager.lookup_codec::<Point>(None).is_err());
        assert!(!manager.unregister_default_codec::<Point>());
    }

    #[test]
    fn test_erased_transform_and_wire() {
        let manager = CodecManager::new();
        manager.register_default_codec(PointCodec("point")).unwrap();
        let codec = manager.lookup_codec::<Point>(None).unwrap();

        let body = Point { x: 3, y: -4 };
        let local = codec.transform_any(&body).unwrap();
        assert_eq!(local.downcast_ref::<Point>(), Some(&body));

        let mut buffer = BytesMut::new();
        codec.encode_any(&mut buffer, &body).unwrap();
        let decoded = codec.decode_any(&buffer).unwrap();
        assert_eq!(decoded.downcast_ref::<Point>(), Some(&body));

        let wrong: String = "nope".to_string();
        assert!(codec.transform_any(&wrong).is_err());
    }

    #[test]
    fn test_encode_body_tags_codec() {
        let manager = CodecManager::new();
        let encoded = manager.encode_body(&42i32, None).unwrap();
        assert_eq!(encoded.codec_id, 5);
        assert_eq!(encoded.codec_name, None);
        let decoded = manager.decode_body(5, None, &encoded.bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<i32>(), Some(&42));

        manager.register_codec(PointCodec("point")).unwrap();
        let point = Point { x: 1, y: 2 };
        let encoded = manager.encode_body(&point, Some("point")).unwrap();
        assert_eq!(encoded.codec_id, -1);
        assert_eq!(encoded.codec_name.as_deref(), Some("point"));
        assert!(matches!(
            manager.decode_body(-1, Some("missing"), &encoded.bytes),
            Err(CodecError::UnknownCodec(_))
        ));
    }
}
