//! Built-in system codecs. Ids are dense and index the system codec table.

use super::{erase, ErasedCodec, MessageCodec};
use crate::eventbus::{ReplyException, ReplyFailure};
use crate::types::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// All system codecs, ordered by id.
pub(crate) fn system_codecs() -> Vec<Arc<dyn ErasedCodec>> {
    vec![
        erase(NullCodec),
        erase(StringCodec),
        erase(BufferCodec),
        erase(JsonCodec),
        erase(ByteArrayCodec),
        erase(IntCodec),
        erase(LongCodec),
        erase(FloatCodec),
        erase(DoubleCodec),
        erase(BoolCodec),
        erase(ShortCodec),
        erase(CharCodec),
        erase(ByteCodec),
        erase(ReplyExceptionCodec),
    ]
}

fn expect_len(codec: &str, bytes: &[u8], len: usize) -> Result<(), CodecError> {
    if bytes.len() == len {
        Ok(())
    } else {
        Err(CodecError::decode(
            codec,
            format!("expected {} bytes, got {}", len, bytes.len()),
        ))
    }
}

/// Fixed-width numeric codecs: big-endian on the wire, copied locally.
macro_rules! fixed_width_codec {
    ($codec:ident, $ty:ty, $name:literal, $id:literal, $put:ident, $get:ident) => {
        #[doc = concat!("System codec `", $name, "` for `", stringify!($ty), "`.")]
        #[derive(Debug, Default, Clone, Copy)]
        pub struct $codec;

        impl MessageCodec for $codec {
            type Outgoing = $ty;
            type Incoming = $ty;

            fn encode_to_wire(&self, buffer: &mut BytesMut, value: &$ty) -> Result<(), CodecError> {
                buffer.$put(*value);
                Ok(())
            }

            fn decode_from_wire(&self, bytes: &[u8]) -> Result<$ty, CodecError> {
                expect_len($name, bytes, std::mem::size_of::<$ty>())?;
                let mut cursor = bytes;
                Ok(cursor.$get())
            }

            fn transform(&self, value: &$ty) -> $ty {
                *value
            }

            fn name(&self) -> &str {
                $name
            }

            fn system_codec_id(&self) -> i8 {
                $id
            }
        }
    };
}

fixed_width_codec!(IntCodec, i32, "int", 5, put_i32, get_i32);
fixed_width_codec!(LongCodec, i64, "long", 6, put_i64, get_i64);
fixed_width_codec!(FloatCodec, f32, "float", 7, put_f32, get_f32);
fixed_width_codec!(DoubleCodec, f64, "double", 8, put_f64, get_f64);
fixed_width_codec!(ShortCodec, i16, "short", 10, put_i16, get_i16);
fixed_width_codec!(ByteCodec, i8, "byte", 12, put_i8, get_i8);

/// System codec `null` for `()`. Encodes to nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCodec;

impl MessageCodec for NullCodec {
    type Outgoing = ();
    type Incoming = ();

    fn encode_to_wire(&self, _buffer: &mut BytesMut, _value: &()) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<(), CodecError> {
        expect_len(self.name(), bytes, 0)
    }

    fn transform(&self, _value: &()) {}

    fn name(&self) -> &str {
        "null"
    }

    fn system_codec_id(&self) -> i8 {
        0
    }
}

/// System codec `string` for `String` (UTF-8).
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl MessageCodec for StringCodec {
    type Outgoing = String;
    type Incoming = String;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &String) -> Result<(), CodecError> {
        buffer.put_slice(value.as_bytes());
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::decode(self.name(), e.to_string()))
    }

    fn transform(&self, value: &String) -> String {
        value.clone()
    }

    fn name(&self) -> &str {
        "string"
    }

    fn system_codec_id(&self) -> i8 {
        1
    }
}

/// System codec `buffer` for [`Bytes`]. Bytes are immutable, so local
/// delivery shares the allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferCodec;

impl MessageCodec for BufferCodec {
    type Outgoing = Bytes;
    type Incoming = Bytes;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &Bytes) -> Result<(), CodecError> {
        buffer.put_slice(value);
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn transform(&self, value: &Bytes) -> Bytes {
        value.clone()
    }

    fn name(&self) -> &str {
        "buffer"
    }

    fn system_codec_id(&self) -> i8 {
        2
    }
}

/// System codec `json` for [`serde_json::Value`]. Local delivery deep-copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    type Outgoing = serde_json::Value;
    type Incoming = serde_json::Value;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &serde_json::Value) -> Result<(), CodecError> {
        serde_json::to_writer(buffer.writer(), value)
            .map_err(|e| CodecError::decode(self.name(), e.to_string()))
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<serde_json::Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::decode(self.name(), e.to_string()))
    }

    fn transform(&self, value: &serde_json::Value) -> serde_json::Value {
        value.clone()
    }

    fn name(&self) -> &str {
        "json"
    }

    fn system_codec_id(&self) -> i8 {
        3
    }
}

/// System codec `bytearray` for `Vec<u8>`. Local delivery copies the vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteArrayCodec;

impl MessageCodec for ByteArrayCodec {
    type Outgoing = Vec<u8>;
    type Incoming = Vec<u8>;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &Vec<u8>) -> Result<(), CodecError> {
        buffer.put_slice(value);
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn transform(&self, value: &Vec<u8>) -> Vec<u8> {
        value.clone()
    }

    fn name(&self) -> &str {
        "bytearray"
    }

    fn system_codec_id(&self) -> i8 {
        4
    }
}

/// System codec `boolean` for `bool`, one byte on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoolCodec;

impl MessageCodec for BoolCodec {
    type Outgoing = bool;
    type Incoming = bool;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &bool) -> Result<(), CodecError> {
        buffer.put_u8(u8::from(*value));
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<bool, CodecError> {
        expect_len(self.name(), bytes, 1)?;
        Ok(bytes[0] != 0)
    }

    fn transform(&self, value: &bool) -> bool {
        *value
    }

    fn name(&self) -> &str {
        "boolean"
    }

    fn system_codec_id(&self) -> i8 {
        9
    }
}

/// System codec `char` for `char`, a big-endian `u32` scalar value.
#[derive(Debug, Default, Clone, Copy)]
pub struct CharCodec;

impl MessageCodec for CharCodec {
    type Outgoing = char;
    type Incoming = char;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &char) -> Result<(), CodecError> {
        buffer.put_u32(u32::from(*value));
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<char, CodecError> {
        expect_len(self.name(), bytes, 4)?;
        let mut cursor = bytes;
        let raw = cursor.get_u32();
        char::from_u32(raw)
            .ok_or_else(|| CodecError::decode(self.name(), format!("invalid scalar value {:#x}", raw)))
    }

    fn transform(&self, value: &char) -> char {
        *value
    }

    fn name(&self) -> &str {
        "char"
    }

    fn system_codec_id(&self) -> i8 {
        11
    }
}

/// System codec for [`ReplyException`] bodies.
///
/// Layout: failure type `i8`, failure code `i32`, UTF-8 message.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyExceptionCodec;

impl MessageCodec for ReplyExceptionCodec {
    type Outgoing = ReplyException;
    type Incoming = ReplyException;

    fn encode_to_wire(&self, buffer: &mut BytesMut, value: &ReplyException) -> Result<(), CodecError> {
        buffer.put_i8(value.failure_type().to_i8());
        buffer.put_i32(value.failure_code());
        buffer.put_slice(value.message().as_bytes());
        Ok(())
    }

    fn decode_from_wire(&self, bytes: &[u8]) -> Result<ReplyException, CodecError> {
        if bytes.len() < 5 {
            return Err(CodecError::decode(self.name(), "truncated reply exception"));
        }
        let mut cursor = bytes;
        let raw_type = cursor.get_i8();
        let failure_type = ReplyFailure::from_i8(raw_type).ok_or_else(|| {
            CodecError::decode(self.name(), format!("unknown failure type {}", raw_type))
        })?;
        let failure_code = cursor.get_i32();
        let message = std::str::from_utf8(cursor)
            .map_err(|e| CodecError::decode(self.name(), e.to_string()))?;
        Ok(ReplyException::new(failure_type, failure_code, message))
    }

    fn transform(&self, value: &ReplyException) -> ReplyException {
        value.clone()
    }

    fn name(&self) -> &str {
        "replyexception"
    }

    fn system_codec_id(&self) -> i8 {
        13
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire<C: MessageCodec>(codec: &C, value: &C::Outgoing) -> BytesMut {
        let mut buffer = BytesMut::new();
        codec.encode_to_wire(&mut buffer, value).unwrap();
        buffer
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        assert_eq!(&wire(&IntCodec, &1)[..], &[0, 0, 0, 1]);
        assert_eq!(&wire(&ShortCodec, &-2)[..], &[0xff, 0xfe]);
        assert_eq!(LongCodec.decode_from_wire(&[0, 0, 0, 0, 0, 0, 1, 0]).unwrap(), 256);
    }

    #[test]
    fn test_fixed_width_rejects_wrong_length() {
        let err = IntCodec.decode_from_wire(&[1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_char_rejects_surrogates() {
        assert_eq!(CharCodec.decode_from_wire(&wire(&CharCodec, &'é')).unwrap(), 'é');
        assert!(CharCodec.decode_from_wire(&[0, 0, 0xd8, 0]).is_err());
    }

    #[test]
    fn test_json_wire_format() {
        let value = json!({"user": "ada", "roles": ["admin"]});
        let bytes = wire(&JsonCodec, &value);
        assert_eq!(JsonCodec.decode_from_wire(&bytes).unwrap(), value);
        assert!(JsonCodec.decode_from_wire(b"{oops").is_err());
    }

    #[test]
    fn test_invalid_utf8_string() {
        assert!(StringCodec.decode_from_wire(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_buffer_transform_shares_allocation() {
        let original = Bytes::from_static(b"payload");
        let local = BufferCodec.transform(&original);
        assert_eq!(local.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_bytearray_transform_copies() {
        let original = vec![1u8, 2, 3];
        let local = ByteArrayCodec.transform(&original);
        assert_eq!(local, original);
        assert_ne!(local.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_reply_exception_wire() {
        let failure = ReplyException::recipient_failure(42, "bad input");
        let decoded = ReplyExceptionCodec
            .decode_from_wire(&wire(&ReplyExceptionCodec, &failure))
            .unwrap();
        assert_eq!(decoded, failure);
        assert!(ReplyExceptionCodec.decode_from_wire(&[2, 0]).is_err());
    }
}
