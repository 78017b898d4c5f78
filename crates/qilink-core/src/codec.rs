//! Binary codec: little-endian, length-prefixed containers, signature
//! driven.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Body, DecodeError, EncodeError, MetaObject, ObjectReference, Type, Value};

/// Builds an outbound payload. Pre-encoded buffers can be stitched in with
/// [`Encoder::append_buffer`] without copying.
#[derive(Debug, Default)]
pub struct Encoder {
    segments: Vec<Bytes>,
    tail: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.tail.put_u8(v);
    }

    pub fn write_i8(&mut self, v: i8) {
        self.tail.put_i8(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.tail.put_u8(v as u8);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.tail.put_u16_le(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.tail.put_u32_le(v);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.tail.put_i32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.tail.put_i64_le(v);
    }

    pub fn write_f32(&mut self, v: f32) {
        self.tail.put_f32_le(v);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.tail.put_f64_le(v);
    }

    pub fn write_str(&mut self, v: &str) {
        self.write_u32(v.len() as u32);
        self.tail.put_slice(v.as_bytes());
    }

    pub fn write_raw(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.tail.put_slice(v);
    }

    /// Stitch a pre-encoded buffer into the payload without copying. The
    /// caller is responsible for having written any length prefix.
    pub fn append_buffer(&mut self, buf: Bytes) {
        if !self.tail.is_empty() {
            self.segments.push(self.tail.split().freeze());
        }
        self.segments.push(buf);
    }

    /// Encode a value by its own structure.
    pub fn write_value(&mut self, value: &Value) -> Result<(), EncodeError> {
        match value {
            Value::Void => {}
            Value::Bool(v) => self.write_bool(*v),
            Value::Int8(v) => self.write_i8(*v),
            Value::Int32(v) => self.write_i32(*v),
            Value::UInt32(v) => self.write_u32(*v),
            Value::Int64(v) => self.write_i64(*v),
            Value::Float(v) => self.write_f32(*v),
            Value::Double(v) => self.write_f64(*v),
            Value::String(v) => self.write_str(v),
            Value::Raw(v) => self.write_raw(v),
            Value::List(items) => {
                self.write_u32(items.len() as u32);
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(entries) => {
                self.write_u32(entries.len() as u32);
                for (k, v) in entries {
                    self.write_value(k)?;
                    self.write_value(v)?;
                }
            }
            Value::Tuple(items) => {
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Dynamic(inner) => {
                self.write_str(&inner.signature().to_string());
                self.write_value(inner)?;
            }
            Value::Object(r) => {
                self.write_value(&r.meta.to_value())?;
                self.write_u32(r.service);
                self.write_u32(r.object);
            }
        }
        Ok(())
    }

    /// Encode a value against a declared signature, wrapping or unwrapping
    /// dynamics as needed. A structural mismatch is an error.
    pub fn write_value_as(&mut self, value: &Value, ty: &Type) -> Result<(), EncodeError> {
        let mismatch = || EncodeError::SignatureMismatch {
            expected: ty.to_string(),
            found: value.signature().to_string(),
        };
        match (ty, value) {
            (Type::Dynamic, Value::Dynamic(_)) => self.write_value(value)?,
            (Type::Dynamic, concrete) => {
                self.write_str(&concrete.signature().to_string());
                self.write_value(concrete)?;
            }
            (ty, Value::Dynamic(inner)) => self.write_value_as(inner, ty)?,
            (Type::Void, Value::Void) => {}
            (Type::List(elem), Value::List(items)) => {
                self.write_u32(items.len() as u32);
                for item in items {
                    self.write_value_as(item, elem)?;
                }
            }
            (Type::Map(kt, vt), Value::Map(entries)) => {
                self.write_u32(entries.len() as u32);
                for (k, v) in entries {
                    self.write_value_as(k, kt)?;
                    self.write_value_as(v, vt)?;
                }
            }
            (Type::Tuple(tys), Value::Tuple(items)) => {
                if tys.len() != items.len() {
                    return Err(mismatch());
                }
                for (item, ty) in items.iter().zip(tys) {
                    self.write_value_as(item, ty)?;
                }
            }
            (Type::Object, Value::Object(_)) => self.write_value(value)?,
            (ty, value) if *ty == value.signature() => self.write_value(value)?,
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    pub fn finish(mut self) -> Body {
        if !self.tail.is_empty() {
            self.segments.push(self.tail.freeze());
        }
        Body::from_segments(self.segments)
    }
}

/// Reads values out of a contiguous payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        let len = self.read_u32()?;
        let bytes = self
            .take(len as usize)
            .map_err(|_| DecodeError::BadLength(len))?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn read_raw(&mut self) -> Result<Bytes, DecodeError> {
        let len = self.read_u32()?;
        let bytes = self
            .take(len as usize)
            .map_err(|_| DecodeError::BadLength(len))?;
        Ok(Bytes::copy_from_slice(bytes))
    }

    /// Read a count prefix, bounding it by what the payload could possibly
    /// hold.
    fn read_count(&mut self, min_elem: usize) -> Result<usize, DecodeError> {
        let count = self.read_u32()? as usize;
        if min_elem > 0 && count > self.remaining() / min_elem {
            return Err(DecodeError::BadLength(count as u32));
        }
        Ok(count)
    }

    pub fn read_value(&mut self, ty: &Type) -> Result<Value, DecodeError> {
        Ok(match ty {
            Type::Void => Value::Void,
            Type::Bool => Value::Bool(self.read_bool()?),
            Type::Int8 => Value::Int8(self.read_i8()?),
            Type::Int32 => Value::Int32(self.read_i32()?),
            Type::UInt32 => Value::UInt32(self.read_u32()?),
            Type::Int64 => Value::Int64(self.read_i64()?),
            Type::Float => Value::Float(self.read_f32()?),
            Type::Double => Value::Double(self.read_f64()?),
            Type::String => Value::String(self.read_str()?.to_owned()),
            Type::Raw => Value::Raw(self.read_raw()?),
            Type::List(elem) => {
                let count = self.read_count(min_wire_size(elem))?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value(elem)?);
                }
                Value::List(items)
            }
            Type::Map(kt, vt) => {
                let count = self.read_count(min_wire_size(kt) + min_wire_size(vt))?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let k = self.read_value(kt)?;
                    let v = self.read_value(vt)?;
                    entries.push((k, v));
                }
                Value::Map(entries)
            }
            Type::Tuple(tys) => {
                let mut items = Vec::with_capacity(tys.len());
                for ty in tys {
                    items.push(self.read_value(ty)?);
                }
                Value::Tuple(items)
            }
            Type::Dynamic => {
                let sig = Type::parse(self.read_str()?)?;
                Value::Dynamic(Box::new(self.read_value(&sig)?))
            }
            Type::Object => {
                let meta_ty = Type::parse(MetaObject::SIGNATURE).expect("constant signature");
                let meta = MetaObject::from_value(&self.read_value(&meta_ty)?)?;
                let service = self.read_u32()?;
                let object = self.read_u32()?;
                Value::Object(ObjectReference {
                    meta,
                    service,
                    object,
                })
            }
        })
    }

    /// Fail unless the payload has been fully consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.pos < self.data.len() {
            return Err(DecodeError::TrailingBytes {
                count: self.data.len() - self.pos,
            });
        }
        Ok(())
    }
}

/// Smallest possible wire footprint of a value of `ty`, used to reject
/// absurd count prefixes before allocating.
fn min_wire_size(ty: &Type) -> usize {
    match ty {
        Type::Void => 0,
        Type::Bool | Type::Int8 => 1,
        Type::Int32 | Type::UInt32 | Type::Float => 4,
        Type::Int64 | Type::Double => 8,
        Type::String | Type::Raw | Type::List(_) | Type::Map(_, _) | Type::Dynamic => 4,
        Type::Tuple(tys) => tys.iter().map(min_wire_size).sum(),
        // metaobject (three empty maps + empty description) + service + object
        Type::Object => 24,
    }
}

/// Encode a single value by its own structure.
pub fn encode_value(value: &Value) -> Result<Body, EncodeError> {
    let mut enc = Encoder::new();
    enc.write_value(value)?;
    Ok(enc.finish())
}

/// Encode a single value against a declared signature.
pub fn encode_value_as(value: &Value, ty: &Type) -> Result<Body, EncodeError> {
    let mut enc = Encoder::new();
    enc.write_value_as(value, ty)?;
    Ok(enc.finish())
}

/// Decode a top-level value. Extra bytes beyond the declared type are
/// accepted for forward compatibility.
pub fn decode_value(data: &[u8], ty: &Type) -> Result<Value, DecodeError> {
    Decoder::new(data).read_value(ty)
}

/// Decode a complete bounded value; trailing garbage is an error.
pub fn decode_value_exact(data: &[u8], ty: &Type) -> Result<Value, DecodeError> {
    let mut dec = Decoder::new(data);
    let value = dec.read_value(ty)?;
    dec.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetaObject;

    fn roundtrip(value: Value) {
        let ty = value.signature();
        let body = encode_value_as(&value, &ty).unwrap();
        let decoded = decode_value_exact(&body.to_bytes(), &ty).unwrap();
        assert_eq!(decoded, value, "signature {ty}");
    }

    #[test]
    fn roundtrip_primitives() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Int8(-7));
        roundtrip(Value::Int32(-123456));
        roundtrip(Value::UInt32(0xdead_beef));
        roundtrip(Value::Int64(i64::MIN));
        roundtrip(Value::Float(1.5));
        roundtrip(Value::Double(-2.25e10));
        roundtrip(Value::String("héllo".to_owned()));
        roundtrip(Value::Raw(Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn roundtrip_containers() {
        roundtrip(Value::List(vec![Value::Int32(1), Value::Int32(2)]));
        roundtrip(Value::Map(vec![
            (Value::String("a".into()), Value::UInt32(1)),
            (Value::String("b".into()), Value::UInt32(2)),
        ]));
        roundtrip(Value::Tuple(vec![
            Value::UInt32(9),
            Value::List(vec![Value::String("tcp://h:1".into())]),
            Value::List(vec![]),
            Value::String("svc".into()),
        ]));
    }

    #[test]
    fn roundtrip_dynamic() {
        roundtrip(Value::Dynamic(Box::new(Value::String("dyn".into()))));
        roundtrip(Value::Dynamic(Box::new(Value::Tuple(vec![
            Value::Int32(1),
            Value::Bool(false),
        ]))));
    }

    #[test]
    fn roundtrip_object_reference() {
        let meta = MetaObject::builder()
            .method("ping", &Type::parse("()").unwrap(), &Type::Void, "")
            .build();
        roundtrip(Value::Object(ObjectReference {
            meta,
            service: 4,
            object: 80,
        }));
    }

    #[test]
    fn toplevel_accepts_trailing_bytes() {
        let mut enc = Encoder::new();
        enc.write_i32(42);
        enc.write_u32(0xffff_ffff);
        let body = enc.finish().to_bytes();
        assert_eq!(
            decode_value(&body, &Type::Int32).unwrap(),
            Value::Int32(42)
        );
        assert!(matches!(
            decode_value_exact(&body, &Type::Int32),
            Err(DecodeError::TrailingBytes { count: 4 })
        ));
    }

    #[test]
    fn tuple_decode_is_bounded() {
        let body = encode_value(&Value::Tuple(vec![Value::Int32(1), Value::Int32(2)]))
            .unwrap()
            .to_bytes();
        // Declared arity wins: a (iii) read over (ii) bytes is an EOF, not
        // a silent short read.
        assert!(matches!(
            decode_value(&body, &Type::parse("(iii)").unwrap()),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn absurd_count_prefix_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_u32(u32::MAX);
        let body = enc.finish().to_bytes();
        assert!(matches!(
            decode_value(&body, &Type::parse("[i]").unwrap()),
            Err(DecodeError::BadLength(_))
        ));
    }

    #[test]
    fn dynamic_wrapping_against_declared_signature() {
        // A concrete value encoded against `m` is readable back as dynamic.
        let body = encode_value_as(&Value::Int32(5), &Type::Dynamic)
            .unwrap()
            .to_bytes();
        let decoded = decode_value_exact(&body, &Type::Dynamic).unwrap();
        assert_eq!(decoded.into_inner(), Value::Int32(5));
    }

    #[test]
    fn stitched_buffers_concatenate() {
        let mut enc = Encoder::new();
        enc.write_u32(3);
        enc.append_buffer(Bytes::from_static(b"abc"));
        enc.write_u32(7);
        let body = enc.finish();
        assert_eq!(body.segments().len(), 3);
        let bytes = body.to_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_str().unwrap(), "abc");
        assert_eq!(dec.read_u32().unwrap(), 7);
    }
}
