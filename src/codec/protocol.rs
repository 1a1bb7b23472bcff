use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::codec::envelope::{EventData, OperationRequest, OperationResponse};
use crate::codec::gp_type::GpType;
use crate::codec::type_registry::TypeRegistry;
use crate::codec::value::{Dictionary, DictionaryType, ElementType, Parameters, TypedArray, Value};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// The tagged binary wire codec. Apart from the (shared, read-only) custom type registry it is
///  stateless, so a single instance can be used concurrently.
///
/// All multi-byte numbers are big-endian. Every value is preceded by its one-byte type tag unless
///  the static type is known from the context (homogeneous arrays, typed dictionaries).
#[derive(Clone)]
pub struct WireCodec {
    registry: Arc<TypeRegistry>,
}

impl WireCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> WireCodec {
        WireCodec { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// convenience for encoding a single tagged value
    pub fn encode(&self, value: &Value) -> anyhow::Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.ser_value(value, &mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn decode(&self, mut buf: &[u8]) -> anyhow::Result<Value> {
        self.try_deser_value(&mut buf)
    }

    pub fn ser_value(&self, value: &Value, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.ser(value, true, buf)
    }

    pub fn try_deser_value<B: Buf>(&self, buf: &mut B) -> anyhow::Result<Value> {
        let tag = GpType::from_tag(buf.try_get_byte()?)?;
        self.deser_typed(tag, buf)
    }

    pub fn ser_parameter_table(&self, parameters: &Parameters, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_count(parameters.len(), buf)?;
        for (&key, value) in parameters {
            buf.put_u8(key);
            self.ser(value, true, buf)?;
        }
        Ok(())
    }

    pub fn try_deser_parameter_table<B: Buf>(&self, buf: &mut B) -> anyhow::Result<Parameters> {
        let count = try_get_count(buf)?;
        let mut result = Parameters::new();
        for _ in 0..count {
            let key = buf.try_get_byte()?;
            let value = self.try_deser_value(buf)?;
            result.insert(key, value);
        }
        Ok(result)
    }

    pub fn ser_operation_request(&self, request: &OperationRequest, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(request.operation_code);
        self.ser_parameter_table(&request.parameters, buf)
    }

    pub fn try_deser_operation_request<B: Buf>(&self, buf: &mut B) -> anyhow::Result<OperationRequest> {
        let operation_code = buf.try_get_byte()?;
        let parameters = self.try_deser_parameter_table(buf)?;
        Ok(OperationRequest { operation_code, parameters })
    }

    pub fn ser_operation_response(&self, response: &OperationResponse, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(response.operation_code);
        buf.put_i16(response.return_code);
        match &response.debug_message {
            Some(msg) => {
                buf.put_u8(GpType::String.into());
                buf.put_short_string(msg)?;
            }
            None => buf.put_u8(GpType::Null.into()),
        }
        self.ser_parameter_table(&response.parameters, buf)
    }

    pub fn try_deser_operation_response<B: Buf>(&self, buf: &mut B) -> anyhow::Result<OperationResponse> {
        let operation_code = buf.try_get_byte()?;
        let return_code = buf.try_get_i16_be()?;
        // anything but a string is read and then ignored
        let debug_message = match self.try_deser_value(buf)? {
            Value::String(s) => Some(s),
            _ => None,
        };
        let parameters = self.try_deser_parameter_table(buf)?;
        Ok(OperationResponse { operation_code, return_code, debug_message, parameters })
    }

    pub fn ser_event(&self, event: &EventData, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(event.code);
        self.ser_parameter_table(&event.parameters, buf)
    }

    pub fn try_deser_event<B: Buf>(&self, buf: &mut B) -> anyhow::Result<EventData> {
        let code = buf.try_get_byte()?;
        let parameters = self.try_deser_parameter_table(buf)?;
        Ok(EventData { code, parameters })
    }

    fn ser(&self, value: &Value, set_type: bool, buf: &mut BytesMut) -> anyhow::Result<()> {
        if set_type {
            buf.put_u8(value.gp_type().into());
        }

        match value {
            Value::Null => {}
            Value::Bool(b) => buf.put_u8(if *b { 1 } else { 0 }),
            Value::Byte(n) => buf.put_u8(*n),
            Value::Short(n) => buf.put_i16(*n),
            Value::Int(n) => buf.put_i32(*n),
            Value::Long(n) => buf.put_i64(*n),
            Value::Float(n) => buf.put_f32(*n),
            Value::Double(n) => buf.put_f64(*n),
            Value::String(s) => buf.put_short_string(s)?,
            Value::ByteArray(bytes) => put_byte_array(bytes, buf)?,
            Value::IntArray(numbers) => {
                put_i32_len(numbers.len(), buf)?;
                for &n in numbers {
                    buf.put_i32(n);
                }
            }
            Value::StringArray(strings) => {
                put_count(strings.len(), buf)?;
                for s in strings {
                    buf.put_short_string(s)?;
                }
            }
            Value::Array(array) => self.ser_typed_array(array, buf)?,
            Value::ObjectArray(elements) => {
                put_count(elements.len(), buf)?;
                for element in elements {
                    self.ser(element, true, buf)?;
                }
            }
            Value::Hashtable(entries) => {
                put_count(entries.len(), buf)?;
                for (key, value) in entries {
                    self.ser(key, true, buf)?;
                    self.ser(value, true, buf)?;
                }
            }
            Value::Dictionary(dict) => {
                ser_dictionary_type(&dict.dictionary_type, buf);
                self.ser_dictionary_entries(dict, buf)?;
            }
            Value::Custom(custom) => {
                let (code, payload) = self.registry.encode(custom)?;
                buf.put_u8(code);
                put_custom_payload(&payload, buf)?;
            }
            Value::EventData(event) => self.ser_event(event, buf)?,
            Value::OperationRequest(request) => self.ser_operation_request(request, buf)?,
            Value::OperationResponse(response) => self.ser_operation_response(response, buf)?,
        }
        Ok(())
    }

    /// Writes a value whose type is statically known from the context, i.e. without a tag. A
    ///  dynamic 'expected' type means the value carries its own tag after all.
    fn ser_untagged(&self, value: &Value, expected: GpType, buf: &mut BytesMut) -> anyhow::Result<()> {
        if expected.is_dynamic() {
            return self.ser(value, true, buf);
        }
        if value.gp_type() != expected {
            bail!("value of type {:?} where {:?} is required: {:?}", value.gp_type(), expected, value);
        }
        self.ser(value, false, buf)
    }

    fn ser_typed_array(&self, array: &TypedArray, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_count(array.elements.len(), buf)?;

        match &array.element_type {
            ElementType::Plain(element_type) => {
                match element_type {
                    GpType::Unknown | GpType::Null => bail!("array elements need a static type - use an object array instead"),
                    GpType::Custom | GpType::Dictionary => bail!("array element type {:?} requires additional type information", element_type),
                    _ => {}
                }
                buf.put_u8((*element_type).into());
                for element in &array.elements {
                    self.ser_untagged(element, *element_type, buf)?;
                }
            }
            ElementType::Custom(code) => {
                buf.put_u8(GpType::Custom.into());
                buf.put_u8(*code);
                for element in &array.elements {
                    let Value::Custom(custom) = element else {
                        bail!("non-custom element in an array of custom type {}: {:?}", code, element);
                    };
                    let (element_code, payload) = self.registry.encode(custom)?;
                    if element_code != *code {
                        bail!("element of custom type {} in an array of custom type {}", element_code, code);
                    }
                    put_custom_payload(&payload, buf)?;
                }
            }
            ElementType::Dictionary(dictionary_type) => {
                buf.put_u8(GpType::Dictionary.into());
                ser_dictionary_type(dictionary_type, buf);
                for element in &array.elements {
                    let Value::Dictionary(dict) = element else {
                        bail!("non-dictionary element in an array of dictionaries: {:?}", element);
                    };
                    if dict.dictionary_type != *dictionary_type {
                        bail!("dictionary of type {:?} in an array of {:?}", dict.dictionary_type, dictionary_type);
                    }
                    self.ser_dictionary_entries(dict, buf)?;
                }
            }
        }
        Ok(())
    }

    fn ser_dictionary_entries(&self, dict: &Dictionary, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_count(dict.entries.len(), buf)?;
        for (key, value) in &dict.entries {
            self.ser_untagged(key, dict.dictionary_type.key_type, buf)?;
            self.ser_untagged(value, dict.dictionary_type.value_type, buf)?;
        }
        Ok(())
    }

    fn deser_typed<B: Buf>(&self, tag: GpType, buf: &mut B) -> anyhow::Result<Value> {
        let value = match tag {
            GpType::Unknown | GpType::Null => Value::Null,
            GpType::Boolean => Value::Bool(buf.try_get_byte()? != 0),
            GpType::Byte => Value::Byte(buf.try_get_byte()?),
            GpType::Short => Value::Short(buf.try_get_i16_be()?),
            GpType::Integer => Value::Int(buf.try_get_i32_be()?),
            GpType::Long => Value::Long(buf.try_get_i64_be()?),
            GpType::Float => Value::Float(buf.try_get_f32_be()?),
            GpType::Double => Value::Double(buf.try_get_f64_be()?),
            GpType::String => Value::String(buf.try_get_short_string()?),
            GpType::ByteArray => Value::ByteArray(try_get_byte_array(buf)?),
            GpType::IntegerArray => {
                let len = try_get_i32_len(buf)?;
                if buf.remaining() < len * 4 {
                    bail!("buffer underflow: int array of length {}", len);
                }
                Value::IntArray((0..len).map(|_| buf.get_i32()).collect())
            }
            GpType::StringArray => {
                let count = try_get_count(buf)?;
                let mut strings = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    strings.push(buf.try_get_short_string()?);
                }
                Value::StringArray(strings)
            }
            GpType::Array => Value::Array(self.deser_typed_array(buf)?),
            GpType::ObjectArray => {
                let count = try_get_count(buf)?;
                let mut elements = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    elements.push(self.try_deser_value(buf)?);
                }
                Value::ObjectArray(elements)
            }
            GpType::Hashtable => {
                let count = try_get_count(buf)?;
                let mut entries = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    let key = self.try_deser_value(buf)?;
                    let value = self.try_deser_value(buf)?;
                    entries.push((key, value));
                }
                Value::Hashtable(entries)
            }
            GpType::Dictionary => {
                let dictionary_type = try_deser_dictionary_type(buf)?;
                Value::Dictionary(self.deser_dictionary_entries(dictionary_type, buf)?)
            }
            GpType::Custom => {
                let code = buf.try_get_byte()?;
                let payload = try_get_custom_payload(buf)?;
                Value::Custom(self.registry.decode(code, &payload)?)
            }
            GpType::EventData => Value::EventData(Box::new(self.try_deser_event(buf)?)),
            GpType::OperationRequest => Value::OperationRequest(Box::new(self.try_deser_operation_request(buf)?)),
            GpType::OperationResponse => Value::OperationResponse(Box::new(self.try_deser_operation_response(buf)?)),
        };
        Ok(value)
    }

    fn deser_typed_array<B: Buf>(&self, buf: &mut B) -> anyhow::Result<TypedArray> {
        let count = try_get_count(buf)?;
        let element_tag = GpType::from_tag(buf.try_get_byte()?)?;
        let mut elements = Vec::with_capacity(count.min(buf.remaining()));

        let element_type = match element_tag {
            GpType::Custom => {
                let code = buf.try_get_byte()?;
                for _ in 0..count {
                    let payload = try_get_custom_payload(buf)?;
                    elements.push(Value::Custom(self.registry.decode(code, &payload)?));
                }
                ElementType::Custom(code)
            }
            GpType::Dictionary => {
                let dictionary_type = try_deser_dictionary_type(buf)?;
                for _ in 0..count {
                    elements.push(Value::Dictionary(self.deser_dictionary_entries(dictionary_type, buf)?));
                }
                ElementType::Dictionary(dictionary_type)
            }
            t if t.is_dynamic() => bail!("array with element type tag {:?}", t),
            t => {
                for _ in 0..count {
                    elements.push(self.deser_typed(t, buf)?);
                }
                ElementType::Plain(t)
            }
        };

        Ok(TypedArray { element_type, elements })
    }

    fn deser_dictionary_entries<B: Buf>(&self, dictionary_type: DictionaryType, buf: &mut B) -> anyhow::Result<Dictionary> {
        let count = try_get_count(buf)?;
        let mut entries = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let key = self.deser_untagged(dictionary_type.key_type, buf)?;
            let value = self.deser_untagged(dictionary_type.value_type, buf)?;
            entries.push((key, value));
        }
        Ok(Dictionary { dictionary_type, entries })
    }

    fn deser_untagged<B: Buf>(&self, expected: GpType, buf: &mut B) -> anyhow::Result<Value> {
        if expected.is_dynamic() {
            self.try_deser_value(buf)
        }
        else {
            self.deser_typed(expected, buf)
        }
    }
}

fn ser_dictionary_type(dictionary_type: &DictionaryType, buf: &mut BytesMut) {
    buf.put_u8(dictionary_type.key_type.into());
    buf.put_u8(dictionary_type.value_type.into());
}

fn try_deser_dictionary_type<B: Buf>(buf: &mut B) -> anyhow::Result<DictionaryType> {
    let key_type = GpType::from_tag(buf.try_get_byte()?)?;
    let value_type = GpType::from_tag(buf.try_get_byte()?)?;
    Ok(DictionaryType { key_type, value_type })
}

fn put_count(count: usize, buf: &mut BytesMut) -> anyhow::Result<()> {
    if count > i16::MAX as usize {
        bail!("{} elements exceed the maximum count of {}", count, i16::MAX);
    }
    buf.put_i16(count as i16);
    Ok(())
}

fn try_get_count<B: Buf>(buf: &mut B) -> anyhow::Result<usize> {
    let count = buf.try_get_i16_be()?;
    if count < 0 {
        bail!("negative element count {}", count);
    }
    Ok(count as usize)
}

fn put_i32_len(len: usize, buf: &mut BytesMut) -> anyhow::Result<()> {
    let Ok(len) = i32::try_from(len) else {
        bail!("length {} exceeds the maximum of {}", len, i32::MAX);
    };
    buf.put_i32(len);
    Ok(())
}

fn try_get_i32_len<B: Buf>(buf: &mut B) -> anyhow::Result<usize> {
    let len = buf.try_get_i32_be()?;
    if len < 0 {
        bail!("negative length {}", len);
    }
    Ok(len as usize)
}

fn put_byte_array(bytes: &[u8], buf: &mut BytesMut) -> anyhow::Result<()> {
    put_i32_len(bytes.len(), buf)?;
    buf.put_slice(bytes);
    Ok(())
}

fn try_get_byte_array<B: Buf>(buf: &mut B) -> anyhow::Result<Vec<u8>> {
    let len = try_get_i32_len(buf)?;
    buf.try_get_bytes(len)
}

fn put_custom_payload(payload: &[u8], buf: &mut BytesMut) -> anyhow::Result<()> {
    if payload.len() > i16::MAX as usize {
        bail!("custom type payload of {} bytes exceeds the maximum of {}", payload.len(), i16::MAX);
    }
    buf.put_i16(payload.len() as i16);
    buf.put_slice(payload);
    Ok(())
}

fn try_get_custom_payload<B: Buf>(buf: &mut B) -> anyhow::Result<Vec<u8>> {
    let len = try_get_count(buf)?;
    buf.try_get_bytes(len)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::CustomValue;
    use rstest::rstest;

    #[derive(Debug, PartialEq)]
    struct Vec2 { x: i16, y: i16 }

    fn codec() -> WireCodec {
        let mut registry = TypeRegistry::new();
        registry.register(b'W',
            |v: &Vec2| [v.x.to_be_bytes(), v.y.to_be_bytes()].concat(),
            |buf: &[u8]| {
                if buf.len() != 4 {
                    bail!("invalid Vec2 length {}", buf.len());
                }
                Ok(Vec2 { x: i16::from_be_bytes([buf[0], buf[1]]), y: i16::from_be_bytes([buf[2], buf[3]]) })
            },
        ).unwrap();
        WireCodec::new(Arc::new(registry))
    }

    fn vec2(x: i16, y: i16) -> Value {
        Value::Custom(CustomValue::new(Vec2 { x, y }))
    }

    fn params(entries: Vec<(u8, Value)>) -> Parameters {
        entries.into_iter().collect()
    }

    #[rstest]
    #[case::null(Value::Null)]
    #[case::bool_true(Value::Bool(true))]
    #[case::bool_false(Value::Bool(false))]
    #[case::byte(Value::Byte(255))]
    #[case::short(Value::Short(-12345))]
    #[case::int(Value::Int(i32::MIN))]
    #[case::long(Value::Long(0x0102_0304_0506_0708))]
    #[case::float(Value::Float(-1.5))]
    #[case::double(Value::Double(std::f64::consts::PI))]
    #[case::string(Value::from("hello, world"))]
    #[case::string_empty(Value::from(""))]
    #[case::string_utf8(Value::from("grüße 🦀"))]
    #[case::string_max_len(Value::String("x".repeat(32767)))]
    #[case::byte_array(Value::ByteArray(vec![1, 2, 3, 255]))]
    #[case::byte_array_empty(Value::ByteArray(vec![]))]
    #[case::int_array(Value::IntArray(vec![1, -1, i32::MAX]))]
    #[case::string_array(Value::StringArray(vec!["a".to_string(), "".to_string(), "bc".to_string()]))]
    #[case::array_of_ints(Value::Array(TypedArray::new(ElementType::Plain(GpType::Integer), vec![Value::Int(1), Value::Int(2)])))]
    #[case::array_empty(Value::Array(TypedArray::new(ElementType::Plain(GpType::String), vec![])))]
    #[case::array_of_byte_arrays(Value::Array(TypedArray::new(ElementType::Plain(GpType::ByteArray), vec![Value::ByteArray(vec![1]), Value::ByteArray(vec![])])))]
    #[case::array_of_arrays(Value::Array(TypedArray::new(ElementType::Plain(GpType::Array), vec![
        Value::Array(TypedArray::new(ElementType::Plain(GpType::Short), vec![Value::Short(1)])),
        Value::Array(TypedArray::new(ElementType::Plain(GpType::Boolean), vec![Value::Bool(true), Value::Bool(false)])),
    ])))]
    #[case::array_of_custom(Value::Array(TypedArray::new(ElementType::Custom(b'W'), vec![vec2(1, 2), vec2(-3, 4)])))]
    #[case::array_of_hashtables(Value::Array(TypedArray::new(ElementType::Plain(GpType::Hashtable), vec![
        Value::Hashtable(vec![(Value::from("a"), Value::Int(1))]),
        Value::Hashtable(vec![]),
    ])))]
    #[case::array_of_dictionaries(Value::Array(TypedArray::new(ElementType::Dictionary(DictionaryType::new(GpType::Byte, GpType::Unknown)), vec![
        Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Unknown, vec![(Value::Byte(1), Value::from("x")), (Value::Byte(2), Value::Null)])),
        Value::Dictionary(Dictionary::new(GpType::Byte, GpType::Unknown)),
    ])))]
    #[case::object_array(Value::ObjectArray(vec![Value::Int(1), Value::from("two"), Value::Null, vec2(5, 6)]))]
    #[case::hashtable(Value::Hashtable(vec![
        (Value::from("key"), Value::Long(7)),
        (Value::Int(3), Value::ObjectArray(vec![Value::Bool(true)])),
    ]))]
    #[case::hashtable_of_arrays(Value::Hashtable(vec![
        (Value::Byte(1), Value::Array(TypedArray::new(ElementType::Plain(GpType::Double), vec![Value::Double(0.25)]))),
    ]))]
    #[case::dictionary_typed(Value::Dictionary(Dictionary::with_entries(GpType::String, GpType::Integer, vec![
        (Value::from("a"), Value::Int(1)),
        (Value::from("b"), Value::Int(2)),
    ])))]
    #[case::dictionary_dynamic(Value::Dictionary(Dictionary::with_entries(GpType::Unknown, GpType::Unknown, vec![
        (Value::Int(1), Value::from("x")),
        (Value::from("y"), Value::Null),
    ])))]
    #[case::dictionary_null_tag(Value::Dictionary(Dictionary::with_entries(GpType::Null, GpType::Short, vec![
        (Value::Bool(true), Value::Short(3)),
    ])))]
    #[case::dictionary_of_dictionaries(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Dictionary, vec![
        (Value::Byte(1), Value::Dictionary(Dictionary::with_entries(GpType::String, GpType::Long, vec![(Value::from("n"), Value::Long(1))]))),
        (Value::Byte(2), Value::Dictionary(Dictionary::with_entries(GpType::Integer, GpType::Unknown, vec![]))),
    ])))]
    #[case::dictionary_of_arrays(Value::Dictionary(Dictionary::with_entries(GpType::Integer, GpType::Array, vec![
        (Value::Int(9), Value::Array(TypedArray::new(ElementType::Plain(GpType::String), vec![Value::from("s")]))),
    ])))]
    #[case::dictionary_of_custom(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Custom, vec![
        (Value::Byte(0), vec2(7, 8)),
    ])))]
    #[case::custom(vec2(-1, 1))]
    #[case::event(Value::EventData(Box::new(EventData { code: 3, parameters: params(vec![(1, Value::Int(4))]) })))]
    #[case::operation_request(Value::OperationRequest(Box::new(OperationRequest { operation_code: 230, parameters: params(vec![(0, Value::from("x")), (255, Value::Null)]) })))]
    #[case::operation_response(Value::OperationResponse(Box::new(OperationResponse {
        operation_code: 1, return_code: -2, debug_message: Some("failed".to_string()), parameters: params(vec![]),
    })))]
    #[case::operation_response_no_debug(Value::OperationResponse(Box::new(OperationResponse {
        operation_code: 1, return_code: 0, debug_message: None, parameters: params(vec![(1, Value::Byte(1))]),
    })))]
    fn test_round_trip(#[case] value: Value) {
        let codec = codec();
        let encoded = codec.encode(&value).unwrap();

        let mut buf: &[u8] = &encoded;
        let decoded = codec.try_deser_value(&mut buf).unwrap();
        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::int(Value::Int(5), vec![105, 0, 0, 0, 5])]
    #[case::null(Value::Null, vec![42])]
    #[case::bool(Value::Bool(true), vec![111, 1])]
    #[case::float(Value::Float(1.0), vec![102, 0x3f, 0x80, 0, 0])]
    #[case::string(Value::from("ab"), vec![115, 0, 2, b'a', b'b'])]
    #[case::byte_array(Value::ByteArray(vec![9]), vec![120, 0, 0, 0, 1, 9])]
    #[case::array(Value::Array(TypedArray::new(ElementType::Plain(GpType::Short), vec![Value::Short(1), Value::Short(2)])), vec![121, 0, 2, 107, 0, 1, 0, 2])]
    #[case::array_of_custom(Value::Array(TypedArray::new(ElementType::Custom(b'W'), vec![vec2(1, 2)])), vec![121, 0, 1, 99, b'W', 0, 4, 0, 1, 0, 2])]
    #[case::custom(vec2(1, 2), vec![99, b'W', 0, 4, 0, 1, 0, 2])]
    #[case::dictionary(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Unknown, vec![(Value::Byte(1), Value::Int(2))])),
        vec![68, 98, 0, 0, 1, 1, 105, 0, 0, 0, 2])]
    #[case::dictionary_of_dictionaries(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Dictionary, vec![
        (Value::Byte(1), Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::Byte, vec![(Value::Byte(2), Value::Byte(3))]))),
    ])), vec![68, 98, 68, 0, 1, 1, 98, 98, 0, 1, 2, 3])]
    #[case::hashtable(Value::Hashtable(vec![(Value::Byte(1), Value::Null)]), vec![104, 0, 1, 98, 1, 42])]
    #[case::operation_response(Value::OperationResponse(Box::new(OperationResponse {
        operation_code: 7, return_code: 1, debug_message: None, parameters: Parameters::new(),
    })), vec![112, 7, 0, 1, 42, 0, 0])]
    fn test_encoding(#[case] value: Value, #[case] expected: Vec<u8>) {
        assert_eq!(codec().encode(&value).unwrap(), expected);
    }

    #[rstest]
    #[case::string_too_long(Value::String("x".repeat(32768)))]
    #[case::string_in_array_too_long(Value::ObjectArray(vec![Value::String("x".repeat(40000))]))]
    #[case::unregistered_custom(Value::Custom(CustomValue::new(17u64)))]
    #[case::array_element_mismatch(Value::Array(TypedArray::new(ElementType::Plain(GpType::Integer), vec![Value::Int(1), Value::Short(2)])))]
    #[case::array_dynamic_element_type(Value::Array(TypedArray::new(ElementType::Plain(GpType::Null), vec![])))]
    #[case::array_custom_without_code(Value::Array(TypedArray::new(ElementType::Plain(GpType::Custom), vec![])))]
    #[case::array_wrong_custom_code(Value::Array(TypedArray::new(ElementType::Custom(b'X'), vec![vec2(1, 1)])))]
    #[case::array_dictionary_mismatch(Value::Array(TypedArray::new(ElementType::Dictionary(DictionaryType::new(GpType::Byte, GpType::Byte)), vec![
        Value::Dictionary(Dictionary::new(GpType::Byte, GpType::Short)),
    ])))]
    #[case::typed_dictionary_null_value(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::String, vec![(Value::Byte(1), Value::Null)])))]
    #[case::typed_dictionary_key_mismatch(Value::Dictionary(Dictionary::with_entries(GpType::Byte, GpType::String, vec![(Value::Int(1), Value::from("a"))])))]
    fn test_encode_failure(#[case] value: Value) {
        assert!(codec().encode(&value).is_err());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_tag(vec![1, 2, 3])]
    #[case::truncated_int(vec![105, 0, 0])]
    #[case::truncated_string(vec![115, 0, 5, b'a'])]
    #[case::negative_string_length(vec![115, 0x80, 0])]
    #[case::negative_byte_array_length(vec![120, 0xff, 0xff, 0xff, 0xff])]
    #[case::huge_int_array(vec![110, 0x7f, 0xff, 0xff, 0xff])]
    #[case::array_of_objects(vec![121, 0, 1, 42])]
    #[case::array_unknown_element_tag(vec![121, 0, 1, 3])]
    #[case::unknown_custom_code(vec![99, b'Q', 0, 0])]
    #[case::invalid_custom_payload(vec![99, b'W', 0, 1, 0])]
    #[case::hashtable_missing_value(vec![104, 0, 1, 98, 1])]
    #[case::invalid_utf8(vec![115, 0, 1, 0xff])]
    fn test_decode_failure(#[case] bytes: Vec<u8>) {
        assert!(codec().decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_debug_message_non_string() {
        let bytes = vec![112, 7, 0, 0, 105, 0, 0, 0, 1, 0, 0];
        match codec().decode(&bytes).unwrap() {
            Value::OperationResponse(r) => {
                assert_eq!(r.operation_code, 7);
                assert_eq!(r.debug_message, None);
            }
            v => panic!("unexpected {:?}", v),
        }
    }

    #[test]
    fn test_decode_dictionary_with_null_tag_header() {
        // 42 in a dictionary header means 'object' just like 0
        let bytes = vec![68, 42, 42, 0, 1, 98, 1, 115, 0, 1, b'x'];
        assert_eq!(codec().decode(&bytes).unwrap(), Value::Dictionary(Dictionary::with_entries(GpType::Null, GpType::Null, vec![
            (Value::Byte(1), Value::from("x")),
        ])));
    }

    #[test]
    fn test_parameter_table() {
        let codec = codec();
        let parameters = params(vec![(0, Value::from("ping")), (7, Value::IntArray(vec![1, 2]))]);

        let mut buf = BytesMut::new();
        codec.ser_parameter_table(&parameters, &mut buf).unwrap();
        assert_eq!(&buf[..7], &[0, 2, 0, 115, 0, 4, b'p']);

        let mut b: &[u8] = &buf;
        assert_eq!(codec.try_deser_parameter_table(&mut b).unwrap(), parameters);
    }
}
