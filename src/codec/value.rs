use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::codec::envelope::{EventData, OperationRequest, OperationResponse};
use crate::codec::gp_type::GpType;

/// Byte-keyed parameters of operations, responses and events.
pub type Parameters = BTreeMap<u8, Value>;

/// A value that can be represented in the wire codec. Each variant corresponds to exactly one
///  type tag (see [GpType]).
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    ByteArray(Vec<u8>),
    IntArray(Vec<i32>),
    StringArray(Vec<String>),
    /// homogeneous array: the element type is written once, elements are written untagged
    Array(TypedArray),
    /// heterogeneous array: every element carries its own tag
    ObjectArray(Vec<Value>),
    /// map of tagged keys to tagged values
    Hashtable(Vec<(Value, Value)>),
    /// strongly typed map
    Dictionary(Dictionary),
    Custom(CustomValue),
    EventData(Box<EventData>),
    OperationRequest(Box<OperationRequest>),
    OperationResponse(Box<OperationResponse>),
}

impl Value {
    pub fn gp_type(&self) -> GpType {
        match self {
            Value::Null => GpType::Null,
            Value::Bool(_) => GpType::Boolean,
            Value::Byte(_) => GpType::Byte,
            Value::Short(_) => GpType::Short,
            Value::Int(_) => GpType::Integer,
            Value::Long(_) => GpType::Long,
            Value::Float(_) => GpType::Float,
            Value::Double(_) => GpType::Double,
            Value::String(_) => GpType::String,
            Value::ByteArray(_) => GpType::ByteArray,
            Value::IntArray(_) => GpType::IntegerArray,
            Value::StringArray(_) => GpType::StringArray,
            Value::Array(_) => GpType::Array,
            Value::ObjectArray(_) => GpType::ObjectArray,
            Value::Hashtable(_) => GpType::Hashtable,
            Value::Dictionary(_) => GpType::Dictionary,
            Value::Custom(_) => GpType::Custom,
            Value::EventData(_) => GpType::EventData,
            Value::OperationRequest(_) => GpType::OperationRequest,
            Value::OperationResponse(_) => GpType::OperationResponse,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteArray(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::$variant(value)
            }
        }
    }
}

value_from!(bool, Bool);
value_from!(u8, Byte);
value_from!(i16, Short);
value_from!(i32, Int);
value_from!(i64, Long);
value_from!(f32, Float);
value_from!(f64, Double);
value_from!(String, String);
value_from!(Vec<u8>, ByteArray);
value_from!(Vec<String>, StringArray);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}


/// How the elements of a [TypedArray] are written
#[derive(Clone, Debug, PartialEq)]
pub enum ElementType {
    /// Elements are written without tag, using the encoding of this type. Custom types and
    ///  dictionaries need additional header information and have their own variants.
    Plain(GpType),
    /// Custom type with the given registered type code; the code is written once for the whole
    ///  array, followed by length-prefixed payloads.
    Custom(u8),
    /// Dictionaries sharing the given key / value type; the header is written once for the whole
    ///  array.
    Dictionary(DictionaryType),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypedArray {
    pub element_type: ElementType,
    pub elements: Vec<Value>,
}
impl TypedArray {
    pub fn new(element_type: ElementType, elements: Vec<Value>) -> TypedArray {
        TypedArray { element_type, elements }
    }
}

/// The static key and value type of a [Dictionary]. [GpType::Unknown] (or [GpType::Null]) means
///  'object', i.e. each key or value carries its own type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DictionaryType {
    pub key_type: GpType,
    pub value_type: GpType,
}
impl DictionaryType {
    pub fn new(key_type: GpType, value_type: GpType) -> DictionaryType {
        DictionaryType { key_type, value_type }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dictionary {
    pub dictionary_type: DictionaryType,
    pub entries: Vec<(Value, Value)>,
}
impl Dictionary {
    pub fn new(key_type: GpType, value_type: GpType) -> Dictionary {
        Dictionary {
            dictionary_type: DictionaryType::new(key_type, value_type),
            entries: Vec::new(),
        }
    }

    pub fn with_entries(key_type: GpType, value_type: GpType, entries: Vec<(Value, Value)>) -> Dictionary {
        Dictionary {
            dictionary_type: DictionaryType::new(key_type, value_type),
            entries,
        }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}


/// Application data of a custom type. Anything that is `Debug + PartialEq + Send + Sync` qualifies;
///  encoding and decoding is registered per type in a
///  [TypeRegistry](crate::codec::type_registry::TypeRegistry).
pub trait CustomData: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn CustomData) -> bool;
}
impl <T: Any + Debug + PartialEq + Send + Sync> CustomData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn CustomData) -> bool {
        other.as_any()
            .downcast_ref::<T>()
            .map_or(false, |o| o == self)
    }
}

#[derive(Clone)]
pub struct CustomValue(Arc<dyn CustomData>);
impl CustomValue {
    pub fn new<T: CustomData>(data: T) -> CustomValue {
        CustomValue(Arc::new(data))
    }

    pub fn data_type_id(&self) -> TypeId {
        self.0.as_any().type_id()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn data(&self) -> &dyn CustomData {
        self.0.as_ref()
    }
}
impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}
impl Debug for CustomValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Custom({:?})", self.0)
    }
}
