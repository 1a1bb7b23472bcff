use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The one-byte type tags of the wire codec.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GpType {
    /// used in dictionary headers for 'object', i.e. values that carry their own tag
    Unknown = 0,
    Null = 42,
    Dictionary = 68,
    StringArray = 97,
    Byte = 98,
    Custom = 99,
    Double = 100,
    EventData = 101,
    Float = 102,
    Hashtable = 104,
    Integer = 105,
    Short = 107,
    Long = 108,
    IntegerArray = 110,
    Boolean = 111,
    OperationResponse = 112,
    OperationRequest = 113,
    String = 115,
    ByteArray = 120,
    Array = 121,
    ObjectArray = 122,
}

impl GpType {
    pub fn from_tag(tag: u8) -> anyhow::Result<GpType> {
        GpType::try_from(tag)
            .map_err(|_| anyhow::anyhow!("invalid type tag {}", tag))
    }

    /// `true` for the tags that stand for "no static type, every value is tagged individually"
    pub fn is_dynamic(&self) -> bool {
        matches!(self, GpType::Unknown | GpType::Null)
    }
}
