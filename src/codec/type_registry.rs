use std::any::{type_name, TypeId};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::codec::value::{CustomData, CustomValue};

type EncodeFn = Box<dyn Fn(&CustomValue) -> anyhow::Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> anyhow::Result<CustomValue> + Send + Sync>;

struct CustomTypeCodec {
    code: u8,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Maps application types to a one-byte type code plus the functions that turn them into an opaque
///  payload and back. A registry is owned by the application and shared (immutably, after setup)
///  by all codecs and peers that use it.
#[derive(Default)]
pub struct TypeRegistry {
    by_code: FxHashMap<u8, Arc<CustomTypeCodec>>,
    by_type: FxHashMap<TypeId, Arc<CustomTypeCodec>>,
}
impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        Default::default()
    }

    /// Registration fails if either the type or the code is registered already.
    pub fn register<T, E, D>(&mut self, code: u8, encode: E, decode: D) -> anyhow::Result<()>
    where
        T: CustomData,
        E: Fn(&T) -> Vec<u8> + Send + Sync + 'static,
        D: Fn(&[u8]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_code.get(&code) {
            bail!("type code {} is already registered for {}", code, existing.type_name);
        }
        if let Some(existing) = self.by_type.get(&type_id) {
            bail!("type {} is already registered with code {}", existing.type_name, existing.code);
        }

        let codec = Arc::new(CustomTypeCodec {
            code,
            type_name: type_name::<T>(),
            encode: Box::new(move |value: &CustomValue| {
                let data = value.downcast_ref::<T>()
                    .ok_or_else(|| anyhow!("custom value is not a {}", type_name::<T>()))?;
                Ok(encode(data))
            }),
            decode: Box::new(move |buf: &[u8]| {
                Ok(CustomValue::new(decode(buf)?))
            }),
        });

        debug!("registered custom type {} with code {}", codec.type_name, code);
        self.by_code.insert(code, codec.clone());
        self.by_type.insert(type_id, codec);
        Ok(())
    }

    pub fn code_of(&self, value: &CustomValue) -> anyhow::Result<u8> {
        self.by_type.get(&value.data_type_id())
            .map(|c| c.code)
            .ok_or_else(|| anyhow!("no custom type registered for {:?}", value))
    }

    /// Returns the type code and the encoded payload
    pub fn encode(&self, value: &CustomValue) -> anyhow::Result<(u8, Vec<u8>)> {
        let codec = self.by_type.get(&value.data_type_id())
            .ok_or_else(|| anyhow!("no custom type registered for {:?}", value))?;
        Ok((codec.code, (codec.encode)(value)?))
    }

    pub fn decode(&self, code: u8, buf: &[u8]) -> anyhow::Result<CustomValue> {
        let codec = self.by_code.get(&code)
            .ok_or_else(|| anyhow!("no custom type registered for code {}", code))?;
        (codec.decode)(buf)
    }

    pub fn is_registered(&self, code: u8) -> bool {
        self.by_code.contains_key(&code)
    }
}
