use anyhow::{anyhow, bail};
use bytes::BufMut;

macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}

/// Fallible big-endian reads. All multi-byte values on the wire (packet headers, commands and
///  codec values alike) are big-endian, so there are no `_le` variants here.
///
/// NB: The names deliberately differ from the `try_get_*` methods newer versions of `bytes` bring
///  along, to avoid ambiguity when both traits are in scope.
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_get_byte, u8, get_u8);
    get_try_impl!(try_get_i16_be, i16, get_i16);
    get_try_impl!(try_get_i32_be, i32, get_i32);
    get_try_impl!(try_get_i64_be, i64, get_i64);
    get_try_impl!(try_get_f32_be, f32, get_f32);
    get_try_impl!(try_get_f64_be, f64, get_f64);

    fn try_get_bytes(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes requested, {} remaining", len, self.remaining());
        }
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// strings are UTF-8 with a signed 16 bit length prefix
    fn try_get_short_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_i16_be()?;
        if len < 0 {
            bail!("negative string length {}", len);
        }
        let raw = self.try_get_bytes(len as usize)?;
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: BufMut {
    fn put_short_string(&mut self, s: &str) -> anyhow::Result<()> {
        let len = s.len();
        if len > i16::MAX as usize {
            bail!("string of {} bytes exceeds the maximum length of {}", len, i16::MAX);
        }
        self.put_i16(len as i16);
        self.put_slice(s.as_bytes());
        Ok(())
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}
