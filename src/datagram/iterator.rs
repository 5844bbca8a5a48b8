use serde::de::DeserializeOwned;

use crate::error::{BamError, Result};
use crate::format::BamEndian;

/// A read cursor over one datagram.
///
/// Every accessor advances the cursor and fails with
/// [`BamError::DecodeUnderrun`] rather than reading past the end.
#[derive(Debug, Clone)]
pub struct DatagramIterator<'a> {
    data: &'a [u8],
    index: usize,
    endian: BamEndian,
    stdfloat_double: bool,
}

macro_rules! get_int {
    ($($name:ident => $t:ty),* $(,)?) => {
        $(
            #[doc = concat!("Reads a `", stringify!($t), "` in the datagram's byte order.")]
            pub fn $name(&mut self) -> Result<$t> {
                let bytes = self.take_array()?;
                Ok(match self.endian {
                    BamEndian::Little => <$t>::from_le_bytes(bytes),
                    BamEndian::Big => <$t>::from_be_bytes(bytes),
                })
            }
        )*
    };
}

impl<'a> DatagramIterator<'a> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'a [u8], endian: BamEndian, stdfloat_double: bool) -> Self {
        Self {
            data,
            index: 0,
            endian,
            stdfloat_double,
        }
    }

    /// Byte order used for numeric fields.
    pub fn endian(&self) -> BamEndian {
        self.endian
    }

    /// Offset of the next unread byte.
    pub fn get_current_index(&self) -> usize {
        self.index
    }

    /// Number of unread bytes.
    pub fn get_remaining_size(&self) -> usize {
        self.data.len() - self.index
    }

    /// Returns and consumes every unread byte.
    pub fn get_remaining_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.index..];
        self.index = self.data.len();
        rest
    }

    /// Advances past `count` bytes.
    pub fn skip_bytes(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    /// Reads exactly `count` raw bytes.
    pub fn extract_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        self.take(count)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        let remaining = self.get_remaining_size();
        if count > remaining {
            return Err(BamError::DecodeUnderrun {
                wanted: count,
                remaining,
            });
        }
        let bytes = &self.data[self.index..self.index + count];
        self.index += count;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Reads a bool; any non-zero byte is true.
    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a byte.
    pub fn get_u8(&mut self) -> Result<u8> {
        let [b] = self.take_array()?;
        Ok(b)
    }

    /// Reads a signed byte.
    pub fn get_i8(&mut self) -> Result<i8> {
        let [b] = self.take_array()?;
        Ok(i8::from_le_bytes([b]))
    }

    get_int! {
        get_u16 => u16,
        get_i16 => i16,
        get_u32 => u32,
        get_i32 => i32,
        get_u64 => u64,
        get_i64 => i64,
        get_f32 => f32,
        get_f64 => f64,
    }

    /// Reads a float whose width is chosen by the stream (`stdfloat_double`).
    pub fn get_stdfloat(&mut self) -> Result<f64> {
        if self.stdfloat_double {
            self.get_f64()
        } else {
            self.get_f32().map(f64::from)
        }
    }

    /// Reads a length-prefixed byte string.
    pub fn get_blob(&mut self) -> Result<&'a [u8]> {
        let start = self.index;
        let len = self.get_u32()? as usize;
        self.take(len).inspect_err(|_| self.index = start)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_blob()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BamError::Format(format!("string field is not UTF-8: {e}")))
    }

    /// Reads a `size`-byte string, dropping trailing NUL padding.
    pub fn get_fixed_string(&mut self, size: usize) -> Result<String> {
        let bytes = self.take(size)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| BamError::Format(format!("string field is not UTF-8: {e}")))
    }

    /// Reads a NUL-terminated string.
    pub fn get_z_string(&mut self) -> Result<String> {
        let rest = &self.data[self.index..];
        let Some(end) = rest.iter().position(|&b| b == 0) else {
            return Err(BamError::DecodeUnderrun {
                wanted: rest.len() + 1,
                remaining: rest.len(),
            });
        };
        let bytes = self.take(end + 1)?;
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|e| BamError::Format(format!("string field is not UTF-8: {e}")))
    }

    /// Reads a serde value written by `Datagram::add_serde`.
    pub fn get_serde<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.get_blob()?;
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(value)
    }
}
