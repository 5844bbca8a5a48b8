use serde::Serialize;

use crate::error::{BamError, Result};
use crate::format::BamEndian;

/// One encoded record: an append-only byte buffer with a fixed byte order.
///
/// Values are written back to back with no tags; the reading side must call
/// the matching `get_*` accessors in exactly the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    data: Vec<u8>,
    endian: BamEndian,
    stdfloat_double: bool,
}

macro_rules! add_int {
    ($($name:ident => $t:ty),* $(,)?) => {
        $(
            #[doc = concat!("Appends a `", stringify!($t), "` in the datagram's byte order.")]
            pub fn $name(&mut self, value: $t) {
                match self.endian {
                    BamEndian::Little => self.data.extend_from_slice(&value.to_le_bytes()),
                    BamEndian::Big => self.data.extend_from_slice(&value.to_be_bytes()),
                }
            }
        )*
    };
}

impl Datagram {
    /// Creates an empty datagram.
    pub fn new(endian: BamEndian, stdfloat_double: bool) -> Self {
        Self {
            data: Vec::new(),
            endian,
            stdfloat_double,
        }
    }

    /// Wraps bytes that were already encoded.
    pub fn from_bytes(data: Vec<u8>, endian: BamEndian, stdfloat_double: bool) -> Self {
        Self {
            data,
            endian,
            stdfloat_double,
        }
    }

    /// Byte order used for numeric fields.
    pub fn endian(&self) -> BamEndian {
        self.endian
    }

    /// Whether `add_stdfloat` writes 64-bit values.
    pub fn stdfloat_double(&self) -> bool {
        self.stdfloat_double
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the datagram, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Appends a bool as a single byte.
    pub fn add_bool(&mut self, value: bool) {
        self.data.push(u8::from(value));
    }

    /// Appends a byte.
    pub fn add_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Appends a signed byte.
    pub fn add_i8(&mut self, value: i8) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    add_int! {
        add_u16 => u16,
        add_i16 => i16,
        add_u32 => u32,
        add_i32 => i32,
        add_u64 => u64,
        add_i64 => i64,
        add_f32 => f32,
        add_f64 => f64,
    }

    /// Appends a float whose width is chosen by the stream (`stdfloat_double`).
    pub fn add_stdfloat(&mut self, value: f64) {
        if self.stdfloat_double {
            self.add_f64(value);
        } else {
            self.add_f32(value as f32);
        }
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn add_string(&mut self, value: &str) -> Result<()> {
        self.add_blob(value.as_bytes())
    }

    /// Appends a length-prefixed byte string.
    pub fn add_blob(&mut self, value: &[u8]) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| {
            BamError::Logic(format!("blob of {} bytes exceeds u32 length", value.len()))
        })?;
        self.add_u32(len);
        self.data.extend_from_slice(value);
        Ok(())
    }

    /// Appends `value` in exactly `size` bytes, padded with NUL. A longer
    /// value is cut at the last character boundary that fits.
    pub fn add_fixed_string(&mut self, value: &str, size: usize) {
        let mut used = value.len().min(size);
        while !value.is_char_boundary(used) {
            used -= 1;
        }
        self.data.extend_from_slice(&value.as_bytes()[..used]);
        self.pad_bytes(size - used);
    }

    /// Appends a NUL-terminated string.
    pub fn add_z_string(&mut self, value: &str) -> Result<()> {
        if value.as_bytes().contains(&0) {
            return Err(BamError::Logic(
                "NUL-terminated string contains a NUL byte".into(),
            ));
        }
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        Ok(())
    }

    /// Appends a serde value, bincode-encoded and stored as a blob.
    pub fn add_serde<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        self.add_blob(&bytes)
    }

    /// Appends raw bytes without a prefix.
    pub fn append_data(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Appends `count` zero bytes.
    pub fn pad_bytes(&mut self, count: usize) {
        self.data.resize(self.data.len() + count, 0);
    }
}
