//! Plain (non-pointer) field values.

use crate::datagram::{Datagram, DatagramIterator};
use crate::error::{BamError, Result};

/// A value stored inline in a record.
///
/// Implemented for the primitive types, `String`, `Vec<T>` and `Option<T>`.
/// `#[derive(BamObject)]` uses it for every field not marked `pointer`,
/// `serde`, `base` or `skip`.
pub trait BamValue: Sized {
    /// Appends the value.
    fn write_value(&self, dg: &mut Datagram) -> Result<()>;

    /// Reads a value written by `write_value`.
    fn read_value(scan: &mut DatagramIterator<'_>) -> Result<Self>;
}

macro_rules! impl_primitive_value {
    ($($t:ty => $add:ident, $get:ident);* $(;)?) => {
        $(
            impl BamValue for $t {
                fn write_value(&self, dg: &mut Datagram) -> Result<()> {
                    dg.$add(*self);
                    Ok(())
                }

                fn read_value(scan: &mut DatagramIterator<'_>) -> Result<Self> {
                    scan.$get()
                }
            }
        )*
    };
}

impl_primitive_value! {
    bool => add_bool, get_bool;
    u8 => add_u8, get_u8;
    i8 => add_i8, get_i8;
    u16 => add_u16, get_u16;
    i16 => add_i16, get_i16;
    u32 => add_u32, get_u32;
    i32 => add_i32, get_i32;
    u64 => add_u64, get_u64;
    i64 => add_i64, get_i64;
    f32 => add_f32, get_f32;
    f64 => add_f64, get_f64;
}

impl BamValue for String {
    fn write_value(&self, dg: &mut Datagram) -> Result<()> {
        dg.add_string(self)
    }

    fn read_value(scan: &mut DatagramIterator<'_>) -> Result<Self> {
        scan.get_string()
    }
}

impl<T: BamValue> BamValue for Vec<T> {
    fn write_value(&self, dg: &mut Datagram) -> Result<()> {
        let len = u32::try_from(self.len())
            .map_err(|_| BamError::Logic("list exceeds u32 length".into()))?;
        dg.add_u32(len);
        for item in self {
            item.write_value(dg)?;
        }
        Ok(())
    }

    fn read_value(scan: &mut DatagramIterator<'_>) -> Result<Self> {
        let len = scan.get_u32()? as usize;
        // Every element takes at least one byte.
        let mut items = Vec::with_capacity(len.min(scan.get_remaining_size()));
        for _ in 0..len {
            items.push(T::read_value(scan)?);
        }
        Ok(items)
    }
}

impl<T: BamValue> BamValue for Option<T> {
    fn write_value(&self, dg: &mut Datagram) -> Result<()> {
        dg.add_bool(self.is_some());
        match self {
            Some(value) => value.write_value(dg),
            None => Ok(()),
        }
    }

    fn read_value(scan: &mut DatagramIterator<'_>) -> Result<Self> {
        if scan.get_bool()? {
            T::read_value(scan).map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::BamEndian;

    #[test]
    fn nested_values_read_back() -> Result<()> {
        let names = vec!["a".to_string(), String::new(), "long name".to_string()];
        let maybe: Option<Vec<u16>> = Some(vec![1, 2, 3]);
        let nothing: Option<i64> = None;

        let mut dg = Datagram::new(BamEndian::Big, false);
        names.write_value(&mut dg)?;
        maybe.write_value(&mut dg)?;
        nothing.write_value(&mut dg)?;
        (-7i32).write_value(&mut dg)?;

        let mut scan = DatagramIterator::new(dg.as_bytes(), BamEndian::Big, false);
        assert_eq!(Vec::<String>::read_value(&mut scan)?, names);
        assert_eq!(Option::<Vec<u16>>::read_value(&mut scan)?, maybe);
        assert_eq!(Option::<i64>::read_value(&mut scan)?, nothing);
        assert_eq!(i32::read_value(&mut scan)?, -7);
        assert_eq!(scan.get_remaining_size(), 0);
        Ok(())
    }

    #[test]
    fn oversized_list_count_fails_cleanly() {
        let mut dg = Datagram::new(BamEndian::Little, false);
        dg.add_u32(u32::MAX);
        dg.add_u8(1);
        let mut scan = DatagramIterator::new(dg.as_bytes(), BamEndian::Little, false);
        assert!(matches!(
            Vec::<u32>::read_value(&mut scan),
            Err(BamError::DecodeUnderrun { .. })
        ));
    }
}
