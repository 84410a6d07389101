//! Typed columns.
//!
//! A [`Column`] owns an ordered `Vec<T>` and adds the operations the record
//! table needs on top of it: reordering by a permutation, element-wise binary
//! encoding, CSV field conversion and, for numeric element types,
//! sentinel-aware aggregation.

use jr_common::{Error, Result};
use jr_math::Measure;
use std::fmt::Debug;
use std::io::{ErrorKind, Read, Write};
use std::ops::Index;

/// Upper bound on a decoded string length. Anything longer is corruption.
const MAX_STRING_BYTES: u32 = 64 * 1024;

/// A value that can live in a [`Column`].
pub trait Element: Clone + Debug + PartialEq + Sized {
    /// Append the little-endian binary encoding of `self` to `sink`.
    fn write_binary<W: Write>(&self, sink: &mut W) -> Result<()>;

    /// Decode one value from `source`.
    ///
    /// Running out of input before the value is complete is a decode error.
    fn read_binary<R: Read>(source: &mut R) -> Result<Self>;

    /// Render as a CSV field.
    fn to_field(&self) -> Result<String>;

    /// Parse a CSV field.
    fn parse_field(field: &str) -> Result<Self>;
}

fn read_exact_or_corrupt<R: Read>(source: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Decode(format!(
                "unexpected end of stream while reading {what}; is the file corrupted?"
            ))
        } else {
            Error::Io(e)
        }
    })
}

macro_rules! integer_element {
    ($ty:ty) => {
        impl Element for $ty {
            fn write_binary<W: Write>(&self, sink: &mut W) -> Result<()> {
                sink.write_all(&self.to_le_bytes())?;
                Ok(())
            }

            fn read_binary<R: Read>(source: &mut R) -> Result<Self> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                read_exact_or_corrupt(source, &mut buf, stringify!($ty))?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            fn to_field(&self) -> Result<String> {
                Ok(self.to_string())
            }

            fn parse_field(field: &str) -> Result<Self> {
                field.trim().parse::<$ty>().map_err(|e| {
                    Error::Decode(format!(
                        "invalid {} value '{}': {e}",
                        stringify!($ty),
                        field
                    ))
                })
            }
        }
    };
}

integer_element!(u32);
integer_element!(i32);
integer_element!(i64);

impl Element for f64 {
    fn write_binary<W: Write>(&self, sink: &mut W) -> Result<()> {
        sink.write_all(&self.to_le_bytes())?;
        Ok(())
    }

    fn read_binary<R: Read>(source: &mut R) -> Result<Self> {
        let mut buf = [0u8; 8];
        read_exact_or_corrupt(source, &mut buf, "f64")?;
        Ok(f64::from_le_bytes(buf))
    }

    // Fixed-point, never exponent notation. NaN renders as "NaN" and parses back.
    fn to_field(&self) -> Result<String> {
        Ok(format!("{:.6}", self))
    }

    fn parse_field(field: &str) -> Result<Self> {
        field
            .trim()
            .parse::<f64>()
            .map_err(|e| Error::Decode(format!("invalid f64 value '{field}': {e}")))
    }
}

impl Element for String {
    fn write_binary<W: Write>(&self, sink: &mut W) -> Result<()> {
        let len = u32::try_from(self.len())
            .ok()
            .filter(|len| *len <= MAX_STRING_BYTES)
            .ok_or_else(|| Error::Encode(format!("string of {} bytes is too long", self.len())))?;
        sink.write_all(&len.to_le_bytes())?;
        sink.write_all(self.as_bytes())?;
        Ok(())
    }

    fn read_binary<R: Read>(source: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        read_exact_or_corrupt(source, &mut len_buf, "string length")?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_STRING_BYTES {
            return Err(Error::Decode(format!(
                "string length {len} exceeds limit of {MAX_STRING_BYTES} bytes"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        read_exact_or_corrupt(source, &mut bytes, "string")?;
        String::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8 string: {e}")))
    }

    fn to_field(&self) -> Result<String> {
        if self.contains([',', '\n', '\r']) {
            return Err(Error::Encode(format!(
                "value '{}' cannot be stored in a CSV field",
                self.escape_debug()
            )));
        }
        Ok(self.clone())
    }

    fn parse_field(field: &str) -> Result<Self> {
        Ok(field.to_string())
    }
}

/// Check that `order` is a bijection on `[0, len)`.
pub(crate) fn validate_permutation(order: &[usize], len: usize) -> Result<()> {
    if order.len() != len {
        return Err(Error::InvalidPermutation(format!(
            "permutation has {} entries for {} rows",
            order.len(),
            len
        )));
    }
    let mut seen = vec![false; len];
    for &idx in order {
        if idx >= len {
            return Err(Error::InvalidPermutation(format!(
                "index {idx} out of range for {len} rows"
            )));
        }
        if std::mem::replace(&mut seen[idx], true) {
            return Err(Error::InvalidPermutation(format!("index {idx} repeated")));
        }
    }
    Ok(())
}

/// An ordered, homogeneously-typed sequence of values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Column<T> {
    values: Vec<T>,
}

impl<T: Element> Column<T> {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn push(&mut self, value: T) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }

    pub fn extend_from(&mut self, other: &Column<T>) {
        self.values.extend_from_slice(&other.values);
    }

    /// Rebuild the column so that position `i` holds the old `order[i]`-th value.
    pub fn permute(&mut self, order: &[usize]) -> Result<()> {
        validate_permutation(order, self.len())?;
        self.reorder(order);
        Ok(())
    }

    /// Apply an already validated permutation.
    pub(crate) fn reorder(&mut self, order: &[usize]) {
        self.values = order.iter().map(|&i| self.values[i].clone()).collect();
    }

    /// Write the binary encoding of the value at `index`.
    pub fn write<W: Write>(&self, sink: &mut W, index: usize) -> Result<()> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::Encode(format!("row {index} out of range for {} rows", self.len()))
        })?;
        value.write_binary(sink)
    }

    /// Decode one value from `source` and append it.
    pub fn read<R: Read>(&mut self, source: &mut R) -> Result<()> {
        let value = T::read_binary(source)?;
        self.values.push(value);
        Ok(())
    }
}

impl<T: Element + Measure> Column<T> {
    /// Sum of the valid entries; the sentinel if there are none.
    pub fn sum(&self) -> T {
        jr_math::sum(&self.values)
    }

    /// Average over the valid entries only; the sentinel if there are none.
    pub fn average(&self) -> T {
        jr_math::mean(&self.values)
    }

    /// Smallest valid entry. `None` for an empty column.
    pub fn min(&self) -> Option<T> {
        jr_math::min(&self.values)
    }

    /// Largest valid entry. `None` for an empty column.
    pub fn max(&self) -> Option<T> {
        jr_math::max(&self.values)
    }
}

impl<T> Index<usize> for Column<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.values[index]
    }
}

impl<T: Element> FromIterator<T> for Column<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
