//! Strongly typed byte quantities, with the `M`/`G` unit suffixes the
//! gadget manifest format uses.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
/// Relative offsets (`offset-write` targets) may not point further than this
/// into a structure.
pub const MAX_RELATIVE_OFFSET: u64 = 4 * GIB;

/// An absolute count of bytes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Size(pub u64);

/// A byte position, 0-based from the start of a volume or structure.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Size {
    pub const fn bytes(n: u64) -> Self {
        Size(n)
    }

    pub fn checked_add(self, rhs: Size) -> Option<Size> {
        self.0.checked_add(rhs.0).map(Size)
    }
}

impl Offset {
    pub const fn bytes(n: u64) -> Self {
        Offset(n)
    }

    pub fn checked_add_size(self, size: Size) -> Option<Offset> {
        self.0.checked_add(size.0).map(Offset)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<Size> for Offset {
    type Output = Offset;
    fn add(self, rhs: Size) -> Offset {
        Offset(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Offset {
    type Output = Size;
    fn sub(self, rhs: Offset) -> Size {
        Size(self.0.checked_sub(rhs.0).expect("offset underflow"))
    }
}

/// Split `<digits><unit>` into the numeric prefix and the (possibly empty) unit.
fn split_unit(s: &str) -> Result<(&str, &str)> {
    let s = s.trim();
    let split_at = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split_at);
    if digits.is_empty() {
        return Err(Error::Parse(format!("missing numeric prefix in {s:?}")));
    }
    Ok((digits, unit))
}

fn unit_multiplier(unit: &str) -> Result<u64> {
    match unit {
        "" => Ok(1),
        "M" => Ok(MIB),
        "G" => Ok(GIB),
        other => Err(Error::Parse(format!("unknown size unit {other:?}"))),
    }
}

/// Parse a gadget-manifest size literal such as `1200M` or `512`.
pub fn parse_size(s: &str) -> Result<Size> {
    let (digits, unit) = split_unit(s)?;
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::Parse(format!("invalid size {s:?}")))?;
    let mult = unit_multiplier(unit)?;
    let bytes = n
        .checked_mul(mult)
        .ok_or_else(|| Error::Parse(format!("size {s:?} overflows a 64-bit byte count")))?;
    Ok(Size(bytes))
}

/// Parse a gadget-manifest absolute offset literal.
pub fn parse_offset(s: &str) -> Result<Offset> {
    Ok(Offset(parse_size(s)?.0))
}

/// `[<name>+]<size>` as used by `offset-write`. Serializes back to the
/// single-string manifest spelling (`"mbr+92"` / `"92"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelativeOffset {
    pub relative_to: Option<String>,
    pub offset: Size,
}

impl fmt::Display for RelativeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relative_to {
            Some(name) => write!(f, "{name}+{}", self.offset),
            None => write!(f, "{}", self.offset),
        }
    }
}

impl Serialize for RelativeOffset {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RelativeOffset {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        parse_relative_offset(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a `RelativeOffset`, rejecting magnitudes above [`MAX_RELATIVE_OFFSET`].
pub fn parse_relative_offset(s: &str) -> Result<RelativeOffset> {
    let (relative_to, size_part) = match s.rsplit_once('+') {
        Some((name, size)) => (Some(name.to_string()), size),
        None => (None, s),
    };
    let offset = parse_size(size_part)?;
    if offset.0 > MAX_RELATIVE_OFFSET {
        return Err(Error::Parse(format!(
            "relative offset {s:?} exceeds the maximum of {MAX_RELATIVE_OFFSET} bytes"
        )));
    }
    Ok(RelativeOffset {
        relative_to,
        offset,
    })
}

impl FromStr for Size {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_size(s)
    }
}

impl FromStr for Offset {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        parse_offset(s)
    }
}
