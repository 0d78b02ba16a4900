// Copyright 2024 tsumiki
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

const BINARY_DATA_MAGNITUDE: u64 = 1024;
pub const B: u64 = 1;
pub const KIB: u64 = B * BINARY_DATA_MAGNITUDE;
pub const MIB: u64 = KIB * BINARY_DATA_MAGNITUDE;
pub const GIB: u64 = MIB * BINARY_DATA_MAGNITUDE;
pub const TIB: u64 = GIB * BINARY_DATA_MAGNITUDE;
pub const PIB: u64 = TIB * BINARY_DATA_MAGNITUDE;

/// A byte count that prints and parses with binary units.
#[derive(Clone, Copy, PartialEq, Eq, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize { ReadableSize(count * KIB) }

    pub const fn mb(count: u64) -> ReadableSize { ReadableSize(count * MIB) }

    pub const fn gb(count: u64) -> ReadableSize { ReadableSize(count * GIB) }

    pub const fn as_mb(self) -> u64 { self.0 / MIB }

    pub const fn as_bytes(self) -> u64 { self.0 }

    pub const fn as_bytes_usize(self) -> usize { self.0 as usize }
}

impl FromStr for ReadableSize {
    type Err = String;

    // This method parses value in binary unit.
    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() || !size_str.is_ascii() {
            return Err(format!("{:?} is not a valid size.", s));
        }

        let size_len = size_str
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .count();
        let (size, unit) = size_str.split_at(size_len);

        let unit = match unit.trim() {
            "K" | "KB" | "KiB" | "k" => KIB,
            "M" | "MB" | "MiB" | "m" => MIB,
            "G" | "GB" | "GiB" | "g" => GIB,
            "T" | "TB" | "TiB" | "t" => TIB,
            "P" | "PB" | "PiB" => PIB,
            "B" | "" => B,
            _ => {
                return Err(format!(
                    "only B, KB, KiB, MB, MiB, GB, GiB, TB, TiB, PB, and PiB are supported: {:?}",
                    s
                ));
            }
        };

        match size.parse::<f64>() {
            Ok(n) => Ok(ReadableSize((n * unit as f64) as u64)),
            Err(_) => Err(format!("invalid size string: {:?}", s)),
        }
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= PIB {
            write!(f, "{:.1}PiB", self.0 as f64 / PIB as f64)
        } else if self.0 >= TIB {
            write!(f, "{:.1}TiB", self.0 as f64 / TIB as f64)
        } else if self.0 >= GIB {
            write!(f, "{:.1}GiB", self.0 as f64 / GIB as f64)
        } else if self.0 >= MIB {
            write!(f, "{:.1}MiB", self.0 as f64 / MIB as f64)
        } else if self.0 >= KIB {
            write!(f, "{:.1}KiB", self.0 as f64 / KIB as f64)
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

impl Debug for ReadableSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self) }
}

/// The one-letter unit used by store configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeUnit {
    Byte,
    Kilo,
    Mega,
    Giga,
    Tera,
}

impl SizeUnit {
    pub fn from_letter(c: char) -> Option<SizeUnit> {
        match c {
            'B' | 'b' => Some(SizeUnit::Byte),
            'K' | 'k' => Some(SizeUnit::Kilo),
            'M' | 'm' => Some(SizeUnit::Mega),
            'G' | 'g' => Some(SizeUnit::Giga),
            'T' | 't' => Some(SizeUnit::Tera),
            _ => None,
        }
    }

    pub const fn letter(self) -> char {
        match self {
            SizeUnit::Byte => 'B',
            SizeUnit::Kilo => 'K',
            SizeUnit::Mega => 'M',
            SizeUnit::Giga => 'G',
            SizeUnit::Tera => 'T',
        }
    }

    pub const fn multiplier(self) -> u64 {
        match self {
            SizeUnit::Byte => B,
            SizeUnit::Kilo => KIB,
            SizeUnit::Mega => MIB,
            SizeUnit::Giga => GIB,
            SizeUnit::Tera => TIB,
        }
    }
}

/// A size written as `<digits><unit letter>`, such as `10G`.
///
/// The amount and unit are kept apart so the value renders back exactly as
/// it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSize {
    pub amount: u64,
    pub unit:   SizeUnit,
}

impl UnitSize {
    pub const fn new(amount: u64, unit: SizeUnit) -> Self { Self { amount, unit } }

    pub fn as_bytes(&self) -> u64 { self.amount.saturating_mul(self.unit.multiplier()) }

    pub fn as_readable(&self) -> ReadableSize { ReadableSize(self.as_bytes()) }
}

impl FromStr for UnitSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let unit = chars
            .next_back()
            .and_then(SizeUnit::from_letter)
            .ok_or_else(|| format!("{:?} has no valid unit, expect one of T/G/M/K/B", s))?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("{:?} is not a valid size", s));
        }
        let amount = digits
            .parse::<u64>()
            .map_err(|e| format!("invalid size {:?}: {}", s, e))?;
        Ok(UnitSize { amount, unit })
    }
}

impl Display for UnitSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.letter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_size() {
        let s = ReadableSize::kb(2);
        assert_eq!(s.0, 2048);
        assert_eq!(s.as_mb(), 0);
        let s = ReadableSize::gb(2);
        assert_eq!(s.as_mb(), 2048);

        assert_eq!("4M".parse::<ReadableSize>().unwrap(), ReadableSize::mb(4));
        assert_eq!("64KiB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(64));
        assert_eq!("512".parse::<ReadableSize>().unwrap(), ReadableSize(512));
        assert!("4X".parse::<ReadableSize>().is_err());
        assert_eq!(ReadableSize::mb(4).to_string(), "4.0MiB");
    }

    #[test]
    fn test_unit_size() {
        let s: UnitSize = "10G".parse().unwrap();
        assert_eq!(s, UnitSize::new(10, SizeUnit::Giga));
        assert_eq!(s.as_bytes(), 10 * GIB);
        assert_eq!(s.to_string(), "10G");

        let s: UnitSize = "3t".parse().unwrap();
        assert_eq!(s.to_string(), "3T");
        let s: UnitSize = "512k".parse().unwrap();
        assert_eq!(s.as_bytes(), 512 * KIB);

        assert!("G".parse::<UnitSize>().is_err());
        assert!("10".parse::<UnitSize>().is_err());
        assert!("1.5G".parse::<UnitSize>().is_err());
        assert!("10X".parse::<UnitSize>().is_err());
    }
}
