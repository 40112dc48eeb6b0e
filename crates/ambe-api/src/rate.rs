use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;

/// An AMBE coding rate: a built-in table index, or six custom rate control
/// words straight from the DVSI datasheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rate {
    /// RATET: index into the chip's rate table (e.g. 33 for DMR / APCO P25
    /// half rate with FEC).
    Table(u8),
    /// RATEP: explicit rate control words (e.g.
    /// `0x0558,0x086b,0x1030,0x0000,0x0000,0x0190` for P25 full rate).
    Custom([u16; 6]),
}

impl Default for Rate {
    fn default() -> Self {
        Rate::Table(33)
    }
}

fn parse_number(text: &str, max: u32) -> Option<u32> {
    let text = text.trim();
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => text.parse::<u32>().ok()?,
    };
    (value <= max).then_some(value)
}

impl FromStr for Rate {
    type Err = ApiError;

    /// A bare number is a table index; six comma-separated numbers (decimal
    /// or `0x` hex) are rate control words.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ApiError::InvalidRate {
            value: text.to_string(),
        };

        if !text.contains(',') {
            let index = parse_number(text, 255).ok_or_else(invalid)?;
            return Ok(Rate::Table(index as u8));
        }

        let words: Vec<u16> = text
            .split(',')
            .map(|word| parse_number(word, u16::MAX as u32).map(|value| value as u16))
            .collect::<Option<_>>()
            .ok_or_else(invalid)?;
        let rcw: [u16; 6] = words.try_into().map_err(|_| invalid())?;
        Ok(Rate::Custom(rcw))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Table(index) => write!(f, "{index}"),
            Rate::Custom(rcw) => {
                for (i, word) in rcw.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "0x{word:04x}")?;
                }
                Ok(())
            }
        }
    }
}
