use part::{align_up, PartitionError};

// Splits a number written with a C-style radix prefix ("0x" hex, "0" octal,
// decimal otherwise) from whatever trails it
fn parse_prefixed(text: &str) -> Result<(u64, &str), PartitionError> {
    let (radix, body) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (16, hex)
    } else if text.len() > 1 && text.starts_with('0') {
        (8, &text[1..])
    } else {
        (10, text)
    };

    let end = body
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(body.len());
    let (digits, rest) = body.split_at(end);

    if digits.is_empty() {
        if radix == 8 {
            return Ok((0, rest));
        }

        return Err(PartitionError::Input(format!("Couldn't parse {text:?}")));
    }

    let value = u64::from_str_radix(digits, radix)
        .map_err(|err| PartitionError::Input(format!("Couldn't parse {text:?}: {err}")))?;

    Ok((value, rest))
}

/// Parses a size, in bytes, with an optional `B`, `K`, `M`, `G` or `T` unit
/// suffix in powers of 1024.
///
/// The number can be written in decimal, in hexadecimal with a `0x` prefix or
/// in octal with a `0` prefix.
///
/// # Errors
///
/// Returns [`PartitionError::Input`] if the text can't be parsed, if the
/// suffix is unknown, or if the size overflows once the unit is applied.
pub fn parse_size(text: &str) -> Result<u64, PartitionError> {
    let (value, suffix) = parse_prefixed(text)?;

    let shift = match suffix {
        "" | "B" => 0,
        "K" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        _ => {
            return Err(PartitionError::Input(format!(
                "Bad size suffix {suffix:?} in {text:?}"
            )))
        }
    };

    value
        .checked_mul(1 << shift)
        .ok_or_else(|| PartitionError::Input(format!("Size {text} overflows")))
}

/// Parses a DOS disk identifier, a 32-bit number in decimal, `0x` hex or `0`
/// octal
///
/// # Errors
///
/// Returns [`PartitionError::Input`] if the text can't be parsed or doesn't
/// fit in 32 bits.
pub fn parse_dos_label(text: &str) -> Result<u32, PartitionError> {
    let (value, rest) = parse_prefixed(text)?;

    if !rest.is_empty() {
        return Err(PartitionError::Input(format!(
            "Couldn't parse DOS disk label {text:?}"
        )));
    }

    u32::try_from(value).map_err(|_err| {
        PartitionError::Input(format!("DOS disk label {text} too large"))
    })
}

/// Sums the given sizes, aligns the result to `1 << align_bits` bytes, adds
/// `extra` bytes and aligns again, then converts it to units of
/// `1 << unit_bits` bytes.
///
/// A zero `align_bits` disables the alignment.
///
/// # Errors
///
/// Returns [`PartitionError::Range`] if any step overflows.
pub fn aligned_size<I>(
    sizes: I,
    extra: u64,
    align_bits: u32,
    unit_bits: u32,
) -> Result<u64, PartitionError>
where
    I: IntoIterator<Item = u64>,
{
    let align = |size: u64| {
        if align_bits == 0 {
            Ok(size)
        } else {
            align_up(size, align_bits)
        }
    };

    let total = sizes.into_iter().try_fold(0_u64, |acc, size| {
        acc.checked_add(size)
            .ok_or_else(|| PartitionError::Range(String::from("Total size overflows")))
    })?;

    let total = align(total)?
        .checked_add(extra)
        .ok_or_else(|| PartitionError::Range(format!("Adding {extra} bytes overflows")))?;

    let total = align(total)?;

    total
        .checked_shr(unit_bits)
        .ok_or_else(|| PartitionError::Range(format!("Units of {unit_bits} bits")))
}

#[cfg(test)]
mod tests {
    use part::{PartitionError, MIB};
    use test_log::test;

    use super::{aligned_size, parse_dos_label, parse_size};

    #[test]
    fn test_parse_size_plain() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("1M").unwrap(), MIB);
        assert_eq!(parse_size("8G").unwrap(), 8_u64 << 30);
        assert_eq!(parse_size("2T").unwrap(), 2_u64 << 40);
    }

    #[test]
    fn test_parse_size_radix() {
        assert_eq!(parse_size("0x10").unwrap(), 16);
        assert_eq!(parse_size("0x1B").unwrap(), 27);
        assert_eq!(parse_size("0x10M").unwrap(), 16 * MIB);
        assert_eq!(parse_size("010").unwrap(), 8);
        assert_eq!(parse_size("0K").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_bad_suffix() {
        assert!(matches!(parse_size("12Q"), Err(PartitionError::Input(_))));
        assert!(matches!(parse_size("12MB"), Err(PartitionError::Input(_))));
        assert!(matches!(parse_size("08"), Err(PartitionError::Input(_))));
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(matches!(parse_size(""), Err(PartitionError::Input(_))));
        assert!(matches!(parse_size("-4K"), Err(PartitionError::Input(_))));
        assert!(matches!(parse_size("M"), Err(PartitionError::Input(_))));
    }

    #[test]
    fn test_parse_size_overflow() {
        assert!(matches!(
            parse_size("16777216T"),
            Err(PartitionError::Input(_))
        ));
        assert!(matches!(
            parse_size("99999999999999999999"),
            Err(PartitionError::Input(_))
        ));
    }

    #[test]
    fn test_parse_dos_label() {
        assert_eq!(parse_dos_label("0x77777777").unwrap(), 0x7777_7777);
        assert_eq!(parse_dos_label("1234").unwrap(), 1234);
        assert_eq!(parse_dos_label("017").unwrap(), 15);
        assert!(matches!(
            parse_dos_label("0x100000000"),
            Err(PartitionError::Input(_))
        ));
        assert!(matches!(
            parse_dos_label("12K"),
            Err(PartitionError::Input(_))
        ));
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size([1000, 24], 0, 0, 0).unwrap(), 1024);
        assert_eq!(aligned_size([1], 0, 20, 0).unwrap(), MIB);
        assert_eq!(aligned_size([MIB], 1, 20, 0).unwrap(), 2 * MIB);
        assert_eq!(aligned_size([MIB, 1], 0, 20, 9).unwrap(), 4096);
        assert_eq!(aligned_size(Vec::new(), 0, 20, 0).unwrap(), 0);
    }

    #[test]
    fn test_aligned_size_overflow() {
        assert!(matches!(
            aligned_size([u64::MAX, 1], 0, 0, 0),
            Err(PartitionError::Range(_))
        ));
        assert!(matches!(
            aligned_size([u64::MAX - 10], 0, 20, 0),
            Err(PartitionError::Range(_))
        ));
    }
}
