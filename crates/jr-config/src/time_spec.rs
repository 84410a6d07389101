//! Slurm-style time limit strings.
//!
//! Accepted forms, as in `sbatch --time`:
//! `M`, `M:S`, `H:M:S`, `D-H`, `D-H:M`, `D-H:M:S`.

use jr_common::{Error, Result};

fn field(part: &str, spec: &str) -> Result<u64> {
    let part = part.trim();
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidTimeSpec(format!(
            "'{spec}': '{part}' is not a number"
        )));
    }
    part.parse()
        .map_err(|_| Error::InvalidTimeSpec(format!("'{spec}': '{part}' is out of range")))
}

/// Parse a time limit into seconds.
pub fn parse_time_spec(spec: &str) -> Result<u64> {
    let trimmed = spec.trim();
    let (days, rest) = match trimmed.split_once('-') {
        Some((d, rest)) => (Some(field(d, spec)?), rest),
        None => (None, trimmed),
    };
    let parts: Vec<u64> = rest
        .split(':')
        .map(|p| field(p, spec))
        .collect::<Result<_>>()?;

    let (h, m, s) = match (days.is_some(), parts.as_slice()) {
        (false, [m]) => (0, *m, 0),
        (false, [m, s]) => (0, *m, *s),
        (false, [h, m, s]) => (*h, *m, *s),
        (true, [h]) => (*h, 0, 0),
        (true, [h, m]) => (*h, *m, 0),
        (true, [h, m, s]) => (*h, *m, *s),
        _ => {
            return Err(Error::InvalidTimeSpec(format!(
                "'{spec}': expected M, M:S, H:M:S, D-H, D-H:M or D-H:M:S"
            )))
        }
    };

    let total = days
        .unwrap_or(0)
        .checked_mul(86_400)
        .and_then(|d| d.checked_add(h.checked_mul(3600)?))
        .and_then(|t| t.checked_add(m.checked_mul(60)?))
        .and_then(|t| t.checked_add(s))
        .ok_or_else(|| Error::InvalidTimeSpec(format!("'{spec}': value too large")))?;
    if total == 0 {
        return Err(Error::InvalidTimeSpec(format!(
            "'{spec}': time limit must be positive"
        )));
    }
    Ok(total)
}
