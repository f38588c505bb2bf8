// Microsecond-resolution time/duration newtypes: a bare signed 64-bit count of microseconds
// since the Unix epoch, rather than anything that pulls in a calendar-arithmetic crate. The
// civil <-> days conversion is Howard Hinnant's well-known `days_from_civil`/`civil_from_days`
// algorithm (public domain; see http://howardhinnant.github.io/date_algorithms.html), chosen so
// `crucible-base` doesn't take on a `chrono`/`time` dependency for a handful of call sites (ISO
// parse/format, and FILETIME-unit key encoding in `crucible-store`).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{err, Error, Result};

/// Microseconds since the Unix epoch (1970-01-01T00:00:00Z), UTC, signed so times before the
/// epoch are representable (not needed in practice here, but costs nothing).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Time(i64);

/// A signed microsecond span, relative to some `Time`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Duration(i64);

/// Microseconds between the Unix epoch and the FILETIME epoch (1601-01-01T00:00:00Z).
const FILETIME_EPOCH_OFFSET_MICROS: i64 = 11_644_473_600_000_000;

impl Duration {
    pub const fn from_micros(micros: i64) -> Self {
        Duration(micros)
    }
    pub const fn from_minutes(minutes: i64) -> Self {
        Duration(minutes * 60_000_000)
    }
    pub const fn from_seconds(seconds: i64) -> Self {
        Duration(seconds * 1_000_000)
    }
    pub const fn as_micros(&self) -> i64 {
        self.0
    }
    pub const fn as_minutes(&self) -> i64 {
        self.0 / 60_000_000
    }
    pub const fn as_seconds_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
    pub const fn zero() -> Self {
        Duration(0)
    }
    pub fn std(&self) -> std::time::Duration {
        if self.0 <= 0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_micros(self.0 as u64)
        }
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Time;
    fn add(self, rhs: Duration) -> Time {
        Time(self.0 + rhs.0)
    }
}
impl std::ops::Sub<Time> for Time {
    type Output = Duration;
    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0 - rhs.0)
    }
}
impl std::ops::Sub<Duration> for Time {
    type Output = Time;
    fn sub(self, rhs: Duration) -> Time {
        Time(self.0 - rhs.0)
    }
}

fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400; // [0, 399]
    let mp = (m + 9) % 12; // [0, 11]
    let doy = (153 * mp + 2) / 5 + d - 1; // [0, 365]
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy; // [0, 146096]
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365; // [0, 399]
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

impl Time {
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Time(dur.as_micros() as i64)
    }

    pub const fn from_unix_micros(micros: i64) -> Self {
        Time(micros)
    }

    pub const fn as_unix_micros(&self) -> i64 {
        self.0
    }

    /// FILETIME-unit encoding (100ns ticks since 1601-01-01), used by `crucible-store`'s
    /// key encoding for `Time`-typed key fields (big-endian, sign-flipped for order).
    pub const fn as_filetime_units(&self) -> i64 {
        (self.0 + FILETIME_EPOCH_OFFSET_MICROS) * 10
    }

    /// Parse `"YYYY-MM-DD HH:MM:SS[.ffffff]"` (UTC implied), per S3.
    pub fn from_iso(s: &str) -> Result<Self> {
        let s = s.trim();
        let (date, rest) = s
            .split_once(' ')
            .ok_or_else(|| err(format!("bad iso time, missing space: {s:?}")))?;
        let mut date_parts = date.split('-');
        let y: i64 = date_parts
            .next()
            .ok_or_else(|| err("missing year"))?
            .parse()
            .map_err(|_| err("bad year"))?;
        let m: i64 = date_parts
            .next()
            .ok_or_else(|| err("missing month"))?
            .parse()
            .map_err(|_| err("bad month"))?;
        let d: i64 = date_parts
            .next()
            .ok_or_else(|| err("missing day"))?
            .parse()
            .map_err(|_| err("bad day"))?;

        let (hms, frac) = match rest.split_once('.') {
            Some((h, f)) => (h, Some(f)),
            None => (rest, None),
        };
        let mut hms_parts = hms.split(':');
        let hh: i64 = hms_parts
            .next()
            .ok_or_else(|| err("missing hour"))?
            .parse()
            .map_err(|_| err("bad hour"))?;
        let mm: i64 = hms_parts
            .next()
            .ok_or_else(|| err("missing minute"))?
            .parse()
            .map_err(|_| err("bad minute"))?;
        let ss: i64 = hms_parts
            .next()
            .ok_or_else(|| err("missing second"))?
            .parse()
            .map_err(|_| err("bad second"))?;

        let micros: i64 = match frac {
            Some(f) => {
                let mut digits = f.to_string();
                while digits.len() < 6 {
                    digits.push('0');
                }
                digits.truncate(6);
                digits.parse().map_err(|_| err("bad fractional seconds"))?
            }
            None => 0,
        };

        let days = days_from_civil(y, m, d);
        let secs_of_day = hh * 3600 + mm * 60 + ss;
        let total_micros = days * 86_400_000_000 + secs_of_day * 1_000_000 + micros;
        Ok(Time(total_micros))
    }

    /// Format as `"YYYY-MM-DD HH:MM:SS.ffffffZ"`, per S3.
    pub fn format_iso_micro_z(&self) -> String {
        let total_micros = self.0;
        let days = total_micros.div_euclid(86_400_000_000);
        let micros_of_day = total_micros.rem_euclid(86_400_000_000);
        let (y, m, d) = civil_from_days(days);
        let secs_of_day = micros_of_day / 1_000_000;
        let micros = micros_of_day % 1_000_000;
        let hh = secs_of_day / 3600;
        let mm = (secs_of_day % 3600) / 60;
        let ss = secs_of_day % 60;
        format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}.{micros:06}Z")
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_iso_micro_z())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_iso_round_trip_s3() {
        let t = Time::from_iso("2019-03-06 22:16:23.012034").unwrap();
        assert_eq!(t.format_iso_micro_z(), "2019-03-06 22:16:23.012034Z");
    }

    #[test]
    fn test_civil_round_trip() {
        for days in [-40000_i64, -1, 0, 1, 365, 10000, 19000, 500000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m as i64, d as i64), days);
        }
    }

    #[test]
    fn test_duration_arith() {
        let t0 = Time::from_unix_micros(0);
        let d = Duration::from_minutes(10);
        let t1 = t0 + d;
        assert_eq!((t1 - t0).as_minutes(), 10);
    }
}
