use std::time::Duration;

use anyhow::Context;

/// The wasmgauge Cargo package version. This environment variable is
/// guaranteed to be made available by Cargo.
pub const WASMGAUGE_VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// The commit revision hash that wasmgauge was built from. This environment
/// variable is set by a custom build script, and is only available when `git`
/// is available.
pub const WASMGAUGE_REVISION: Option<&'static str> =
    option_env!("WASMGAUGE_REVISION");

/// Returns a complete version string for `wasmgauge`.
///
/// If `git` was available while building `wasmgauge`, then this includes the
/// revision hash.
pub fn version() -> String {
    let mut s = WASMGAUGE_VERSION.to_string();
    if let Some(rev) = WASMGAUGE_REVISION {
        s.push_str(&format!(" (rev {})", rev));
    }
    s
}

/// A simple little wrapper type around std::time::Duration that permits
/// serializing and deserializing using a basic human friendly short duration.
///
/// We can get away with being simple here by assuming the duration is short.
/// i.e., No longer than one minute. So all we handle here are seconds,
/// milliseconds, microseconds and nanoseconds.
#[derive(Clone, Copy, Default)]
pub struct ShortHumanDuration(Duration);

impl From<ShortHumanDuration> for Duration {
    fn from(hdur: ShortHumanDuration) -> Duration {
        hdur.0
    }
}

impl From<Duration> for ShortHumanDuration {
    fn from(dur: Duration) -> ShortHumanDuration {
        ShortHumanDuration(dur)
    }
}

impl std::fmt::Debug for ShortHumanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for ShortHumanDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let v = self.0.as_secs_f64();
        if v >= 0.950 {
            write!(f, "{:.2}s", v)
        } else if v >= 0.000_950 {
            write!(f, "{:.2}ms", v * 1_000.0)
        } else if v >= 0.000_000_950 {
            write!(f, "{:.2}us", v * 1_000_000.0)
        } else {
            write!(f, "{:.2}ns", v * 1_000_000_000.0)
        }
    }
}

impl std::str::FromStr for ShortHumanDuration {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ShortHumanDuration> {
        let re = regex!(
            r"(?x)
                ^
                (?P<float>[0-9]+(?:\.[0-9]*)?|\.[0-9]+)
                (?P<units>m|s|ms|us|ns)
                $
            ",
        );
        // Special case: if we have 0, then it's the same regardless of units.
        if s == "0" {
            return Ok(ShortHumanDuration::default());
        }
        let caps = match re.captures(s) {
            Some(caps) => caps,
            None => anyhow::bail!(
                "duration '{}' not in '<decimal>(m|s|ms|us|ns)' format",
                s,
            ),
        };
        let mut value: f64 =
            caps["float"].parse().context("invalid duration decimal")?;
        match &caps["units"] {
            "m" => value *= 60.0,
            "s" => value /= 1.0,
            "ms" => value /= 1_000.0,
            "us" => value /= 1_000_000.0,
            "ns" => value /= 1_000_000_000.0,
            unit => unreachable!("impossible unit '{}'", unit),
        }
        Ok(ShortHumanDuration(Duration::from_secs_f64(value)))
    }
}

impl serde::Serialize for ShortHumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ShortHumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<ShortHumanDuration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl<'de> serde::de::Visitor<'de> for V {
            type Value = ShortHumanDuration;

            fn expecting(
                &self,
                f: &mut std::fmt::Formatter,
            ) -> std::fmt::Result {
                write!(
                    f,
                    "duration string of the form <decimal>(m|s|ms|us|ns)"
                )
            }

            fn visit_str<E>(self, s: &str) -> Result<ShortHumanDuration, E>
            where
                E: serde::de::Error,
            {
                s.parse::<ShortHumanDuration>()
                    .map_err(|e| serde::de::Error::custom(e.to_string()))
            }
        }
        deserializer.deserialize_str(V)
    }
}

/// Serde glue for `Duration` fields that should be read and written in the
/// short human format, e.g. `iter-timeout = "2s"`.
pub mod humandur {
    use std::time::Duration;

    use super::ShortHumanDuration;

    pub fn serialize<S: serde::Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&ShortHumanDuration::from(*d), s)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        let sdur: ShortHumanDuration = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from(sdur))
    }
}

/// Like `humandur`, but for `Option<Duration>` fields.
pub mod humandur_opt {
    use std::time::Duration;

    use super::ShortHumanDuration;

    pub fn serialize<S: serde::Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match *d {
            None => s.serialize_none(),
            Some(d) => s.serialize_some(&ShortHumanDuration::from(d)),
        }
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let sdur: Option<ShortHumanDuration> =
            serde::Deserialize::deserialize(d)?;
        Ok(sdur.map(Duration::from))
    }
}

/// Write the given divider character `width` times to the given writer.
pub fn write_divider<W: std::io::Write>(
    mut wtr: W,
    divider: char,
    width: usize,
) -> anyhow::Result<()> {
    let div: String = std::iter::repeat(divider).take(width).collect();
    write!(wtr, "{}", div)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_human_duration_parse() {
        let dur: ShortHumanDuration = "1.5s".parse().unwrap();
        assert_eq!(Duration::from(dur), Duration::from_millis(1500));
        let dur: ShortHumanDuration = "250ms".parse().unwrap();
        assert_eq!(Duration::from(dur), Duration::from_millis(250));
        let dur: ShortHumanDuration = "2m".parse().unwrap();
        assert_eq!(Duration::from(dur), Duration::from_secs(120));
        assert!("1 hour".parse::<ShortHumanDuration>().is_err());
    }

    #[test]
    fn short_human_duration_display() {
        let d = ShortHumanDuration::from(Duration::from_micros(1500));
        assert_eq!(d.to_string(), "1.50ms");
    }
}
