//! Per-partition configuration
//!
//! Configuration keys follow Kafka's names and semantics where they overlap.
//! Files are `key = value` lines with `#` comments; durations and sizes use a
//! compact grammar of `<number><unit>` terms optionally joined by `,` or `+`
//! (`1h+30m`, `512mb,256kb`). A term without a unit means seconds or bytes.

use crate::error::{Result, TankError};
use std::path::Path;
use tracing::warn;

/// Retention strategy for sealed segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupPolicy {
    /// Unlink the oldest sealed segments past the count/size/age limits
    #[default]
    Delete,
    /// Key-based log cleaning: rewrite the sealed run keeping the latest
    /// message per key
    Cleanup,
}

/// Validated knobs of one partition log
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// `retention.segments.count`: max sealed segments (0 disables, else >= 2)
    pub ro_segments_cnt: u32,
    /// `log.retention.bytes`: max total sealed size (0 disables, else >= 128)
    pub ro_segments_size: u64,
    /// `log.retention.secs`: max age of the oldest sealed segment (0 disables)
    pub last_segment_max_age: u32,
    /// `log.cleanup.policy`
    pub log_cleanup_policy: CleanupPolicy,
    /// `log.cleaner.min.cleanable.ratio`: dirty-ratio threshold in [0, 1]
    pub log_clean_ratio_min: f64,
    /// `log.segment.bytes`: active segment roll threshold (>= 64)
    pub max_segment_size: u64,
    /// `log.index.interval.bytes`: sparse index stride (>= 128)
    pub index_interval: u64,
    /// `log.index.size.max.bytes`: index-size roll threshold (>= 128)
    pub max_index_size: u64,
    /// `log.roll.secs`: age-based roll interval (0 disables)
    pub cur_segment_max_age: u32,
    /// `log.roll.jitter.secs`: upper bound of the stable per-partition jitter
    pub max_roll_jitter_secs: u32,
    /// `flush.messages`: schedule a flush after this many appended messages
    pub flush_interval_msgs: u32,
    /// `flush.secs`: schedule a flush after this much wall time
    pub flush_interval_secs: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            ro_segments_cnt: 0,
            ro_segments_size: 0,
            last_segment_max_age: 0,
            log_cleanup_policy: CleanupPolicy::Delete,
            log_clean_ratio_min: 0.5,
            max_segment_size: 1024 * 1024 * 1024,
            index_interval: 4096,
            max_index_size: 10 * 1024 * 1024,
            cur_segment_max_age: 0,
            max_roll_jitter_secs: 0,
            flush_interval_msgs: 0,
            flush_interval_secs: 0,
        }
    }
}

// Longest names first so e.g. "mon" cannot shadow "month" or "m" shadow "mb".
const DURATION_UNITS: &[(&str, u64)] = &[
    ("seconds", 1),
    ("second", 1),
    ("secs", 1),
    ("sec", 1),
    ("minutes", 60),
    ("minute", 60),
    ("mins", 60),
    ("min", 60),
    ("months", 86_400 * 30),
    ("month", 86_400 * 30),
    ("mon", 86_400 * 30),
    ("hours", 3_600),
    ("hour", 3_600),
    ("weeks", 86_400 * 7),
    ("week", 86_400 * 7),
    ("years", 86_400 * 365),
    ("year", 86_400 * 365),
    ("days", 86_400),
    ("day", 86_400),
    ("s", 1),
    ("m", 60),
    ("h", 3_600),
    ("w", 86_400 * 7),
    ("y", 86_400 * 365),
    ("d", 86_400),
];

const SIZE_UNITS: &[(&str, u64)] = &[
    ("terabytes", 1 << 40),
    ("terabyte", 1 << 40),
    ("tbs", 1 << 40),
    ("tb", 1 << 40),
    ("gigabytes", 1 << 30),
    ("gigabyte", 1 << 30),
    ("gbs", 1 << 30),
    ("gb", 1 << 30),
    ("megabytes", 1 << 20),
    ("megabyte", 1 << 20),
    ("mbs", 1 << 20),
    ("mb", 1 << 20),
    ("kilobytes", 1 << 10),
    ("kilobyte", 1 << 10),
    ("kbs", 1 << 10),
    ("kb", 1 << 10),
    ("bytes", 1),
    ("byte", 1),
    ("t", 1 << 40),
    ("g", 1 << 30),
    ("m", 1 << 20),
    ("k", 1 << 10),
    ("b", 1),
];

fn parse_terms(input: &str, units: &[(&str, u64)]) -> Option<u64> {
    let mut s = input;
    let mut sum: u64 = 0;
    if s.is_empty() {
        return None;
    }
    while !s.is_empty() {
        let digits = s.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        let n: u64 = s[..digits].parse().ok()?;
        s = &s[digits..];

        let mut scale = 1u64;
        for (unit, unit_scale) in units {
            if let Some(rest) = s.strip_prefix(unit) {
                scale = *unit_scale;
                s = rest;
                break;
            }
        }

        if let Some(rest) = s.strip_prefix(',') {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('+') {
            s = rest;
        }

        sum = sum.checked_add(n.checked_mul(scale)?)?;
    }
    Some(sum)
}

/// Parse a duration expression into seconds. A bare number means seconds.
pub fn parse_duration(input: &str) -> Option<u32> {
    parse_terms(input, DURATION_UNITS).and_then(|v| u32::try_from(v).ok())
}

/// Parse a size expression into bytes (base-1024 units). A bare number means
/// bytes.
pub fn parse_size(input: &str) -> Option<u64> {
    parse_terms(input, SIZE_UNITS)
}

fn invalid(key: &str, value: &str) -> TankError {
    TankError::ConfigInvalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl PartitionConfig {
    /// Apply `key = value` lines on top of the current configuration.
    ///
    /// Unknown keys are logged and skipped; invalid values abort with
    /// [`TankError::ConfigInvalid`] leaving earlier assignments in place.
    pub fn apply(&mut self, contents: &str) -> Result<()> {
        for raw_line in contents.lines() {
            let line = match raw_line.split_once('#') {
                Some((before, _)) => before,
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (k, v) = line.split_once('=').ok_or_else(|| invalid(line, ""))?;
            let (k, v) = (k.trim(), v.trim());
            if v.is_empty() || v.len() > 128 {
                return Err(invalid(k, v));
            }

            if k.eq_ignore_ascii_case("retention.segments.count") {
                let n: u32 = v.parse().map_err(|_| invalid(k, v))?;
                if n != 0 && n < 2 {
                    return Err(invalid(k, v));
                }
                self.ro_segments_cnt = n;
            } else if k.eq_ignore_ascii_case("log.cleanup.policy") {
                self.log_cleanup_policy = if v.eq_ignore_ascii_case("cleanup") {
                    CleanupPolicy::Cleanup
                } else if v.eq_ignore_ascii_case("delete") {
                    CleanupPolicy::Delete
                } else {
                    return Err(invalid(k, v));
                };
            } else if k.eq_ignore_ascii_case("log.cleaner.min.cleanable.ratio") {
                let ratio: f64 = v.parse().map_err(|_| invalid(k, v))?;
                if !(0.0..=1.0).contains(&ratio) {
                    return Err(invalid(k, v));
                }
                self.log_clean_ratio_min = ratio;
            } else if k.eq_ignore_ascii_case("log.retention.secs") {
                self.last_segment_max_age = parse_duration(v).ok_or_else(|| invalid(k, v))?;
            } else if k.eq_ignore_ascii_case("log.retention.bytes") {
                let n = parse_size(v).ok_or_else(|| invalid(k, v))?;
                if n != 0 && n < 128 {
                    return Err(invalid(k, v));
                }
                self.ro_segments_size = n;
            } else if k.eq_ignore_ascii_case("log.segment.bytes") {
                let n = parse_size(v).ok_or_else(|| invalid(k, v))?;
                if n < 64 {
                    return Err(invalid(k, v));
                }
                self.max_segment_size = n;
            } else if k.eq_ignore_ascii_case("log.index.interval.bytes") {
                let n = parse_size(v).ok_or_else(|| invalid(k, v))?;
                if n < 128 {
                    return Err(invalid(k, v));
                }
                self.index_interval = n;
            } else if k.eq_ignore_ascii_case("log.index.size.max.bytes") {
                let n = parse_size(v).ok_or_else(|| invalid(k, v))?;
                if n < 128 {
                    return Err(invalid(k, v));
                }
                self.max_index_size = n;
            } else if k.eq_ignore_ascii_case("log.roll.jitter.secs") {
                self.max_roll_jitter_secs = parse_duration(v).ok_or_else(|| invalid(k, v))?;
            } else if k.eq_ignore_ascii_case("log.roll.secs") {
                self.cur_segment_max_age = parse_duration(v).ok_or_else(|| invalid(k, v))?;
            } else if k.eq_ignore_ascii_case("flush.messages") {
                self.flush_interval_msgs = v.parse().map_err(|_| invalid(k, v))?;
            } else if k.eq_ignore_ascii_case("flush.secs") {
                self.flush_interval_secs = parse_duration(v).ok_or_else(|| invalid(k, v))?;
            } else {
                warn!(key = k, "unknown partition configuration key");
            }
        }
        Ok(())
    }

    /// Parse a standalone configuration document on top of the defaults.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply(contents)?;
        Ok(config)
    }

    /// Layer an optional on-disk configuration file over `self`.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        match std::fs::read_to_string(path) {
            Ok(contents) => self.apply(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TankError::io(path, e)),
        }
    }
}
