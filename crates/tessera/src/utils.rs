//! Utility functions
use std::{
    fmt::Display,
    fs::Metadata,
    time::{SystemTime, UNIX_EPOCH},
};

/// transform bytes into a human readable format.
pub fn to_human_readable(n: u64) -> String {
    let mut n = n as f64;

    let units = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    let delimiter = 1000_f64;

    if n < delimiter {
        return format!("{} {}", n, "B");
    }

    let mut u: i32 = 0;
    let r = 10_f64;

    while (n * r).round() / r >= delimiter && u < (units.len() as i32) - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u as usize])
}

/// Seconds since the epoch.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Modification time of a file in seconds since the epoch, `0` when the
/// platform can't tell.
pub fn mtime_secs(meta: &Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Result of dividing two byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Ratio {
    /// Both sides are zero.
    #[default]
    NotAvailable,
    /// Something divided by zero.
    Infinite,
    Value(f64),
}

impl Ratio {
    pub fn new(numerator: u64, denominator: u64) -> Self {
        if denominator > 0 {
            Self::Value(numerator as f64 / denominator as f64)
        } else if numerator > 0 {
            Self::Infinite
        } else {
            Self::NotAvailable
        }
    }

    /// Whether the ratio reached `limit`.
    pub fn reached(&self, limit: f64) -> bool {
        match self {
            Self::NotAvailable => false,
            Self::Infinite => true,
            Self::Value(v) => *v >= limit,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Value(v) => Some(*v),
            _ => None,
        }
    }
}

impl Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAvailable => write!(f, "None"),
            Self::Infinite => write!(f, "Inf"),
            Self::Value(v) => write!(f, "{v:.2}"),
        }
    }
}
