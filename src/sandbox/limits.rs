// Resource limits - merging and translation into engine container settings

use super::types::{Limits, Ulimit};

/// Merge caller overrides onto `defaults`.
///
/// Absent or empty overrides yield `defaults` unchanged. Otherwise every unset
/// field is taken from `defaults`, and when the caller gave no `realtime` it
/// is derived as `cputime * factor`. `defaults` is never modified.
pub fn merge_limits(defaults: &Limits, overrides: Option<&Limits>, factor: u64) -> Limits {
    let overrides = match overrides {
        Some(o) if !o.is_empty() => o,
        _ => return defaults.clone(),
    };

    let mut merged = overlay(defaults, overrides);
    if overrides.realtime.is_none() {
        if let Some(cputime) = merged.cputime {
            merged.realtime = Some(cputime.saturating_mul(factor));
        }
    }
    merged
}

/// Field-wise `top` over `base`, without any derivation.
pub fn overlay(base: &Limits, top: &Limits) -> Limits {
    Limits {
        cputime: top.cputime.or(base.cputime),
        realtime: top.realtime.or(base.realtime),
        memory: top.memory.or(base.memory),
        processes: top.processes.or(base.processes),
        file_size: top.file_size.or(base.file_size),
    }
}

/// Ulimits for the merged limits, or `None` to keep the engine defaults.
pub fn create_ulimits(limits: &Limits) -> Option<Vec<Ulimit>> {
    let mut ulimits = Vec::new();
    if let Some(cpu) = limits.cputime.filter(|&c| c > 0) {
        ulimits.push(Ulimit::new("cpu", clamp_i64(cpu)));
    }
    if let Some(fsize) = limits.file_size {
        // RLIMIT_FSIZE is expressed in bytes.
        ulimits.push(Ulimit::new("fsize", clamp_i64(fsize.saturating_mul(1024))));
    }
    if ulimits.is_empty() {
        None
    } else {
        Some(ulimits)
    }
}

/// Memory ceiling in bytes.
pub fn memory_bytes(limits: &Limits) -> Option<i64> {
    limits.memory.map(|mb| clamp_i64(mb.saturating_mul(1024 * 1024)))
}

/// Pids ceiling; non-positive process counts mean unlimited.
pub fn pids_limit(limits: &Limits) -> Option<i64> {
    limits.processes.filter(|&p| p > 0)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
