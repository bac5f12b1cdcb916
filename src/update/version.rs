//! Numeric `major.minor.patch` ordering for release versions.

use std::cmp::Ordering;

/// Compare two version strings component-wise.
///
/// A leading `v` is ignored, only the first three dot-separated components
/// count, and each component contributes its leading digits (so `2-rc1` reads
/// as 2). Missing or non-numeric components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    components(a).cmp(&components(b))
}

/// True when `target` is strictly newer than `current`.
pub fn is_newer(current: &str, target: &str) -> bool {
    compare_versions(target, current) == Ordering::Greater
}

fn components(version: &str) -> [u64; 3] {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let mut out = [0u64; 3];
    for (slot, part) in out.iter_mut().zip(trimmed.split('.')) {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        *slot = digits.parse().unwrap_or(0);
    }
    out
}
