// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dotted version comparison used to gate features on the collector's version.

use std::cmp::Ordering;

/// Numeric fields of a dotted version.
///
/// Anything after the first space or `-` (build info, `-SNAPSHOT`) is ignored, and a
/// field without leading digits counts as zero.
fn fields(version: &str) -> Vec<u64> {
    let core = version
        .trim()
        .split(|c: char| c == '-' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    core.split('.')
        .map(|field| {
            let digits: String = field.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Field-wise comparison; missing trailing fields compare as zero.
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = fields(left);
    let right = fields(right);
    let len = left.len().max(right.len());
    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[must_use]
pub fn is_version_greater(left: &str, right: &str) -> bool {
    compare_versions(left, right) == Ordering::Greater
}
