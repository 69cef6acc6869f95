//! Range placement policies.
//!
//! Pure functions: given the existing registry, a policy, and a chunk
//! size, compute where a new range goes. Every candidate is re-validated
//! against the full range set before it is returned, whatever policy
//! produced it.

use crate::port::PortRange;
use crate::registry::{AutoAllocationConfig, Placement, ServiceType};

/// Domain words recognized by the category heuristic. A name segment
/// matching one of these becomes the name's category; otherwise the first
/// segment does.
const DOMAIN_WORDS: &[&str] = &[
    "api", "db", "database", "cache", "queue", "worker", "web", "ui", "frontend", "backend",
    "proxy", "mail", "auth", "test", "mock", "dev", "ai", "ml", "model", "llm", "monitor",
    "metrics", "log", "trace", "search", "storage",
];

/// Derives the grouping category of a service-type name.
///
/// # Examples
///
/// ```
/// use portreeve::planner::category_of;
///
/// assert_eq!(category_of("orders-db"), "db");
/// assert_eq!(category_of("db-orders"), "db");
/// assert_eq!(category_of("jaeger"), "jaeger");
/// assert_eq!(category_of("payment-api-v2"), "api");
/// ```
#[must_use]
pub fn category_of(name: &str) -> &str {
    let mut first = name;
    for (i, segment) in name.split('-').enumerate() {
        if i == 0 {
            first = segment;
        }
        if DOMAIN_WORDS.contains(&segment) {
            return segment;
        }
    }
    first
}

/// Chooses a range for `name` under `policy`.
///
/// # Errors
///
/// Returns a human-readable reason when no valid placement exists.
pub fn plan_range(
    name: &str,
    existing: &[ServiceType],
    policy: &AutoAllocationConfig,
    chunk: u16,
) -> Result<PortRange, String> {
    if chunk == 0 {
        return Err("chunk size must be at least 1".to_string());
    }

    let mut ranges: Vec<PortRange> = existing.iter().map(|s| s.range).collect();
    ranges.sort_by_key(PortRange::lo);

    let candidate = match policy.placement {
        Placement::After => place_after(&ranges, policy, chunk)?,
        Placement::Before => place_before(&ranges, policy, chunk)?,
        Placement::Smart => place_smart(name, existing, &ranges, policy, chunk)?,
    };

    validate_candidate(candidate, &ranges, policy)?;
    Ok(candidate)
}

fn effective_gap(policy: &AutoAllocationConfig) -> u32 {
    if policy.preserve_gaps {
        u32::from(policy.gap_size)
    } else {
        0
    }
}

/// Immediately above the highest existing `hi`.
fn place_after(
    ranges: &[PortRange],
    policy: &AutoAllocationConfig,
    chunk: u16,
) -> Result<PortRange, String> {
    let lo = match ranges.iter().map(|r| r.hi().value()).max() {
        Some(top) => u32::from(top) + 1 + effective_gap(policy),
        None => u32::from(policy.min_port),
    };
    let hi = lo + u32::from(chunk) - 1;
    if hi > u32::from(policy.max_port) {
        return Err(format!(
            "placing after existing ranges would exceed max_port {}",
            policy.max_port
        ));
    }
    range_from_u32(lo, hi)
}

/// Immediately below the lowest existing `lo`.
fn place_before(
    ranges: &[PortRange],
    policy: &AutoAllocationConfig,
    chunk: u16,
) -> Result<PortRange, String> {
    let Some(bottom) = ranges.iter().map(|r| r.lo().value()).min() else {
        return place_after(ranges, policy, chunk);
    };
    let hi = i64::from(bottom) - 1 - i64::from(effective_gap(policy));
    let lo = hi - i64::from(chunk) + 1;
    if lo < i64::from(policy.min_port) {
        return Err(format!(
            "placing before existing ranges would fall below min_port {}",
            policy.min_port
        ));
    }
    let lo = u16::try_from(lo).map_err(|_| format!("port {lo} out of u16 range"))?;
    let hi = u16::try_from(hi).map_err(|_| format!("port {hi} out of u16 range"))?;
    PortRange::from_bounds(lo, hi).map_err(|e| e.to_string())
}

/// Gap-fit lowest-first, then category grouping, then `after`.
fn place_smart(
    name: &str,
    existing: &[ServiceType],
    ranges: &[PortRange],
    policy: &AutoAllocationConfig,
    chunk: u16,
) -> Result<PortRange, String> {
    let gap = effective_gap(policy);
    let needed = u32::from(chunk) + 2 * gap;

    // Inter-range gaps, lowest first (ranges are sorted by lo).
    for pair in ranges.windows(2) {
        let Some(free) = pair[0].gap_between(&pair[1]) else {
            continue;
        };
        if u32::from(free) >= needed {
            let lo = u32::from(pair[0].hi().value()) + 1 + gap;
            let hi = lo + u32::from(chunk) - 1;
            if lo >= u32::from(policy.min_port) && hi <= u32::from(policy.max_port) {
                return range_from_u32(lo, hi);
            }
        }
    }

    // Group near same-category existing ranges.
    let category = category_of(name);
    let mut peers: Vec<&ServiceType> = existing
        .iter()
        .filter(|s| category_of(&s.name) == category)
        .collect();
    peers.sort_by_key(|s| s.range.lo());
    for peer in peers {
        let lo = u32::from(peer.range.hi().value()) + 1 + gap;
        let hi = lo + u32::from(chunk) - 1;
        if lo < u32::from(policy.min_port) || hi > u32::from(policy.max_port) {
            continue;
        }
        if let Ok(candidate) = range_from_u32(lo, hi) {
            if validate_candidate(candidate, ranges, policy).is_ok() {
                return Ok(candidate);
            }
        }
    }

    place_after(ranges, policy, chunk)
}

/// The final collision check every candidate passes, whatever produced it.
fn validate_candidate(
    candidate: PortRange,
    ranges: &[PortRange],
    policy: &AutoAllocationConfig,
) -> Result<(), String> {
    if candidate.lo().value() < policy.min_port || candidate.hi().value() > policy.max_port {
        return Err(format!(
            "candidate {candidate} outside [{}, {}]",
            policy.min_port, policy.max_port
        ));
    }
    for range in ranges {
        if candidate.overlaps(range) {
            return Err(format!("candidate {candidate} collides with existing {range}"));
        }
        if policy.preserve_gaps {
            if let Some(free) = candidate.gap_between(range) {
                if u32::from(free) < u32::from(policy.gap_size) {
                    return Err(format!(
                        "candidate {candidate} closer than gap {} to {range}",
                        policy.gap_size
                    ));
                }
            }
        }
    }
    Ok(())
}

fn range_from_u32(lo: u32, hi: u32) -> Result<PortRange, String> {
    let lo = u16::try_from(lo).map_err(|_| format!("port {lo} out of u16 range"))?;
    let hi = u16::try_from(hi).map_err(|_| format!("port {hi} out of u16 range"))?;
    PortRange::from_bounds(lo, hi).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Cardinality, ServiceType};

    fn service(name: &str, lo: u16, hi: u16) -> ServiceType {
        ServiceType {
            name: name.to_string(),
            range: PortRange::from_bounds(lo, hi).unwrap(),
            preferred_ports: Vec::new(),
            cardinality: Cardinality::Multi,
            description: String::new(),
            auto_allocated: false,
        }
    }

    fn policy(placement: Placement) -> AutoAllocationConfig {
        AutoAllocationConfig {
            enabled: true,
            placement,
            default_chunk_size: 10,
            gap_size: 10,
            preserve_gaps: true,
            min_port: 1024,
            max_port: 65535,
            chunk_rules: Vec::new(),
        }
    }

    #[test]
    fn test_category_heuristics() {
        assert_eq!(category_of("postgres-db"), "db");
        assert_eq!(category_of("db-replica"), "db");
        assert_eq!(category_of("payment-api"), "api");
        assert_eq!(category_of("jaeger"), "jaeger");
        assert_eq!(category_of("jaeger-ui"), "ui");
        assert_eq!(category_of("my-custom-thing"), "my");
    }

    #[test]
    fn test_after_places_above_top_with_gap() {
        let existing = vec![service("a", 3000, 3099), service("b", 10000, 10099)];
        let range = plan_range("new", &existing, &policy(Placement::After), 10).unwrap();
        assert_eq!(range.lo().value(), 10110);
        assert_eq!(range.hi().value(), 10119);
    }

    #[test]
    fn test_after_without_gap_preservation() {
        let existing = vec![service("a", 10000, 10099)];
        let mut p = policy(Placement::After);
        p.preserve_gaps = false;
        let range = plan_range("new", &existing, &p, 10).unwrap();
        assert_eq!(range.lo().value(), 10100);
    }

    #[test]
    fn test_after_fails_past_max_port() {
        let existing = vec![service("a", 65000, 65500)];
        let err = plan_range("new", &existing, &policy(Placement::After), 100).unwrap_err();
        assert!(err.contains("max_port"));
    }

    #[test]
    fn test_after_on_empty_registry_starts_at_min() {
        let range = plan_range("new", &[], &policy(Placement::After), 10).unwrap();
        assert_eq!(range.lo().value(), 1024);
        assert_eq!(range.hi().value(), 1033);
    }

    #[test]
    fn test_before_places_below_bottom_with_gap() {
        let existing = vec![service("a", 3000, 3099)];
        let range = plan_range("new", &existing, &policy(Placement::Before), 10).unwrap();
        assert_eq!(range.hi().value(), 2989);
        assert_eq!(range.lo().value(), 2980);
    }

    #[test]
    fn test_before_fails_below_min_port() {
        let existing = vec![service("a", 1030, 1099)];
        let err = plan_range("new", &existing, &policy(Placement::Before), 10).unwrap_err();
        assert!(err.contains("min_port"));
    }

    #[test]
    fn test_smart_fills_lowest_gap_first() {
        // Gaps: 3100..=4999 (1900 wide) and 5100..=5999 (900 wide).
        let existing = vec![
            service("a", 3000, 3099),
            service("b", 5000, 5099),
            service("c", 6000, 6099),
        ];
        let range = plan_range("new", &existing, &policy(Placement::Smart), 10).unwrap();
        assert_eq!(range.lo().value(), 3110);
        assert_eq!(range.hi().value(), 3119);
    }

    #[test]
    fn test_smart_skips_too_small_gaps() {
        // First gap holds 15 ports, smaller than chunk + 2 * gap = 30.
        let existing = vec![service("a", 3000, 3099), service("b", 3115, 3199)];
        let range = plan_range("new", &existing, &policy(Placement::Smart), 10).unwrap();
        // Falls through to after-placement above 3199.
        assert_eq!(range.lo().value(), 3210);
    }

    #[test]
    fn test_smart_groups_by_category_when_no_gap_fits() {
        // No inter-range gap is big enough, but orders-db can sit above
        // postgres-db if the space after it is free.
        let existing = vec![service("postgres-db", 5400, 5419), service("web", 5450, 5459)];
        let mut p = policy(Placement::Smart);
        p.gap_size = 2;
        let range = plan_range("orders-db", &existing, &p, 5).unwrap();
        // Gap fit: region between the two ranges is 5420..=5449 (30 wide),
        // needs 5 + 2*2 = 9, so the gap wins before category grouping.
        assert_eq!(range.lo().value(), 5422);
    }

    #[test]
    fn test_smart_category_grouping_path() {
        // Make the only inter-range gap too small so grouping decides.
        let existing = vec![
            service("postgres-db", 5400, 5499),
            service("web", 5505, 5599),
        ];
        let mut p = policy(Placement::Smart);
        p.gap_size = 2;
        let range = plan_range("orders-db", &existing, &p, 10).unwrap();
        // Same-category peer is postgres-db; after web there is room too,
        // but grouping tries db peers first: 5500.. collides with web, so
        // placement falls through to after-placement above 5599.
        assert_eq!(range.lo().value(), 5602);
    }

    #[test]
    fn test_candidate_never_overlaps() {
        let existing = vec![service("a", 3000, 3099), service("b", 3110, 3199)];
        for placement in [Placement::After, Placement::Before, Placement::Smart] {
            if let Ok(range) = plan_range("x", &existing, &policy(placement), 10) {
                for s in &existing {
                    assert!(!range.overlaps(&s.range), "{placement:?} produced {range}");
                }
            }
        }
    }

    #[test]
    fn test_zero_chunk_rejected() {
        assert!(plan_range("x", &[], &policy(Placement::After), 0).is_err());
    }
}
