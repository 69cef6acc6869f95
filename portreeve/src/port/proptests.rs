//! Property-based tests for `Port` and `PortRange`.

use super::{Port, PortRange};
use proptest::prelude::*;

const MIN_VALID_PORT: u16 = 1;
const MAX_VALID_PORT: u16 = u16::MAX;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 10000,
        max_shrink_iters: 10000,
        .. ProptestConfig::default()
    })]

    // Every non-zero u16 is a valid port and round-trips its value.
    #[test]
    fn port_accepts_all_nonzero(value in MIN_VALID_PORT..=MAX_VALID_PORT) {
        let port = Port::try_from(value);
        prop_assert!(port.is_ok());
        prop_assert_eq!(port.unwrap().value(), value);
    }

    // Serde round-trips through the transparent representation.
    #[test]
    fn port_serde_roundtrip(value in MIN_VALID_PORT..=MAX_VALID_PORT) {
        let port = Port::try_from(value).unwrap();
        let json = serde_json::to_string(&port).unwrap();
        let back: Port = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(port, back);
    }

    // checked_add never produces an out-of-range port.
    #[test]
    fn port_checked_add_bounded(base in MIN_VALID_PORT..=MAX_VALID_PORT, offset in 0u16..=1000) {
        let port = Port::try_from(base).unwrap();
        match port.checked_add(offset) {
            Some(sum) => prop_assert_eq!(u32::from(sum.value()), u32::from(base) + u32::from(offset)),
            None => prop_assert!(u32::from(base) + u32::from(offset) > u32::from(MAX_VALID_PORT)),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 10000,
        max_shrink_iters: 10000,
        .. ProptestConfig::default()
    })]

    // Construction normalizes nothing: lo <= hi always holds.
    #[test]
    fn range_lo_le_hi(a in MIN_VALID_PORT..=MAX_VALID_PORT, b in MIN_VALID_PORT..=MAX_VALID_PORT) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let range = PortRange::from_bounds(lo, hi).unwrap();
        prop_assert!(range.lo() <= range.hi());
        prop_assert_eq!(u32::from(range.len()), u32::from(hi - lo) + 1);
    }

    // contains() agrees with the arithmetic definition.
    #[test]
    fn range_contains_accuracy(lo in MIN_VALID_PORT..MAX_VALID_PORT, len in 0u16..=200, probe in MIN_VALID_PORT..=MAX_VALID_PORT) {
        let hi = lo.saturating_add(len).min(MAX_VALID_PORT);
        let range = PortRange::from_bounds(lo, hi).unwrap();
        let expected = probe >= lo && probe <= hi;
        prop_assert_eq!(range.contains(Port::try_from(probe).unwrap()), expected);
    }

    // overlaps() is symmetric and agrees with interval arithmetic.
    #[test]
    fn range_overlap_symmetric(
        a_lo in MIN_VALID_PORT..MAX_VALID_PORT, a_len in 0u16..=100,
        b_lo in MIN_VALID_PORT..MAX_VALID_PORT, b_len in 0u16..=100,
    ) {
        let a = PortRange::from_bounds(a_lo, a_lo.saturating_add(a_len).min(MAX_VALID_PORT)).unwrap();
        let b = PortRange::from_bounds(b_lo, b_lo.saturating_add(b_len).min(MAX_VALID_PORT)).unwrap();
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        let expected = a.lo() <= b.hi() && b.lo() <= a.hi();
        prop_assert_eq!(a.overlaps(&b), expected);
    }

    // gap_between is defined exactly when the ranges are disjoint, and a
    // positive gap means no port is shared even after widening by the gap.
    #[test]
    fn range_gap_consistent(
        a_lo in MIN_VALID_PORT..MAX_VALID_PORT, a_len in 0u16..=100,
        b_lo in MIN_VALID_PORT..MAX_VALID_PORT, b_len in 0u16..=100,
    ) {
        let a = PortRange::from_bounds(a_lo, a_lo.saturating_add(a_len).min(MAX_VALID_PORT)).unwrap();
        let b = PortRange::from_bounds(b_lo, b_lo.saturating_add(b_len).min(MAX_VALID_PORT)).unwrap();
        match a.gap_between(&b) {
            Some(_) => prop_assert!(!a.overlaps(&b)),
            None => prop_assert!(a.overlaps(&b)),
        }
    }

    // Iteration yields exactly len() ascending in-range ports.
    #[test]
    fn range_iteration_complete(lo in MIN_VALID_PORT..=MAX_VALID_PORT - 50, len in 0u16..=50) {
        let range = PortRange::from_bounds(lo, lo + len).unwrap();
        let ports: Vec<Port> = range.iter().collect();
        prop_assert_eq!(ports.len(), usize::from(range.len()));
        for window in ports.windows(2) {
            prop_assert!(window[0] < window[1]);
        }
        for port in &ports {
            prop_assert!(range.contains(*port));
        }
    }
}
