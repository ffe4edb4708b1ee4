use alloy::primitives::U256;
use relayer_core::job::TransactionParams;

/// Escalation fractions are carried as integer basis points so all wei
/// arithmetic stays exact over the chain's 256-bit value space.
pub const BPS_DENOMINATOR: u64 = 10_000;

pub fn to_basis_points(fraction: f64) -> u64 {
    if fraction <= 0.0 {
        return 0;
    }
    (fraction * BPS_DENOMINATOR as f64).round() as u64
}

/// Cumulative multiplier for the next child: `(children + 1) × increment`,
/// capped at the configured limit.
pub fn escalation_multiplier_bps(children: u64, increment_bps: u64, limit_bps: u64) -> u64 {
    children
        .saturating_add(1)
        .saturating_mul(increment_bps)
        .min(limit_bps)
}

/// Whether another escalation step is allowed. Once the escalation already
/// spawned has reached the limit, further firings fall back to plain resend.
pub fn escalation_applies(children: u64, increment_bps: u64, limit_bps: u64) -> bool {
    increment_bps > 0 && children.saturating_mul(increment_bps) < limit_bps
}

fn scale(value: u128, multiplier_bps: u64) -> u128 {
    let scaled = U256::from(value) * U256::from(BPS_DENOMINATOR + multiplier_bps)
        / U256::from(BPS_DENOMINATOR);
    scaled.min(U256::from(u128::MAX)).to::<u128>()
}

/// Apply `1 + multiplier` to the job's fee fields: the legacy gas price, or
/// the tip cap for dynamic-fee transactions (lifting the fee cap if the
/// bumped tip would exceed it).
pub fn apply_escalation(tx: &mut TransactionParams, multiplier_bps: u64) {
    if tx.is_dynamic_fee() {
        let tip = tx.max_priority_fee_per_gas.unwrap_or_default();
        let bumped = scale(tip, multiplier_bps);
        tx.max_priority_fee_per_gas = Some(bumped);
        if let Some(fee_cap) = tx.max_fee_per_gas {
            if fee_cap < bumped {
                tx.max_fee_per_gas = Some(bumped);
            }
        }
    } else if let Some(gas_price) = tx.gas_price {
        tx.gas_price = Some(scale(gas_price, multiplier_bps));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplier_progression_is_capped() {
        let increment = to_basis_points(0.06);
        let limit = to_basis_points(0.12);

        // First escalation: +6%.
        assert!(escalation_applies(0, increment, limit));
        assert_eq!(escalation_multiplier_bps(0, increment, limit), 600);

        // Second escalation: capped at +12%, not +18%.
        assert!(escalation_applies(1, increment, limit));
        assert_eq!(escalation_multiplier_bps(1, increment, limit), 1200);

        // The cap has been reached: no further escalation.
        assert!(!escalation_applies(2, increment, limit));
    }

    #[test]
    fn test_no_escalation_without_increment() {
        assert!(!escalation_applies(0, 0, 1200));
    }

    #[test]
    fn test_legacy_gas_price_scaling_is_exact() {
        let mut tx = TransactionParams {
            gas_price: Some(1_000_000_000_000_000_000),
            ..Default::default()
        };
        apply_escalation(&mut tx, 600);
        assert_eq!(tx.gas_price, Some(1_060_000_000_000_000_000));
    }

    #[test]
    fn test_dynamic_fee_bumps_tip_and_lifts_fee_cap() {
        let mut tx = TransactionParams {
            max_fee_per_gas: Some(100),
            max_priority_fee_per_gas: Some(95),
            ..Default::default()
        };
        apply_escalation(&mut tx, 1200);
        assert_eq!(tx.max_priority_fee_per_gas, Some(106));
        assert_eq!(tx.max_fee_per_gas, Some(106));
    }

    #[test]
    fn test_large_wei_values_do_not_lose_precision() {
        let value = u128::MAX / 2;
        let mut tx = TransactionParams {
            gas_price: Some(value),
            ..Default::default()
        };
        apply_escalation(&mut tx, 1200);
        let expected = (U256::from(value) * U256::from(11_200u64) / U256::from(10_000u64))
            .to::<u128>();
        assert_eq!(tx.gas_price, Some(expected));
    }
}
