use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::quote::{ExtraCost, PartLine, ServiceLine};

/// Italian standard VAT, applied when a draft does not name a rate.
pub const DEFAULT_VAT_RATE: Decimal = Decimal::from_parts(22, 0, 0, false, 0);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub labor_cost: Decimal,
    pub parts_cost: Decimal,
    pub subtotal: Decimal,
    pub vat_amount: Decimal,
    pub total_cost: Decimal,
}

pub fn line_total(quantity: u32, unit_price: Decimal) -> Decimal {
    round_currency(unit_price * Decimal::from(quantity))
}

pub fn vat_amount(subtotal: Decimal, vat_rate: Decimal) -> Decimal {
    round_currency(subtotal * vat_rate / Decimal::ONE_HUNDRED)
}

/// Computes every aggregate from the raw line items. Part line totals are
/// derived from quantity and unit price here, not read from the input.
pub fn breakdown(
    services: &[ServiceLine],
    parts: &[PartLine],
    extras: &[ExtraCost],
    vat_rate: Decimal,
) -> CostBreakdown {
    let labor_cost: Decimal = services.iter().map(|line| line.labor_cost).sum();
    let parts_cost: Decimal =
        parts.iter().map(|part| line_total(part.quantity, part.unit_price)).sum();
    let extras_cost: Decimal = extras.iter().map(|extra| extra.amount).sum();

    let subtotal = round_currency(labor_cost + parts_cost + extras_cost);
    let vat = vat_amount(subtotal, vat_rate);

    CostBreakdown {
        labor_cost: round_currency(labor_cost),
        parts_cost: round_currency(parts_cost),
        subtotal,
        vat_amount: vat,
        total_cost: subtotal + vat,
    }
}

fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{breakdown, line_total, vat_amount, DEFAULT_VAT_RATE};
    use crate::domain::quote::{ExtraCost, PartLine, ServiceLine};

    fn part(quantity: u32, unit_price: Decimal) -> PartLine {
        PartLine {
            name: "part".to_string(),
            quantity,
            unit_price,
            line_total: Decimal::ZERO,
        }
    }

    #[test]
    fn breakdown_sums_labor_parts_and_extras() {
        let result = breakdown(
            &[ServiceLine { name: "labor".to_string(), labor_cost: Decimal::new(5000, 2) }],
            &[part(1, Decimal::new(3000, 2))],
            &[ExtraCost { name: "extra".to_string(), amount: Decimal::new(2000, 2) }],
            DEFAULT_VAT_RATE,
        );

        assert_eq!(result.labor_cost, Decimal::new(5000, 2));
        assert_eq!(result.parts_cost, Decimal::new(3000, 2));
        assert_eq!(result.subtotal, Decimal::new(10000, 2));
        assert_eq!(result.vat_amount, Decimal::new(2200, 2));
        assert_eq!(result.total_cost, Decimal::new(12200, 2));
    }

    #[test]
    fn total_minus_subtotal_is_always_the_vat() {
        let inputs = [
            (Decimal::new(9_99, 2), Decimal::new(22, 0)),
            (Decimal::new(123_45, 2), Decimal::new(22, 0)),
            (Decimal::new(1, 2), Decimal::new(10, 0)),
            (Decimal::new(100_00, 2), Decimal::ZERO),
        ];

        for (labor, rate) in inputs {
            let result = breakdown(
                &[ServiceLine { name: "labor".to_string(), labor_cost: labor }],
                &[],
                &[],
                rate,
            );
            assert_eq!(result.total_cost - result.subtotal, result.vat_amount);
            assert_eq!(result.vat_amount, vat_amount(result.subtotal, rate));
        }
    }

    #[test]
    fn vat_rounds_to_cents_half_away_from_zero() {
        // 10.01 * 22% = 2.2022 -> 2.20; 10.25 * 22% = 2.255 -> 2.26
        assert_eq!(vat_amount(Decimal::new(10_01, 2), DEFAULT_VAT_RATE), Decimal::new(2_20, 2));
        assert_eq!(vat_amount(Decimal::new(10_25, 2), DEFAULT_VAT_RATE), Decimal::new(2_26, 2));
    }

    #[test]
    fn line_total_multiplies_quantity() {
        assert_eq!(line_total(3, Decimal::new(12_50, 2)), Decimal::new(37_50, 2));
        assert_eq!(line_total(0, Decimal::new(12_50, 2)), Decimal::ZERO);
    }
}
