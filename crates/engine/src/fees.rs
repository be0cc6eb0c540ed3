//! A-share exchange fee schedule
//!
//! Per-fill costs on Shanghai/Shenzhen listed funds:
//! commission = max(amount × commission_rate, min_commission)
//! transfer   = amount × transfer_rate
//! stamp duty = amount × stamp_duty_rate on sells, waived for ETFs
//! slippage   = amount × slippage_rate

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Direction of a single fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    /// Broker commission (default 0.0003)
    pub commission_rate: Decimal,
    /// Floor applied to every non-empty fill (default 5)
    pub min_commission: Decimal,
    /// Shanghai transfer fee (default 0.00002)
    pub transfer_rate: Decimal,
    /// Sell-side stamp duty (default 0.001)
    pub stamp_duty_rate: Decimal,
    pub stamp_duty_exempt: bool,
    pub slippage_rate: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::etf(dec!(0.0005))
    }
}

impl FeeSchedule {
    /// Exchange-traded fund schedule with the given slippage fraction
    pub fn etf(slippage_rate: Decimal) -> Self {
        Self {
            commission_rate: dec!(0.0003),
            min_commission: dec!(5),
            transfer_rate: dec!(0.00002),
            stamp_duty_rate: dec!(0.001),
            stamp_duty_exempt: true,
            slippage_rate,
        }
    }
}

/// Itemised costs of one fill
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeCosts {
    pub commission: Decimal,
    pub transfer: Decimal,
    pub stamp_duty: Decimal,
    pub slippage: Decimal,
    pub total: Decimal,
}

/// Costs of filling `shares` at `price`. An empty fill costs nothing.
pub fn calculate_trading_costs(
    price: Decimal,
    shares: u64,
    side: OrderSide,
    schedule: &FeeSchedule,
) -> TradeCosts {
    if shares == 0 || price <= Decimal::ZERO {
        return TradeCosts::default();
    }

    let amount = price * Decimal::from(shares);
    let commission = (amount * schedule.commission_rate).max(schedule.min_commission);
    let transfer = amount * schedule.transfer_rate;
    let stamp_duty = match side {
        OrderSide::Sell if !schedule.stamp_duty_exempt => amount * schedule.stamp_duty_rate,
        _ => Decimal::ZERO,
    };
    let slippage = amount * schedule.slippage_rate;

    TradeCosts {
        commission,
        transfer,
        stamp_duty,
        slippage,
        total: commission + transfer + stamp_duty + slippage,
    }
}
