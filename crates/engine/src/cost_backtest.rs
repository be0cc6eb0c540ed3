//! Signal-driven, long-only backtest with itemised trading costs
//!
//! Runs in two steps: a strategy is first reduced to its BUY/SELL events with
//! [`collect_signals`], then [`backtest_with_costs`] replays those events
//! against the bars under a [`FeeSchedule`].

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::validate_bars;
use crate::error::{EngineError, EngineResult};
use crate::fees::{calculate_trading_costs, FeeSchedule, OrderSide, TradeCosts};
use crate::strategy::{Signal, SignalEvent, Strategy};
use crate::types::{CostBreakdown, EquityPoint, MarketBar};

/// Share of capital used for the first sizing estimate
const SIZING_ESTIMATE: Decimal = dec!(0.99);

/// One fill on the cost-aware path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostedTrade {
    pub index: usize,
    pub timestamp: i64,
    pub side: OrderSide,
    pub price: Decimal,
    pub shares: u64,
    pub costs: TradeCosts,
    /// Costs as percent of the fill amount
    pub cost_pct: f64,
    /// Cash after the fill
    pub cash: Decimal,
    /// Cash plus holdings at the fill price
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAwareResult {
    pub initial_capital: Decimal,
    pub final_asset: Decimal,
    /// Percent
    pub total_return: f64,
    pub total_trades: u32,
    pub costs: CostBreakdown,
    /// Total costs as percent of initial capital
    pub cost_pct: f64,
    /// Percent, as if every cost had been refunded
    pub return_without_costs: f64,
    /// Percentage points lost to costs
    pub cost_impact: f64,
    pub trades: Vec<CostedTrade>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Replay `bars` through `strategy`, keeping only BUY and SELL events
pub fn collect_signals(
    strategy: &mut dyn Strategy,
    bars: &[MarketBar],
) -> EngineResult<Vec<SignalEvent>> {
    strategy.initialize();
    let mut events = Vec::new();
    for (index, bar) in bars.iter().enumerate() {
        let signal = strategy.on_bar(bar)?;
        if signal != Signal::Hold {
            events.push(SignalEvent {
                index,
                timestamp: bar.timestamp,
                price: bar.close,
                signal,
            });
        }
    }
    strategy.on_exit();
    Ok(events)
}

fn pct(part: Decimal, whole: Decimal) -> f64 {
    if whole.is_zero() {
        return 0.0;
    }
    (part / whole * dec!(100)).to_f64().unwrap_or(0.0)
}

/// Long-only replay of `signals` with exchange fees.
///
/// BUY while flat spends all cash that remains after costs; SELL liquidates
/// the holding. Any position still held at the end is valued at the last
/// close without being sold.
pub fn backtest_with_costs(
    bars: &[MarketBar],
    signals: &[SignalEvent],
    initial_capital: Decimal,
    schedule: &FeeSchedule,
) -> EngineResult<CostAwareResult> {
    validate_bars(bars)?;
    if initial_capital <= Decimal::ZERO {
        return Err(EngineError::InvalidConfig(format!(
            "initial_capital must be positive, got {initial_capital}"
        )));
    }
    if let Some(bad) = signals
        .iter()
        .find(|s| s.index >= bars.len() || s.price <= Decimal::ZERO)
    {
        return Err(EngineError::InvalidParameter(format!(
            "signal at index {} (price {}) does not fit {} bars",
            bad.index,
            bad.price,
            bars.len()
        )));
    }

    let mut cash = initial_capital;
    let mut shares: u64 = 0;
    let mut totals = CostBreakdown::default();
    let mut trades = Vec::new();
    let mut equity_curve = Vec::with_capacity(bars.len());
    let mut pending = signals.iter().peekable();

    for (index, bar) in bars.iter().enumerate() {
        while let Some(event) = pending.next_if(|s| s.index <= index) {
            let price = event.price;
            match event.signal {
                Signal::Buy if shares == 0 => {
                    let estimate = (cash * SIZING_ESTIMATE / price).floor().to_u64().unwrap_or(0);
                    let est_costs = calculate_trading_costs(price, estimate, OrderSide::Buy, schedule);
                    let mut qty = ((cash - est_costs.total) / price)
                        .floor()
                        .to_u64()
                        .unwrap_or(0);

                    // the minimum commission can push a tiny order over budget
                    let mut costs = calculate_trading_costs(price, qty, OrderSide::Buy, schedule);
                    while qty > 0 && price * Decimal::from(qty) + costs.total > cash {
                        qty -= 1;
                        costs = calculate_trading_costs(price, qty, OrderSide::Buy, schedule);
                    }
                    if qty == 0 {
                        debug!(price = %price, cash = %cash, "Insufficient cash, BUY skipped");
                        continue;
                    }

                    let amount = price * Decimal::from(qty);
                    cash -= amount + costs.total;
                    shares = qty;
                    totals.add(costs.commission, costs.transfer, costs.stamp_duty, costs.slippage);
                    trades.push(CostedTrade {
                        index: event.index,
                        timestamp: event.timestamp,
                        side: OrderSide::Buy,
                        price,
                        shares: qty,
                        cost_pct: pct(costs.total, amount),
                        costs,
                        cash,
                        total: cash + amount,
                    });
                }
                Signal::Sell if shares > 0 => {
                    let costs = calculate_trading_costs(price, shares, OrderSide::Sell, schedule);
                    let amount = price * Decimal::from(shares);
                    cash += amount - costs.total;
                    totals.add(costs.commission, costs.transfer, costs.stamp_duty, costs.slippage);
                    trades.push(CostedTrade {
                        index: event.index,
                        timestamp: event.timestamp,
                        side: OrderSide::Sell,
                        price,
                        shares,
                        cost_pct: pct(costs.total, amount),
                        costs,
                        cash,
                        total: cash,
                    });
                    shares = 0;
                }
                _ => {}
            }
        }

        equity_curve.push(EquityPoint {
            time: bar.timestamp,
            equity: cash + Decimal::from(shares) * bar.close,
            position: shares as i64,
        });
    }

    let last_close = bars[bars.len() - 1].close;
    let final_asset = cash + Decimal::from(shares) * last_close;
    let total_return = pct(final_asset - initial_capital, initial_capital);
    let return_without_costs = pct(final_asset + totals.total - initial_capital, initial_capital);

    info!(
        trades = trades.len(),
        final_asset = %final_asset,
        total_costs = %totals.total,
        "Cost-aware backtest complete"
    );

    Ok(CostAwareResult {
        initial_capital,
        final_asset,
        total_return,
        total_trades: trades.len() as u32,
        cost_pct: pct(totals.total, initial_capital),
        costs: totals,
        return_without_costs,
        cost_impact: return_without_costs - total_return,
        trades,
        equity_curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::make_bars;
    use crate::strategy::MovingAverageCrossover;

    fn event(bars: &[MarketBar], index: usize, signal: Signal) -> SignalEvent {
        SignalEvent {
            index,
            timestamp: bars[index].timestamp,
            price: bars[index].close,
            signal,
        }
    }

    #[test]
    fn test_collect_signals_keeps_only_actions() {
        let bars = make_bars(&[10.0, 10.0, 10.0, 10.0, 11.0, 12.0, 13.0, 14.0, 8.0]);
        let mut strategy = MovingAverageCrossover::new(2, 4).unwrap();
        let events = collect_signals(&mut strategy, &bars).unwrap();

        let summary: Vec<(usize, Signal)> = events.iter().map(|e| (e.index, e.signal)).collect();
        assert_eq!(summary, vec![(4, Signal::Buy), (8, Signal::Sell)]);
        assert_eq!(events[0].price, dec!(11));
    }

    #[test]
    fn test_round_trip_itemises_costs() {
        let bars = make_bars(&[10.0, 10.0, 11.0]);
        let signals = vec![event(&bars, 0, Signal::Buy), event(&bars, 2, Signal::Sell)];
        let result =
            backtest_with_costs(&bars, &signals, dec!(100000), &FeeSchedule::default()).unwrap();

        assert_eq!(result.total_trades, 2);
        let buy = &result.trades[0];
        assert_eq!(buy.shares, 9991);
        assert_eq!(buy.costs.total, dec!(81.9262));
        assert_eq!(buy.cash, dec!(8.0738));

        let sell = &result.trades[1];
        assert_eq!(sell.costs.total, dec!(90.11882));
        assert_eq!(result.final_asset, dec!(109818.95498));
        assert_eq!(result.costs.total, dec!(172.04502));
        assert_eq!(result.costs.stamp_duty, Decimal::ZERO);

        assert!(result.return_without_costs > result.total_return);
        assert!((result.cost_impact - 0.17204502).abs() < 1e-9);
    }

    #[test]
    fn test_equity_curve_has_point_per_bar_with_position() {
        let bars = make_bars(&[10.0, 10.0, 11.0, 12.0]);
        let signals = vec![event(&bars, 1, Signal::Buy)];
        let result =
            backtest_with_costs(&bars, &signals, dec!(100000), &FeeSchedule::default()).unwrap();

        assert_eq!(result.equity_curve.len(), bars.len());
        let positions: Vec<i64> = result.equity_curve.iter().map(|p| p.position).collect();
        assert_eq!(positions[0], 0);
        assert!(positions[1..].iter().all(|p| *p > 0));
        assert_eq!(result.equity_curve[0].equity, dec!(100000));
        // still held at the end: valued at the last close
        let held = Decimal::from(result.trades[0].shares);
        assert_eq!(result.final_asset, result.trades[0].cash + held * dec!(12));
    }

    #[test]
    fn test_repeated_buy_while_holding_is_ignored() {
        let bars = make_bars(&[10.0, 10.0, 10.0]);
        let signals = vec![event(&bars, 0, Signal::Buy), event(&bars, 1, Signal::Buy)];
        let result =
            backtest_with_costs(&bars, &signals, dec!(100000), &FeeSchedule::default()).unwrap();
        assert_eq!(result.total_trades, 1);
    }

    #[test]
    fn test_tiny_capital_cannot_cover_minimum_commission() {
        let bars = make_bars(&[10.0, 10.0]);
        let signals = vec![event(&bars, 0, Signal::Buy)];
        let result =
            backtest_with_costs(&bars, &signals, dec!(12), &FeeSchedule::default()).unwrap();
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.final_asset, dec!(12));
    }

    #[test]
    fn test_rejects_out_of_range_signal() {
        let bars = make_bars(&[10.0]);
        let signals = vec![SignalEvent {
            index: 3,
            timestamp: 0,
            price: dec!(10),
            signal: Signal::Buy,
        }];
        assert!(backtest_with_costs(&bars, &signals, dec!(1000), &FeeSchedule::default()).is_err());
    }
}
