//! Bar-by-bar backtesting engine

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::strategy::{Signal, Strategy};
use crate::types::*;

const MS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0 * 1000.0;
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Lifecycle of a single `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initialized,
    Replaying,
    Finalizing,
    Complete,
}

/// The one open position; `trade` indexes the OPEN entry in the ledger
#[derive(Debug, Clone, Copy)]
struct OpenPosition {
    trade: usize,
    side: TradeSide,
    shares: u64,
    entry_price: Decimal,
}

/// Check the invariants the replay loop relies on
pub fn validate_bars(bars: &[MarketBar]) -> EngineResult<()> {
    if bars.is_empty() {
        return Err(EngineError::EmptyData);
    }
    for (index, bar) in bars.iter().enumerate() {
        if bar.close <= Decimal::ZERO {
            return Err(EngineError::InvalidBar {
                index,
                reason: format!("close must be positive, got {}", bar.close),
            });
        }
        if index > 0 && bar.timestamp <= bars[index - 1].timestamp {
            return Err(EngineError::UnsortedData { index });
        }
    }
    Ok(())
}

/// Single-position backtesting engine.
///
/// Owns one strategy and one config. Each call to [`BacktestEngine::run`]
/// resets the book and the strategy, replays the loaded bars in order and
/// returns a fresh [`BacktestResult`].
pub struct BacktestEngine {
    config: BacktestConfig,
    strategy: Box<dyn Strategy>,
    data: Arc<[MarketBar]>,
    state: EngineState,
    cash: Decimal,
    position: Option<OpenPosition>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
    costs: CostBreakdown,
}

impl BacktestEngine {
    pub fn new(strategy: Box<dyn Strategy>, config: BacktestConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            cash: config.initial_capital,
            config,
            strategy,
            data: Arc::from(Vec::new()),
            state: EngineState::Initialized,
            position: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
            costs: CostBreakdown::default(),
        })
    }

    /// Replace the bar sequence replayed by the next `run()`
    pub fn load_data(&mut self, data: impl Into<Arc<[MarketBar]>>) {
        self.data = data.into();
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Signed share count: positive long, negative short, zero flat
    pub fn position(&self) -> i64 {
        match self.position {
            None => 0,
            Some(pos) => match pos.side {
                TradeSide::Long => pos.shares as i64,
                TradeSide::Short => -(pos.shares as i64),
            },
        }
    }

    pub fn run(&mut self) -> EngineResult<BacktestResult> {
        validate_bars(&self.data)?;

        self.state = EngineState::Initialized;
        self.cash = self.config.initial_capital;
        self.position = None;
        self.trades.clear();
        self.equity_curve.clear();
        self.costs = CostBreakdown::default();
        self.strategy.initialize();

        let data = Arc::clone(&self.data);
        info!(
            strategy = self.strategy.name(),
            symbol = %data[0].symbol,
            bars = data.len(),
            capital = %self.config.initial_capital,
            "Starting backtest"
        );

        self.state = EngineState::Replaying;
        for bar in data.iter() {
            let signal = self.strategy.on_bar(bar)?;
            self.process_signal(signal, bar);

            self.equity_curve.push(EquityPoint {
                time: bar.timestamp,
                equity: self.cash + Decimal::from(self.position()) * bar.close,
                position: self.position(),
            });
        }

        self.state = EngineState::Finalizing;
        if let Some(last) = data.last() {
            if self.position.is_some() {
                debug!(time = last.timestamp, "Force-closing position at end of data");
                self.close_position(last);
            }
        }
        self.strategy.on_exit();

        let result = self.build_result(&data);
        self.state = EngineState::Complete;

        info!(
            strategy = %result.strategy_name,
            total_trades = result.total_trades,
            final_capital = %result.final_capital,
            total_return = result.total_return,
            max_drawdown = result.max_drawdown,
            "Backtest complete"
        );

        Ok(result)
    }

    fn process_signal(&mut self, signal: Signal, bar: &MarketBar) {
        match signal {
            Signal::Buy => {
                if matches!(self.position, Some(p) if p.side == TradeSide::Long) {
                    return;
                }
                if self.position.is_some() && self.config.allow_short {
                    self.close_position(bar);
                }
                if self.position.is_none() {
                    self.open_position(TradeSide::Long, bar);
                }
            }
            Signal::Sell => {
                if !matches!(self.position, Some(p) if p.side == TradeSide::Long) {
                    return;
                }
                self.close_position(bar);
                if self.config.allow_short {
                    self.open_position(TradeSide::Short, bar);
                }
            }
            Signal::Hold => {}
        }
    }

    /// Close price widened against a buy or a sell
    fn fill_price(&self, close: Decimal, buying: bool) -> Decimal {
        if buying {
            close * (Decimal::ONE + self.config.slippage)
        } else {
            close * (Decimal::ONE - self.config.slippage)
        }
    }

    fn open_position(&mut self, side: TradeSide, bar: &MarketBar) {
        let c = self.config.commission_rate;
        let price = self.fill_price(bar.close, side == TradeSide::Long);
        let budget = self.cash * self.config.position_size;
        let shares = (budget / (price * (Decimal::ONE + c)))
            .floor()
            .to_u64()
            .unwrap_or(0);

        if shares == 0 {
            debug!(
                price = %price,
                cash = %self.cash,
                "Insufficient cash for one share, signal dropped"
            );
            return;
        }

        let qty = Decimal::from(shares);
        let notional = qty * price;
        match side {
            TradeSide::Long => self.cash -= notional * (Decimal::ONE + c),
            TradeSide::Short => self.cash += notional * (Decimal::ONE - c),
        }
        self.costs.add(
            notional * c,
            Decimal::ZERO,
            Decimal::ZERO,
            qty * (price - bar.close).abs(),
        );

        self.trades.push(Trade {
            entry_time: bar.timestamp,
            entry_price: price,
            exit_time: None,
            exit_price: None,
            shares,
            side,
            pnl: Decimal::ZERO,
            pnl_pct: Decimal::ZERO,
            status: TradeStatus::Open,
        });
        self.position = Some(OpenPosition {
            trade: self.trades.len() - 1,
            side,
            shares,
            entry_price: price,
        });

        debug!(
            side = ?side,
            price = %price,
            shares,
            time = bar.timestamp,
            "Opened position"
        );
    }

    fn close_position(&mut self, bar: &MarketBar) {
        let Some(pos) = self.position.take() else {
            return;
        };

        let c = self.config.commission_rate;
        let price = self.fill_price(bar.close, pos.side == TradeSide::Short);
        let qty = Decimal::from(pos.shares);
        let basis = qty * pos.entry_price;

        let pnl = match pos.side {
            TradeSide::Long => {
                let proceeds = qty * price * (Decimal::ONE - c);
                self.cash += proceeds;
                proceeds - basis * (Decimal::ONE + c)
            }
            TradeSide::Short => {
                let cover = qty * price * (Decimal::ONE + c);
                self.cash -= cover;
                basis * (Decimal::ONE - c) - cover
            }
        };
        self.costs.add(
            qty * price * c,
            Decimal::ZERO,
            Decimal::ZERO,
            qty * (price - bar.close).abs(),
        );

        if let Some(trade) = self.trades.get_mut(pos.trade) {
            trade.exit_time = Some(bar.timestamp);
            trade.exit_price = Some(price);
            trade.pnl = pnl;
            trade.pnl_pct = if basis > Decimal::ZERO {
                pnl / basis * dec!(100)
            } else {
                Decimal::ZERO
            };
            trade.status = TradeStatus::Closed;
        }

        debug!(
            side = ?pos.side,
            entry = %pos.entry_price,
            exit = %price,
            pnl = %pnl,
            "Closed position"
        );
    }

    fn build_result(&self, data: &[MarketBar]) -> BacktestResult {
        let initial = self.config.initial_capital;
        let final_capital = self.cash;
        let ratio = (final_capital / initial).to_f64().unwrap_or(0.0);

        let start_time = data.first().map(|b| b.timestamp).unwrap_or(0);
        let end_time = data.last().map(|b| b.timestamp).unwrap_or(0);

        let closed: Vec<&Trade> = self
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Closed)
            .collect();
        let total_trades = closed.len() as u32;
        let winning_trades = closed.iter().filter(|t| t.pnl > Decimal::ZERO).count() as u32;
        let losing_trades = total_trades - winning_trades;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let gross_profit: Decimal = closed
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .sum();
        let gross_loss: Decimal = closed
            .iter()
            .filter(|t| t.pnl <= Decimal::ZERO)
            .map(|t| t.pnl.abs())
            .sum();
        let profit_factor = if gross_loss > Decimal::ZERO {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        let equity: Vec<f64> = self
            .equity_curve
            .iter()
            .map(|p| p.equity.to_f64().unwrap_or(0.0))
            .collect();

        BacktestResult {
            strategy_name: self.strategy.name().to_string(),
            symbol: data.first().map(|b| b.symbol.clone()).unwrap_or_default(),
            start_time,
            end_time,
            initial_capital: initial,
            final_capital,
            total_return: (ratio - 1.0) * 100.0,
            annual_return: annual_return(ratio, end_time - start_time),
            sharpe_ratio: sharpe_ratio(&equity),
            max_drawdown: max_drawdown(initial.to_f64().unwrap_or(0.0), &equity),
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            profit_factor,
            equity_curve: self.equity_curve.clone(),
            trades: self.trades.clone(),
            params: self.strategy.params(),
            costs: self.costs.clone(),
            config: self.config.clone(),
        }
    }
}

/// Geometric annualised return in percent; 0 when no time elapsed
pub fn annual_return(ratio: f64, elapsed_ms: i64) -> f64 {
    let years = elapsed_ms as f64 / MS_PER_YEAR;
    if years <= 0.0 {
        return 0.0;
    }
    if ratio <= 0.0 {
        return -100.0;
    }
    (ratio.powf(1.0 / years) - 1.0) * 100.0
}

/// Largest peak-to-trough decline in percent, peak seeded with the initial capital
pub fn max_drawdown(initial: f64, equity: &[f64]) -> f64 {
    let mut peak = initial;
    let mut worst = 0.0f64;
    for &value in equity {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            worst = worst.max((peak - value) / peak * 100.0);
        }
    }
    worst
}

/// Annualised Sharpe of per-bar simple returns, zero risk-free rate, population std
pub fn sharpe_ratio(equity: &[f64]) -> f64 {
    let returns: Vec<f64> = equity
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }

    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{make_bars, DAY_MS};
    use crate::strategy::MovingAverageCrossover;

    /// Emits a fixed signal per bar index, HOLD past the end of the script
    struct Scripted {
        script: Vec<Signal>,
        cursor: usize,
    }

    impl Scripted {
        fn boxed(script: &[Signal]) -> Box<dyn Strategy> {
            Box::new(Self {
                script: script.to_vec(),
                cursor: 0,
            })
        }
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn description(&self) -> &str {
            "test script"
        }

        fn params(&self) -> ParamSet {
            ParamSet::new()
        }

        fn initialize(&mut self) {
            self.cursor = 0;
        }

        fn on_bar(&mut self, _bar: &MarketBar) -> EngineResult<Signal> {
            let signal = self.script.get(self.cursor).copied().unwrap_or(Signal::Hold);
            self.cursor += 1;
            Ok(signal)
        }
    }

    fn frictionless(capital: Decimal, allow_short: bool) -> BacktestConfig {
        BacktestConfig {
            initial_capital: capital,
            commission_rate: Decimal::ZERO,
            slippage: Decimal::ZERO,
            allow_short,
            position_size: Decimal::ONE,
        }
    }

    fn run_script(
        config: BacktestConfig,
        prices: &[f64],
        script: &[Signal],
    ) -> (BacktestResult, BacktestEngine) {
        let mut engine = BacktestEngine::new(Scripted::boxed(script), config).unwrap();
        engine.load_data(make_bars(prices));
        let result = engine.run().unwrap();
        (result, engine)
    }

    #[test]
    fn test_uptrend_crossover_end_to_end() {
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let strategy = MovingAverageCrossover::new(2, 4).unwrap();
        let mut engine =
            BacktestEngine::new(Box::new(strategy), frictionless(dec!(100000), false)).unwrap();
        engine.load_data(make_bars(&prices));

        let result = engine.run().unwrap();

        assert_eq!(engine.position(), 0);
        assert_eq!(engine.state(), EngineState::Complete);
        assert_eq!(result.equity_curve.len(), 10);
        assert_eq!(result.total_trades, 1);

        let trade = &result.trades[0];
        assert_eq!(trade.entry_time, 2 * DAY_MS);
        assert_eq!(trade.entry_price, dec!(102));
        assert_eq!(trade.shares, 980);
        assert_eq!(trade.exit_price, Some(dec!(109)));
        assert_eq!(trade.status, TradeStatus::Closed);

        assert_eq!(result.final_capital, dec!(106860));
        assert!(result.final_capital > result.initial_capital);
        assert!(result.profit_factor.is_infinite());
        assert_eq!(result.win_rate, 100.0);
        assert_eq!(result.params["fastPeriod"], 2.0);
    }

    #[test]
    fn test_run_is_deterministic() {
        let prices = [10.0, 11.0, 12.0, 11.0, 9.0, 8.0, 9.0, 11.0, 13.0, 12.0, 10.0, 9.0];
        let strategy = MovingAverageCrossover::new(2, 3).unwrap();
        let mut engine = BacktestEngine::new(Box::new(strategy), BacktestConfig::default()).unwrap();
        engine.load_data(make_bars(&prices));

        let first = engine.run().unwrap();
        let second = engine.run().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.equity_curve.len(), prices.len());
        for pair in first.trades.windows(2) {
            assert!(pair[0].entry_time <= pair[1].entry_time);
        }
    }

    #[test]
    fn test_round_trip_long() {
        use Signal::*;
        let (result, engine) =
            run_script(frictionless(dec!(1000), false), &[10.0, 10.0, 12.0, 12.0], &[Hold, Buy, Sell]);

        assert_eq!(engine.position(), 0);
        assert_eq!(result.final_capital, dec!(1200));
        assert_eq!(result.trades[0].shares, 100);
        assert_eq!(result.trades[0].pnl, dec!(200));
        assert_eq!(result.trades[0].pnl_pct, dec!(20));
        assert!((result.total_return - 20.0).abs() < 1e-9);
        let equity: Vec<Decimal> = result.equity_curve.iter().map(|p| p.equity).collect();
        assert_eq!(equity, vec![dec!(1000), dec!(1000), dec!(1200), dec!(1200)]);
    }

    #[test]
    fn test_short_reversal_books_cash_both_ways() {
        use Signal::*;
        let (result, engine) =
            run_script(frictionless(dec!(1000), true), &[10.0, 10.0, 8.0], &[Buy, Sell, Buy]);

        assert_eq!(engine.position(), 0);
        let sides: Vec<TradeSide> = result.trades.iter().map(|t| t.side).collect();
        assert_eq!(sides, vec![TradeSide::Long, TradeSide::Short, TradeSide::Long]);
        assert_eq!(result.trades[1].pnl, dec!(200));
        assert_eq!(result.trades[2].shares, 150);

        let equity: Vec<Decimal> = result.equity_curve.iter().map(|p| p.equity).collect();
        assert_eq!(equity, vec![dec!(1000), dec!(1000), dec!(1200)]);
        assert_eq!(result.equity_curve[1].position, -100);
        assert_eq!(result.final_capital, dec!(1200));
        assert_eq!(result.winning_trades, 1);
        assert_eq!(result.losing_trades, 2);
    }

    #[test]
    fn test_open_short_is_force_closed() {
        use Signal::*;
        let (result, engine) =
            run_script(frictionless(dec!(1000), true), &[10.0, 10.0], &[Buy, Sell]);
        assert_eq!(engine.position(), 0);
        assert_eq!(result.trades.len(), 2);
        assert!(result.trades.iter().all(|t| t.status == TradeStatus::Closed));
        assert_eq!(result.final_capital, dec!(1000));
    }

    #[test]
    fn test_sell_when_flat_is_ignored() {
        use Signal::*;
        let (result, _) = run_script(frictionless(dec!(1000), true), &[10.0, 11.0], &[Sell, Sell]);
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.final_capital, dec!(1000));
        assert_eq!(result.win_rate, 0.0);
        assert_eq!(result.profit_factor, 0.0);
        assert_eq!(result.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_slippage_widens_both_fills() {
        use Signal::*;
        let config = BacktestConfig {
            slippage: dec!(0.01),
            ..frictionless(dec!(1000), false)
        };
        let (result, _) = run_script(config, &[10.0, 10.0], &[Buy, Sell]);

        let trade = &result.trades[0];
        assert_eq!(trade.entry_price, dec!(10.1));
        assert_eq!(trade.exit_price, Some(dec!(9.9)));
        assert_eq!(trade.shares, 99);
        assert_eq!(trade.pnl, dec!(-19.8));
        assert_eq!(result.final_capital, dec!(980.2));
        assert_eq!(result.costs.slippage, dec!(19.8));
        assert_eq!(result.costs.commission, Decimal::ZERO);
    }

    #[test]
    fn test_commission_charged_on_entry_and_exit() {
        use Signal::*;
        let config = BacktestConfig {
            commission_rate: dec!(0.01),
            ..frictionless(dec!(1000), false)
        };
        let (result, _) = run_script(config, &[10.0, 10.0], &[Buy, Sell]);

        assert_eq!(result.trades[0].shares, 99);
        assert_eq!(result.final_capital, dec!(980.2));
        assert_eq!(result.costs.commission, dec!(19.8));
        assert_eq!(result.losing_trades, 1);
    }

    #[test]
    fn test_insufficient_cash_drops_signal() {
        use Signal::*;
        let (result, engine) = run_script(frictionless(dec!(5), false), &[10.0, 10.0], &[Buy]);
        assert!(result.trades.is_empty());
        assert_eq!(engine.cash(), dec!(5));
    }

    #[test]
    fn test_drawdown_tracks_peak() {
        use Signal::*;
        let (result, _) = run_script(
            frictionless(dec!(1000), false),
            &[10.0, 10.0, 5.0, 10.0],
            &[Buy],
        );
        assert!((result.max_drawdown - 50.0).abs() < 1e-9);
        assert_eq!(result.final_capital, dec!(1000));
    }

    #[test]
    fn test_single_bar_has_zero_annual_return() {
        let (result, _) = run_script(frictionless(dec!(1000), false), &[10.0], &[Signal::Buy]);
        assert_eq!(result.annual_return, 0.0);
        assert_eq!(result.equity_curve.len(), 1);
    }

    #[test]
    fn test_rejects_invalid_data() {
        let mut engine = BacktestEngine::new(Scripted::boxed(&[]), BacktestConfig::default()).unwrap();
        assert_eq!(engine.run(), Err(EngineError::EmptyData));

        let mut bars = make_bars(&[10.0, 11.0, 12.0]);
        bars[2].timestamp = bars[1].timestamp;
        engine.load_data(bars);
        assert_eq!(engine.run(), Err(EngineError::UnsortedData { index: 2 }));

        let mut bars = make_bars(&[10.0, 11.0]);
        bars[1].close = Decimal::ZERO;
        engine.load_data(bars);
        assert!(matches!(engine.run(), Err(EngineError::InvalidBar { index: 1, .. })));
        assert_eq!(engine.state(), EngineState::Initialized);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = BacktestConfig {
            initial_capital: dec!(-1),
            ..Default::default()
        };
        assert!(BacktestEngine::new(Scripted::boxed(&[]), config).is_err());
    }

    #[test]
    fn test_sharpe_and_annual_helpers() {
        assert_eq!(sharpe_ratio(&[100.0, 100.0, 100.0]), 0.0);
        assert_eq!(sharpe_ratio(&[100.0]), 0.0);
        // returns +10%, -10%: mean 0
        assert!(sharpe_ratio(&[100.0, 110.0, 99.0]).abs() < 1e-9);

        let one_year = (MS_PER_YEAR) as i64;
        assert!((annual_return(1.21, 2 * one_year) - 10.0).abs() < 1e-9);
        assert_eq!(annual_return(1.5, 0), 0.0);
    }
}
