//! Parameter optimization for backtesting strategies
//!
//! Two searches over a discretised parameter space share one evaluation
//! path: exhaustive grid search and a seeded genetic algorithm. Every
//! evaluation builds a fresh strategy through the caller's factory and runs
//! it in a fresh [`BacktestEngine`] over the same bars and config.

use std::fmt;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::BacktestEngine;
use crate::error::{EngineError, EngineResult};
use crate::strategy::Strategy;
use crate::types::{BacktestConfig, BacktestResult, MarketBar, ParamSet};

/// Upper bound on the size of a grid search
pub const MAX_GRID_COMBINATIONS: u64 = 100_000;

// ============================================================================
// Types
// ============================================================================

/// Inclusive range `min, min + step, ..., <= max` for one named parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    pub fn new(name: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            step,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: &str| EngineError::InvalidRange {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(invalid("bounds and step must be finite"));
        }
        if self.step <= 0.0 {
            return Err(invalid("step must be positive"));
        }
        if self.min > self.max {
            return Err(invalid("min must not exceed max"));
        }
        let values = self.steps() + 1.0;
        if !values.is_finite() || values > MAX_GRID_COMBINATIONS as f64 {
            return Err(invalid(&format!(
                "more than {MAX_GRID_COMBINATIONS} values between min and max"
            )));
        }
        Ok(())
    }

    fn steps(&self) -> f64 {
        ((self.max - self.min) / self.step + 1e-9).floor()
    }

    /// Number of discrete values in the range; saturates for ranges that
    /// fail [`ParameterRange::validate`]
    pub fn count(&self) -> u64 {
        let steps = self.steps();
        if steps.is_nan() || steps < 0.0 {
            return 1;
        }
        (steps as u64).saturating_add(1)
    }

    /// The `k`-th value, snapped to remove accumulated float noise
    pub fn value_at(&self, k: u64) -> f64 {
        let raw = self.min + k as f64 * self.step;
        (raw * 1e10).round() / 1e10
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.count()).map(|k| self.value_at(k)).collect()
    }

    fn sample(&self, rng: &mut impl Rng) -> f64 {
        self.value_at(rng.gen_range(0..self.count()))
    }
}

/// Result field a search ranks by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptimizationMetric {
    #[default]
    SharpeRatio,
    TotalReturn,
    AnnualReturn,
    MaxDrawdown,
    WinRate,
    ProfitFactor,
    FinalCapital,
    TotalTrades,
}

impl OptimizationMetric {
    pub fn value(&self, result: &BacktestResult) -> f64 {
        match self {
            OptimizationMetric::SharpeRatio => result.sharpe_ratio,
            OptimizationMetric::TotalReturn => result.total_return,
            OptimizationMetric::AnnualReturn => result.annual_return,
            OptimizationMetric::MaxDrawdown => result.max_drawdown,
            OptimizationMetric::WinRate => result.win_rate,
            OptimizationMetric::ProfitFactor => result.profit_factor,
            OptimizationMetric::FinalCapital => result.final_capital.to_f64().unwrap_or(0.0),
            OptimizationMetric::TotalTrades => result.total_trades as f64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMetric::SharpeRatio => "sharpeRatio",
            OptimizationMetric::TotalReturn => "totalReturn",
            OptimizationMetric::AnnualReturn => "annualReturn",
            OptimizationMetric::MaxDrawdown => "maxDrawdown",
            OptimizationMetric::WinRate => "winRate",
            OptimizationMetric::ProfitFactor => "profitFactor",
            OptimizationMetric::FinalCapital => "finalCapital",
            OptimizationMetric::TotalTrades => "totalTrades",
        }
    }
}

impl fmt::Display for OptimizationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizationMetric {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sharpeRatio" | "sharpe_ratio" | "sharpe" => Ok(OptimizationMetric::SharpeRatio),
            "totalReturn" | "total_return" => Ok(OptimizationMetric::TotalReturn),
            "annualReturn" | "annual_return" => Ok(OptimizationMetric::AnnualReturn),
            "maxDrawdown" | "max_drawdown" => Ok(OptimizationMetric::MaxDrawdown),
            "winRate" | "win_rate" => Ok(OptimizationMetric::WinRate),
            "profitFactor" | "profit_factor" => Ok(OptimizationMetric::ProfitFactor),
            "finalCapital" | "final_capital" => Ok(OptimizationMetric::FinalCapital),
            "totalTrades" | "total_trades" => Ok(OptimizationMetric::TotalTrades),
            other => Err(EngineError::UnknownMetric(other.to_string())),
        }
    }
}

/// One evaluated parameter combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub params: ParamSet,
    pub result: BacktestResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub best_params: ParamSet,
    pub best_result: BacktestResult,
    /// Every evaluation in the order it ran
    pub all_results: Vec<Evaluation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneticConfig {
    pub population_size: usize,
    pub generations: usize,
    pub mutation_rate: f64,
    pub elite_count: usize,
    pub seed: u64,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            mutation_rate: 0.1,
            elite_count: 2,
            seed: 42,
        }
    }
}

impl GeneticConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.population_size == 0 {
            return Err(EngineError::InvalidConfig(
                "population_size must be at least 1".to_string(),
            ));
        }
        if self.elite_count > self.population_size {
            return Err(EngineError::InvalidConfig(format!(
                "elite_count ({}) exceeds population_size ({})",
                self.elite_count, self.population_size
            )));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(EngineError::InvalidConfig(format!(
                "mutation_rate must be within [0, 1], got {}",
                self.mutation_rate
            )));
        }
        Ok(())
    }

    /// Evaluations a search with this config performs
    pub fn evaluations(&self) -> u64 {
        self.population_size as u64 * (self.generations as u64 + 1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    #[default]
    Grid,
    Genetic,
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMethod::Grid => write!(f, "grid"),
            SearchMethod::Genetic => write!(f, "genetic"),
        }
    }
}

impl FromStr for SearchMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(SearchMethod::Grid),
            "genetic" | "ga" => Ok(SearchMethod::Genetic),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown search method '{other}'"
            ))),
        }
    }
}

// ============================================================================
// Progress tracking
// ============================================================================

/// Optimization run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Headline of a finished search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeSummary {
    pub method: SearchMethod,
    pub metric: OptimizationMetric,
    pub best_params: ParamSet,
    pub best_value: f64,
    pub evaluations: usize,
}

/// Point-in-time copy of [`OptimizeProgress`] for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: OptimizeStatus,
    pub method: Option<SearchMethod>,
    pub total: u64,
    pub completed: u64,
    pub progress_pct: f32,
    pub summary: Option<OptimizeSummary>,
    pub error: Option<String>,
}

/// Shared progress tracker between the API handler and a running search
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub method: RwLock<Option<SearchMethod>>,
    pub total: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicBool,
    pub summary: RwLock<Option<OptimizeSummary>>,
    pub error_message: RwLock<Option<String>>,
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            method: RwLock::new(None),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            summary: RwLock::new(None),
            error_message: RwLock::new(None),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self, method: SearchMethod) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = OptimizeStatus::Running;
        self.clear(method);
    }

    /// Claim the tracker for a new run. Check and set happen under one
    /// status lock, so of two concurrent callers exactly one gets `true`.
    pub fn try_start(&self, method: SearchMethod) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if *status == OptimizeStatus::Running {
            return false;
        }
        *status = OptimizeStatus::Running;
        self.clear(method);
        true
    }

    fn clear(&self, method: SearchMethod) {
        *self.method.write().unwrap_or_else(PoisonError::into_inner) = Some(method);
        self.total.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.summary.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.error_message.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn finish(&self, summary: OptimizeSummary) {
        *self.summary.write().unwrap_or_else(PoisonError::into_inner) = Some(summary);
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = OptimizeStatus::Complete;
    }

    /// Record a failed search; cancellation is reported as its own status
    pub fn fail(&self, error: &EngineError) {
        let status = if *error == EngineError::Cancelled {
            OptimizeStatus::Cancelled
        } else {
            *self.error_message.write().unwrap_or_else(PoisonError::into_inner) =
                Some(error.to_string());
            OptimizeStatus::Error
        };
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Get progress as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        matches!(
            *self.status.read().unwrap_or_else(PoisonError::into_inner),
            OptimizeStatus::Running
        )
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            status: *self.status.read().unwrap_or_else(PoisonError::into_inner),
            method: *self.method.read().unwrap_or_else(PoisonError::into_inner),
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            progress_pct: self.progress_pct(),
            summary: self
                .summary
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            error: self
                .error_message
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Grid Generation
// ============================================================================

/// Cartesian product of every range, in range order.
///
/// No ranges yields exactly one empty combination.
pub fn grid_combinations(ranges: &[ParameterRange]) -> EngineResult<Vec<ParamSet>> {
    let mut count: u64 = 1;
    for range in ranges {
        range.validate()?;
        count = count.saturating_mul(range.count());
    }
    if count > MAX_GRID_COMBINATIONS {
        return Err(EngineError::TooManyCombinations {
            count,
            limit: MAX_GRID_COMBINATIONS,
        });
    }

    let mut combinations = vec![ParamSet::new()];
    for range in ranges {
        let values = range.values();
        combinations = combinations
            .iter()
            .flat_map(|combo| {
                values.iter().map(move |&v| {
                    let mut next = combo.clone();
                    next.insert(range.name.clone(), v);
                    next
                })
            })
            .collect();
    }
    Ok(combinations)
}

// ============================================================================
// Optimizer
// ============================================================================

/// Runs backtests for many parameter sets and keeps the best.
///
/// `factory` maps a parameter set to a fresh strategy. Any error from the
/// factory or from a backtest aborts the whole search.
pub struct Optimizer<F> {
    factory: F,
    data: Arc<[MarketBar]>,
    config: BacktestConfig,
    metric: OptimizationMetric,
    maximize: bool,
    progress: Option<Arc<OptimizeProgress>>,
}

impl<F> Optimizer<F>
where
    F: Fn(&ParamSet) -> EngineResult<Box<dyn Strategy>>,
{
    pub fn new(factory: F, data: impl Into<Arc<[MarketBar]>>, config: BacktestConfig) -> Self {
        Self {
            factory,
            data: data.into(),
            config,
            metric: OptimizationMetric::default(),
            maximize: true,
            progress: None,
        }
    }

    pub fn with_metric(mut self, metric: OptimizationMetric, maximize: bool) -> Self {
        self.metric = metric;
        self.maximize = maximize;
        self
    }

    /// Report progress and honour cancellation through `progress`
    pub fn with_progress(mut self, progress: Arc<OptimizeProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn grid_search(&self, ranges: &[ParameterRange]) -> EngineResult<OptimizationResult> {
        let combinations = grid_combinations(ranges)?;
        self.set_total(combinations.len() as u64);

        info!(
            combinations = combinations.len(),
            metric = %self.metric,
            maximize = self.maximize,
            "Starting grid search"
        );

        let mut all_results = Vec::with_capacity(combinations.len());
        for params in combinations {
            all_results.push(self.evaluate(params)?);
        }

        self.conclude(all_results)
    }

    pub fn genetic_search(
        &self,
        ranges: &[ParameterRange],
        genetic: &GeneticConfig,
    ) -> EngineResult<OptimizationResult> {
        genetic.validate()?;
        for range in ranges {
            range.validate()?;
        }
        self.set_total(genetic.evaluations());

        info!(
            population = genetic.population_size,
            generations = genetic.generations,
            seed = genetic.seed,
            metric = %self.metric,
            "Starting genetic search"
        );

        let mut rng = ChaCha8Rng::seed_from_u64(genetic.seed);
        let population: Vec<ParamSet> = (0..genetic.population_size)
            .map(|_| random_individual(ranges, &mut rng))
            .collect();

        let mut evaluated = self.evaluate_all(population)?;
        let mut all_results = evaluated.clone();

        for generation in 0..genetic.generations {
            let mut ranked: Vec<&Evaluation> = evaluated.iter().collect();
            ranked.sort_by(|a, b| {
                let (a, b) = (self.metric.value(&a.result), self.metric.value(&b.result));
                if self.maximize {
                    b.total_cmp(&a)
                } else {
                    a.total_cmp(&b)
                }
            });

            let mut next: Vec<ParamSet> = ranked
                .iter()
                .take(genetic.elite_count)
                .map(|e| e.params.clone())
                .collect();

            let fitness: Vec<f64> = evaluated
                .iter()
                .map(|e| self.fitness(self.metric.value(&e.result)))
                .collect();

            while next.len() < genetic.population_size {
                let a = select_parent(&evaluated, &fitness, &mut rng);
                let b = select_parent(&evaluated, &fitness, &mut rng);
                let mut child = crossover(ranges, a, b, &mut rng);
                mutate(ranges, &mut child, genetic.mutation_rate, &mut rng);
                next.push(child);
            }

            evaluated = self.evaluate_all(next)?;
            all_results.extend(evaluated.iter().cloned());
            debug!(generation, evaluated = all_results.len(), "Generation complete");
        }

        self.conclude(all_results)
    }

    fn set_total(&self, total: u64) {
        if let Some(progress) = &self.progress {
            progress.total.store(total, Ordering::Relaxed);
        }
    }

    fn evaluate_all(&self, population: Vec<ParamSet>) -> EngineResult<Vec<Evaluation>> {
        population.into_iter().map(|p| self.evaluate(p)).collect()
    }

    fn evaluate(&self, params: ParamSet) -> EngineResult<Evaluation> {
        if let Some(progress) = &self.progress {
            if progress.is_cancelled() {
                warn!("Optimization cancelled");
                return Err(EngineError::Cancelled);
            }
        }

        let strategy = (self.factory)(&params)?;
        let mut engine = BacktestEngine::new(strategy, self.config.clone())?;
        engine.load_data(Arc::clone(&self.data));
        let result = engine.run()?;

        if let Some(progress) = &self.progress {
            progress.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Evaluation { params, result })
    }

    fn is_better(&self, current: f64, best: f64) -> bool {
        if self.maximize {
            current > best
        } else {
            current < best
        }
    }

    /// Selection weight; always finite and non-negative
    fn fitness(&self, value: f64) -> f64 {
        let value = if value.is_nan() {
            0.0
        } else {
            value.clamp(-1e12, 1e12)
        };
        let fitness = if self.maximize {
            value.max(0.0)
        } else {
            (1.0 / (value + 0.0001)).max(0.0)
        };
        if fitness.is_finite() {
            fitness
        } else {
            0.0
        }
    }

    fn conclude(&self, all_results: Vec<Evaluation>) -> EngineResult<OptimizationResult> {
        let mut best: Option<&Evaluation> = None;
        for evaluation in &all_results {
            let better = match best {
                None => true,
                Some(b) => self.is_better(
                    self.metric.value(&evaluation.result),
                    self.metric.value(&b.result),
                ),
            };
            if better {
                best = Some(evaluation);
            }
        }
        let best = best.cloned().ok_or(EngineError::EmptyData)?;

        info!(
            evaluations = all_results.len(),
            best_value = self.metric.value(&best.result),
            best_params = ?best.params,
            "Optimization complete"
        );

        Ok(OptimizationResult {
            best_params: best.params,
            best_result: best.result,
            all_results,
        })
    }
}

fn random_individual(ranges: &[ParameterRange], rng: &mut impl Rng) -> ParamSet {
    ranges
        .iter()
        .map(|r| (r.name.clone(), r.sample(rng)))
        .collect()
}

/// Roulette-wheel selection, uniform when every weight is zero
fn select_parent<'a>(
    population: &'a [Evaluation],
    fitness: &[f64],
    rng: &mut impl Rng,
) -> &'a ParamSet {
    let total: f64 = fitness.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return &population[rng.gen_range(0..population.len())].params;
    }

    let target = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (individual, weight) in population.iter().zip(fitness) {
        cumulative += weight;
        if cumulative >= target {
            return &individual.params;
        }
    }
    &population[population.len() - 1].params
}

fn crossover(
    ranges: &[ParameterRange],
    a: &ParamSet,
    b: &ParamSet,
    rng: &mut impl Rng,
) -> ParamSet {
    ranges
        .iter()
        .filter_map(|r| {
            let parent = if rng.gen_bool(0.5) { a } else { b };
            parent.get(&r.name).map(|v| (r.name.clone(), *v))
        })
        .collect()
}

fn mutate(ranges: &[ParameterRange], individual: &mut ParamSet, rate: f64, rng: &mut impl Rng) {
    for range in ranges {
        if rng.gen_bool(rate) {
            individual.insert(range.name.clone(), range.sample(rng));
        }
    }
}
