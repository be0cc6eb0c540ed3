use std::collections::VecDeque;

use super::{Signal, Strategy};
use crate::error::{EngineError, EngineResult};
use crate::types::{MarketBar, ParamSet};

const TRAINING_EPOCHS: usize = 100;
const LEARNING_RATE: f64 = 0.01;

/// Linear model fitted by per-sample gradient descent on squared error
#[derive(Debug, Clone)]
pub struct LinearRegression {
    weights: Vec<f64>,
    bias: f64,
    learning_rate: f64,
}

impl LinearRegression {
    /// Zero-initialised model, so training is fully deterministic
    pub fn new(features: usize, learning_rate: f64) -> Self {
        Self {
            weights: vec![0.0; features],
            bias: 0.0,
            learning_rate,
        }
    }

    pub fn predict(&self, x: &[f64]) -> EngineResult<f64> {
        if x.len() != self.weights.len() {
            return Err(EngineError::Strategy(format!(
                "feature count mismatch: expected {}, got {}",
                self.weights.len(),
                x.len()
            )));
        }
        Ok(self.bias + self.weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>())
    }

    pub fn train(&mut self, x: &[Vec<f64>], y: &[f64], epochs: usize) -> EngineResult<()> {
        for _ in 0..epochs {
            for (features, target) in x.iter().zip(y) {
                let error = self.predict(features)? - target;
                self.bias -= self.learning_rate * error;
                for (w, v) in self.weights.iter_mut().zip(features) {
                    *w -= self.learning_rate * error * v;
                }
            }
        }
        Ok(())
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }
}

/// Linear-regression forecaster over normalised lagged prices.
///
/// Each bar past the warm-up contributes one example: the `lookback` closes
/// preceding the current bar, each divided by the oldest of them minus one,
/// labelled with the current single-bar return. After `train_period`
/// examples the model is trained once and then predicts on every later bar.
#[derive(Debug, Clone)]
pub struct MlStrategy {
    lookback: usize,
    train_period: usize,
    threshold: f64,
    model: LinearRegression,
    prices: VecDeque<f64>,
    bars_seen: usize,
    features: Vec<Vec<f64>>,
    targets: Vec<f64>,
    trained: bool,
}

impl MlStrategy {
    pub fn new(lookback: usize, train_period: usize, threshold: f64) -> EngineResult<Self> {
        if lookback == 0 || train_period == 0 {
            return Err(EngineError::InvalidParameter(format!(
                "ML lookback and train period must be at least 1, got {lookback}/{train_period}"
            )));
        }
        if !(threshold >= 0.0 && threshold.is_finite()) {
            return Err(EngineError::InvalidParameter(format!(
                "ML threshold must be non-negative, got {threshold}"
            )));
        }

        Ok(Self {
            lookback,
            train_period,
            threshold,
            model: LinearRegression::new(lookback, LEARNING_RATE),
            prices: VecDeque::with_capacity(lookback + 2),
            bars_seen: 0,
            features: Vec::with_capacity(train_period),
            targets: Vec::with_capacity(train_period),
            trained: false,
        })
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn example(&self) -> EngineResult<(Vec<f64>, f64)> {
        let n = self.prices.len();
        let base = self.prices[0];
        let (current, previous) = (self.prices[n - 1], self.prices[n - 2]);
        if base == 0.0 || previous == 0.0 {
            return Err(EngineError::Strategy(
                "zero price in ML feature window".to_string(),
            ));
        }

        let feature = self
            .prices
            .iter()
            .take(self.lookback)
            .map(|p| p / base - 1.0)
            .collect();
        Ok((feature, current / previous - 1.0))
    }
}

impl Strategy for MlStrategy {
    fn name(&self) -> &str {
        "ML Linear Regression"
    }

    fn description(&self) -> &str {
        "Predicts the next return with a linear regression over recent normalised prices"
    }

    fn params(&self) -> ParamSet {
        ParamSet::from([
            ("lookback".to_string(), self.lookback as f64),
            ("trainPeriod".to_string(), self.train_period as f64),
            ("threshold".to_string(), self.threshold),
        ])
    }

    fn initialize(&mut self) {
        self.model = LinearRegression::new(self.lookback, LEARNING_RATE);
        self.prices.clear();
        self.bars_seen = 0;
        self.features.clear();
        self.targets.clear();
        self.trained = false;
    }

    fn on_bar(&mut self, bar: &MarketBar) -> EngineResult<Signal> {
        self.bars_seen += 1;
        self.prices.push_back(bar.close_f64());
        if self.prices.len() > self.lookback + 1 {
            self.prices.pop_front();
        }
        if self.bars_seen <= self.lookback + 1 {
            return Ok(Signal::Hold);
        }

        let (feature, target) = self.example()?;

        if !self.trained {
            self.features.push(feature.clone());
            self.targets.push(target);
            if self.features.len() >= self.train_period {
                self.model
                    .train(&self.features, &self.targets, TRAINING_EPOCHS)?;
                self.trained = true;
            }
        }
        if !self.trained {
            return Ok(Signal::Hold);
        }

        let prediction = self.model.predict(&feature)?;
        if prediction > self.threshold {
            Ok(Signal::Buy)
        } else if prediction < -self.threshold {
            Ok(Signal::Sell)
        } else {
            Ok(Signal::Hold)
        }
    }
}
