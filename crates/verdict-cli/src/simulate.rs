//! Synthetic hierarchy driven by simulated data sources

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use verdict_core::prelude::*;
use verdict_core::{
    spawn_sweeper, ConfigStore, KeyParameterConfig, PageConfig, PoolStats, RequestId, SearchQuery,
    TabConfig,
};

/// Shape and behaviour of a simulated run
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub seed: u64,
    pub pages: usize,
    pub tabs: usize,
    pub params: usize,
    /// Percentage of parameters answered out-of-band
    pub deferred_percent: u32,
    /// Percentage of connector calls that fail
    pub failure_percent: u32,
    /// Percentage of deferred searches that are never answered
    pub lost_percent: u32,
    pub max_delay: Duration,
}

/// Outcome of a simulated run
#[derive(Debug)]
pub struct SimulatorReport {
    pub parameters: usize,
    pub elapsed: Duration,
    pub snapshot: Option<SessionSnapshot>,
    pub statuses: BTreeMap<String, usize>,
    pub pools: [PoolStats; 2],
}

impl SimulatorReport {
    pub fn settled(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        out.push_str("Simulation Report\n=================\n");
        out.push_str(&format!("Parameters: {}\n", self.parameters));
        out.push_str(&format!("Elapsed: {:.2}s\n", self.elapsed.as_secs_f64()));
        match &self.snapshot {
            Some(snapshot) => {
                let verdict = snapshot
                    .status
                    .map_or_else(|| "-".to_string(), |s| s.to_string());
                out.push_str(&format!("State: {:?}\nVerdict: {verdict}\n", snapshot.state));
            }
            None => out.push_str("State: did not settle\n"),
        }
        out.push_str("Parameter statuses:\n");
        for (status, count) in &self.statuses {
            out.push_str(&format!("  {status}: {count}\n"));
        }
        for pool in &self.pools {
            out.push_str(&format!(
                "Pool {}: {} workers, {} submitted, {} completed, {} failed\n",
                pool.phase, pool.workers, pool.submitted, pool.completed, pool.failed
            ));
        }
        out
    }
}

struct SimulatedStore {
    pages: Vec<PageConfig>,
    common: Vec<ParameterConfig>,
}

#[async_trait]
impl ConfigStore for SimulatedStore {
    async fn load_pages(&self, _folder: &str) -> Result<Vec<PageConfig>, VerdictError> {
        Ok(self.pages.clone())
    }

    async fn load_common_params(&self, _folder: &str) -> Result<Vec<ParameterConfig>, VerdictError> {
        Ok(self.common.clone())
    }

    async fn load_key_params(&self, _folder: &str) -> Result<Vec<KeyParameterConfig>, VerdictError> {
        Ok(vec![KeyParameterConfig {
            name: "run".to_string(),
            required: true,
            default: None,
        }])
    }
}

/// Answers after a random delay; the value is the query itself
struct SimulatedConnector {
    seed: AtomicU64,
    failure_percent: u32,
    max_delay: Duration,
}

impl SimulatedConnector {
    fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn execute(&self, request: &ConnectorRequest) -> Result<Value, ConnectorError> {
        let (delay, fail) = {
            let mut rng = self.rng();
            (random_delay(&mut rng, self.max_delay), rng.random_range(0..100) < self.failure_percent)
        };
        tokio::time::sleep(delay).await;
        if fail {
            return Err(ConnectorError::Failure(format!("simulated outage on {}", request.path)));
        }
        Ok(json!(request.query))
    }
}

/// Hands started searches to a responder task
struct SimulatedSearch {
    next_id: AtomicU64,
    started: mpsc::UnboundedSender<(RequestId, String)>,
}

#[async_trait]
impl DeferredSearch for SimulatedSearch {
    async fn start_search(&self, query: &SearchQuery) -> Result<RequestId, ConnectorError> {
        let id = RequestId::new(format!("sim-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        self.started
            .send((id.clone(), query.query.clone()))
            .map_err(|_| ConnectorError::Failure("search responder stopped".into()))?;
        Ok(id)
    }

    async fn cancel(&self, request_ids: &[RequestId]) -> Result<(), ConnectorError> {
        tracing::debug!(count = request_ids.len(), "simulated searches cancelled");
        Ok(())
    }
}

fn random_delay(rng: &mut StdRng, max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX).max(5);
    Duration::from_millis(rng.random_range(5..=max_ms))
}

fn build_hierarchy(config: &SimulatorConfig, rng: &mut StdRng) -> (Vec<PageConfig>, Vec<ParameterConfig>) {
    let common = vec![ParameterConfig::new("batch", "sim", "batch-${run}").expect(json!("batch-1"))];
    let pages = (0..config.pages)
        .map(|p| PageConfig {
            name: format!("page-{p}"),
            order: u32::try_from(p).unwrap_or(u32::MAX),
            tabs: (0..config.tabs)
                .map(|t| TabConfig {
                    name: format!("tab-{t}"),
                    parameters: (0..config.params)
                        .map(|i| {
                            let query = format!("${{batch}}/{p}/{t}/{i}");
                            let expected = json!(format!("batch-1/{p}/{t}/{i}"));
                            let param = if rng.random_range(0..100) < config.deferred_percent {
                                ParameterConfig::new(format!("param-{i}"), "search", query).deferred()
                            } else {
                                ParameterConfig::new(format!("param-{i}"), "sim", query)
                            };
                            if i % 5 == 0 {
                                param.synchronous().expect(expected)
                            } else {
                                param.expect(expected)
                            }
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();
    (pages, common)
}

/// Run one session over a generated hierarchy until it settles
pub async fn run_simulator(
    orchestrator_config: OrchestratorConfig,
    config: SimulatorConfig,
) -> anyhow::Result<SimulatorReport> {
    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (pages, common) = build_hierarchy(&config, &mut rng);
    let parameters = config.pages * config.tabs * config.params;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(SimulatedConnector {
        seed: AtomicU64::new(config.seed),
        failure_percent: config.failure_percent,
        max_delay: config.max_delay,
    });
    let collaborators = Collaborators::new(Arc::new(SimulatedStore { pages, common }))
        .with_connectors(ConnectorRegistry::new().with("sim", connector))
        .with_deferred_search(Arc::new(SimulatedSearch {
            next_id: AtomicU64::new(0),
            started: started_tx,
        }));
    let orchestrator = Orchestrator::new(orchestrator_config, collaborators)?;
    let sweeper = spawn_sweeper(orchestrator.clone());

    let responder = {
        let orchestrator = orchestrator.clone();
        let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5eed);
        let lost_percent = config.lost_percent;
        let max_delay = config.max_delay;
        tokio::spawn(async move {
            while let Some((request, query)) = started_rx.recv().await {
                if rng.random_range(0..100) < lost_percent {
                    tracing::debug!(%request, "simulated search lost");
                    continue;
                }
                let delay = random_delay(&mut rng, max_delay);
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    orchestrator
                        .on_deferred_result(&request, DeferredOutcome::Value(json!(query)))
                        .await;
                });
            }
        })
    };

    let session = orchestrator
        .create_session(SessionRequest::new("simulation").with_key("run", "1"))
        .await?;
    orchestrator.execute(session, ExecutionConfig::new()).await?;

    // Long enough for unanswered searches to be swept.
    let budget = orchestrator.config().deferred_ttl()
        + orchestrator.config().sweep_interval() * 2
        + config.max_delay * 4;
    let snapshot = orchestrator.wait_until_settled(session, budget).await?;

    let mut statuses = BTreeMap::new();
    if let Some(snapshot) = &snapshot {
        for param in snapshot
            .pages
            .iter()
            .flat_map(|p| &p.tabs)
            .flat_map(|t| &t.parameters)
        {
            let label = param.status.map_or_else(|| "pending".to_string(), |s| s.to_string());
            *statuses.entry(label).or_insert(0) += 1;
        }
    }
    let pools = orchestrator.pool_stats();

    sweeper.shutdown().await;
    orchestrator.shutdown().await;
    responder.abort();

    Ok(SimulatorReport {
        parameters,
        elapsed: start.elapsed(),
        snapshot,
        statuses,
        pools,
    })
}
