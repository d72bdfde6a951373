use crate::document::BalanceDocument;
use crate::error::{MarginError, Result};
use crate::margin::{compute, compute_rollup, merge_by_name, SegmentResult};
use crate::report::{AnalysisReport, PeriodReport};
use crate::request::{build_queries, build_range_queries, BranchSelector, QueryRequest};
use crate::schema::{DashboardConfig, FailurePolicy, ResolvedSegments};
use crate::series::{FetchFailure, MonthlySeries};
use crate::source::{fetch_with_timeout, BalanceSource};
use crate::utils::{validate_month, MonthRange};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MIN_YEAR: i32 = 2000;
pub const MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    /// Subsectors rolled up into sectors ("Análise Setorial").
    Sectoral,
    /// One result per subsector ("Análise Subsetorial").
    Subsectoral,
    /// Sectoral results for every month of the configured range.
    Annual,
}

/// The tuple selected by the user before pressing "Analisar".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSelection {
    pub month: u32,
    pub year: i32,
    pub branch: BranchSelector,
    pub kind: AnalysisType,
}

impl AnalysisSelection {
    pub fn validate(&self) -> Result<()> {
        validate_year(self.year)?;
        if self.kind != AnalysisType::Annual {
            validate_month(self.month)?;
        }
        if self.branch == BranchSelector::Single(0) {
            return Err(MarginError::InvalidArgument(
                "Branch code 0 selects the consolidated view; use BranchSelector::All".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_year(year: i32) -> Result<()> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(MarginError::InvalidArgument(format!(
            "Invalid year {}: must be between {} and {}",
            year, MIN_YEAR, MAX_YEAR
        )));
    }
    Ok(())
}

/// Monotonic counter identifying analysis runs. Results of a run whose ticket is
/// no longer current must not reach the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct AnalysisGeneration {
    current: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct AnalysisTicket {
    id: u64,
    current: Arc<AtomicU64>,
}

impl AnalysisGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run, superseding every earlier ticket.
    pub fn begin(&self) -> AnalysisTicket {
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        AnalysisTicket {
            id,
            current: Arc::clone(&self.current),
        }
    }
}

impl AnalysisTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.id
    }
}

/// Documents fetched for a batch of queries, in query order.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub documents: Vec<(QueryRequest, BalanceDocument)>,
    pub failures: Vec<FetchFailure>,
}

pub struct MarginAnalyzer<S> {
    source: S,
    config: DashboardConfig,
    generation: AnalysisGeneration,
}

impl<S: BalanceSource> MarginAnalyzer<S> {
    pub fn new(source: S, config: DashboardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            generation: AnalysisGeneration::new(),
        })
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn generation(&self) -> &AnalysisGeneration {
        &self.generation
    }

    /// Fetches all queries with at most `max_concurrency` requests in flight.
    ///
    /// Under `FailFast` the first failure aborts the batch and drops the requests
    /// still pending. Under `Partial` fetch failures are collected, while
    /// parse failures still abort; a batch in which every query failed is an error.
    pub async fn fetch_all(&self, queries: Vec<QueryRequest>) -> Result<FetchBatch> {
        let limit = self.config.gateway.timeout();
        let total = queries.len();
        let requests = futures::stream::iter(queries).map(|query| async move {
            let result = fetch_with_timeout(&self.source, &query, limit).await;
            (query, result)
        });
        let requests = requests.buffered(self.config.max_concurrency);

        match self.config.failure_policy {
            FailurePolicy::FailFast => {
                let documents: Vec<(QueryRequest, BalanceDocument)> = requests
                    .map(|(query, result)| result.map(|document| (query, document)))
                    .try_collect()
                    .await?;
                debug!("Fetched {} balance documents", documents.len());
                Ok(FetchBatch {
                    documents,
                    failures: Vec::new(),
                })
            }
            FailurePolicy::Partial => {
                let outcomes: Vec<(QueryRequest, Result<BalanceDocument>)> = requests.collect().await;
                let mut batch = FetchBatch::default();
                let mut first_error = None;

                for (query, result) in outcomes {
                    match result {
                        Ok(document) => batch.documents.push((query, document)),
                        Err(e) if e.is_fetch_error() => {
                            warn!("Balance request {} failed: {}", query.label(), e);
                            batch.failures.push(FetchFailure {
                                month: query.month,
                                year: query.year,
                                branch: query.branch,
                                reason: e.to_string(),
                            });
                            first_error.get_or_insert(e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                if batch.documents.is_empty() {
                    if let Some(e) = first_error {
                        return Err(e);
                    }
                }
                debug!(
                    "Fetched {} of {} balance documents",
                    batch.documents.len(),
                    total
                );
                Ok(batch)
            }
        }
    }

    fn resolve(&self, branch: u32) -> ResolvedSegments {
        self.config.segments.resolve(branch)
    }

    fn sector_results(&self, query: &QueryRequest, document: &BalanceDocument) -> Result<Vec<SegmentResult>> {
        let resolved = self.resolve(query.branch);
        compute_rollup(&resolved.sectors, document, self.config.missing_member)
    }

    /// Sectoral or subsectoral results for one month, consolidated across the
    /// selected branches by segment name.
    pub async fn analyze_period(
        &self,
        month: u32,
        year: i32,
        branch: BranchSelector,
        kind: AnalysisType,
    ) -> Result<PeriodReport> {
        if kind == AnalysisType::Annual {
            return Err(MarginError::InvalidArgument(
                "Annual analysis is built with build_monthly_series".to_string(),
            ));
        }
        validate_year(year)?;

        let queries = build_queries(month, year, branch, &self.config.branches)?;
        info!(
            "Analyzing {:?} for {:02}/{} ({}, {} requests)",
            kind,
            month,
            year,
            branch,
            queries.len()
        );

        let batch = self.fetch_all(queries).await?;

        let mut per_branch = Vec::with_capacity(batch.documents.len());
        for (query, document) in &batch.documents {
            let results = match kind {
                AnalysisType::Subsectoral => compute(&self.resolve(query.branch).subsectors, document)?,
                _ => self.sector_results(query, document)?,
            };
            per_branch.push(results);
        }

        Ok(PeriodReport {
            kind,
            month,
            year,
            branch,
            segments: merge_by_name(&per_branch, self.config.margin_aggregation)?,
            failures: batch.failures,
        })
    }

    /// Sector results for every month of `months`, chronologically ordered.
    pub async fn build_monthly_series(
        &self,
        year: i32,
        branch: BranchSelector,
        months: MonthRange,
    ) -> Result<MonthlySeries> {
        validate_year(year)?;

        let queries = build_range_queries(year, months, branch, &self.config.branches)?;
        info!(
            "Building monthly series for {} months {}:{} ({}, {} requests)",
            year,
            months.start,
            months.end,
            branch,
            queries.len()
        );

        let batch = self.fetch_all(queries).await?;

        let mut by_month: BTreeMap<u32, Vec<Vec<SegmentResult>>> = BTreeMap::new();
        for (query, document) in &batch.documents {
            by_month
                .entry(query.month)
                .or_default()
                .push(self.sector_results(query, document)?);
        }

        let per_month = by_month
            .into_iter()
            .map(|(month, per_branch)| {
                merge_by_name(&per_branch, self.config.margin_aggregation).map(|sectors| (month, sectors))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut series = MonthlySeries::assemble(
            year,
            branch,
            per_month,
            self.config.series.mode,
            self.config.margin_aggregation,
        )?;
        series.failures = batch.failures;
        Ok(series)
    }

    pub async fn analyze(&self, selection: AnalysisSelection) -> Result<AnalysisReport> {
        selection.validate()?;
        match selection.kind {
            AnalysisType::Annual => Ok(AnalysisReport::Series(
                self.build_monthly_series(selection.year, selection.branch, self.config.series.months)
                    .await?,
            )),
            kind => Ok(AnalysisReport::Period(
                self.analyze_period(selection.month, selection.year, selection.branch, kind)
                    .await?,
            )),
        }
    }

    /// Runs an analysis under a fresh ticket. Returns `Ok(None)` when another run
    /// started before this one finished.
    pub async fn analyze_latest(&self, selection: AnalysisSelection) -> Result<Option<AnalysisReport>> {
        let ticket = self.generation.begin();
        let outcome = self.analyze(selection).await;

        if !ticket.is_current() {
            debug!("Discarding results of superseded analysis run {}", ticket.id());
            return Ok(None);
        }
        outcome.map(Some)
    }
}
