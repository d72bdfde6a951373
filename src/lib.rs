//! # Ledger Margin Engine
//!
//! Extracts ledger account balances from the Dealernet `CONSULTASALDOCONTABIL`
//! export and turns them into per-segment results and gross margins for a
//! month, a branch (or all branches), or a range of months.
//!
//! ## Core Concepts
//!
//! - **Balance Document**: one month's export for one branch, keyed by account path.
//!   The period movement of an account is `SaldoFinal - SaldoInicial`, rounded to cents.
//! - **Segment**: a named business unit defined by a revenue account and a cost account.
//! - **Net Result**: `(-revenue - cost) / 1000`, in thousands of currency units.
//! - **Gross Margin**: net result as a percentage of revenue (0 when revenue is 0).
//! - **Roll-up**: subsectors summed into sectors (Vendas / Pós-Vendas) before the
//!   ratios are taken.
//!
//! Segments whose accounts are absent from an export are left out of the results,
//! never reported as zero.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ledger_margin_engine::*;
//!
//! let config = DashboardConfig {
//!     gateway: GatewayConfig::from_env()?,
//!     ..DashboardConfig::default()
//! };
//! let gateway = DealernetGateway::new(config.gateway.clone())?;
//! let analyzer = MarginAnalyzer::new(gateway, config)?;
//!
//! let report = analyzer
//!     .analyze(AnalysisSelection {
//!         month: 11,
//!         year: 2024,
//!         branch: BranchSelector::All,
//!         kind: AnalysisType::Sectoral,
//!     })
//!     .await?;
//!
//! println!("{}", report.to_markdown());
//! ```

pub mod analysis;
pub mod document;
pub mod error;
pub mod margin;
pub mod report;
pub mod request;
pub mod schema;
pub mod series;
pub mod source;
pub mod utils;

#[cfg(feature = "gateway")]
pub mod gateway;

pub use analysis::{
    AnalysisGeneration, AnalysisSelection, AnalysisTicket, AnalysisType, FetchBatch,
    MarginAnalyzer,
};
pub use document::{extract_payload, parse_envelope, AccountBalance, BalanceDocument};
pub use error::{MarginError, Result};
pub use margin::{compute, compute_rollup, merge_by_name, SegmentResult};
pub use report::{month_name, AnalysisReport, PeriodReport};
pub use request::{build_queries, build_query, build_range_queries, BranchSelector, QueryRequest};
pub use schema::*;
pub use series::{FetchFailure, MonthlyPoint, MonthlySeries, SegmentTrack};
pub use source::{fetch_with_timeout, BalanceSource, RecordedBalanceSource};
pub use utils::*;

#[cfg(feature = "gateway")]
pub use gateway::DealernetGateway;

use log::debug;

/// Results for a single, already fetched document, using the branch's view of
/// the segment table.
pub fn analyze_document(
    document: &BalanceDocument,
    config: &DashboardConfig,
    branch: u32,
    kind: AnalysisType,
) -> Result<Vec<SegmentResult>> {
    let resolved = config.segments.resolve(branch);
    debug!(
        "Analyzing document of {} accounts for branch {} as {:?}",
        document.len(),
        branch,
        kind
    );

    match kind {
        AnalysisType::Subsectoral => compute(&resolved.subsectors, document),
        AnalysisType::Sectoral => compute_rollup(&resolved.sectors, document, config.missing_member),
        AnalysisType::Annual => Err(MarginError::InvalidArgument(
            "A single document covers one month; use MarginAnalyzer::build_monthly_series".to_string(),
        )),
    }
}
