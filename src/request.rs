use crate::error::{MarginError, Result};
use crate::schema::GatewayConfig;
use crate::utils::{month_bounds, MonthRange};
use chrono::NaiveDate;
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const DEALERNET_NS: &str = "DealerNet";
pub const SOAP_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// Which company codes an analysis covers. Code `0` means every configured branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSelector {
    All,
    Single(u32),
}

impl BranchSelector {
    pub fn from_code(code: u32) -> Self {
        if code == 0 {
            Self::All
        } else {
            Self::Single(code)
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::All => 0,
            Self::Single(code) => *code,
        }
    }

    /// Branch codes to query, in configuration order.
    pub fn branches(&self, known: &[u32]) -> Vec<u32> {
        match self {
            Self::All => known.to_vec(),
            Self::Single(code) => vec![*code],
        }
    }
}

impl fmt::Display for BranchSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "consolidado"),
            Self::Single(code) => write!(f, "empresa {}", code),
        }
    }
}

/// One balance inquiry: a single branch over exactly one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryRequest {
    pub month: u32,
    pub year: i32,
    pub branch: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl QueryRequest {
    /// Renders the `CONSULTASALDOCONTABIL` request envelope.
    pub fn to_soap_envelope(&self, gateway: &GatewayConfig) -> String {
        format!(
            r#"<soapenv:Envelope xmlns:soapenv="{soap_ns}" xmlns:deal="{deal_ns}">
<soapenv:Header/>
<soapenv:Body>
    <deal:WS_DealernetGateway.CONSULTASALDOCONTABIL>
        <deal:Usuario_identificador>{user}</deal:Usuario_identificador>
        <deal:Usuariosenha_senha>{password}</deal:Usuariosenha_senha>
        <deal:Empresa_codigo>{branch}</deal:Empresa_codigo>
        <deal:Dtini>{start}</deal:Dtini>
        <deal:Dtfin>{end}</deal:Dtfin>
    </deal:WS_DealernetGateway.CONSULTASALDOCONTABIL>
</soapenv:Body>
</soapenv:Envelope>"#,
            soap_ns = SOAP_ENV_NS,
            deal_ns = DEALERNET_NS,
            user = escape(gateway.username.as_str()),
            password = escape(gateway.password.as_str()),
            branch = self.branch,
            start = self.start_date.format("%Y-%m-%d"),
            end = self.end_date.format("%Y-%m-%d"),
        )
    }

    /// Short label used in logs and failure reports, e.g. `2024-11 empresa 3`.
    pub fn label(&self) -> String {
        format!("{:04}-{:02} empresa {}", self.year, self.month, self.branch)
    }
}

pub fn build_query(month: u32, year: i32, branch: u32) -> Result<QueryRequest> {
    if branch == 0 {
        return Err(MarginError::InvalidArgument(
            "A single query needs a concrete branch; use build_queries for the consolidated view"
                .to_string(),
        ));
    }
    let (start_date, end_date) = month_bounds(month, year)?;
    Ok(QueryRequest {
        month,
        year,
        branch,
        start_date,
        end_date,
    })
}

/// One query per selected branch for a single month.
pub fn build_queries(
    month: u32,
    year: i32,
    selector: BranchSelector,
    known_branches: &[u32],
) -> Result<Vec<QueryRequest>> {
    let branches = selector.branches(known_branches);
    if branches.is_empty() {
        return Err(MarginError::InvalidArgument(
            "No branches configured for the consolidated view".to_string(),
        ));
    }
    branches
        .into_iter()
        .map(|branch| build_query(month, year, branch))
        .collect()
}

/// One query per (month, branch) pair, months outermost.
pub fn build_range_queries(
    year: i32,
    months: MonthRange,
    selector: BranchSelector,
    known_branches: &[u32],
) -> Result<Vec<QueryRequest>> {
    months.validate()?;
    let mut queries = Vec::with_capacity(months.len() * known_branches.len().max(1));
    for month in months.months() {
        queries.extend(build_queries(month, year, selector, known_branches)?);
    }
    Ok(queries)
}
