use crate::error::{MarginError, Result};
use crate::utils::MonthRange;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://gaivota.dealernetworkflow.com.br/aws_dealernetgateway.aspx";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Sector names used by the default roll-up.
pub const SECTOR_VENDAS: &str = "Vendas";
pub const SECTOR_POS_VENDAS: &str = "Pós-Vendas";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentDefinition {
    #[schemars(description = "Display name of the business segment (e.g. 'VN Passageiros')")]
    pub name: String,

    #[schemars(
        description = "Ledger account path carrying the segment revenue (e.g. '3.1.1.001.000001'). Revenue accounts have credit balances, so their period delta is negative."
    )]
    pub revenue_account: String,

    #[schemars(
        description = "Ledger account path carrying the segment cost of sales (e.g. '3.3.1.001.000001')."
    )]
    pub cost_account: String,
}

impl SegmentDefinition {
    pub fn new(
        name: impl Into<String>,
        revenue_account: impl Into<String>,
        cost_account: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            revenue_account: revenue_account.into(),
            cost_account: cost_account.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SectorGroup {
    #[schemars(description = "Sector name shown in the sectoral analysis (e.g. 'Vendas')")]
    pub name: String,

    #[schemars(description = "Names of the subsectors whose balances are summed into this sector")]
    pub members: Vec<String>,
}

/// Per-branch exception to the shared subsector table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct BranchOverride {
    #[schemars(description = "Company code (Empresa_codigo) the override applies to")]
    pub branch: u32,

    #[serde(default)]
    #[schemars(description = "Subsectors this branch does not operate. They are removed from both analyses.")]
    pub excluded_subsectors: Vec<String>,

    #[serde(default)]
    #[schemars(
        description = "Subsectors whose accounts differ for this branch. Matched by name against the shared table."
    )]
    pub replacements: Vec<SegmentDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SegmentTable {
    #[schemars(description = "Subsector definitions, in display order")]
    pub subsectors: Vec<SegmentDefinition>,

    #[schemars(description = "Roll-up of subsectors into sectors, in display order")]
    pub sectors: Vec<SectorGroup>,

    #[serde(default)]
    #[schemars(description = "Branch-specific exceptions to the subsector table")]
    pub branch_overrides: Vec<BranchOverride>,
}

/// A roll-up group with its member definitions resolved for one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentGroup {
    pub name: String,
    pub members: Vec<SegmentDefinition>,
}

/// The segment table as seen by a single branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSegments {
    pub branch: u32,
    pub subsectors: Vec<SegmentDefinition>,
    pub sectors: Vec<SegmentGroup>,
}

impl SegmentTable {
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        for segment in &self.subsectors {
            if !names.insert(segment.name.as_str()) {
                return Err(MarginError::InvalidArgument(format!(
                    "Subsector '{}' is defined more than once",
                    segment.name
                )));
            }
        }

        let mut sector_names = BTreeSet::new();
        for sector in &self.sectors {
            if !sector_names.insert(sector.name.as_str()) {
                return Err(MarginError::InvalidArgument(format!(
                    "Sector '{}' is defined more than once",
                    sector.name
                )));
            }
            if sector.members.is_empty() {
                return Err(MarginError::InvalidArgument(format!(
                    "Sector '{}' has no members",
                    sector.name
                )));
            }
            for member in &sector.members {
                if !names.contains(member.as_str()) {
                    return Err(MarginError::InvalidArgument(format!(
                        "Sector '{}' references unknown subsector '{}'",
                        sector.name, member
                    )));
                }
            }
        }

        for branch_override in &self.branch_overrides {
            let overridden = branch_override
                .excluded_subsectors
                .iter()
                .chain(branch_override.replacements.iter().map(|r| &r.name));
            for name in overridden {
                if !names.contains(name.as_str()) {
                    return Err(MarginError::InvalidArgument(format!(
                        "Override for branch {} references unknown subsector '{}'",
                        branch_override.branch, name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn override_for(&self, branch: u32) -> Option<&BranchOverride> {
        self.branch_overrides.iter().find(|o| o.branch == branch)
    }

    /// Applies the branch override (if any) and resolves sector members to definitions.
    /// Sectors left without members after exclusions are dropped.
    pub fn resolve(&self, branch: u32) -> ResolvedSegments {
        let branch_override = self.override_for(branch);

        let subsectors: Vec<SegmentDefinition> = self
            .subsectors
            .iter()
            .filter(|s| {
                branch_override
                    .map(|o| !o.excluded_subsectors.contains(&s.name))
                    .unwrap_or(true)
            })
            .map(|s| {
                branch_override
                    .and_then(|o| o.replacements.iter().find(|r| r.name == s.name))
                    .unwrap_or(s)
                    .clone()
            })
            .collect();

        let sectors = self
            .sectors
            .iter()
            .filter_map(|sector| {
                let members: Vec<SegmentDefinition> = sector
                    .members
                    .iter()
                    .filter_map(|m| subsectors.iter().find(|s| &s.name == m).cloned())
                    .collect();
                if members.is_empty() {
                    None
                } else {
                    Some(SegmentGroup {
                        name: sector.name.clone(),
                        members,
                    })
                }
            })
            .collect();

        ResolvedSegments {
            branch,
            subsectors,
            sectors,
        }
    }
}

impl Default for SegmentTable {
    /// The Dealernet chart of the two dealerships served by the margin dashboards.
    fn default() -> Self {
        let subsectors = vec![
            SegmentDefinition::new("VN Passageiros", "3.1.1.001.000001", "3.3.1.001.000001"),
            SegmentDefinition::new("VN Comerciais Leves", "3.1.1.001.000002", "3.3.1.001.000002"),
            SegmentDefinition::new("Seminovos", "3.1.1.002.000001", "3.3.1.002.000001"),
            SegmentDefinition::new("Peças Atacado", "3.1.1.003.000001", "3.3.1.003.000001"),
            SegmentDefinition::new("Peças Varejo", "3.1.1.003.000002", "3.3.1.003.000002"),
            SegmentDefinition::new("Peças Mecânica", "3.1.1.003.000003", "3.3.1.003.000003"),
            SegmentDefinition::new(
                "Peças Funilaria e Pintura",
                "3.1.1.003.000004",
                "3.3.1.003.000004",
            ),
            SegmentDefinition::new("Peças Garantia", "3.1.1.003.000005", "3.3.1.003.000005"),
            SegmentDefinition::new("Peças Interna", "3.1.1.003.000006", "3.3.1.003.000006"),
            SegmentDefinition::new("Acessórios", "3.1.1.003.000007", "3.3.1.003.000007"),
            SegmentDefinition::new(
                "Combustíveis e Lubrificantes",
                "3.1.1.003.000008",
                "3.3.1.003.000008",
            ),
            SegmentDefinition::new("Pneus e Câmaras", "3.1.1.003.000009", "3.3.1.003.000009"),
        ];

        let names: Vec<String> = subsectors.iter().map(|s| s.name.clone()).collect();
        let sectors = vec![
            SectorGroup {
                name: SECTOR_VENDAS.to_string(),
                members: names[..3].to_vec(),
            },
            SectorGroup {
                name: SECTOR_POS_VENDAS.to_string(),
                members: names[3..].to_vec(),
            },
        ];

        Self {
            subsectors,
            sectors,
            branch_overrides: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    #[schemars(description = "URL of the Dealernet gateway (aws_dealernetgateway.aspx)")]
    pub endpoint: String,

    #[schemars(description = "Operator identifier sent as Usuario_identificador")]
    pub username: String,

    #[schemars(description = "Operator password sent as Usuariosenha_senha")]
    pub password: String,

    #[serde(default = "default_timeout_secs")]
    #[schemars(description = "Upper bound for a single balance request, in seconds")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl GatewayConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            username: username.into(),
            password: password.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Reads `DEALERNET_USER` and `DEALERNET_PASSWORD` (required) plus
    /// `DEALERNET_ENDPOINT` and `DEALERNET_TIMEOUT_SECS` (optional).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlays the environment onto this configuration. Credentials are always
    /// taken from the environment; endpoint and timeout only when their
    /// variables are set, so values loaded from a config file survive.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let required = |key: &str| {
            var(key).ok_or_else(|| {
                MarginError::InvalidArgument(format!("Environment variable {} is not set", key))
            })
        };

        self.username = required("DEALERNET_USER")?;
        self.password = required("DEALERNET_PASSWORD")?;

        if let Some(endpoint) = var("DEALERNET_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(raw) = var("DEALERNET_TIMEOUT_SECS") {
            self.timeout_secs = raw.trim().parse().map_err(|_| {
                MarginError::InvalidArgument(format!(
                    "DEALERNET_TIMEOUT_SECS must be a whole number of seconds, got '{}'",
                    raw
                ))
            })?;
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(String::new(), String::new())
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    #[schemars(description = "Any failed branch or month aborts the whole analysis")]
    FailFast,

    #[schemars(
        description = "Failed branches or months are reported alongside the results computed from the rest"
    )]
    Partial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingMemberPolicy {
    #[default]
    #[schemars(description = "A sector whose member account is absent fails the analysis")]
    Fail,

    #[schemars(description = "A sector whose member account is absent is left out of the results")]
    SkipGroup,
}

/// How results for the same segment are merged across branches and, in
/// cumulative series, across months. `Sum` adds every field as the legacy
/// consolidated dashboards did, so two branches at 20% report 40%.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarginAggregation {
    #[default]
    #[schemars(description = "Sum revenue and cost, then recompute result and margin")]
    Recompute,

    #[schemars(description = "Sum every field, including the margin percentage")]
    Sum,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeriesMode {
    #[default]
    #[schemars(description = "Each point holds the figures of its own month")]
    PerMonth,

    #[schemars(description = "Each point holds the running total from the first month of the range")]
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub struct SeriesConfig {
    #[serde(default)]
    pub months: MonthRange,

    #[serde(default)]
    pub mode: SeriesMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DashboardConfig {
    pub gateway: GatewayConfig,

    #[serde(default = "default_branches")]
    #[schemars(description = "Company codes queried by the consolidated view")]
    pub branches: Vec<u32>,

    #[serde(default)]
    pub segments: SegmentTable,

    #[serde(default = "default_max_concurrency")]
    #[schemars(description = "Maximum number of balance requests in flight at once")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub missing_member: MissingMemberPolicy,

    #[serde(default)]
    pub margin_aggregation: MarginAggregation,

    #[serde(default)]
    pub series: SeriesConfig,
}

fn default_branches() -> Vec<u32> {
    vec![1, 3]
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            branches: default_branches(),
            segments: SegmentTable::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            failure_policy: FailurePolicy::default(),
            missing_member: MissingMemberPolicy::default(),
            margin_aggregation: MarginAggregation::default(),
            series: SeriesConfig::default(),
        }
    }
}

impl DashboardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(MarginError::InvalidArgument(
                "At least one branch must be configured".to_string(),
            ));
        }
        if self.branches.contains(&0) {
            return Err(MarginError::InvalidArgument(
                "Branch code 0 is reserved for the consolidated view".to_string(),
            ));
        }
        let unique: BTreeSet<u32> = self.branches.iter().copied().collect();
        if unique.len() != self.branches.len() {
            return Err(MarginError::InvalidArgument(
                "Branch codes must be unique".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(MarginError::InvalidArgument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.gateway.timeout_secs == 0 {
            return Err(MarginError::InvalidArgument(
                "gateway.timeout_secs must be at least 1".to_string(),
            ));
        }
        self.series.months.validate()?;
        self.segments.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(DashboardConfig)
    }

    pub fn schema_as_json() -> Result<String> {
        let schema = Self::generate_json_schema();
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}
