use crate::analysis::AnalysisType;
use crate::margin::SegmentResult;
use crate::request::BranchSelector;
use crate::series::{FetchFailure, MonthlySeries};
use serde::{Deserialize, Serialize};

pub const MONTH_NAMES: [&str; 12] = [
    "Janeiro", "Fevereiro", "Março", "Abril", "Maio", "Junho", "Julho", "Agosto", "Setembro",
    "Outubro", "Novembro", "Dezembro",
];

pub fn month_name(month: u32) -> &'static str {
    month
        .checked_sub(1)
        .and_then(|i| MONTH_NAMES.get(i as usize))
        .copied()
        .unwrap_or("?")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodReport {
    pub kind: AnalysisType,
    pub month: u32,
    pub year: i32,
    pub branch: BranchSelector,
    pub segments: Vec<SegmentResult>,
    #[serde(default)]
    pub failures: Vec<FetchFailure>,
}

impl PeriodReport {
    pub fn title(&self) -> String {
        let granularity = match self.kind {
            AnalysisType::Subsectoral => "Subsetor",
            _ => "Setor",
        };
        format!(
            "Resultados e Margens Brutas por {} - {:02}/{}",
            granularity, self.month, self.year
        )
    }
}

/// What the presentation layer receives for one "Analisar" action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum AnalysisReport {
    Period(PeriodReport),
    Series(MonthlySeries),
}

impl AnalysisReport {
    pub fn title(&self) -> String {
        match self {
            Self::Period(report) => report.title(),
            Self::Series(series) => {
                format!("Resultados e Margens Mensais por Setor - {}", series.year)
            }
        }
    }

    pub fn failures(&self) -> &[FetchFailure] {
        match self {
            Self::Period(report) => &report.failures,
            Self::Series(series) => &series.failures,
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failures().is_empty()
    }

    /// Flattened rows of (label, segment result); label is the month name for series.
    fn rows(&self) -> Vec<(Option<u32>, &SegmentResult)> {
        match self {
            Self::Period(report) => report.segments.iter().map(|s| (None, s)).collect(),
            Self::Series(series) => series
                .points
                .iter()
                .flat_map(|p| p.sectors.iter().map(move |s| (Some(p.month), s)))
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        let with_month = matches!(self, Self::Series(_));

        if with_month {
            output.push_str("Month,");
        }
        output.push_str("Segment,Revenue,Cost,Result (thousands),Gross Margin (%)\n");

        for (month, segment) in self.rows() {
            if let Some(month) = month {
                output.push_str(&format!("{},", month_name(month)));
            }
            output.push_str(&format!(
                "{},{:.2},{:.2},{:.2},{:.2}\n",
                segment.name,
                segment.revenue,
                segment.cost,
                segment.net_result,
                segment.gross_margin_pct
            ));
        }

        output
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("# {}\n\n", self.title()));

        match self {
            Self::Period(report) => {
                output.push_str(&format!("**Branch:** {}\n\n", report.branch));
                output.push_str("| Segment | Result (mil R$) | Gross Margin (%) |\n");
                output.push_str("|---|---:|---:|\n");
                for segment in &report.segments {
                    output.push_str(&format!(
                        "| {} | {:.2} | {:.2} |\n",
                        segment.name, segment.net_result, segment.gross_margin_pct
                    ));
                }
            }
            Self::Series(series) => {
                output.push_str(&format!("**Branch:** {}\n\n", series.branch));
                output.push_str("| Month | Sector | Result (mil R$) | Gross Margin (%) |\n");
                output.push_str("|---|---|---:|---:|\n");
                for point in &series.points {
                    for sector in &point.sectors {
                        output.push_str(&format!(
                            "| {} | {} | {:.2} | {:.2} |\n",
                            month_name(point.month),
                            sector.name,
                            sector.net_result,
                            sector.gross_margin_pct
                        ));
                    }
                }
            }
        }

        if self.is_partial() {
            output.push_str("\n## Missing data\n\n");
            for failure in self.failures() {
                output.push_str(&format!(
                    "- {:02}/{} empresa {}: {}\n",
                    failure.month, failure.year, failure.branch, failure.reason
                ));
            }
        }

        output
    }
}
