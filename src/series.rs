use crate::error::Result;
use crate::margin::{merge_by_name, SegmentResult};
use crate::request::BranchSelector;
use crate::schema::{MarginAggregation, SeriesMode};
use serde::{Deserialize, Serialize};

/// A failed inquiry that was tolerated under the partial failure policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub month: u32,
    pub year: i32,
    pub branch: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyPoint {
    pub month: u32,
    pub sectors: Vec<SegmentResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlySeries {
    pub year: i32,
    pub branch: BranchSelector,
    pub mode: SeriesMode,
    pub points: Vec<MonthlyPoint>,
    #[serde(default)]
    pub failures: Vec<FetchFailure>,
}

/// One segment's values across the series, aligned with `months`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentTrack {
    pub name: String,
    pub months: Vec<u32>,
    pub net_results: Vec<rust_decimal::Decimal>,
    pub gross_margins: Vec<rust_decimal::Decimal>,
}

impl MonthlySeries {
    /// Orders per-month sector results chronologically and, in cumulative mode,
    /// replaces each point with the running total since the first month.
    pub fn assemble(
        year: i32,
        branch: BranchSelector,
        mut per_month: Vec<(u32, Vec<SegmentResult>)>,
        mode: SeriesMode,
        aggregation: MarginAggregation,
    ) -> Result<Self> {
        per_month.sort_by_key(|(month, _)| *month);

        let points = match mode {
            SeriesMode::PerMonth => per_month
                .into_iter()
                .map(|(month, sectors)| MonthlyPoint { month, sectors })
                .collect(),
            SeriesMode::Cumulative => {
                let mut running: Vec<SegmentResult> = Vec::new();
                let mut points = Vec::with_capacity(per_month.len());
                for (month, sectors) in per_month {
                    running = merge_by_name(&[running, sectors], aggregation)?;
                    points.push(MonthlyPoint {
                        month,
                        sectors: running.clone(),
                    });
                }
                points
            }
        };

        Ok(Self {
            year,
            branch,
            mode,
            points,
            failures: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn months(&self) -> Vec<u32> {
        self.points.iter().map(|p| p.month).collect()
    }

    /// Sector names in order of first appearance.
    pub fn segment_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for point in &self.points {
            for sector in &point.sectors {
                if !names.contains(&sector.name) {
                    names.push(sector.name.clone());
                }
            }
        }
        names
    }

    /// Values of one sector for every month in which it is present.
    pub fn track(&self, name: &str) -> SegmentTrack {
        let mut track = SegmentTrack {
            name: name.to_string(),
            months: Vec::new(),
            net_results: Vec::new(),
            gross_margins: Vec::new(),
        };

        for point in &self.points {
            if let Some(result) = point.sectors.iter().find(|s| s.name == name) {
                track.months.push(point.month);
                track.net_results.push(result.net_result);
                track.gross_margins.push(result.gross_margin_pct);
            }
        }

        track
    }
}
