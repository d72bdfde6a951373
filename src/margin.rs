use crate::document::BalanceDocument;
use crate::error::{MarginError, Result};
use crate::schema::{MarginAggregation, MissingMemberPolicy, SegmentDefinition, SegmentGroup};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const THOUSAND: Decimal = Decimal::ONE_THOUSAND;
const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Result and gross margin of one segment for one period.
///
/// `revenue` and `cost` are the raw account deltas (revenue is normally negative,
/// being a credit balance). `net_result` is in thousands of currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResult {
    pub name: String,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub net_result: Decimal,
    pub gross_margin_pct: Decimal,
}

impl SegmentResult {
    /// Fails with `MarginError::Overflow` when an intermediate value leaves the
    /// `Decimal` range.
    pub fn from_deltas(name: impl Into<String>, revenue: Decimal, cost: Decimal) -> Result<Self> {
        let name = name.into();
        let overflow = || MarginError::Overflow(format!("segment '{}'", name));

        let unscaled = (-revenue).checked_sub(cost).ok_or_else(overflow)?;
        let gross_margin_pct = if revenue.is_zero() {
            Decimal::ZERO
        } else {
            (-unscaled)
                .checked_div(revenue)
                .and_then(|ratio| ratio.checked_mul(HUNDRED))
                .ok_or_else(overflow)?
        };
        let net_result = unscaled.checked_div(THOUSAND).ok_or_else(overflow)?;

        Ok(Self {
            name,
            revenue,
            cost,
            net_result,
            gross_margin_pct,
        })
    }

    /// Combines two results for the same segment.
    pub fn combine(&self, other: &SegmentResult, aggregation: MarginAggregation) -> Result<SegmentResult> {
        let add = |a: Decimal, b: Decimal| {
            a.checked_add(b)
                .ok_or_else(|| MarginError::Overflow(format!("segment '{}'", self.name)))
        };

        let revenue = add(self.revenue, other.revenue)?;
        let cost = add(self.cost, other.cost)?;
        match aggregation {
            MarginAggregation::Recompute => Self::from_deltas(self.name.clone(), revenue, cost),
            MarginAggregation::Sum => Ok(SegmentResult {
                name: self.name.clone(),
                revenue,
                cost,
                net_result: add(self.net_result, other.net_result)?,
                gross_margin_pct: add(self.gross_margin_pct, other.gross_margin_pct)?,
            }),
        }
    }
}

/// Computes every segment whose revenue and cost accounts are both present.
/// Segments with an absent account are left out of the output.
pub fn compute(segments: &[SegmentDefinition], doc: &BalanceDocument) -> Result<Vec<SegmentResult>> {
    let mut results = Vec::with_capacity(segments.len());

    for segment in segments {
        match (
            doc.lookup(&segment.revenue_account),
            doc.lookup(&segment.cost_account),
        ) {
            (Some(revenue), Some(cost)) => {
                results.push(SegmentResult::from_deltas(segment.name.clone(), revenue, cost)?)
            }
            _ => debug!(
                "Skipping segment '{}': account without activity in this period",
                segment.name
            ),
        }
    }

    Ok(results)
}

/// Sums revenue and cost across each group's members, then computes one result per group.
pub fn compute_rollup(
    groups: &[SegmentGroup],
    doc: &BalanceDocument,
    policy: MissingMemberPolicy,
) -> Result<Vec<SegmentResult>> {
    let mut results = Vec::with_capacity(groups.len());

    'groups: for group in groups {
        let mut revenue = Decimal::ZERO;
        let mut cost = Decimal::ZERO;

        for member in &group.members {
            let (member_revenue, member_cost) = match (
                doc.lookup(&member.revenue_account),
                doc.lookup(&member.cost_account),
            ) {
                (Some(r), Some(c)) => (r, c),
                (r, _) => {
                    let account = if r.is_none() {
                        &member.revenue_account
                    } else {
                        &member.cost_account
                    };
                    match policy {
                        MissingMemberPolicy::Fail => {
                            return Err(MarginError::Aggregation {
                                group: group.name.clone(),
                                account: account.clone(),
                            })
                        }
                        MissingMemberPolicy::SkipGroup => {
                            warn!(
                                "Skipping sector '{}': account {} absent",
                                group.name, account
                            );
                            continue 'groups;
                        }
                    }
                }
            };

            let overflow = || MarginError::Overflow(format!("sector '{}'", group.name));
            revenue = revenue.checked_add(member_revenue).ok_or_else(overflow)?;
            cost = cost.checked_add(member_cost).ok_or_else(overflow)?;
        }

        results.push(SegmentResult::from_deltas(group.name.clone(), revenue, cost)?);
    }

    Ok(results)
}

/// Merges per-branch result lists by segment name.
///
/// Output order follows first appearance across the inputs. A segment present in
/// only some branches is carried with the branches that have it. With
/// `MarginAggregation::Sum` every field, the margin included, is added as-is,
/// which is how the legacy dashboards consolidate; `Recompute` derives the margin
/// from the summed revenue and cost instead.
pub fn merge_by_name(
    per_branch: &[Vec<SegmentResult>],
    aggregation: MarginAggregation,
) -> Result<Vec<SegmentResult>> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: BTreeMap<String, SegmentResult> = BTreeMap::new();

    for results in per_branch {
        for result in results {
            match merged.get_mut(&result.name) {
                Some(existing) => *existing = existing.combine(result, aggregation)?,
                None => {
                    order.push(result.name.clone());
                    merged.insert(result.name.clone(), result.clone());
                }
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|name| merged.remove(&name))
        .collect())
}
