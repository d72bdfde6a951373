use async_trait::async_trait;
use ledger_margin_engine::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn render_export(balances: &[AccountBalance]) -> String {
    let mut xml = String::from("<SDT_SaldoContabil xmlns=\"DealerNet\">");
    for balance in balances {
        xml.push_str(&format!(
            "<SDT_SaldoContabilItem><ContaIDNivel>{}</ContaIDNivel>\
             <SaldoInicial>{}</SaldoInicial><SaldoFinal>{}</SaldoFinal></SDT_SaldoContabilItem>",
            balance.account_id, balance.opening_balance, balance.closing_balance
        ));
    }
    xml.push_str("</SDT_SaldoContabil>");
    xml
}

fn render_envelope(balances: &[AccountBalance]) -> String {
    let escaped = render_export(balances)
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        "<SOAP-ENV:Envelope xmlns:SOAP-ENV=\"http://schemas.xmlsoap.org/soap/envelope/\">\
         <SOAP-ENV:Body><WS_DealernetGateway.CONSULTASALDOCONTABILResponse xmlns=\"DealerNet\">\
         <Xml_retorno>{}</Xml_retorno>\
         </WS_DealernetGateway.CONSULTASALDOCONTABILResponse></SOAP-ENV:Body></SOAP-ENV:Envelope>",
        escaped
    )
}

/// Revenue of subsector `index` for a branch and month; cost is always 80% of it.
fn revenue_for(branch: u32, month: u32, index: usize) -> Decimal {
    Decimal::from(-(1000 * branch as i64 + 100 * month as i64 + 10 * index as i64))
}

fn synthetic_balances(branch: u32, month: u32, skip: &[&str]) -> Vec<AccountBalance> {
    SegmentTable::default()
        .subsectors
        .iter()
        .enumerate()
        .flat_map(|(index, segment)| {
            let revenue = revenue_for(branch, month, index);
            vec![
                AccountBalance::new(segment.revenue_account.clone(), dec!(500), dec!(500) + revenue),
                AccountBalance::new(segment.cost_account.clone(), dec!(-20), dec!(-20) - revenue * dec!(0.8)),
            ]
        })
        .filter(|b| !skip.contains(&b.account_id.as_str()))
        .collect()
}

#[derive(Default)]
struct MockGateway {
    failing: HashSet<(u32, u32)>,
    malformed: HashSet<(u32, u32)>,
    missing_accounts: Vec<&'static str>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<(u32, u32)>>,
}

impl MockGateway {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl BalanceSource for MockGateway {
    async fn fetch_balance(&self, query: &QueryRequest) -> Result<BalanceDocument> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push((query.month, query.branch));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let key = (query.month, query.branch);
        if self.failing.contains(&key) {
            return Err(MarginError::HttpStatus {
                status: 500,
                body: "Internal Server Error".to_string(),
            });
        }
        if self.malformed.contains(&key) {
            return parse_envelope(render_envelope(&[]).as_bytes());
        }

        let balances = synthetic_balances(query.branch, query.month, &self.missing_accounts);
        parse_envelope(render_envelope(&balances).as_bytes())
    }
}

fn config_with_branches(branches: Vec<u32>) -> DashboardConfig {
    DashboardConfig {
        gateway: GatewayConfig::new("operator", "secret"),
        branches,
        ..DashboardConfig::default()
    }
}

fn selection(kind: AnalysisType, branch: BranchSelector) -> AnalysisSelection {
    AnalysisSelection {
        month: 11,
        year: 2024,
        branch,
        kind,
    }
}

#[tokio::test]
async fn test_annual_series_has_twelve_chronological_points() {
    let analyzer = MarginAnalyzer::new(MockGateway::new(), config_with_branches(vec![1])).unwrap();

    let series = analyzer
        .build_monthly_series(2024, BranchSelector::Single(1), MonthRange::full_year())
        .await
        .unwrap();

    assert_eq!(series.len(), 12);
    assert_eq!(series.months(), (1..=12).collect::<Vec<u32>>());
    for point in &series.points {
        let names: Vec<&str> = point.sectors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![SECTOR_VENDAS, SECTOR_POS_VENDAS]);
        assert!(point
            .sectors
            .iter()
            .all(|s| s.gross_margin_pct == dec!(20)));
    }

    // Vendas in January: revenues of subsectors 0..3 for branch 1, month 1.
    let expected_revenue: Decimal = (0..3).map(|i| revenue_for(1, 1, i)).sum();
    assert_eq!(series.points[0].sectors[0].revenue, expected_revenue);
    assert_eq!(
        series.points[0].sectors[0].net_result,
        -expected_revenue * dec!(0.2) / dec!(1000)
    );
}

#[tokio::test]
async fn test_partial_month_range_from_configuration() {
    let mut config = config_with_branches(vec![1, 3]);
    config.series.months = parse_month_range("7:12").unwrap();
    let analyzer = MarginAnalyzer::new(MockGateway::new(), config).unwrap();

    let report = analyzer
        .analyze(selection(AnalysisType::Annual, BranchSelector::All))
        .await
        .unwrap();

    match &report {
        AnalysisReport::Series(series) => {
            assert_eq!(series.months(), vec![7, 8, 9, 10, 11, 12]);
            let vendas = series.track(SECTOR_VENDAS);
            assert_eq!(vendas.months.len(), 6);
        }
        other => panic!("expected a series, got {:?}", other),
    }
    assert_eq!(report.title(), "Resultados e Margens Mensais por Setor - 2024");
}

#[tokio::test]
async fn test_cumulative_series_accumulates_results() {
    let mut config = config_with_branches(vec![1]);
    config.series.mode = SeriesMode::Cumulative;
    let analyzer = MarginAnalyzer::new(MockGateway::new(), config).unwrap();

    let series = analyzer
        .build_monthly_series(2024, BranchSelector::Single(1), MonthRange::new(1, 3).unwrap())
        .await
        .unwrap();

    let per_month: Vec<Decimal> = (1..=3)
        .map(|m| (0..3).map(|i| revenue_for(1, m, i)).sum::<Decimal>())
        .collect();
    let running: Decimal = per_month.iter().copied().sum();

    assert_eq!(series.points[2].sectors[0].revenue, running);
    assert_eq!(series.points[2].sectors[0].gross_margin_pct, dec!(20));
}

#[tokio::test]
async fn test_consolidation_is_independent_of_branch_order() {
    let forward = MarginAnalyzer::new(MockGateway::new(), config_with_branches(vec![1, 2, 3])).unwrap();
    let backward = MarginAnalyzer::new(MockGateway::new(), config_with_branches(vec![3, 2, 1])).unwrap();

    for kind in [AnalysisType::Sectoral, AnalysisType::Subsectoral] {
        let a = forward.analyze_period(11, 2024, BranchSelector::All, kind).await.unwrap();
        let b = backward.analyze_period(11, 2024, BranchSelector::All, kind).await.unwrap();

        assert_eq!(a.segments.len(), b.segments.len());
        for segment in &a.segments {
            let other = b.segments.iter().find(|s| s.name == segment.name).unwrap();
            assert_eq!(segment, other);
        }
    }
}

#[tokio::test]
async fn test_consolidated_view_sums_branches() {
    let analyzer = MarginAnalyzer::new(MockGateway::new(), config_with_branches(vec![1, 3])).unwrap();

    let all = analyzer
        .analyze_period(11, 2024, BranchSelector::All, AnalysisType::Subsectoral)
        .await
        .unwrap();
    let one = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Subsectoral)
        .await
        .unwrap();
    let three = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(3), AnalysisType::Subsectoral)
        .await
        .unwrap();

    assert_eq!(all.segments.len(), 12);
    for (index, segment) in all.segments.iter().enumerate() {
        assert_eq!(segment.revenue, one.segments[index].revenue + three.segments[index].revenue);
        assert_eq!(
            segment.net_result,
            one.segments[index].net_result + three.segments[index].net_result
        );
    }
}

#[tokio::test]
async fn test_consolidated_view_with_summed_margins() {
    let mut config = config_with_branches(vec![1, 3]);
    config.margin_aggregation = MarginAggregation::Sum;
    let analyzer = MarginAnalyzer::new(MockGateway::new(), config).unwrap();

    let all = analyzer
        .analyze_period(11, 2024, BranchSelector::All, AnalysisType::Sectoral)
        .await
        .unwrap();
    let one = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Sectoral)
        .await
        .unwrap();
    let three = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(3), AnalysisType::Sectoral)
        .await
        .unwrap();

    assert_eq!(all.segments.len(), 2);
    for (index, sector) in all.segments.iter().enumerate() {
        assert_eq!(sector.revenue, one.segments[index].revenue + three.segments[index].revenue);
        assert_eq!(
            sector.net_result,
            one.segments[index].net_result + three.segments[index].net_result
        );
        // Each branch runs at 20%, and every field is added.
        assert_eq!(sector.gross_margin_pct, dec!(40));
    }
}

#[tokio::test]
async fn test_fail_fast_aborts_consolidation() {
    let mut gateway = MockGateway::new();
    gateway.failing.insert((11, 3));
    let analyzer = MarginAnalyzer::new(gateway, config_with_branches(vec![1, 3])).unwrap();

    let err = analyzer
        .analyze(selection(AnalysisType::Sectoral, BranchSelector::All))
        .await
        .unwrap_err();

    assert!(err.is_fetch_error());
    assert!(matches!(err, MarginError::HttpStatus { status: 500, .. }));
}

#[tokio::test]
async fn test_fail_fast_aborts_series() {
    let mut gateway = MockGateway::new();
    gateway.failing.insert((5, 1));
    let analyzer = MarginAnalyzer::new(gateway, config_with_branches(vec![1])).unwrap();

    let result = analyzer
        .build_monthly_series(2024, BranchSelector::Single(1), MonthRange::full_year())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_partial_policy_reports_failed_branches() {
    let mut gateway = MockGateway::new();
    gateway.failing.insert((11, 3));
    let mut config = config_with_branches(vec![1, 3]);
    config.failure_policy = FailurePolicy::Partial;
    let analyzer = MarginAnalyzer::new(gateway, config).unwrap();

    let report = analyzer
        .analyze(selection(AnalysisType::Sectoral, BranchSelector::All))
        .await
        .unwrap();

    assert!(report.is_partial());
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].branch, 3);

    match report {
        AnalysisReport::Period(period) => {
            let expected: Decimal = (0..3).map(|i| revenue_for(1, 11, i)).sum();
            assert_eq!(period.segments[0].revenue, expected);
        }
        other => panic!("expected a period report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_partial_policy_still_fails_when_nothing_arrives() {
    let mut gateway = MockGateway::new();
    gateway.failing.insert((11, 1));
    let mut config = config_with_branches(vec![1]);
    config.failure_policy = FailurePolicy::Partial;
    let analyzer = MarginAnalyzer::new(gateway, config).unwrap();

    let err = analyzer
        .analyze(selection(AnalysisType::Subsectoral, BranchSelector::All))
        .await
        .unwrap_err();
    assert!(err.is_fetch_error());
}

#[tokio::test]
async fn test_parse_errors_abort_even_under_partial_policy() {
    let mut gateway = MockGateway::new();
    gateway.malformed.insert((11, 3));
    let mut config = config_with_branches(vec![1, 3]);
    config.failure_policy = FailurePolicy::Partial;
    let analyzer = MarginAnalyzer::new(gateway, config).unwrap();

    let err = analyzer
        .analyze(selection(AnalysisType::Sectoral, BranchSelector::All))
        .await
        .unwrap_err();
    assert!(matches!(err, MarginError::Parse(_)));
}

#[tokio::test]
async fn test_absent_account_excludes_subsector_and_fails_rollup() {
    let mut gateway = MockGateway::new();
    gateway.missing_accounts = vec!["3.3.1.003.000009"];
    let analyzer = MarginAnalyzer::new(gateway, config_with_branches(vec![1])).unwrap();

    let subsectors = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Subsectoral)
        .await
        .unwrap();
    assert_eq!(subsectors.segments.len(), 11);
    assert!(subsectors.segments.iter().all(|s| s.name != "Pneus e Câmaras"));

    let err = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Sectoral)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MarginError::Aggregation { ref group, .. } if group == SECTOR_POS_VENDAS
    ));
}

#[tokio::test]
async fn test_skip_group_policy_keeps_complete_sectors() {
    let mut gateway = MockGateway::new();
    gateway.missing_accounts = vec!["3.3.1.003.000009"];
    let mut config = config_with_branches(vec![1]);
    config.missing_member = MissingMemberPolicy::SkipGroup;
    let analyzer = MarginAnalyzer::new(gateway, config).unwrap();

    let report = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Sectoral)
        .await
        .unwrap();
    assert_eq!(report.segments.len(), 1);
    assert_eq!(report.segments[0].name, SECTOR_VENDAS);
}

#[tokio::test]
async fn test_branch_override_applies_per_branch() {
    let mut config = config_with_branches(vec![1, 3]);
    config.segments.branch_overrides.push(BranchOverride {
        branch: 3,
        excluded_subsectors: vec!["Pneus e Câmaras".to_string()],
        replacements: Vec::new(),
    });
    let mut gateway = MockGateway::new();
    gateway.missing_accounts = vec!["3.1.1.003.000009", "3.3.1.003.000009"];
    let analyzer = MarginAnalyzer::new(gateway, config).unwrap();

    // Branch 3 does not sell tyres, so its roll-up does not require those accounts.
    let three = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(3), AnalysisType::Sectoral)
        .await
        .unwrap();
    assert_eq!(three.segments.len(), 2);

    let one = analyzer
        .analyze_period(11, 2024, BranchSelector::Single(1), AnalysisType::Sectoral)
        .await;
    assert!(one.is_err());
}

#[tokio::test]
async fn test_fetches_respect_concurrency_bound() {
    let gateway = Arc::new(MockGateway::with_delay(Duration::from_millis(10)));
    let mut config = config_with_branches(vec![1, 3]);
    config.max_concurrency = 2;
    let analyzer = MarginAnalyzer::new(Arc::clone(&gateway), config).unwrap();

    let series = analyzer
        .build_monthly_series(2024, BranchSelector::All, MonthRange::full_year())
        .await
        .unwrap();

    assert_eq!(series.len(), 12);
    assert_eq!(gateway.calls.lock().unwrap().len(), 24);
    let peak = gateway.max_in_flight.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency was {}", peak);
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_slow_gateway_times_out() {
    let mut config = config_with_branches(vec![1]);
    config.gateway.timeout_secs = 1;
    let analyzer =
        MarginAnalyzer::new(MockGateway::with_delay(Duration::from_secs(10)), config).unwrap();

    let err = analyzer
        .analyze(selection(AnalysisType::Sectoral, BranchSelector::Single(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, MarginError::Timeout(_)));
}

#[tokio::test]
async fn test_superseded_run_is_discarded() {
    let analyzer = MarginAnalyzer::new(
        MockGateway::with_delay(Duration::from_millis(20)),
        config_with_branches(vec![1]),
    )
    .unwrap();

    let stale = analyzer.analyze_latest(selection(AnalysisType::Sectoral, BranchSelector::Single(1)));
    let fresh =
        analyzer.analyze_latest(selection(AnalysisType::Subsectoral, BranchSelector::Single(1)));
    let (stale, fresh) = tokio::join!(stale, fresh);

    assert!(stale.unwrap().is_none());
    match fresh.unwrap() {
        Some(AnalysisReport::Period(report)) => {
            assert_eq!(report.kind, AnalysisType::Subsectoral)
        }
        other => panic!("expected the latest report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recorded_envelopes_replay() {
    let mut source = RecordedBalanceSource::new();
    for branch in [1, 3] {
        source.insert_envelope(2024, 11, branch, render_envelope(&synthetic_balances(branch, 11, &[])));
    }
    let analyzer = MarginAnalyzer::new(source, config_with_branches(vec![1, 3])).unwrap();

    let report = analyzer
        .analyze(selection(AnalysisType::Sectoral, BranchSelector::All))
        .await
        .unwrap();
    assert_eq!(report.title(), "Resultados e Margens Brutas por Setor - 11/2024");
    assert!(!report.is_partial());

    let csv = report.to_csv();
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.contains(SECTOR_POS_VENDAS));
}

#[tokio::test]
async fn test_invalid_selection_is_rejected_before_fetching() {
    let gateway = Arc::new(MockGateway::new());
    let analyzer = MarginAnalyzer::new(Arc::clone(&gateway), config_with_branches(vec![1])).unwrap();

    let err = analyzer
        .analyze(AnalysisSelection {
            month: 13,
            year: 2024,
            branch: BranchSelector::All,
            kind: AnalysisType::Sectoral,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, MarginError::InvalidArgument(_)));
    assert!(gateway.calls.lock().unwrap().is_empty());
}

#[test]
fn test_revenue_round_trip_through_results() {
    let balances = synthetic_balances(2, 6, &[]);
    let document = BalanceDocument::parse(&render_export(&balances)).unwrap();
    let table = SegmentTable::default();

    for result in compute(&table.subsectors, &document).unwrap() {
        let segment = table.subsectors.iter().find(|s| s.name == result.name).unwrap();
        let revenue = document.lookup(&segment.revenue_account).unwrap();
        let recovered = -(result.net_result * dec!(1000)) - result.cost;
        assert!((recovered - revenue).abs() <= dec!(0.01));
    }
}
