use dotenv::dotenv;
use ledger_margin_engine::*;
use std::env;

/// Usage: margin_report [sectoral|subsectoral|annual] [month] [year] [branch]
///
/// Branch 0 selects the consolidated view. Credentials come from
/// `DEALERNET_USER` / `DEALERNET_PASSWORD`; `MARGIN_CONFIG` may point at a JSON
/// dashboard configuration.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let kind = match args.first().map(String::as_str).unwrap_or("sectoral") {
        "subsectoral" => AnalysisType::Subsectoral,
        "annual" => AnalysisType::Annual,
        _ => AnalysisType::Sectoral,
    };
    let month: u32 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(1);
    let year: i32 = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(2024);
    let branch: u32 = args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(0);

    let mut config = match env::var("MARGIN_CONFIG") {
        Ok(path) => DashboardConfig::from_json_file(path)?,
        Err(_) => DashboardConfig::default(),
    };
    config.gateway.apply_env()?;

    println!("📊 Dealernet margin report");
    println!("   Endpoint: {}", config.gateway.endpoint);
    println!("   Branches: {:?}\n", config.branches);

    let gateway = DealernetGateway::new(config.gateway.clone())?;
    let analyzer = MarginAnalyzer::new(gateway, config)?;

    let report = analyzer
        .analyze(AnalysisSelection {
            month,
            year,
            branch: BranchSelector::from_code(branch),
            kind,
        })
        .await?;

    println!("{}", report.to_markdown());

    if report.is_partial() {
        println!("⚠️  {} request(s) failed; totals are incomplete", report.failures().len());
    }

    Ok(())
}
