use axum::{
    Router,
    extract::{Json, Query},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::core::{
    Averaging, CashFlowBasis, DensityGrid, DiscountRate, DistributionSummary, ForwardOutcome,
    ForwardRun, HistogramBin, HistoricalCashFlows, ImpliedBasis, ImpliedOutcome, ImpliedRun,
    SensitivityReport, SimulationSummary, Step, TriangularParams, ValuationError,
    ValuationInputs, ValuationMode, YearCashFlow, run_forward, run_implied, sensitivity_report,
};

/// Largest trial count accepted from the CLI or an HTTP payload.
const MAX_TRIALS: usize = 10_000_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliMode {
    Historical,
    Forecast,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliAveraging {
    Simple,
    Weighted,
}

impl From<CliAveraging> for Averaging {
    fn from(value: CliAveraging) -> Self {
        match value {
            CliAveraging::Simple => Averaging::Simple,
            CliAveraging::Weighted => Averaging::RecencyWeighted,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliImpliedBasis {
    NextYear,
    CurrentYear,
}

impl From<CliImpliedBasis> for ImpliedBasis {
    fn from(value: CliImpliedBasis) -> Self {
        match value {
            CliImpliedBasis::NextYear => ImpliedBasis::NextYear,
            CliImpliedBasis::CurrentYear => ImpliedBasis::CurrentYear,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiMode {
    #[serde(alias = "hist")]
    Historical,
    #[serde(alias = "dcf")]
    Forecast,
}

impl From<ApiMode> for CliMode {
    fn from(value: ApiMode) -> Self {
        match value {
            ApiMode::Historical => CliMode::Historical,
            ApiMode::Forecast => CliMode::Forecast,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiAveraging {
    #[serde(alias = "mean")]
    Simple,
    #[serde(alias = "recencyWeighted", alias = "recency-weighted")]
    Weighted,
}

impl From<ApiAveraging> for CliAveraging {
    fn from(value: ApiAveraging) -> Self {
        match value {
            ApiAveraging::Simple => CliAveraging::Simple,
            ApiAveraging::Weighted => CliAveraging::Weighted,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiImpliedBasis {
    #[serde(alias = "nextYear", alias = "next_year")]
    NextYear,
    #[serde(alias = "currentYear", alias = "current_year")]
    CurrentYear,
}

impl From<ApiImpliedBasis> for CliImpliedBasis {
    fn from(value: ApiImpliedBasis) -> Self {
        match value {
            ApiImpliedBasis::NextYear => CliImpliedBasis::NextYear,
            ApiImpliedBasis::CurrentYear => CliImpliedBasis::CurrentYear,
        }
    }
}

/// A JSON array, or a comma-separated string when sent as a query parameter.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumberList {
    List(Vec<f64>),
    Csv(String),
}

impl NumberList {
    fn into_values(self, key: &str) -> Result<Vec<f64>, String> {
        match self {
            NumberList::List(values) => Ok(values),
            NumberList::Csv(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<f64>()
                        .map_err(|_| format!("{key}: `{s}` is not a number"))
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    mode: Option<ApiMode>,
    operating_cash_flows: Option<NumberList>,
    capital_expenditures: Option<NumberList>,
    averaging: Option<ApiAveraging>,
    forecast_cash_flows: Option<NumberList>,

    growth_min: Option<f64>,
    growth_mode: Option<f64>,
    growth_max: Option<f64>,
    discount_rate: Option<f64>,
    discount_min: Option<f64>,
    discount_mode: Option<f64>,
    discount_max: Option<f64>,

    debt: Option<f64>,
    cash: Option<f64>,
    shares_outstanding: Option<f64>,
    current_price: Option<f64>,

    trials: Option<usize>,
    seed: Option<String>,
    chunk_size: Option<usize>,
    lattice_size: Option<usize>,
    implied_basis: Option<ApiImpliedBasis>,
    include_samples: Option<bool>,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dcfsim",
    about = "Monte Carlo DCF valuation: per-share value distribution and market-implied assumptions"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = CliMode::Historical)]
    mode: CliMode,
    #[arg(
        long,
        value_delimiter = ',',
        allow_negative_numbers = true,
        help = "Historical operating cash flow per year, oldest first"
    )]
    operating_cash_flow: Vec<f64>,
    #[arg(
        long,
        value_delimiter = ',',
        allow_negative_numbers = true,
        help = "Historical capital expenditure per year, oldest first"
    )]
    capital_expenditure: Vec<f64>,
    #[arg(
        long,
        value_enum,
        default_value_t = CliAveraging::Simple,
        help = "How the last five years are averaged into the base FCF"
    )]
    averaging: CliAveraging,
    #[arg(
        long,
        value_delimiter = ',',
        allow_negative_numbers = true,
        help = "Forecast free cash flow per year, year 1 first"
    )]
    forecast_cash_flow: Vec<f64>,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Minimum perpetual growth rate in percent"
    )]
    growth_min: f64,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Most likely perpetual growth rate in percent"
    )]
    growth_mode: f64,
    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Maximum perpetual growth rate in percent"
    )]
    growth_max: f64,
    #[arg(long, help = "Fixed discount rate in percent; overrides the triangular range")]
    discount_rate: Option<f64>,
    #[arg(long)]
    discount_min: Option<f64>,
    #[arg(long)]
    discount_mode: Option<f64>,
    #[arg(long)]
    discount_max: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    debt: f64,
    #[arg(long, default_value_t = 0.0)]
    cash: f64,
    #[arg(long)]
    shares_outstanding: f64,
    #[arg(long)]
    current_price: f64,
    #[arg(
        long,
        default_value_t = 100_000,
        help = "Monte Carlo trials, at most 10000000; each costs 8 bytes forward, 32 bytes reverse"
    )]
    trials: usize,
    #[arg(long, help = "Seed string for reproducible runs; omitted means host entropy")]
    seed: Option<String>,
    #[arg(long, default_value_t = crate::core::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, default_value_t = crate::core::LATTICE_SIZE)]
    lattice_size: usize,
    #[arg(long, value_enum, default_value_t = CliImpliedBasis::NextYear)]
    implied_basis: CliImpliedBasis,
    #[arg(long, help = "Include raw sorted prices and implied pairs in the output")]
    include_samples: bool,
}

#[derive(Copy, Clone, Debug)]
struct ApiOptions {
    chunk_size: usize,
    lattice_size: usize,
    include_samples: bool,
}

#[derive(Debug)]
struct ApiRequest {
    inputs: ValuationInputs,
    options: ApiOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForwardResponse {
    trial_count: usize,
    valid_count: usize,
    discarded_count: usize,
    summary: SimulationSummary,
    histogram: Vec<HistogramBin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    samples: Option<Vec<f64>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReverseResponse {
    basis: ImpliedBasis,
    market_enterprise_value: f64,
    base_fcf: f64,
    implied_fcf: DistributionSummary,
    implied_growth: DistributionSummary,
    base_fcf_percentile: f64,
    prob_growth_above_mode: f64,
    density: DensityGrid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pairs: Option<Vec<[f64; 2]>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    mode: ValuationMode,
    seeded: bool,
    forward: ForwardResponse,
    reverse: Option<ReverseResponse>,
    reverse_error: Option<String>,
    sensitivity: SensitivityReport,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn require_finite(flag: &str, value: f64) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(format!("{flag} must be a finite number"))
    }
}

fn build_cash_flows(cli: &Cli) -> Result<CashFlowBasis, String> {
    match cli.mode {
        CliMode::Historical => {
            if cli.operating_cash_flow.is_empty() {
                return Err("--operating-cash-flow needs at least one year".to_string());
            }
            if cli.operating_cash_flow.len() != cli.capital_expenditure.len() {
                return Err("--operating-cash-flow and --capital-expenditure must list \
                            the same number of years"
                    .to_string());
            }
            let years = cli
                .operating_cash_flow
                .iter()
                .zip(&cli.capital_expenditure)
                .map(|(&operating_cash_flow, &capital_expenditure)| YearCashFlow {
                    operating_cash_flow,
                    capital_expenditure,
                })
                .collect();
            let history = HistoricalCashFlows {
                years,
                averaging: cli.averaging.into(),
            };
            let base_fcf = history
                .base_fcf()
                .ok_or_else(|| "--operating-cash-flow needs at least one year".to_string())?;
            Ok(CashFlowBasis::Historical { base_fcf })
        }
        CliMode::Forecast => {
            if cli.forecast_cash_flow.is_empty() {
                return Err("--forecast-cash-flow needs at least one year".to_string());
            }
            Ok(CashFlowBasis::Forecast {
                cash_flows: cli.forecast_cash_flow.clone(),
            })
        }
    }
}

fn build_discount(cli: &Cli) -> Result<DiscountRate, String> {
    if let Some(rate) = cli.discount_rate {
        require_finite("--discount-rate", rate)?;
        return Ok(DiscountRate::Fixed(rate / 100.0));
    }
    let (Some(min), Some(mode), Some(max)) = (cli.discount_min, cli.discount_mode, cli.discount_max)
    else {
        return Err("either --discount-rate or all of --discount-min, --discount-mode \
                    and --discount-max are required"
            .to_string());
    };
    require_finite("--discount-min", min)?;
    require_finite("--discount-mode", mode)?;
    require_finite("--discount-max", max)?;
    if min > mode {
        return Err("--discount-min must be <= --discount-mode".to_string());
    }
    if mode > max {
        return Err("--discount-mode must be <= --discount-max".to_string());
    }
    Ok(DiscountRate::Triangular(TriangularParams::new(
        min / 100.0,
        mode / 100.0,
        max / 100.0,
    )))
}

fn build_inputs(cli: &Cli) -> Result<ValuationInputs, String> {
    for (flag, value) in [
        ("--growth-min", cli.growth_min),
        ("--growth-mode", cli.growth_mode),
        ("--growth-max", cli.growth_max),
        ("--debt", cli.debt),
        ("--cash", cli.cash),
        ("--shares-outstanding", cli.shares_outstanding),
        ("--current-price", cli.current_price),
    ] {
        require_finite(flag, value)?;
    }
    if cli
        .operating_cash_flow
        .iter()
        .chain(&cli.capital_expenditure)
        .chain(&cli.forecast_cash_flow)
        .any(|v| !v.is_finite())
    {
        return Err("cash flow lists must contain only finite numbers".to_string());
    }

    if cli.growth_min > cli.growth_mode {
        return Err("--growth-min must be <= --growth-mode".to_string());
    }
    if cli.growth_mode > cli.growth_max {
        return Err("--growth-mode must be <= --growth-max".to_string());
    }
    if cli.shares_outstanding <= 0.0 {
        return Err("--shares-outstanding must be > 0".to_string());
    }
    if cli.current_price < 0.0 {
        return Err("--current-price must be >= 0".to_string());
    }
    if cli.trials == 0 {
        return Err("--trials must be > 0".to_string());
    }
    if cli.trials > MAX_TRIALS {
        return Err(format!("--trials must be <= {MAX_TRIALS}"));
    }

    let inputs = ValuationInputs {
        cash_flows: build_cash_flows(cli)?,
        growth: TriangularParams::new(
            cli.growth_min / 100.0,
            cli.growth_mode / 100.0,
            cli.growth_max / 100.0,
        ),
        discount: build_discount(cli)?,
        net_debt: cli.debt - cli.cash,
        shares_outstanding: cli.shares_outstanding,
        current_price: cli.current_price,
        trial_count: cli.trials,
        seed: cli.seed.clone().filter(|s| !s.trim().is_empty()),
        implied_basis: cli.implied_basis.into(),
    };
    inputs.validate().map_err(|e| e.to_string())?;
    Ok(inputs)
}

fn build_request(cli: &Cli) -> Result<ApiRequest, String> {
    if cli.chunk_size == 0 {
        return Err("--chunk-size must be > 0".to_string());
    }
    if cli.lattice_size < 2 {
        return Err("--lattice-size must be >= 2".to_string());
    }
    Ok(ApiRequest {
        inputs: build_inputs(cli)?,
        options: ApiOptions {
            chunk_size: cli.chunk_size,
            lattice_size: cli.lattice_size,
            include_samples: cli.include_samples,
        },
    })
}

/// One-shot command line run: parses flags, simulates, prints the JSON response.
pub fn run_cli(args: Vec<String>) -> Result<(), String> {
    let cli = Cli::try_parse_from(args).unwrap_or_else(|e| e.exit());
    let request = build_request(&cli)?;
    let inputs = &request.inputs;

    let forward = run_forward(inputs, |p| {
        debug!(percent = p.percent(), "forward progress");
    })
    .map_err(|e| e.to_string())?;
    let reverse = run_implied(inputs, |p| {
        debug!(percent = p.percent(), "implied progress");
    });

    let response = build_simulate_response(&request, forward, reverse);
    let json = serde_json::to_string_pretty(&response)
        .map_err(|e| format!("failed to serialize response: {e}"))?;
    println!("{json}");
    Ok(())
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router();

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "valuation HTTP API listening");

    axum::serve(listener, app).await
}

fn router() -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/sensitivity", post(sensitivity_handler))
        .fallback(not_found_handler)
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn sensitivity_handler(Json(payload): Json<SimulatePayload>) -> Response {
    match api_request_from_payload(payload) {
        Ok(request) => json_response(
            StatusCode::OK,
            sensitivity_report(&request.inputs, request.options.lattice_size),
        ),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let forward = match drive_forward(&request).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(error = %err, "forward simulation failed");
            return error_response(status_for(&err), &err.to_string());
        }
    };
    let reverse = drive_implied(&request).await;

    json_response(
        StatusCode::OK,
        build_simulate_response(&request, forward, reverse),
    )
}

/// Runs the forward driver chunk by chunk, yielding to the runtime in between.
async fn drive_forward(request: &ApiRequest) -> Result<ForwardOutcome, ValuationError> {
    let mut run = ForwardRun::new(&request.inputs)?.with_chunk_size(request.options.chunk_size);
    while let Step::Yielded(progress) = run.step()? {
        debug!(percent = progress.percent(), "forward progress");
        tokio::task::yield_now().await;
    }
    run.finish()
}

async fn drive_implied(request: &ApiRequest) -> Result<ImpliedOutcome, ValuationError> {
    let mut run = ImpliedRun::new(&request.inputs)?.with_chunk_size(request.options.chunk_size);
    while let Step::Yielded(progress) = run.step()? {
        debug!(percent = progress.percent(), "implied progress");
        tokio::task::yield_now().await;
    }
    run.finish()
}

fn status_for(err: &ValuationError) -> StatusCode {
    match err {
        ValuationError::InvalidInput { .. } | ValuationError::NonPositiveEnterpriseValue(_) => {
            StatusCode::BAD_REQUEST
        }
        ValuationError::NoValidTrials { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ValuationError::BufferAllocation { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ValuationError::Aborted { .. } | ValuationError::RunIncomplete { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.mode {
        cli.mode = v.into();
    }
    if let Some(v) = payload.operating_cash_flows {
        cli.operating_cash_flow = v.into_values("operatingCashFlows")?;
    }
    if let Some(v) = payload.capital_expenditures {
        cli.capital_expenditure = v.into_values("capitalExpenditures")?;
    }
    if let Some(v) = payload.averaging {
        cli.averaging = v.into();
    }
    if let Some(v) = payload.forecast_cash_flows {
        cli.forecast_cash_flow = v.into_values("forecastCashFlows")?;
    }
    if let Some(v) = payload.growth_min {
        cli.growth_min = v;
    }
    if let Some(v) = payload.growth_mode {
        cli.growth_mode = v;
    }
    if let Some(v) = payload.growth_max {
        cli.growth_max = v;
    }
    if let Some(v) = payload.discount_rate {
        cli.discount_rate = Some(v);
    }
    if let Some(v) = payload.discount_min {
        cli.discount_min = Some(v);
    }
    if let Some(v) = payload.discount_mode {
        cli.discount_mode = Some(v);
    }
    if let Some(v) = payload.discount_max {
        cli.discount_max = Some(v);
    }
    if let Some(v) = payload.debt {
        cli.debt = v;
    }
    if let Some(v) = payload.cash {
        cli.cash = v;
    }
    if let Some(v) = payload.shares_outstanding {
        cli.shares_outstanding = v;
    }
    if let Some(v) = payload.current_price {
        cli.current_price = v;
    }
    if let Some(v) = payload.trials {
        cli.trials = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = Some(v);
    }
    if let Some(v) = payload.chunk_size {
        cli.chunk_size = v;
    }
    if let Some(v) = payload.lattice_size {
        cli.lattice_size = v;
    }
    if let Some(v) = payload.implied_basis {
        cli.implied_basis = v.into();
    }
    if let Some(v) = payload.include_samples {
        cli.include_samples = v;
    }

    build_request(&cli).map_err(|msg| msg.replace("--", ""))
}

fn default_cli_for_api() -> Cli {
    Cli {
        mode: CliMode::Historical,
        operating_cash_flow: vec![820.0, 870.0, 910.0, 980.0, 1_040.0],
        capital_expenditure: vec![210.0, 230.0, 240.0, 260.0, 270.0],
        averaging: CliAveraging::Simple,
        forecast_cash_flow: vec![800.0, 850.0, 900.0, 950.0, 1_000.0],
        growth_min: 1.0,
        growth_mode: 2.5,
        growth_max: 4.0,
        discount_rate: None,
        discount_min: Some(7.0),
        discount_mode: Some(8.5),
        discount_max: Some(10.0),
        debt: 2_000.0,
        cash: 500.0,
        shares_outstanding: 1_000.0,
        current_price: 10.0,
        trials: 100_000,
        seed: None,
        chunk_size: crate::core::DEFAULT_CHUNK_SIZE,
        lattice_size: crate::core::LATTICE_SIZE,
        implied_basis: CliImpliedBasis::NextYear,
        include_samples: false,
    }
}

fn build_simulate_response(
    request: &ApiRequest,
    forward: ForwardOutcome,
    reverse: Result<ImpliedOutcome, ValuationError>,
) -> SimulateResponse {
    let inputs = &request.inputs;
    let include_samples = request.options.include_samples;

    let forward_response = ForwardResponse {
        trial_count: forward.trial_count,
        valid_count: forward.valid_count,
        discarded_count: forward.discarded_count(),
        summary: forward.summary.clone(),
        histogram: forward.histogram.clone(),
        samples: include_samples.then(|| forward.samples.as_slice().to_vec()),
    };

    let (reverse, reverse_error) = match reverse {
        Ok(outcome) => {
            let pairs = include_samples.then(|| {
                outcome
                    .implied_fcf
                    .iter()
                    .zip(&outcome.implied_growth)
                    .map(|(&fcf, &g)| [fcf, g])
                    .collect()
            });
            (
                Some(ReverseResponse {
                    basis: inputs.implied_basis,
                    market_enterprise_value: outcome.market_enterprise_value,
                    base_fcf: outcome.base_fcf,
                    implied_fcf: outcome.fcf_summary,
                    implied_growth: outcome.growth_summary,
                    base_fcf_percentile: outcome.base_fcf_percentile,
                    prob_growth_above_mode: outcome.prob_growth_above_mode,
                    density: outcome.density,
                    pairs,
                }),
                None,
            )
        }
        Err(err) => {
            warn!(error = %err, "implied simulation skipped");
            (None, Some(err.to_string()))
        }
    };

    SimulateResponse {
        mode: inputs.mode(),
        seeded: inputs.seed.is_some(),
        forward: forward_response,
        reverse,
        reverse_error,
        sensitivity: sensitivity_report(inputs, request.options.lattice_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        let mut cli = default_cli_for_api();
        cli.trials = 2_000;
        cli.seed = Some("unit".to_string());
        cli
    }

    #[test]
    fn cli_parses_percent_flags_and_lists() {
        let cli = Cli::try_parse_from([
            "dcfsim",
            "--operating-cash-flow",
            "100,110,120",
            "--capital-expenditure",
            "20,20,20",
            "--growth-min",
            "-1",
            "--growth-mode",
            "2",
            "--growth-max",
            "3",
            "--discount-rate",
            "9",
            "--shares-outstanding",
            "50",
            "--current-price",
            "25",
        ])
        .expect("valid flags");
        assert_eq!(cli.operating_cash_flow, vec![100.0, 110.0, 120.0]);

        let inputs = build_inputs(&cli).expect("valid inputs");
        assert_eq!(inputs.cash_flows, CashFlowBasis::Historical { base_fcf: 90.0 });
        assert_approx(inputs.growth.min, -0.01);
        assert_eq!(inputs.discount, DiscountRate::Fixed(0.09));
        assert_eq!(inputs.trial_count, 100_000);
        assert!(inputs.seed.is_none());
    }

    #[test]
    fn build_inputs_derives_net_debt_and_weighted_base() {
        let mut cli = sample_cli();
        cli.operating_cash_flow = vec![10.0, 20.0];
        cli.capital_expenditure = vec![0.0, 0.0];
        cli.averaging = CliAveraging::Weighted;
        cli.debt = 300.0;
        cli.cash = 120.0;

        let inputs = build_inputs(&cli).expect("valid inputs");
        // (1*10 + 2*20) / 3
        match inputs.cash_flows {
            CashFlowBasis::Historical { base_fcf } => assert_approx(base_fcf, 50.0 / 3.0),
            other => panic!("unexpected basis {other:?}"),
        }
        assert_approx(inputs.net_debt, 180.0);
    }

    #[test]
    fn build_inputs_rejects_unordered_growth() {
        let mut cli = sample_cli();
        cli.growth_min = 5.0;
        let err = build_inputs(&cli).expect_err("must reject growth order");
        assert!(err.contains("--growth-min"));

        let mut cli = sample_cli();
        cli.growth_max = 2.0;
        let err = build_inputs(&cli).expect_err("must reject growth order");
        assert!(err.contains("--growth-mode"));
    }

    #[test]
    fn build_inputs_rejects_missing_or_unordered_discount() {
        let mut cli = sample_cli();
        cli.discount_mode = None;
        let err = build_inputs(&cli).expect_err("must require a discount");
        assert!(err.contains("--discount-rate"));

        let mut cli = sample_cli();
        cli.discount_min = Some(9.0);
        let err = build_inputs(&cli).expect_err("must reject discount order");
        assert!(err.contains("--discount-min"));
    }

    #[test]
    fn build_inputs_rejects_bad_shares_price_and_history() {
        let mut cli = sample_cli();
        cli.shares_outstanding = 0.0;
        assert!(build_inputs(&cli)
            .expect_err("shares")
            .contains("--shares-outstanding"));

        let mut cli = sample_cli();
        cli.current_price = -1.0;
        assert!(build_inputs(&cli).expect_err("price").contains("--current-price"));

        let mut cli = sample_cli();
        cli.capital_expenditure.pop();
        assert!(build_inputs(&cli)
            .expect_err("history")
            .contains("same number of years"));

        let mut cli = sample_cli();
        cli.growth_mode = f64::NAN;
        assert!(build_inputs(&cli).expect_err("nan").contains("finite"));
    }

    #[test]
    fn build_inputs_caps_the_trial_count() {
        let mut cli = sample_cli();
        cli.trials = MAX_TRIALS;
        assert!(build_inputs(&cli).is_ok());

        cli.trials = MAX_TRIALS + 1;
        let err = build_inputs(&cli).expect_err("above the ceiling");
        assert_eq!(err, "--trials must be <= 10000000");
    }

    #[test]
    fn query_string_payload_reads_comma_separated_lists() {
        let uri: axum::http::Uri = "/api/simulate?mode=forecast\
            &forecastCashFlows=50%2C55,60&growthMin=0.5&growthMode=2&growthMax=3\
            &discountRate=9&trials=500&seed=query&includeSamples=true"
            .parse()
            .expect("valid uri");
        let Query(payload) = Query::<SimulatePayload>::try_from_uri(&uri).expect("valid query");
        let request = api_request_from_payload(payload).expect("valid payload");

        assert_eq!(request.inputs.mode(), ValuationMode::Forecast);
        assert_eq!(
            request.inputs.cash_flows,
            CashFlowBasis::Forecast {
                cash_flows: vec![50.0, 55.0, 60.0]
            }
        );
        assert_eq!(request.inputs.discount, DiscountRate::Fixed(0.09));
        assert_eq!(request.inputs.trial_count, 500);
        assert_eq!(request.inputs.seed.as_deref(), Some("query"));
        assert!(request.options.include_samples);
    }

    #[test]
    fn build_request_rejects_zero_chunk_size() {
        let mut cli = sample_cli();
        cli.chunk_size = 0;
        assert!(build_request(&cli).expect_err("chunk").contains("--chunk-size"));
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let request = api_request_from_json(
            r#"{
                "mode": "forecast",
                "forecastCashFlows": [50, 55, 60, 65, 70],
                "growthMin": 0.5,
                "growthMode": 2,
                "growthMax": 3,
                "discountRate": 9,
                "debt": 100,
                "cash": 40,
                "sharesOutstanding": 20,
                "currentPrice": 30,
                "trials": 5000,
                "seed": "web",
                "chunkSize": 1000,
                "latticeSize": 10,
                "impliedBasis": "currentYear",
                "includeSamples": true
            }"#,
        )
        .expect("valid payload");

        let inputs = &request.inputs;
        assert_eq!(inputs.mode(), ValuationMode::Forecast);
        assert_eq!(
            inputs.cash_flows,
            CashFlowBasis::Forecast {
                cash_flows: vec![50.0, 55.0, 60.0, 65.0, 70.0]
            }
        );
        assert_eq!(inputs.discount, DiscountRate::Fixed(0.09));
        assert_approx(inputs.net_debt, 60.0);
        assert_eq!(inputs.trial_count, 5_000);
        assert_eq!(inputs.seed.as_deref(), Some("web"));
        assert_eq!(inputs.implied_basis, ImpliedBasis::CurrentYear);
        assert_eq!(request.options.chunk_size, 1_000);
        assert_eq!(request.options.lattice_size, 10);
        assert!(request.options.include_samples);
    }

    #[test]
    fn api_request_accepts_comma_separated_lists() {
        let request = api_request_from_json(
            r#"{
                "operatingCashFlows": "100, 120",
                "capitalExpenditures": "10,20",
                "averaging": "mean"
            }"#,
        )
        .expect("valid payload");
        assert_eq!(
            request.inputs.cash_flows,
            CashFlowBasis::Historical { base_fcf: 95.0 }
        );

        let err = api_request_from_json(r#"{ "forecastCashFlows": "1,abc", "mode": "forecast" }"#)
            .expect_err("bad number");
        assert!(err.contains("forecastCashFlows"));
    }

    #[test]
    fn api_errors_drop_flag_prefixes() {
        let err = api_request_from_json(r#"{ "sharesOutstanding": 0 }"#).expect_err("shares");
        assert!(err.contains("shares-outstanding"));
        assert!(!err.contains("--"));
    }

    #[test]
    fn simulate_response_serialization_contains_expected_fields() {
        let request = build_request(&sample_cli()).expect("valid request");
        let forward = run_forward(&request.inputs, |_| {}).expect("forward");
        let reverse = run_implied(&request.inputs, |_| {});
        let response = build_simulate_response(&request, forward, reverse);

        let json = serde_json::to_string(&response).expect("response should serialize");
        for key in [
            "\"forward\"",
            "\"summary\"",
            "\"probAboveCurrentPrice\"",
            "\"modeScenarioPrice\"",
            "\"currentPricePercentile\"",
            "\"histogram\"",
            "\"reverse\"",
            "\"impliedFcf\"",
            "\"impliedGrowth\"",
            "\"density\"",
            "\"sensitivity\"",
            "\"scenarios\"",
            "\"lattice\"",
        ] {
            assert!(json.contains(key), "missing {key}");
        }
        assert!(!json.contains("\"samples\""));
        assert!(!json.contains("\"pairs\""));
    }

    #[test]
    fn reverse_precondition_failure_is_reported_beside_forward_results() {
        let mut cli = sample_cli();
        cli.current_price = 0.0;
        cli.debt = 0.0;
        cli.cash = 1_000.0;
        let request = build_request(&cli).expect("valid request");
        let forward = run_forward(&request.inputs, |_| {}).expect("forward");
        let reverse = run_implied(&request.inputs, |_| {});
        let response = build_simulate_response(&request, forward, reverse);

        assert!(response.reverse.is_none());
        assert!(
            response
                .reverse_error
                .as_deref()
                .is_some_and(|e| e.contains("enterprise value"))
        );
    }

    #[test]
    fn samples_are_included_on_request() {
        let mut cli = sample_cli();
        cli.include_samples = true;
        cli.trials = 300;
        let request = build_request(&cli).expect("valid request");
        let forward = run_forward(&request.inputs, |_| {}).expect("forward");
        let reverse = run_implied(&request.inputs, |_| {});
        let response = build_simulate_response(&request, forward, reverse);

        let samples = response.forward.samples.as_ref().expect("samples");
        assert_eq!(samples.len(), response.forward.valid_count);
        let pairs = response
            .reverse
            .as_ref()
            .and_then(|r| r.pairs.as_ref())
            .expect("pairs");
        assert_eq!(pairs.len(), 300);
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(
            status_for(&ValuationError::NoValidTrials { trial_count: 1 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&ValuationError::NonPositiveEnterpriseValue(0.0)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ValuationError::BufferAllocation { trials: 1 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn cooperative_drivers_match_the_blocking_loop() {
        let mut cli = sample_cli();
        cli.chunk_size = 700;
        let request = build_request(&cli).expect("valid request");

        let cooperative = drive_forward(&request).await.expect("forward");
        let blocking = run_forward(&request.inputs, |_| {}).expect("forward");
        assert_eq!(cooperative.samples, blocking.samples);
        assert_eq!(cooperative.summary, blocking.summary);

        let implied = drive_implied(&request).await.expect("implied");
        assert_eq!(implied.implied_fcf.len(), request.inputs.trial_count);
    }

    #[tokio::test]
    async fn simulate_handler_maps_degenerate_runs_to_422() {
        let payload = SimulatePayload {
            growth_min: Some(8.0),
            growth_mode: Some(10.0),
            growth_max: Some(12.0),
            discount_rate: Some(5.0),
            trials: Some(1_000),
            ..SimulatePayload::default()
        };
        let response = simulate_handler_impl(payload).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let payload = SimulatePayload {
            trials: Some(0),
            ..SimulatePayload::default()
        };
        let response = simulate_handler_impl(payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_trial_counts_are_rejected_before_allocation() {
        let payload = SimulatePayload {
            trials: Some(usize::MAX / 4),
            ..SimulatePayload::default()
        };
        let response = simulate_handler_impl(payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let payload = SimulatePayload {
            trials: Some(MAX_TRIALS + 1),
            ..SimulatePayload::default()
        };
        let response = sensitivity_handler(Json(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
