use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    NormalizationError, NormalizationResult, RepetitionResult, SearchConfig, SearchStrategy,
    SimulationConfig, TradeSet, TradeWeighting, generate_trade_list, run_risk_normalization,
    validate_config,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliWeighting {
    Uniform,
    Triangular,
}

impl From<CliWeighting> for TradeWeighting {
    fn from(value: CliWeighting) -> Self {
        match value {
            CliWeighting::Uniform => TradeWeighting::Uniform,
            CliWeighting::Triangular => TradeWeighting::Triangular,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSearchStrategy {
    Bisection,
    Proportional,
}

impl From<CliSearchStrategy> for SearchStrategy {
    fn from(value: CliSearchStrategy) -> Self {
        match value {
            CliSearchStrategy::Bisection => SearchStrategy::Bisection,
            CliSearchStrategy::Proportional => SearchStrategy::Proportional,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiWeighting {
    Uniform,
    Triangular,
}

impl From<ApiWeighting> for CliWeighting {
    fn from(value: ApiWeighting) -> Self {
        match value {
            ApiWeighting::Uniform => CliWeighting::Uniform,
            ApiWeighting::Triangular => CliWeighting::Triangular,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiSearchStrategy {
    Bisection,
    Proportional,
}

impl From<ApiSearchStrategy> for CliSearchStrategy {
    fn from(value: ApiSearchStrategy) -> Self {
        match value {
            ApiSearchStrategy::Bisection => CliSearchStrategy::Bisection,
            ApiSearchStrategy::Proportional => CliSearchStrategy::Proportional,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct NormalizePayload {
    trades: Option<Vec<f64>>,
    synthetic_trades: Option<usize>,
    synthetic_mean: Option<f64>,
    synthetic_std_dev: Option<f64>,
    sequence_length: Option<usize>,
    initial_capital: Option<f64>,
    tail_percentage: Option<f64>,
    drawdown_tolerance: Option<f64>,
    #[serde(alias = "numberEquityInCDF")]
    number_equity_in_cdf: Option<usize>,
    repetitions: Option<usize>,
    weighting: Option<ApiWeighting>,
    strategy: Option<ApiSearchStrategy>,
    min_fraction: Option<f64>,
    max_fraction: Option<f64>,
    initial_fraction: Option<f64>,
    accuracy: Option<f64>,
    max_iterations: Option<u32>,
    fresh_draws: Option<bool>,
    time_budget_secs: Option<f64>,
    seed: Option<u64>,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "safef",
    about = "Monte Carlo safe-f and CAR25 estimator for a list of daily trade returns"
)]
struct Cli {
    #[arg(long, help = "CSV file with one fractional daily return per row")]
    trades: Option<PathBuf>,
    #[arg(
        long,
        default_value_t = 1000,
        help = "Synthetic trades to draw when --trades is not given"
    )]
    synthetic_trades: usize,
    #[arg(long, default_value_t = 0.1, help = "Synthetic mean daily gain in percent")]
    synthetic_mean: f64,
    #[arg(
        long,
        default_value_t = 0.3,
        help = "Synthetic daily standard deviation in percent"
    )]
    synthetic_std_dev: f64,
    #[arg(long, default_value_t = 504, help = "Trades per simulated equity path")]
    sequence_length: usize,
    #[arg(long, default_value_t = 100_000.0)]
    initial_capital: f64,
    #[arg(
        long,
        default_value_t = 5.0,
        help = "Percent of worst drawdowns forming the tail"
    )]
    tail_percentage: f64,
    #[arg(
        long,
        default_value_t = 10.0,
        help = "Drawdown tolerance in percent of peak equity"
    )]
    drawdown_tolerance: f64,
    #[arg(long, default_value_t = 1000, help = "Equity paths per distribution")]
    number_equity_in_cdf: usize,
    #[arg(long, default_value_t = 1)]
    repetitions: usize,
    #[arg(long, value_enum, default_value_t = CliWeighting::Uniform)]
    weighting: CliWeighting,
    #[arg(long, value_enum, default_value_t = CliSearchStrategy::Bisection)]
    strategy: CliSearchStrategy,
    #[arg(long, default_value_t = 0.0)]
    min_fraction: f64,
    #[arg(long, default_value_t = 2.0)]
    max_fraction: f64,
    #[arg(
        long,
        default_value_t = 1.0,
        help = "Starting fraction for the proportional strategy"
    )]
    initial_fraction: f64,
    #[arg(
        long,
        default_value_t = 0.3,
        help = "Accepted gap between tail risk and tolerance, in percent"
    )]
    accuracy: f64,
    #[arg(long, default_value_t = 50)]
    max_iterations: u32,
    #[arg(long, help = "Redraw equity paths for every search evaluation")]
    fresh_draws: bool,
    #[arg(long, help = "Wall-clock budget for each safe-f search, in seconds")]
    time_budget_secs: Option<f64>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, help = "Run trials and repetitions on a single thread")]
    sequential: bool,
    #[arg(long, help = "Print the result as JSON")]
    json: bool,
}

#[derive(Debug)]
struct ApiRequest {
    trades: TradeSet,
    config: SimulationConfig,
    search: SearchConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NormalizeResponse {
    safe_f: f64,
    car25: f64,
    trade_count: usize,
    sequence_length: usize,
    initial_capital: f64,
    tail_percentage: f64,
    drawdown_tolerance: f64,
    number_equity_in_cdf: usize,
    seed: u64,
    repetitions: Vec<RepetitionResult>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<&'static str>,
}

fn build_configs(cli: &Cli) -> Result<(SimulationConfig, SearchConfig), String> {
    if cli.sequence_length == 0 {
        return Err("--sequence-length must be > 0".to_string());
    }

    if !cli.initial_capital.is_finite() || cli.initial_capital <= 0.0 {
        return Err("--initial-capital must be > 0".to_string());
    }

    if !(cli.tail_percentage > 0.0 && cli.tail_percentage < 100.0) {
        return Err("--tail-percentage must be between 0 and 100 (exclusive)".to_string());
    }

    if !(cli.drawdown_tolerance > 0.0 && cli.drawdown_tolerance <= 100.0) {
        return Err("--drawdown-tolerance must be > 0 and <= 100".to_string());
    }

    if cli.number_equity_in_cdf == 0 {
        return Err("--number-equity-in-cdf must be > 0".to_string());
    }

    if cli.repetitions == 0 {
        return Err("--repetitions must be > 0".to_string());
    }

    if !cli.min_fraction.is_finite() || cli.min_fraction < 0.0 {
        return Err("--min-fraction must be >= 0".to_string());
    }

    if !cli.max_fraction.is_finite() || cli.max_fraction <= cli.min_fraction {
        return Err("--max-fraction must be > --min-fraction".to_string());
    }

    if !(cli.min_fraction..=cli.max_fraction).contains(&cli.initial_fraction) {
        return Err("--initial-fraction must lie between --min-fraction and --max-fraction".to_string());
    }

    if !cli.accuracy.is_finite() || cli.accuracy <= 0.0 {
        return Err("--accuracy must be > 0".to_string());
    }

    if cli.max_iterations == 0 {
        return Err("--max-iterations must be > 0".to_string());
    }

    let time_budget = match cli.time_budget_secs {
        Some(secs) if !secs.is_finite() || secs < 0.0 => {
            return Err("--time-budget-secs must be >= 0".to_string());
        }
        Some(secs) => Some(
            Duration::try_from_secs_f64(secs)
                .map_err(|_| "--time-budget-secs is too large".to_string())?,
        ),
        None => None,
    };

    let config = SimulationConfig {
        sequence_length: cli.sequence_length,
        initial_capital: cli.initial_capital,
        tail_percentage: cli.tail_percentage,
        drawdown_tolerance: cli.drawdown_tolerance / 100.0,
        number_equity_in_cdf: cli.number_equity_in_cdf,
        number_repetitions: cli.repetitions,
        weighting: cli.weighting.into(),
        seed: cli.seed,
        parallel: !cli.sequential,
    };
    let search = SearchConfig {
        strategy: cli.strategy.into(),
        min_fraction: cli.min_fraction,
        max_fraction: cli.max_fraction,
        initial_fraction: cli.initial_fraction,
        accuracy: cli.accuracy / 100.0,
        max_iterations: cli.max_iterations,
        common_random_numbers: !cli.fresh_draws,
        time_budget,
        ..SearchConfig::default()
    };

    validate_config(&config, &search).map_err(|e| e.to_string())?;
    Ok((config, search))
}

fn load_trade_set(cli: &Cli) -> Result<TradeSet, String> {
    if let Some(path) = &cli.trades {
        return load_trades_csv(path);
    }

    if cli.synthetic_trades == 0 {
        return Err("--synthetic-trades must be > 0 when --trades is not given".to_string());
    }

    if !cli.synthetic_std_dev.is_finite() || cli.synthetic_std_dev < 0.0 {
        return Err("--synthetic-std-dev must be >= 0".to_string());
    }

    generate_trade_list(
        cli.synthetic_trades,
        cli.synthetic_mean / 100.0,
        cli.synthetic_std_dev / 100.0,
        cli.seed,
    )
    .map_err(|e| e.to_string())
}

/// Reads one return per row from the first column. A non-numeric first row is
/// treated as a header.
pub fn load_trades_csv(path: &Path) -> Result<TradeSet, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| format!("Failed to open trades file {}: {e}", path.display()))?;

    let mut returns = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| format!("Failed to read trades file {}: {e}", path.display()))?;
        let Some(field) = record.get(0) else {
            continue;
        };
        if field.is_empty() {
            continue;
        }
        match field.parse::<f64>() {
            Ok(value) => returns.push(value),
            Err(_) if row == 0 => continue,
            Err(_) => {
                return Err(format!(
                    "Row {} of {} is not a number: {field:?}",
                    row + 1,
                    path.display()
                ));
            }
        }
    }

    TradeSet::new(returns).map_err(|e| format!("Invalid trades file {}: {e}", path.display()))
}

/// Parses command-line arguments, runs the estimate and prints it.
pub fn run_cli<I, T>(args: I) -> Result<(), String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let (config, search) = build_configs(&cli)?;
    let trades = load_trade_set(&cli)?;

    let result = run_risk_normalization(&trades, &config, &search).map_err(|e| e.to_string())?;
    let response = build_normalize_response(&trades, &config, result);

    if cli.json {
        let json = serde_json::to_string_pretty(&response)
            .map_err(|e| format!("Failed to serialize result: {e}"))?;
        println!("{json}");
    } else {
        print!("{}", render_text(&response));
    }
    Ok(())
}

fn render_text(response: &NormalizeResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} trades, {} day horizon, {:.2}% drawdown tolerance at the {:.1}th percentile",
        response.trade_count,
        response.sequence_length,
        response.drawdown_tolerance * 100.0,
        100.0 - response.tail_percentage,
    );
    for rep in &response.repetitions {
        let _ = writeln!(
            out,
            "repetition {:>3}: safe-f {:.3}  tail risk {:.4}  TWR25 {:>12.0}  CAR25 {:>8.3}%  ({} evaluations, {})",
            rep.repetition + 1,
            rep.safe_f,
            rep.tail_risk,
            rep.terminal_wealth_25,
            rep.car25 * 100.0,
            rep.iterations.len(),
            rep.termination.as_str(),
        );
    }
    out
}

fn build_normalize_response(
    trades: &TradeSet,
    config: &SimulationConfig,
    result: NormalizationResult,
) -> NormalizeResponse {
    NormalizeResponse {
        safe_f: result.safe_f,
        car25: result.car25,
        trade_count: trades.len(),
        sequence_length: config.sequence_length,
        initial_capital: config.initial_capital,
        tail_percentage: config.tail_percentage,
        drawdown_tolerance: config.drawdown_tolerance,
        number_equity_in_cdf: config.number_equity_in_cdf,
        seed: config.seed,
        repetitions: result.repetitions,
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/normalize",
            get(normalize_get_handler).post(normalize_post_handler),
        )
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "safe-f HTTP API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found", None)
}

async fn normalize_get_handler(Query(payload): Query<NormalizePayload>) -> Response {
    normalize_handler_impl(payload).await
}

async fn normalize_post_handler(Json(payload): Json<NormalizePayload>) -> Response {
    normalize_handler_impl(payload).await
}

async fn normalize_handler_impl(payload: NormalizePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg, Some("configuration")),
    };

    let outcome = tokio::task::spawn_blocking(move || {
        run_risk_normalization(&request.trades, &request.config, &request.search)
            .map(|result| build_normalize_response(&request.trades, &request.config, result))
    })
    .await;

    match outcome {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => error_response(status_for(&err), &err.to_string(), Some(err.phase())),
        Err(join_err) => {
            error!("simulation task failed: {join_err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Simulation task failed",
                None,
            )
        }
    }
}

fn status_for(err: &NormalizationError) -> StatusCode {
    match err {
        NormalizationError::Configuration(_) => StatusCode::BAD_REQUEST,
        NormalizationError::ConvergenceFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str, phase: Option<&'static str>) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
            phase,
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<NormalizePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: NormalizePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.synthetic_trades {
        cli.synthetic_trades = v;
    }
    if let Some(v) = payload.synthetic_mean {
        cli.synthetic_mean = v;
    }
    if let Some(v) = payload.synthetic_std_dev {
        cli.synthetic_std_dev = v;
    }
    if let Some(v) = payload.sequence_length {
        cli.sequence_length = v;
    }
    if let Some(v) = payload.initial_capital {
        cli.initial_capital = v;
    }
    if let Some(v) = payload.tail_percentage {
        cli.tail_percentage = v;
    }
    if let Some(v) = payload.drawdown_tolerance {
        cli.drawdown_tolerance = v;
    }
    if let Some(v) = payload.number_equity_in_cdf {
        cli.number_equity_in_cdf = v;
    }
    if let Some(v) = payload.repetitions {
        cli.repetitions = v;
    }
    if let Some(v) = payload.weighting {
        cli.weighting = v.into();
    }
    if let Some(v) = payload.strategy {
        cli.strategy = v.into();
    }
    if let Some(v) = payload.min_fraction {
        cli.min_fraction = v;
    }
    if let Some(v) = payload.max_fraction {
        cli.max_fraction = v;
    }
    if let Some(v) = payload.initial_fraction {
        cli.initial_fraction = v;
    }
    if let Some(v) = payload.accuracy {
        cli.accuracy = v;
    }
    if let Some(v) = payload.max_iterations {
        cli.max_iterations = v;
    }
    if let Some(v) = payload.fresh_draws {
        cli.fresh_draws = v;
    }
    if payload.time_budget_secs.is_some() {
        cli.time_budget_secs = payload.time_budget_secs;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }

    let (config, search) = build_configs(&cli)?;
    let trades = match payload.trades {
        Some(returns) => TradeSet::new(returns).map_err(|e| format!("Invalid trades: {e}"))?,
        None => load_trade_set(&cli)?,
    };

    Ok(ApiRequest {
        trades,
        config,
        search,
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        trades: None,
        synthetic_trades: 1_000,
        synthetic_mean: 0.1,
        synthetic_std_dev: 0.3,
        sequence_length: 504,
        initial_capital: 100_000.0,
        tail_percentage: 5.0,
        drawdown_tolerance: 10.0,
        number_equity_in_cdf: 1_000,
        repetitions: 1,
        weighting: CliWeighting::Uniform,
        strategy: CliSearchStrategy::Bisection,
        min_fraction: 0.0,
        max_fraction: 2.0,
        initial_fraction: 1.0,
        accuracy: 0.3,
        max_iterations: 50,
        fresh_draws: false,
        time_budget_secs: None,
        seed: 42,
        sequential: false,
        json: false,
    }
}
