use anyhow::Result;
use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use std::str::FromStr;
use std::sync::Arc;

mod analyze;
mod logging;
mod metrics;
mod proxy;
mod sse;
mod utils;
mod voice_clone;
mod workflow;

#[derive(clap::Parser, Debug)]
struct WorkerArgs {
    #[clap(short = 'l', long = "log", default_value = "info")]
    log_level: String,

    #[clap(short = 'a', long = "addr", default_value = "0.0.0.0")]
    addr: String,

    #[clap(short = 'p', long = "port", default_value = "3000")]
    port: u16,

    #[clap(long)]
    config: String,

    #[clap(long)]
    silent: bool,

    /// Maximum size of each log file in MB before rotation (default: 100)
    #[clap(long, default_value = "100")]
    log_max_size_mb: u64,

    /// Maximum number of rotated log files to keep (default: 10)
    #[clap(long, default_value = "10")]
    log_max_files: usize,

    /// Use JSON structured logging
    #[clap(long)]
    json: bool,

    /// Console log style: compact, pretty, or verbose (default: pretty)
    #[clap(long, default_value = "pretty")]
    log_style: String,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    Validate { configs: Vec<String> },
    Worker(WorkerArgs),
}

#[derive(clap::Parser, Debug)]
#[clap(name = "coach-server", about = "Speech coach streaming gateway")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

fn default_max_duration_s() -> u64 {
    300
}

fn default_connect_timeout_s() -> u64 {
    10
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StreamConfig {
    /// Upper bound on the lifetime of one analysis stream.
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { max_duration_s: default_max_duration_s() }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProxyConfig {
    /// Only the connect phase is bounded, event streams may stay open.
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { connect_timeout_s: default_connect_timeout_s() }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub log_dir: String,
    pub instance_name: String,
    pub backend_url: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn load<P: AsRef<std::path::Path>>(p: P) -> Result<Self> {
        let config = std::fs::read_to_string(p)?;
        Self::parse(&config)
    }

    fn parse(config: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(&utils::replace_env_vars(config))?;
        if let Ok(url) = std::env::var("BACKEND_URL") {
            if !url.is_empty() {
                config.backend_url = url;
            }
        }
        if let Ok(secs) = std::env::var("MAX_STREAM_DURATION_S") {
            config.stream.max_duration_s = secs.parse()?;
        }
        if config.backend_url.is_empty() {
            anyhow::bail!("backend_url must not be empty")
        }
        config.backend_url = config.backend_url.trim_end_matches('/').to_string();
        Ok(config)
    }
}

pub struct AppStateInner {
    config: Config,
    http: reqwest::Client,
    workflow: Arc<dyn workflow::WorkflowSource>,
    jobs: Arc<dyn voice_clone::JobStore>,
}

type AppState = Arc<AppStateInner>;

impl AppStateInner {
    fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.proxy.connect_timeout_s))
            .build()?;
        let workflow = Arc::new(workflow::HttpWorkflow::new(http.clone(), &config.backend_url));
        let jobs = Arc::new(voice_clone::BackendJobStore::new(http.clone(), &config.backend_url));
        Ok(Self { config, http, workflow, jobs })
    }

    #[cfg(test)]
    fn for_tests(backend_url: &str) -> Self {
        let config = Config {
            log_dir: String::new(),
            instance_name: "test".to_string(),
            backend_url: backend_url.to_string(),
            stream: StreamConfig::default(),
            proxy: ProxyConfig::default(),
        };
        Self::new(config).expect("test client")
    }

    #[cfg(test)]
    fn with_workflow(mut self, workflow: Arc<dyn workflow::WorkflowSource>) -> Self {
        self.workflow = workflow;
        self
    }

    #[cfg(test)]
    fn with_jobs(mut self, jobs: Arc<dyn voice_clone::JobStore>) -> Self {
        self.jobs = jobs;
        self
    }
}

fn router(state: AppState) -> axum::Router<()> {
    use axum::routing::{any, get, post};

    axum::Router::new()
        .route("/api/health", get(health_check))
        .route("/api/analyze", post(analyze::handler))
        .route("/api/voice-clone/status", get(voice_clone::handler))
        .route("/api/{*path}", any(proxy::handler))
        .route("/metrics", get(metrics))
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::request_id::SetRequestIdLayer::x_request_id(
                    tower_http::request_id::MakeRequestUuid,
                ))
                .layer(tower_http::trace::TraceLayer::new_for_http()),
        )
        .with_state(state)
}

/// Configuration for log rotation
struct LogConfig {
    log_dir: String,
    instance_name: String,
    log_level: String,
    silent: bool,
    max_size_mb: u64,
    max_files: usize,
    json: bool,
    log_style: logging::LogStyle,
}

fn tracing_init(config: LogConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use std::io::IsTerminal;
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::time::ChronoLocal;
    use tracing_subscriber::prelude::*;

    std::fs::create_dir_all(&config.log_dir)?;

    // log.instance, log.instance.1, log.instance.2, ...
    let log_path =
        std::path::Path::new(&config.log_dir).join(format!("log.{}", config.instance_name));

    // Rotate daily or when the file exceeds max_size_mb.
    let condition = RollingConditionBase::new().daily().max_size(config.max_size_mb * 1024 * 1024);
    let file_appender = RollingFileAppenderBase::new(log_path, condition, config.max_files)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::filter::LevelFilter::from_str(&config.log_level)?;
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    let file_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer.clone())
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_writer(non_blocking_file)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .event_format(
                tracing_subscriber::fmt::format()
                    .with_timer(timer.clone())
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .with_ansi(false),
            )
            .with_writer(non_blocking_file)
            .with_filter(filter)
            .boxed()
    };

    if config.silent {
        tracing_subscriber::registry().with(file_layer).init();
    } else {
        let console_layer = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_current_span(true)
                .with_target(true)
                .with_writer(std::io::stdout)
                .with_filter(filter)
                .boxed()
        } else {
            let formatter = logging::GatewayFormatter::new(timer, config.log_style)
                .with_ansi(std::io::stdout().is_terminal());
            tracing_subscriber::fmt::layer()
                .event_format(formatter)
                .with_writer(std::io::stdout)
                .with_filter(filter)
                .boxed()
        };
        tracing_subscriber::registry().with(file_layer).with(console_layer).init();
    }

    tracing::info!(
        log_dir = %config.log_dir,
        max_size_mb = config.max_size_mb,
        max_files = config.max_files,
        json = config.json,
        "logging initialized with rotation"
    );
    Ok(guard)
}

async fn metrics() -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    };
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

static SERVER_START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

fn init_server_start_time() {
    SERVER_START_TIME.get_or_init(std::time::Instant::now);
}

fn get_uptime_seconds() -> u64 {
    SERVER_START_TIME.get().map(|start| start.elapsed().as_secs()).unwrap_or(0)
}

#[derive(serde::Serialize, Debug)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

async fn health_check() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse { status: "ok", uptime_seconds: get_uptime_seconds() })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    // Exit explicitly so startup errors (e.g. port in use) are not hidden by
    // background tasks keeping the runtime alive.
    if let Err(err) = main_().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn main_() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = <Args as clap::Parser>::parse();
    match args.command {
        Command::Validate { configs } => {
            tracing_subscriber::fmt().init();
            for config in configs.iter() {
                let _ = Config::load(config)?;
                tracing::info!(?config, "loaded successfully")
            }
        }
        Command::Worker(args) => {
            let config = Config::load(&args.config)?;

            if std::env::var("RUST_LOG").is_err() {
                std::env::set_var("RUST_LOG", format!("{},hyper=info,mio=info", args.log_level))
            }
            let log_style = args.log_style.parse().unwrap_or_else(|e: String| {
                eprintln!("Warning: {e}, using 'pretty'");
                logging::LogStyle::Pretty
            });
            let log_config = LogConfig {
                log_dir: config.log_dir.clone(),
                instance_name: config.instance_name.clone(),
                log_level: args.log_level.clone(),
                silent: args.silent,
                max_size_mb: args.log_max_size_mb,
                max_files: args.log_max_files,
                json: args.json,
                log_style,
            };
            let _guard = tracing_init(log_config)?;

            tracing::info!(
                backend_url = %config.backend_url,
                max_stream_duration_s = config.stream.max_duration_s,
                connect_timeout_s = config.proxy.connect_timeout_s,
                "starting gateway"
            );
            let state = Arc::new(AppStateInner::new(config)?);
            init_server_start_time();
            let app = router(state);

            let sock_addr = std::net::SocketAddr::from((
                std::net::IpAddr::from_str(args.addr.as_str())
                    .unwrap_or(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
                args.port,
            ));
            tracing::info!("listening on {}", sock_addr);
            let listener = tokio::net::TcpListener::bind(sock_addr).await?;
            axum::serve(listener, app).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    // Env overrides are process-wide; tests touching them take this lock.
    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn bundled_config_parses() {
        let _lock = env_lock();
        std::env::remove_var("BACKEND_URL");
        std::env::remove_var("MAX_STREAM_DURATION_S");
        let config = Config::parse(include_str!("../configs/gateway.toml")).unwrap();
        assert_eq!(config.instance_name, "gateway");
        assert_eq!(config.backend_url, "http://localhost:8000");
        assert_eq!(config.stream.max_duration_s, 300);
        assert_eq!(config.proxy.connect_timeout_s, 10);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = env_lock();
        std::env::set_var("BACKEND_URL", "http://backend:9000/");
        std::env::set_var("MAX_STREAM_DURATION_S", "42");
        let config = Config::parse(
            "log_dir = \"/tmp/coach\"\ninstance_name = \"t\"\nbackend_url = \"http://x\"\n",
        );
        std::env::remove_var("BACKEND_URL");
        std::env::remove_var("MAX_STREAM_DURATION_S");
        let config = config.unwrap();
        assert_eq!(config.backend_url, "http://backend:9000");
        assert_eq!(config.stream.max_duration_s, 42);
    }

    #[test]
    fn missing_backend_url_is_rejected() {
        let _lock = env_lock();
        std::env::remove_var("BACKEND_URL");
        assert!(Config::parse("log_dir = \"x\"\ninstance_name = \"t\"\n").is_err());
        assert!(Config::parse("log_dir = \"x\"\ninstance_name = \"t\"\nbackend_url = \"\"\n").is_err());
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(Arc::new(AppStateInner::for_tests("http://127.0.0.1:9")));
        let resp = app.oneshot(Request::get("/api/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["status"], "ok");
        assert!(v["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        crate::metrics::analyze::SESSIONS.inc_by(0.0);
        let app = router(Arc::new(AppStateInner::for_tests("http://127.0.0.1:9")));
        let resp = app.oneshot(Request::get("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("analyze_sessions_total"));
    }
}
