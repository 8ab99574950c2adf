use axum::{
    Router,
    middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use vitallab_core::config::Config;
use vitallab_core::db::Db;
use vitallab_core::models;
use vitallab_core::services::gmail::client::HttpGmailClient;
use vitallab_core::services::job_fabric::SessionSweepTask;
use vitallab_core::services::llm::LlmClient;
use vitallab_core::services::vision::LlmVisionExtractor;
use vitallab_core::services::{AnalyteMapper, GmailService, JobRegistry, ReportProcessor, SchemaCache, UnitNormalizer, UserService};
use vitallab_core::utils::{JwtUtil, ScheduledExecutor};
use vitallab_core::{AgenticSession, AppState, handlers, middleware};

const SCHEMA_SCHEMAS: &[&str] = &["public"];

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::me,

        handlers::patients::list_patients,
        handlers::patients::find_or_create_patient,

        handlers::reports::upload_report,

        handlers::jobs::list_jobs,
        handlers::jobs::get_job,
        handlers::jobs::cancel_job,

        handlers::catalog_admin::list_pending_analytes,
        handlers::catalog_admin::approve_pending_analyte,
        handlers::catalog_admin::list_match_reviews,
        handlers::catalog_admin::skip_match_review,
        handlers::catalog_admin::list_unit_reviews,
        handlers::catalog_admin::resolve_unit_review,

        handlers::gmail::authorize,
        handlers::gmail::oauth_callback,
        handlers::gmail::sweep_and_classify,
        handlers::gmail::ingest_selected,

        handlers::query::ask,
    ),
    components(
        schemas(
            models::RegisterRequest,
            models::LoginRequest,
            models::LoginResponse,
            models::UserResponse,
            models::Patient,
            models::PatientResponse,
            handlers::patients::CreatePatientRequest,
            handlers::reports::UploadReportResponse,
            models::Job,
            models::JobStatus,
            models::JobType,
            handlers::jobs::CancelJobResponse,
            models::PendingAnalyte,
            models::ApproveAnalyteRequest,
            models::ApproveAnalyteResponse,
            models::MatchReview,
            models::MatchCandidate,
            models::UnitReview,
            handlers::catalog_admin::ResolveReviewResponse,
            handlers::gmail::AuthorizeUrlResponse,
            models::BodyClassification,
            models::SubjectClassification,
            models::GmailMessageHeader,
            models::AttachmentMetadata,
            models::SelectAttachmentsRequest,
            models::SelectedAttachment,
            models::AttachmentIngestResult,
            models::AskQuestionRequest,
            models::AskQuestionResponse,
        )
    ),
    tags(
        (name = "Auth", description = "Registration, login, and identity"),
        (name = "Patients", description = "Patient lookup and creation"),
        (name = "Reports", description = "Lab report upload and ingestion"),
        (name = "Jobs", description = "Background job status and cancellation"),
        (name = "Catalog admin", description = "Analyte and unit catalog maintenance"),
        (name = "Gmail", description = "Gmail-sourced report ingestion"),
        (name = "Query", description = "Conversational SQL generation"),
    ),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.as_mut().unwrap();
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(utoipa::openapi::security::Http::new(
                utoipa::openapi::security::HttpAuthScheme::Bearer,
            )),
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("vitallab.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("vitallab starting up");
    tracing::info!("configuration loaded successfully");

    let db = Db::connect(&config.database.url, &config.database.admin_url, config.database.max_connections).await?;
    db.migrate().await?;
    tracing::info!("database pools connected and migrated");

    let jwt_util = Arc::new(JwtUtil::new(&config.auth.jwt_secret, config.auth.jwt_expires_in_secs));
    let user_service = Arc::new(UserService::new(db.admin.clone(), Arc::clone(&jwt_util)));

    let llm = Arc::new(LlmClient::new());

    let schema_cache = Arc::new(SchemaCache::default());
    schema_cache.refresh(&db.admin, SCHEMA_SCHEMAS).await?;
    tracing::info!("schema snapshot loaded");

    let unit_normalizer = Arc::new(UnitNormalizer::new(
        db.clone(),
        Arc::clone(&llm),
        config.llm.chat_endpoint(),
        config.unit_normalization.clone(),
    ));

    let analyte_mapper = Arc::new(AnalyteMapper::new(
        db.clone(),
        Arc::clone(&llm),
        config.llm.chat_endpoint(),
        config.mapping.clone(),
    ));

    let vision = Arc::new(LlmVisionExtractor::new(config.llm.vision_endpoint()));
    let report_processor =
        Arc::new(ReportProcessor::new(db.clone(), vision, Arc::clone(&unit_normalizer), Arc::clone(&analyte_mapper)));

    let agentic = Arc::new(AgenticSession::new(
        db.clone(),
        Arc::clone(&llm),
        config.llm.chat_endpoint(),
        Arc::clone(&schema_cache),
        config.agentic.clone(),
    ));

    let gmail_client = Arc::new(HttpGmailClient::new());
    let gmail = Arc::new(GmailService::new(
        config.gmail.clone(),
        gmail_client,
        Arc::clone(&llm),
        config.llm.chat_endpoint(),
    )?);

    let jobs = JobRegistry::default();

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        db: db.clone(),
        jwt_util: Arc::clone(&jwt_util),
        user_service,
        schema_cache,
        unit_normalizer,
        analyte_mapper,
        report_processor,
        agentic,
        gmail,
        jobs,
    });

    let sweep_interval = std::time::Duration::from_secs(config.jobs.session_sweep_interval_secs);
    let sweep_task = SessionSweepTask::new(db.admin.clone());
    tokio::spawn(async move {
        ScheduledExecutor::new("session-sweep", sweep_interval).start(sweep_task).await;
    });
    tracing::info!(interval_secs = config.jobs.session_sweep_interval_secs, "session sweep task started");

    let auth_state = middleware::AuthState { jwt_util: Arc::clone(&app_state.jwt_util) };

    let public_routes = Router::new()
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/gmail/oauth/callback", get(handlers::gmail::oauth_callback))
        .with_state(Arc::clone(&app_state));

    let protected_routes = Router::new()
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/patients",
            get(handlers::patients::list_patients).post(handlers::patients::find_or_create_patient),
        )
        .route("/api/reports", post(handlers::reports::upload_report))
        .route("/api/jobs", get(handlers::jobs::list_jobs))
        .route("/api/jobs/:id", get(handlers::jobs::get_job))
        .route("/api/jobs/:id/cancel", post(handlers::jobs::cancel_job))
        .route("/api/gmail/oauth/authorize", get(handlers::gmail::authorize))
        .route("/api/gmail/sweep", post(handlers::gmail::sweep_and_classify))
        .route("/api/gmail/ingest", post(handlers::gmail::ingest_selected))
        .route("/api/query/ask", post(handlers::query::ask))
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn_with_state(auth_state.clone(), middleware::auth_middleware));

    let admin_routes = Router::new()
        .route("/api/admin/pending-analytes", get(handlers::catalog_admin::list_pending_analytes))
        .route(
            "/api/admin/pending-analytes/:code/approve",
            post(handlers::catalog_admin::approve_pending_analyte),
        )
        .route("/api/admin/match-reviews", get(handlers::catalog_admin::list_match_reviews))
        .route("/api/admin/match-reviews/:id/skip", post(handlers::catalog_admin::skip_match_review))
        .route("/api/admin/unit-reviews", get(handlers::catalog_admin::list_unit_reviews))
        .route("/api/admin/unit-reviews/:id/resolve", post(handlers::catalog_admin::resolve_unit_review))
        .with_state(Arc::clone(&app_state))
        .layer(axum_middleware::from_fn(middleware::require_admin))
        .layer(axum_middleware::from_fn_with_state(auth_state, middleware::auth_middleware));

    let health_routes = Router::new().route("/health", get(health_check)).route("/ready", get(ready_check));

    let app = Router::new()
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on http://{}", addr);
    tracing::info!("api documentation available at http://{}/api-docs", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}
