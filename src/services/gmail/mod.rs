//! Gmail ingestion pipeline (C9, spec §4.9): OAuth lifecycle, metadata
//! sweep, two-stage classification, and batch attachment ingestion.

pub mod classify;
pub mod client;
pub mod ingest;
pub mod metadata;
pub mod oauth;

use std::sync::{Arc, RwLock};

use sqlx::PgPool;
use uuid::Uuid;

use crate::config::GmailConfig;
use crate::models::{BodyClassification, GmailMessageHeader, OAuthTokens, SelectedAttachment, SubjectClassification};
use crate::services::llm::{LlmClient, LlmEndpoint};
use crate::services::report_processor::ReportProcessor;
use crate::utils::{ApiError, ApiResult};
use client::GmailApiClient;
use oauth::GmailOAuth;

/// Process-wide token singleton (§5: "the OAuth token store (C9)" is one of
/// the two documented global caches, alongside the schema snapshot).
#[derive(Default)]
pub struct TokenStore {
    tokens: RwLock<Option<OAuthTokens>>,
}

impl TokenStore {
    pub fn set(&self, tokens: OAuthTokens) {
        *self.tokens.write().unwrap_or_else(|e| e.into_inner()) = Some(tokens);
    }

    pub fn get(&self) -> Option<OAuthTokens> {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct GmailService {
    oauth: GmailOAuth,
    gmail: Arc<dyn GmailApiClient>,
    llm: Arc<LlmClient>,
    llm_endpoint: LlmEndpoint,
    tokens: Arc<TokenStore>,
    config: GmailConfig,
}

impl GmailService {
    pub fn new(
        config: GmailConfig,
        gmail: Arc<dyn GmailApiClient>,
        llm: Arc<LlmClient>,
        llm_endpoint: LlmEndpoint,
    ) -> ApiResult<Self> {
        let oauth = GmailOAuth::new(&config.client_id, &config.client_secret, &config.redirect_uri)?;
        Ok(Self { oauth, gmail, llm, llm_endpoint, tokens: Arc::new(TokenStore::default()), config })
    }

    pub fn authorize_url(&self) -> (String, String) {
        self.oauth.authorize_url()
    }

    pub async fn handle_oauth_callback(&self, code: &str, state: &str) -> ApiResult<()> {
        let tokens = self.oauth.exchange_code(code, state).await?;
        self.tokens.set(tokens);
        Ok(())
    }

    /// Returns a live access token, refreshing first if the current one is
    /// within 60 seconds of expiry (§4.9 Stage 0 token-refresh listener).
    async fn live_access_token(&self) -> ApiResult<String> {
        let current = self
            .tokens
            .get()
            .ok_or_else(|| ApiError::unauthorized("gmail account not connected"))?;

        if current.expires_at > chrono::Utc::now() + chrono::Duration::seconds(60) {
            return Ok(current.access_token);
        }

        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| ApiError::unauthorized("no refresh token on file, reauthorize"))?;
        let refreshed = self.oauth.refresh(&refresh_token).await?;
        self.tokens.set(refreshed.clone());
        Ok(refreshed.access_token)
    }

    /// Stages 1+2: sweep the inbox and run both classifiers, returning the
    /// per-message body classification for whichever headers cleared the
    /// subject filter.
    pub async fn sweep_and_classify(&self) -> ApiResult<Vec<BodyClassification>> {
        let access_token = self.live_access_token().await?;

        let headers = metadata::sweep_inbox(
            &self.gmail,
            &access_token,
            self.config.max_emails,
            self.config.concurrency_limit,
            |_batch| {},
        )
        .await?;

        let subject_results: Vec<SubjectClassification> =
            classify::subject_classify(&self.llm, &self.llm_endpoint, &headers).await;

        let candidates: Vec<GmailMessageHeader> = headers
            .into_iter()
            .filter(|h| {
                subject_results
                    .iter()
                    .any(|r| r.id == h.message_id && r.is_lab_likely)
            })
            .collect();

        Ok(classify::body_classify(
            &self.gmail,
            &self.llm,
            &self.llm_endpoint,
            &access_token,
            &candidates,
            self.config.max_body_chars,
        )
        .await)
    }

    pub async fn ingest_selected(
        &self,
        pool: &PgPool,
        report_processor: &Arc<ReportProcessor>,
        patient_id: Uuid,
        selections: &[SelectedAttachment],
    ) -> ApiResult<Vec<crate::models::AttachmentIngestResult>> {
        let access_token = self.live_access_token().await?;
        Ok(ingest::ingest_selected_attachments(
            pool,
            &self.gmail,
            report_processor,
            &access_token,
            patient_id,
            selections,
        )
        .await)
    }
}
