use crate::config::Config;
use crate::store::{CalendarToken, Store};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

/// Google Calendar capability with a per-organization OAuth token
/// lifecycle. Event creation is fire-and-forget for callers: failures
/// are logged, never propagated into ticket operations.
#[derive(Clone)]
pub struct CalendarClient {
    http: reqwest::Client,
    store: Store,
    oauth: Option<OAuthSettings>,
}

#[derive(Debug, Clone)]
struct OAuthSettings {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
}

impl CalendarClient {
    pub fn new(config: &Config, store: Store) -> Self {
        let oauth = match (&config.google_client_id, &config.google_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(OAuthSettings {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                redirect_uri: config.google_redirect_uri.clone().unwrap_or_default(),
            }),
            _ => {
                info!("Google Calendar credentials not configured");
                None
            }
        };

        Self {
            http: reqwest::Client::new(),
            store,
            oauth,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.oauth.is_some()
    }

    /// Consent URL for the per-organization OAuth handshake.
    pub fn auth_url(&self, state: &str) -> Option<String> {
        let oauth = self.oauth.as_ref()?;
        Some(format!(
            "{AUTH_URL}?client_id={}&redirect_uri={}&response_type=code&scope={CALENDAR_SCOPE}&access_type=offline&prompt=consent&state={state}",
            oauth.client_id, oauth.redirect_uri,
        ))
    }

    pub async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenResponse> {
        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("OAuth not configured"))?;

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
                ("redirect_uri", &oauth.redirect_uri),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    pub async fn save_token(&self, org_id: i64, token: TokenResponse) -> anyhow::Result<()> {
        let expiry = token
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));
        self.store
            .save_calendar_token(&CalendarToken {
                organization_id: org_id,
                access_token: token.access_token,
                refresh_token: token.refresh_token,
                token_type: token.token_type,
                expiry,
            })
            .await?;
        Ok(())
    }

    /// Create a calendar event for the organization. Refreshes the
    /// stored access token first when it has expired.
    pub async fn create_event(
        &self,
        org_id: i64,
        title: &str,
        description: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let access_token = self.access_token(org_id).await?;

        let calendar_id = match self.store.organization_by_id(org_id).await? {
            Some(org) => org
                .google_calendar_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| "primary".to_string()),
            None => "primary".to_string(),
        };

        let event = json!({
            "summary": title,
            "description": description,
            "start": { "dateTime": start.to_rfc3339(), "timeZone": "UTC" },
            "end": { "dateTime": end.to_rfc3339(), "timeZone": "UTC" },
        });

        self.http
            .post(format!(
                "https://www.googleapis.com/calendar/v3/calendars/{calendar_id}/events"
            ))
            .bearer_auth(access_token)
            .json(&event)
            .send()
            .await?
            .error_for_status()?;

        info!(org_id, title, "calendar event created");
        Ok(())
    }

    /// Same as [`create_event`](Self::create_event) but swallows the
    /// error; the calling operation must not fail on a calendar hiccup.
    pub async fn create_event_best_effort(
        &self,
        org_id: i64,
        title: &str,
        description: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) {
        if !self.is_configured() {
            return;
        }
        if let Err(e) = self
            .create_event(org_id, title, description, start, end)
            .await
        {
            warn!(org_id, "calendar event creation failed: {e}");
        }
    }

    async fn access_token(&self, org_id: i64) -> anyhow::Result<String> {
        let token = self
            .store
            .calendar_token(org_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no calendar token for organization {org_id}"))?;

        let expired = token.expiry.is_some_and(|expiry| expiry <= Utc::now());
        if !expired {
            return Ok(token.access_token);
        }

        let oauth = self
            .oauth
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("OAuth not configured"))?;
        let refresh_token = token
            .refresh_token
            .ok_or_else(|| anyhow::anyhow!("token expired and no refresh token stored"))?;

        let refreshed: TokenResponse = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("refresh_token", refresh_token.as_str()),
                ("client_id", &oauth.client_id),
                ("client_secret", &oauth.client_secret),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let access_token = refreshed.access_token.clone();
        self.save_token(org_id, refreshed).await?;
        Ok(access_token)
    }
}
