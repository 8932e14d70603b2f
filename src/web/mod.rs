use crate::calendar::CalendarClient;
use crate::correlate::Correlator;
use crate::error::Error;
use crate::interface::telegram::Notifier;
use crate::lifecycle::TicketLifecycle;
use crate::models::{Role, TicketStatus};
use crate::policy;
use crate::session::{verify_password, Session, SessionManager};
use crate::store::Store;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

const SESSION_COOKIE: &str = "session";
const SESSION_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Everything the handlers need. Role and organization come only from
/// the validated session; client-supplied fields are never trusted.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub sessions: SessionManager,
    pub correlator: Correlator,
    pub lifecycle: TicketLifecycle,
    pub calendar: CalendarClient,
    pub notifier: Option<Notifier>,
    /// Pending OAuth states, mapping the CSRF token we issued to the
    /// organization that started the handshake.
    pub oauth_states: Arc<Mutex<HashMap<String, i64>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::to("/dashboard") }))
        .route("/dashboard", get(dashboard))
        .route("/ticket/:id", get(ticket_detail))
        .route("/ticket/message", post(add_message))
        .route("/ticket/status", post(update_status))
        .route("/ticket/assign", post(assign_ticket))
        .route("/auth/google", get(google_auth))
        .route("/auth/google/callback", get(google_callback))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ))
        .route("/login", get(login_page).post(login))
        .route("/logout", get(logout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            Error::CorrelationMiss => (StatusCode::NOT_FOUND, self.to_string()),
            Error::ExpiredSession => {
                return Redirect::to("/login").into_response();
            }
            Error::AccessDenied => (StatusCode::FORBIDDEN, self.to_string()),
            Error::InvalidTransition { .. } => (StatusCode::FORBIDDEN, self.to_string()),
            Error::Store(e) => {
                error!("store error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Pull the session token out of the Cookie header.
fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let session = session_token(request.headers())
        .and_then(|token| state.sessions.validate(&token).ok());

    match session {
        Some(session) => {
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        None => Redirect::to("/login").into_response(),
    }
}

async fn login_page() -> impl IntoResponse {
    Json(json!({ "message": "POST email and password to log in" }))
}

#[derive(Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Response, Error> {
    let invalid = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid email or password" })),
        )
            .into_response()
    };

    if form.email.is_empty() || form.password.is_empty() {
        return Ok(invalid());
    }

    let Some(user) = state.store.user_by_email(&form.email).await? else {
        return Ok(invalid());
    };
    let Some(hash) = user.password_hash.as_deref() else {
        return Ok(invalid());
    };
    if !verify_password(&form.password, hash) {
        return Ok(invalid());
    }
    if !user.is_active {
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "account is deactivated" })),
        )
            .into_response());
    }

    let token = state
        .sessions
        .create(user.id, user.organization_id, user.role);

    let cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={SESSION_MAX_AGE_SECS}"
    );
    let mut response = Redirect::to("/dashboard").into_response();
    // Tokens are hex, so the cookie is always a valid header value.
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.sessions.destroy(&token);
    }

    let mut response = Redirect::to("/login").into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_static("session=; Path=/; HttpOnly; Max-Age=0"),
    );
    response
}

#[derive(Deserialize)]
struct DashboardQuery {
    status: Option<String>,
}

async fn dashboard(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<DashboardQuery>,
) -> Result<Response, Error> {
    let filter = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => match raw.parse::<TicketStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                return Ok((StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response())
            }
        },
    };

    let mut tickets = state
        .store
        .tickets_by_organization(session.organization_id, filter)
        .await?;

    // Customers only see their own tickets on the dashboard.
    if !session.role.can_view_any_ticket() {
        tickets.retain(|t| t.customer_id == Some(session.user_id));
    }

    Ok(Json(json!({
        "tickets": tickets,
        "status_filter": query.status.unwrap_or_else(|| "all".into()),
        "role": session.role,
    }))
    .into_response())
}

async fn ticket_detail(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<i64>,
) -> Result<Response, Error> {
    let ticket = state
        .store
        .ticket_by_id(id)
        .await?
        .ok_or(Error::NotFound("ticket"))?;
    policy::authorize_view(&session, &ticket)?;

    let messages = state.store.messages_by_ticket(ticket.id).await?;
    let users = state
        .store
        .users_by_organization(session.organization_id)
        .await?;

    Ok(Json(json!({
        "ticket": ticket,
        "messages": messages,
        "users": users,
        "role": session.role,
    }))
    .into_response())
}

#[derive(Deserialize)]
struct MessageForm {
    ticket_id: i64,
    content: String,
}

async fn add_message(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Form(form): Form<MessageForm>,
) -> Result<Response, Error> {
    if form.content.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "content is required" })),
        )
            .into_response());
    }

    let ticket = state
        .store
        .ticket_by_id(form.ticket_id)
        .await?
        .ok_or(Error::NotFound("ticket"))?;
    policy::authorize_view(&session, &ticket)?;

    state
        .correlator
        .dashboard_message(&ticket, session.user_id, session.role, &form.content)
        .await?;

    // Push the reply out to the customer's chat. Best effort: the
    // timeline entry above is already committed.
    if session.role != Role::Customer {
        if let Some(notifier) = &state.notifier {
            let text = format!("New message on ticket #{}:\n\n{}", ticket.id, form.content);
            notifier.notify_ticket(&ticket, &text, false).await;
        }
    }

    Ok(Redirect::to(&format!("/ticket/{}", ticket.id)).into_response())
}

#[derive(Deserialize)]
struct StatusForm {
    ticket_id: i64,
    status: String,
}

async fn update_status(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Form(form): Form<StatusForm>,
) -> Result<Response, Error> {
    let new_status = match form.status.parse::<TicketStatus>() {
        Ok(status) => status,
        Err(e) => {
            return Ok((StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response())
        }
    };

    let ticket = state
        .store
        .ticket_by_id(form.ticket_id)
        .await?
        .ok_or(Error::NotFound("ticket"))?;
    policy::authorize_set_status(&session, &ticket)?;

    let updated = state.lifecycle.set_status(&ticket, new_status).await?;

    // Resolutions get a follow-up slot on the organization's calendar.
    // Fire-and-forget: a calendar hiccup never fails the transition.
    if updated.status == TicketStatus::Resolved {
        let calendar = state.calendar.clone();
        let (org_id, ticket_id, title) = (updated.organization_id, updated.id, updated.title.clone());
        tokio::spawn(async move {
            let start = chrono::Utc::now() + chrono::Duration::days(1);
            calendar
                .create_event_best_effort(
                    org_id,
                    &format!("Follow up on ticket #{ticket_id}"),
                    &title,
                    start,
                    start + chrono::Duration::minutes(30),
                )
                .await;
        });
    }

    if let Some(notifier) = &state.notifier {
        let text = format!(
            "Ticket #{} status changed to {}.",
            updated.id, updated.status
        );
        notifier.notify_ticket(&updated, &text, true).await;
    }

    Ok(Redirect::to(&format!("/ticket/{}", ticket.id)).into_response())
}

#[derive(Deserialize)]
struct AssignForm {
    ticket_id: i64,
    agent_id: i64,
}

async fn assign_ticket(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Form(form): Form<AssignForm>,
) -> Result<Response, Error> {
    let ticket = state
        .store
        .ticket_by_id(form.ticket_id)
        .await?
        .ok_or(Error::NotFound("ticket"))?;
    policy::authorize_assign(&session, &ticket)?;

    // The assignee must be an agent or admin of the same organization.
    let agent = state
        .store
        .user_by_id(form.agent_id)
        .await?
        .ok_or(Error::NotFound("agent"))?;
    if agent.organization_id != session.organization_id || !agent.role.can_set_status() {
        return Err(Error::AccessDenied);
    }

    state.lifecycle.assign(&ticket, agent.id).await?;

    Ok(Redirect::to(&format!("/ticket/{}", ticket.id)).into_response())
}

async fn google_auth(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response, Error> {
    if session.role != Role::Admin {
        return Err(Error::AccessDenied);
    }

    let csrf = Uuid::new_v4().to_string();
    let Some(url) = state.calendar.auth_url(&csrf) else {
        return Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Google Calendar not configured" })),
        )
            .into_response());
    };

    state
        .oauth_states
        .lock()
        .unwrap()
        .insert(csrf, session.organization_id);

    Ok(Redirect::to(&url).into_response())
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

async fn google_callback(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, Error> {
    let (Some(code), Some(csrf)) = (query.code, query.state) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "authorization code not provided" })),
        )
            .into_response());
    };

    // The state must be one we issued, for this organization.
    let org_id = state.oauth_states.lock().unwrap().remove(&csrf);
    if org_id != Some(session.organization_id) {
        return Err(Error::AccessDenied);
    }

    let token = state.calendar.exchange_code(&code).await.map_err(|e| {
        error!("OAuth code exchange failed: {e}");
        Error::AccessDenied
    })?;
    state
        .calendar
        .save_token(session.organization_id, token)
        .await
        .map_err(|e| {
            error!("failed to save calendar token: {e}");
            Error::NotFound("organization")
        })?;

    Ok(Redirect::to("/dashboard").into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_is_parsed_from_the_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc123; lang=en"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("abc123"));

        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(session_token(&headers), None);

        assert_eq!(session_token(&HeaderMap::new()), None);
    }
}
