//! GitHub OAuth callback.
//!
//! The consent web flow itself lives outside this service; this endpoint
//! only redeems the authorization code, persists the installation-shaped
//! record, and bounces the browser to the success page.

use {
    axum::{
        extract::{Query, State},
        http::StatusCode,
        response::{Html, IntoResponse, Redirect, Response},
    },
    chrono::Utc,
    serde::Deserialize,
    tracing::{info, warn},
};

use {
    crate::state::AppState,
    dockyard_github::exchange_code,
    dockyard_registry::{GithubInstallation, Registry as _, model::User},
};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    #[serde(default)]
    pub state: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "GitHub OAuth is not configured on this server",
        )
            .into_response();
    };

    let token = match exchange_code(oauth, &query.code).await {
        Ok(token) => token,
        Err(e) => {
            warn!(error = %e, "oauth code exchange failed");
            return (
                StatusCode::BAD_REQUEST,
                "code exchange failed; restart the authorization flow",
            )
                .into_response();
        },
    };

    // Ensure a user exists for this login, then upsert the installation.
    let user = match state
        .registry
        .get_user_by_username(&token.account_login)
        .await
    {
        Ok(Some(user)) => user,
        Ok(None) => {
            let user = User::new(&token.account_login, "");
            if let Err(e) = state.registry.register_user(user.clone()).await {
                warn!(error = %e, "user auto-registration failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            user
        },
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        },
    };

    let now = Utc::now();
    let installation = GithubInstallation {
        // OAuth-minted records are not app installations; the prefix keeps
        // them out of the app-token refresh path.
        id: format!("oauth:{}", token.account_id),
        user_id: user.id.clone(),
        account_id: token.account_id,
        account_login: token.account_login.clone(),
        access_token: token.access_token.clone(),
        token_expires_at: token.expires_at,
        repository_scope: None,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = state.registry.upsert_installation(installation).await {
        warn!(error = %e, "installation upsert failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    info!(
        user = %user.id,
        login = %token.account_login,
        state = query.state.as_deref().unwrap_or("-"),
        "github identity linked"
    );
    Redirect::to("/auth/success").into_response()
}

pub async fn success() -> impl IntoResponse {
    Html(
        "<!doctype html><title>dockyard</title>\
         <p>GitHub account linked. You can close this tab and retry your request.</p>",
    )
}
