use crate::handlers::common::success_response;
use crate::{
    errors::ServiceError,
    services::carts::{AddItemInput, ResolvedCart},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COOKIE: &str = "cart_session";
const USER_HEADER: &str = "x-user-id";
const SESSION_HEADER: &str = "x-cart-session";

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_cart))
        .route("/items", post(add_item))
        .route("/items/:product_id", put(update_item))
        .route("/items/:product_id", delete(remove_item))
}

/// Caller identity taken from headers: an authenticated user id and/or a
/// guest session carried by header or cookie.
fn identity(headers: &HeaderMap) -> Result<(Option<Uuid>, Option<String>), ServiceError> {
    let user_id = match headers.get(USER_HEADER) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| ServiceError::ValidationError("Invalid x-user-id header".into()))?;
            Some(Uuid::parse_str(raw).map_err(|_| {
                ServiceError::ValidationError("x-user-id must be a UUID".to_string())
            })?)
        }
        None => None,
    };

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| session_from_cookie(headers));

    Ok((user_id, session_id))
}

fn session_from_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Attaches the session cookie when the resolution minted a new session,
/// so the guest keeps the same cart on their next request.
fn with_session_cookie(
    resolved: &ResolvedCart,
    ttl_secs: u64,
    response: Response,
) -> Result<Response, ServiceError> {
    if !resolved.is_new_session {
        return Ok(response);
    }
    let Some(ref sid) = resolved.session_id else {
        return Ok(response);
    };

    let cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        SESSION_COOKIE, sid, ttl_secs
    );
    let value = HeaderValue::from_str(&cookie)
        .map_err(|_| ServiceError::InternalError("invalid session cookie value".into()))?;

    let mut response = response;
    response.headers_mut().insert(header::SET_COOKIE, value);
    Ok(response)
}

/// Get (or lazily create) the caller's cart
async fn get_cart(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let (user_id, session_id) = identity(&headers)?;
    let resolved = state.services.carts.resolve(user_id, session_id).await?;

    let response = success_response(&resolved);
    with_session_cookie(&resolved, state.config.cart_session_ttl_secs, response)
}

#[derive(Debug, Deserialize)]
struct AddItemRequest {
    product_id: Uuid,
    quantity: i32,
}

/// Add an item to the caller's cart
async fn add_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let (user_id, session_id) = identity(&headers)?;
    let resolved = state.services.carts.resolve(user_id, session_id).await?;

    state
        .services
        .carts
        .add_item(
            resolved.cart.id,
            AddItemInput {
                product_id: payload.product_id,
                quantity: payload.quantity,
            },
        )
        .await?;

    let resolved = state.services.carts.get_cart(resolved.cart.id).await?;
    let response = success_response(&resolved);
    with_session_cookie(&resolved, state.config.cart_session_ttl_secs, response)
}

#[derive(Debug, Deserialize)]
struct UpdateItemRequest {
    quantity: i32,
}

/// Set an item's quantity; zero removes the line
async fn update_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let (user_id, session_id) = identity(&headers)?;
    let resolved = state.services.carts.resolve(user_id, session_id).await?;

    state
        .services
        .carts
        .update_item_quantity(resolved.cart.id, product_id, payload.quantity)
        .await?;

    let resolved = state.services.carts.get_cart(resolved.cart.id).await?;
    Ok(success_response(&resolved))
}

/// Remove an item from the caller's cart
async fn remove_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let (user_id, session_id) = identity(&headers)?;
    let resolved = state.services.carts.resolve(user_id, session_id).await?;

    state
        .services
        .carts
        .remove_item(resolved.cart.id, product_id)
        .await?;

    let resolved = state.services.carts.get_cart(resolved.cart.id).await?;
    Ok(success_response(&resolved))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_is_parsed_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; cart_session=sess_abc; theme=dark"),
        );
        assert_eq!(session_from_cookie(&headers).as_deref(), Some("sess_abc"));
    }

    #[test]
    fn missing_cookie_yields_none() {
        let headers = HeaderMap::new();
        assert!(session_from_cookie(&headers).is_none());
    }

    #[test]
    fn header_session_takes_precedence_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("sess_hdr"));
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("cart_session=sess_cookie"),
        );
        let (_, session) = identity(&headers).unwrap();
        assert_eq!(session.as_deref(), Some("sess_hdr"));
    }

    #[test]
    fn malformed_user_id_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(identity(&headers).is_err());
    }
}
