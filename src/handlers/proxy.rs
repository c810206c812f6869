use axum::extract::{Request, State};
use axum::response::Response;

use crate::state::GatewayState;

/// Fallback handler: every path not served locally goes through the
/// dispatcher.
pub async fn proxy(State(state): State<GatewayState>, request: Request) -> Response {
    state.dispatcher.dispatch(request).await
}
