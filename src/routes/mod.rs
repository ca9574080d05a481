use axum::extract::DefaultBodyLimit;
use axum::http::{self, Method};
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::channel;
use crate::state::AppState;

pub mod bolt12;
pub mod lnurl;
pub mod nwc;

/// Assembles the public router: registration surfaces, payer-facing bridge
/// endpoints and the wallet reply sink.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/lnurlpay/:identifier",
            post(lnurl::register).delete(lnurl::unregister),
        )
        .route("/lnurlpay/:identifier/recover", post(lnurl::recover))
        .route("/lnurlpay/:identifier/invoice", get(lnurl::handle_invoice))
        .route(
            "/lnurlpay/:identifier/:payment_hash",
            get(lnurl::handle_verify),
        )
        .route("/lnurlp/:identifier", get(lnurl::handle_info))
        .route("/.well-known/lnurlp/:identifier", get(lnurl::handle_info))
        .route(
            "/bolt12offer/:identifier",
            post(bolt12::register).delete(bolt12::unregister),
        )
        .route("/bolt12offer/:identifier/recover", post(bolt12::recover))
        .route("/nwc/:identifier", post(nwc::register).delete(nwc::unregister))
        .route("/response/:response_id", post(channel::handle_response))
        .layer(Extension(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ]),
        )
        .layer(DefaultBodyLimit::max(1_000_000)) // max 1mb body size
}
