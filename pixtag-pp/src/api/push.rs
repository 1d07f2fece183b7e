//! Trigger endpoint: select unclassified images and dispatch them

use axum::{body::Bytes, extract::State, Json};
use pixtag_common::selector::{plan_dispatch, ProductFilter, SelectorOptions};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{ApiError, ApiResult, AppState};

/// Trigger request body. Every field is optional; an empty body is accepted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushRequest {
    /// Maximum number of products to dispatch (configured default if absent)
    pub product_limit: Option<usize>,
    pub category_prefix: Option<String>,
    pub brands: Option<Vec<String>>,
    pub offer_ids: Option<Vec<String>>,
    pub exclude_classified: Option<bool>,
}

impl PushRequest {
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    /// Products selected after filtering
    pub selected: usize,
    /// Tasks enqueued (one per product)
    pub dispatched: usize,
    /// Image links covered by the dispatched tasks
    pub images: usize,
}

/// POST / and POST /push
pub async fn push_products(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<PushResponse>> {
    let request = PushRequest::parse(&body)?;
    let config = &state.config;

    let options = SelectorOptions {
        exclude_classified: request
            .exclude_classified
            .unwrap_or(config.dispatch.exclude_classified),
    };
    let filter = ProductFilter {
        category_prefix: request.category_prefix,
        brands: request.brands,
        offer_ids: request.offer_ids,
        limit: Some(request.product_limit.unwrap_or(config.dispatch.product_limit)),
    };

    let result = async {
        let planned = plan_dispatch(
            &state.db,
            &config.catalog.table,
            &config.results.table,
            &options,
            &filter,
        )
        .await?;
        let dispatched = state
            .dispatcher
            .dispatch(&planned, &config.dispatch.worker_url)
            .await?;

        Ok::<_, pixtag_common::Error>(PushResponse {
            selected: planned.len(),
            dispatched,
            images: planned.iter().map(|p| p.images.len()).sum(),
        })
    }
    .await;

    match result {
        Ok(response) => {
            info!(
                selected = response.selected,
                dispatched = response.dispatched,
                images = response.images,
                "Push cycle complete"
            );
            Ok(Json(response))
        }
        Err(e) => {
            error!(error = %e, "Push cycle failed");
            state.record_error(e.to_string()).await;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_uses_defaults() {
        let request = PushRequest::parse(b"").unwrap();
        assert!(request.product_limit.is_none());
        assert!(request.brands.is_none());

        let request = PushRequest::parse(b"  \n").unwrap();
        assert!(request.exclude_classified.is_none());
    }

    #[test]
    fn test_parses_filters() {
        let request = PushRequest::parse(
            br#"{"product_limit": 3, "category_prefix": "Home", "brands": ["Acme"]}"#,
        )
        .unwrap();
        assert_eq!(request.product_limit, Some(3));
        assert_eq!(request.category_prefix.as_deref(), Some("Home"));
        assert_eq!(request.brands, Some(vec!["Acme".to_string()]));
    }

    #[test]
    fn test_rejects_bad_body() {
        assert!(matches!(
            PushRequest::parse(br#"{"product_limit": -1}"#),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            PushRequest::parse(br#"{"limit": 5}"#),
            Err(ApiError::BadRequest(_))
        ));
    }
}
