//! Model Invoker
//!
//! One multimodal call per task: every fetched image of the product plus a
//! text prompt, constrained to return one structured record per image in
//! input order.

mod fake;
mod gemini;

pub use fake::FakeInvoker;
pub use gemini::GeminiInvoker;

use async_trait::async_trait;
use pixtag_common::config::ModelConfig;
use pixtag_common::ClassificationTask;
use serde_json::Value;
use std::fmt;

use crate::error::ModelError;

/// Image bytes sent inline with the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Images in prompt order; image `i` is labelled `image{i}` in the prompt
    pub images: Vec<InlineImage>,
    pub prompt: String,
    /// Structured-output constraint from the compiled schema
    pub response_schema: Value,
}

#[async_trait]
pub trait ModelInvoker: Send + Sync + fmt::Debug {
    /// Run the request and return the parsed JSON response
    async fn invoke(&self, request: &ModelRequest) -> Result<Value, ModelError>;

    fn model_name(&self) -> &str;
}

/// Build the text part of the request.
///
/// Image labels come first so the model can refer to each image by position,
/// then the prompt text, then the product title and category when present.
pub fn compose_prompt(prompt_text: &str, task: &ClassificationTask, image_count: usize) -> String {
    let mut lines: Vec<String> = (0..image_count).map(|i| format!("image{}", i)).collect();
    lines.push(prompt_text.to_string());

    let product = &task.product;
    if !product.title.is_empty() {
        lines.push(format!("The product showcased by the images is: {}", product.title));
    }
    if let Some(product_type) = product.product_type.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!(
            "The category of the product shown in the images is: {}",
            product_type
        ));
    }

    lines.join("\n")
}

/// Gemini invoker for `config`
pub fn create_invoker(config: &ModelConfig) -> Result<Box<dyn ModelInvoker>, ModelError> {
    Ok(Box::new(GeminiInvoker::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixtag_common::Product;

    fn task(title: &str, product_type: Option<&str>) -> ClassificationTask {
        ClassificationTask {
            product: Product {
                offer_id: "o1".to_string(),
                merchant_id: 1,
                aggregator_id: 2,
                title: title.to_string(),
                product_type: product_type.map(str::to_string),
                brand: None,
                image_link: None,
                additional_image_links: vec![],
            },
        }
    }

    #[test]
    fn test_prompt_layout() {
        let prompt = compose_prompt("Classify each image.", &task("Oak Chair", Some("Home > Chairs")), 2);
        assert_eq!(
            prompt,
            "image0\nimage1\nClassify each image.\n\
             The product showcased by the images is: Oak Chair\n\
             The category of the product shown in the images is: Home > Chairs"
        );
    }

    #[test]
    fn test_prompt_omits_missing_product_lines() {
        let prompt = compose_prompt("Classify.", &task("", None), 1);
        assert_eq!(prompt, "image0\nClassify.");
    }
}
