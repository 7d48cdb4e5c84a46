use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use tally_core::model::{NutrientTuple, normalize_name};

use crate::config::CatalogConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned HTTP {code}: {body}")]
    Status { code: u16, body: String },
}

/// External nutrition catalog. May fail transiently; a failure never
/// fabricates nutrients — the resolver degrades it to a not-found reply.
#[allow(async_fn_in_trait)]
pub trait NutritionCatalog: Send + Sync {
    async fn lookup_by_name(&self, query: &str) -> Result<Option<NutrientTuple>, CatalogError>;
    async fn lookup_by_barcode(&self, code: &str) -> Result<Option<NutrientTuple>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct FoodsResponse {
    #[serde(default)]
    foods: Vec<FoodItem>,
}

#[derive(Debug, Default, Deserialize)]
struct FoodItem {
    #[serde(default)]
    nf_calories: f64,
    #[serde(default)]
    nf_protein: f64,
    #[serde(default)]
    nf_total_carbohydrate: f64,
    #[serde(default)]
    nf_total_fat: f64,
}

fn sum_foods(foods: &[FoodItem]) -> Option<NutrientTuple> {
    if foods.is_empty() {
        return None;
    }
    let mut total = NutrientTuple::ZERO;
    for food in foods {
        total.calories += food.nf_calories.round() as i64;
        total.protein += food.nf_protein.round() as i64;
        total.carbs += food.nf_total_carbohydrate.round() as i64;
        total.fat += food.nf_total_fat.round() as i64;
    }
    Some(total)
}

/// Nutritionix-style HTTP client: natural-language queries are summed
/// across the returned foods (a description like "2 eggs and toast" is
/// several items), barcode lookups hit the UPC item endpoint.
pub struct HttpCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
}

impl HttpCatalog {
    pub fn new(config: CatalogConfig) -> Result<HttpCatalog, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(HttpCatalog { client, config })
    }

    async fn check(resp: reqwest::Response) -> Result<Option<reqwest::Response>, CatalogError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CatalogError::Status {
                code: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(resp))
    }
}

impl NutritionCatalog for HttpCatalog {
    async fn lookup_by_name(&self, query: &str) -> Result<Option<NutrientTuple>, CatalogError> {
        let url = format!("{}/v2/natural/nutrients", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-app-id", &self.config.app_id)
            .header("x-app-key", &self.config.app_key)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await?;
        let Some(resp) = Self::check(resp).await? else {
            return Ok(None);
        };
        let body: FoodsResponse = resp.json().await?;
        Ok(sum_foods(&body.foods))
    }

    async fn lookup_by_barcode(&self, code: &str) -> Result<Option<NutrientTuple>, CatalogError> {
        let url = format!("{}/v2/search/item", self.config.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("upc", code)])
            .header("x-app-id", &self.config.app_id)
            .header("x-app-key", &self.config.app_key)
            .send()
            .await?;
        let Some(resp) = Self::check(resp).await? else {
            return Ok(None);
        };
        let body: FoodsResponse = resp.json().await?;
        Ok(sum_foods(&body.foods))
    }
}

/// Fixed catalog for tests and the CLI's offline mode.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    by_name: HashMap<String, NutrientTuple>,
    by_barcode: HashMap<String, NutrientTuple>,
    fail: std::sync::atomic::AtomicBool,
}

impl StaticCatalog {
    pub fn new() -> StaticCatalog {
        StaticCatalog::default()
    }

    pub fn with_name(mut self, name: &str, nutrients: NutrientTuple) -> StaticCatalog {
        self.by_name.insert(normalize_name(name), nutrients);
        self
    }

    pub fn with_barcode(mut self, code: &str, nutrients: NutrientTuple) -> StaticCatalog {
        self.by_barcode.insert(code.to_string(), nutrients);
        self
    }

    /// Make subsequent lookups fail, to exercise the degraded path.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), CatalogError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CatalogError::Status {
                code: 503,
                body: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl NutritionCatalog for StaticCatalog {
    async fn lookup_by_name(&self, query: &str) -> Result<Option<NutrientTuple>, CatalogError> {
        self.check_failure()?;
        Ok(self.by_name.get(&normalize_name(query)).copied())
    }

    async fn lookup_by_barcode(&self, code: &str) -> Result<Option<NutrientTuple>, CatalogError> {
        self.check_failure()?;
        Ok(self.by_barcode.get(code).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summing_rounds_each_food_to_whole_units() {
        let foods = vec![
            FoodItem {
                nf_calories: 71.5,
                nf_protein: 6.3,
                nf_total_carbohydrate: 0.4,
                nf_total_fat: 4.8,
            },
            FoodItem {
                nf_calories: 71.5,
                nf_protein: 6.3,
                nf_total_carbohydrate: 0.4,
                nf_total_fat: 4.8,
            },
        ];
        assert_eq!(
            sum_foods(&foods),
            Some(NutrientTuple {
                calories: 144,
                protein: 12,
                carbs: 0,
                fat: 10,
            })
        );
    }

    #[test]
    fn empty_foods_is_a_miss() {
        assert_eq!(sum_foods(&[]), None);
    }
}
