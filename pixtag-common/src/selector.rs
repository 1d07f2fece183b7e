//! Dedup Selector and Product Filter
//!
//! Selection is a pure function of a catalog snapshot and the set of image
//! links already present in the Results Store:
//!
//! 1. Every image URL gets exactly one owning product. A URL that is a primary
//!    image anywhere belongs to the lowest product that uses it as primary;
//!    otherwise to the lowest product listing it as additional. "Lowest" is by
//!    `(offer_id, title, merchant_id, aggregator_id)`.
//! 2. URLs already classified are dropped (unless the exclusion is turned
//!    off for a full re-run).
//! 3. Each product keeps the URLs it owns; products left with none are
//!    omitted. Output is ordered by `(offer_id, title)`.
//!
//! Because ownership is decided across the whole snapshot before anything is
//! emitted, a URL never appears in two tasks of the same cycle.

use crate::catalog::CatalogStore;
use crate::{results, ClassificationTask, ImageRef, ImageRole, Product, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorOptions {
    /// Skip image links that already have a row in the Results Store
    pub exclude_classified: bool,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            exclude_classified: true,
        }
    }
}

/// A product and the image references it owns this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedProduct {
    pub product: Product,
    pub images: Vec<ImageRef>,
}

impl SelectedProduct {
    pub fn to_task(&self) -> ClassificationTask {
        ClassificationTask::new(&self.product, &self.images)
    }
}

/// Compute the products and image references still needing classification
pub fn select(
    snapshot: &[Product],
    classified: &HashSet<String>,
    options: &SelectorOptions,
) -> Vec<SelectedProduct> {
    let mut order: Vec<usize> = (0..snapshot.len()).collect();
    order.sort_by(|&a, &b| {
        snapshot[a]
            .sort_key()
            .cmp(&snapshot[b].sort_key())
            .then(a.cmp(&b))
    });

    // URL -> (owner position in `order`, role under that owner)
    let mut owners: HashMap<&str, (usize, ImageRole)> = HashMap::new();
    let refs: Vec<Vec<ImageRef>> = order.iter().map(|&i| snapshot[i].image_refs()).collect();

    for (rank, product_refs) in refs.iter().enumerate() {
        for image in product_refs {
            owners
                .entry(image.image_link.as_str())
                .and_modify(|owner| {
                    // Primary beats additional; within a role the lower rank already holds it
                    if owner.1 == ImageRole::Additional && image.role == ImageRole::Primary {
                        *owner = (rank, image.role);
                    }
                })
                .or_insert((rank, image.role));
        }
    }

    let mut selected = Vec::new();
    for (rank, product_refs) in refs.iter().enumerate() {
        let images: Vec<ImageRef> = product_refs
            .iter()
            .filter(|image| owners.get(image.image_link.as_str()).map(|o| o.0) == Some(rank))
            .filter(|image| !(options.exclude_classified && classified.contains(&image.image_link)))
            .cloned()
            .collect();

        if !images.is_empty() {
            selected.push(SelectedProduct {
                product: snapshot[order[rank]].clone(),
                images,
            });
        }
    }

    selected
}

/// Optional predicates over the selector's output, combined with AND.
///
/// Category is a case-insensitive prefix of `product_type`; brands and offer
/// ids are case-insensitive exact matches. An unset or empty filter matches
/// everything. `limit` caps the number of products, applied after filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFilter {
    #[serde(default)]
    pub category_prefix: Option<String>,
    #[serde(default)]
    pub brands: Option<Vec<String>>,
    #[serde(default)]
    pub offer_ids: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn lowered_set(values: &Option<Vec<String>>) -> Option<HashSet<String>> {
    values
        .as_ref()
        .filter(|v| !v.is_empty())
        .map(|v| v.iter().map(|s| s.to_lowercase()).collect())
}

impl ProductFilter {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn apply(&self, candidates: Vec<SelectedProduct>) -> Vec<SelectedProduct> {
        let prefix = self
            .category_prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(str::to_lowercase);
        let brands = lowered_set(&self.brands);
        let offer_ids = lowered_set(&self.offer_ids);

        let matches = |p: &Product| {
            let category_ok = match &prefix {
                None => true,
                Some(prefix) => p
                    .product_type
                    .as_deref()
                    .map(|t| t.to_lowercase().starts_with(prefix.as_str()))
                    .unwrap_or(false),
            };
            let brand_ok = match &brands {
                None => true,
                Some(set) => p
                    .brand
                    .as_deref()
                    .map(|b| set.contains(&b.to_lowercase()))
                    .unwrap_or(false),
            };
            let offer_ok = match &offer_ids {
                None => true,
                Some(set) => set.contains(&p.offer_id.to_lowercase()),
            };
            category_ok && brand_ok && offer_ok
        };

        candidates
            .into_iter()
            .filter(|c| matches(&c.product))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Read the latest catalog batch and the classified links, then select and
/// filter. A missing catalog table is a selection error.
pub async fn plan_dispatch(
    pool: &SqlitePool,
    catalog_table: &str,
    results_table: &str,
    options: &SelectorOptions,
    filter: &ProductFilter,
) -> Result<Vec<SelectedProduct>> {
    let snapshot = CatalogStore::new(pool.clone(), catalog_table)?
        .latest_snapshot()
        .await?;

    let classified = if options.exclude_classified {
        results::classified_image_links(pool, results_table).await?
    } else {
        HashSet::new()
    };

    let candidates = select(&snapshot.products, &classified, options);
    let candidate_count = candidates.len();
    let planned = filter.apply(candidates);

    info!(
        batch = ?snapshot.batch,
        catalog_products = snapshot.products.len(),
        classified_links = classified.len(),
        candidates = candidate_count,
        planned = planned.len(),
        images = planned.iter().map(|p| p.images.len()).sum::<usize>(),
        "Planned dispatch"
    );

    Ok(planned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn product(offer_id: &str, image: Option<&str>, additional: &[&str]) -> Product {
        Product {
            offer_id: offer_id.to_string(),
            merchant_id: 1,
            aggregator_id: 101,
            title: format!("Offer {}", offer_id),
            product_type: None,
            brand: None,
            image_link: image.map(str::to_string),
            additional_image_links: additional.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn links(selection: &[SelectedProduct]) -> Vec<(String, String)> {
        selection
            .iter()
            .flat_map(|s| {
                s.images
                    .iter()
                    .map(move |i| (s.product.offer_id.clone(), i.image_link.clone()))
            })
            .collect()
    }

    #[test]
    fn test_shared_primary_attributed_to_lowest_offer() {
        let snapshot = vec![
            product("B", Some("X"), &["Y"]),
            product("A", Some("X"), &[]),
        ];

        let selection = select(&snapshot, &HashSet::new(), &SelectorOptions::default());

        assert_eq!(
            links(&selection),
            vec![
                ("A".to_string(), "X".to_string()),
                ("B".to_string(), "Y".to_string())
            ]
        );
        assert_eq!(selection[0].images[0].role, ImageRole::Primary);
        assert_eq!(selection[1].images[0].role, ImageRole::Additional);
    }

    #[test]
    fn test_classified_link_excluded_but_rest_returned() {
        let snapshot = vec![product("A", Some("X"), &[]), product("B", Some("X"), &["Y"])];
        let classified = HashSet::from(["X".to_string()]);

        let selection = select(&snapshot, &classified, &SelectorOptions::default());

        assert_eq!(links(&selection), vec![("B".to_string(), "Y".to_string())]);
    }

    #[test]
    fn test_exclusion_toggle_resurfaces_everything() {
        let snapshot = vec![product("A", Some("X"), &[]), product("B", Some("X"), &["Y"])];
        let classified = HashSet::from(["X".to_string(), "Y".to_string()]);
        let options = SelectorOptions {
            exclude_classified: false,
        };

        let selection = select(&snapshot, &classified, &options);
        assert_eq!(links(&selection).len(), 2);
    }

    #[test]
    fn test_primary_beats_lower_additional_referrer() {
        // A lists X as additional, but X is B's primary
        let snapshot = vec![product("A", Some("P"), &["X"]), product("B", Some("X"), &[])];

        let selection = select(&snapshot, &HashSet::new(), &SelectorOptions::default());

        assert_eq!(
            links(&selection),
            vec![
                ("A".to_string(), "P".to_string()),
                ("B".to_string(), "X".to_string())
            ]
        );
    }

    #[test]
    fn test_tie_break_uses_title_after_offer_id() {
        let mut first = product("A", Some("X"), &[]);
        first.title = "Zebra".to_string();
        let mut second = product("A", Some("X"), &[]);
        second.title = "Aardvark".to_string();
        second.merchant_id = 2;

        let selection = select(&[first, second], &HashSet::new(), &SelectorOptions::default());
        assert_eq!(selection.len(), 1);
        assert_eq!(selection[0].product.title, "Aardvark");
    }

    #[test]
    fn test_empty_snapshot_and_schemeless_urls() {
        assert!(select(&[], &HashSet::new(), &SelectorOptions::default()).is_empty());

        let snapshot = vec![product("A", Some("not a url"), &[])];
        let selection = select(&snapshot, &HashSet::new(), &SelectorOptions::default());
        assert_eq!(selection[0].images[0].image_link, "not a url");
    }

    fn random_catalog(rng: &mut rand::rngs::StdRng) -> Vec<Product> {
        let urls: Vec<String> = (0..12).map(|i| format!("http://img/{}", i)).collect();
        (0..rng.gen_range(0..15))
            .map(|i| {
                let primary = rng.gen_bool(0.8).then(|| urls[rng.gen_range(0..urls.len())].clone());
                let additional = (0..rng.gen_range(0..4))
                    .map(|_| urls[rng.gen_range(0..urls.len())].clone())
                    .collect();
                Product {
                    offer_id: format!("offer{}", rng.gen_range(0..6)),
                    merchant_id: i,
                    aggregator_id: 1,
                    title: format!("t{}", rng.gen_range(0..3)),
                    product_type: None,
                    brand: None,
                    image_link: primary,
                    additional_image_links: additional,
                }
            })
            .collect()
    }

    #[test]
    fn test_no_link_selected_twice_and_selection_is_idempotent() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let catalog = random_catalog(&mut rng);
            let classified: HashSet<String> = (0..3)
                .map(|_| format!("http://img/{}", rng.gen_range(0..12)))
                .collect();

            let first = select(&catalog, &classified, &SelectorOptions::default());
            let second = select(&catalog, &classified, &SelectorOptions::default());
            assert_eq!(first, second);

            let mut seen = HashSet::new();
            for selected in &first {
                assert!(!selected.images.is_empty());
                for image in &selected.images {
                    assert!(seen.insert(image.image_link.clone()), "duplicate {}", image.image_link);
                    assert!(!classified.contains(&image.image_link));
                }
            }

            // Every unclassified link in the catalog is covered
            let expected: HashSet<String> = catalog
                .iter()
                .flat_map(|p| p.image_refs())
                .map(|r| r.image_link)
                .filter(|l| !classified.contains(l))
                .collect();
            assert_eq!(seen, expected);

            let keys: Vec<(&str, &str)> = first
                .iter()
                .map(|s| (s.product.offer_id.as_str(), s.product.title.as_str()))
                .collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);
        }
    }

    fn catalog_for_filter() -> Vec<SelectedProduct> {
        let mut chair = product("chair-1", Some("c1"), &[]);
        chair.product_type = Some("Home & Garden > Furniture > Chairs".to_string());
        chair.brand = Some("Acme".to_string());
        let mut lamp = product("lamp-1", Some("l1"), &[]);
        lamp.product_type = Some("Home & Garden > Lighting".to_string());
        lamp.brand = Some("Lumen".to_string());
        let mut shoe = product("shoe-1", Some("s1"), &[]);
        shoe.product_type = Some("Apparel > Shoes".to_string());
        shoe.brand = Some("ACME".to_string());

        select(&[chair, lamp, shoe], &HashSet::new(), &SelectorOptions::default())
    }

    fn offer_ids(selection: &[SelectedProduct]) -> Vec<&str> {
        selection.iter().map(|s| s.product.offer_id.as_str()).collect()
    }

    #[test]
    fn test_filter_absent_matches_all() {
        let filtered = ProductFilter::default().apply(catalog_for_filter());
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn test_filter_category_prefix_case_insensitive() {
        let filter = ProductFilter {
            category_prefix: Some("home & garden".to_string()),
            ..Default::default()
        };
        assert_eq!(offer_ids(&filter.apply(catalog_for_filter())), vec!["chair-1", "lamp-1"]);
    }

    #[test]
    fn test_filters_combine_with_and() {
        let filter = ProductFilter {
            category_prefix: Some("HOME".to_string()),
            brands: Some(vec!["acme".to_string()]),
            ..Default::default()
        };
        assert_eq!(offer_ids(&filter.apply(catalog_for_filter())), vec!["chair-1"]);

        let filter = ProductFilter {
            offer_ids: Some(vec!["SHOE-1".to_string(), "lamp-1".to_string()]),
            ..Default::default()
        };
        assert_eq!(offer_ids(&filter.apply(catalog_for_filter())), vec!["lamp-1", "shoe-1"]);
    }

    #[test]
    fn test_limit_applies_after_filter_and_counts_products() {
        let filter = ProductFilter {
            brands: Some(vec!["Acme".to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(offer_ids(&filter.apply(catalog_for_filter())), vec!["chair-1"]);

        let mut many = product("z", Some("a"), &["b", "c", "d"]);
        many.brand = Some("Acme".to_string());
        let selection = select(&[many], &HashSet::new(), &SelectorOptions::default());
        let limited = ProductFilter::with_limit(1).apply(selection);
        assert_eq!(limited[0].images.len(), 4);
    }

    #[tokio::test]
    async fn test_plan_dispatch_reads_latest_batch_and_results() {
        use crate::catalog::CatalogStore;
        use crate::schema::{compile, TypeDescription};

        let pool = crate::db::init_memory_database().await.unwrap();
        let catalog = CatalogStore::new(pool.clone(), "products").unwrap();
        catalog
            .ingest_batch(&[product("old", Some("O"), &[])])
            .await
            .unwrap();
        catalog
            .ingest_batch(&[product("A", Some("X"), &[]), product("B", Some("X"), &["Y"])])
            .await
            .unwrap();

        let schema = compile(
            &TypeDescription::from_toml_str(
                "name = \"L\"\n[[fields]]\nname = \"label\"\ntype = \"string\"\n",
            )
            .unwrap(),
        )
        .unwrap();
        let store = results::ResultsStore::provision(pool.clone(), "labeled_images", schema)
            .await
            .unwrap();
        let mut fields = serde_json::Map::new();
        fields.insert("label".to_string(), serde_json::json!("silo"));
        store
            .append(&[results::LabeledImageRow {
                offer_id: "A".to_string(),
                merchant_id: 1,
                aggregator_id: 101,
                image_link: "X".to_string(),
                metadata: crate::ImageMetadata {
                    mime_type: "image/png".to_string(),
                    byte_size: 3,
                    content_hash: "00".to_string(),
                },
                fields,
                timestamp: chrono::Utc::now(),
            }])
            .await
            .unwrap();

        let plan = plan_dispatch(
            &pool,
            "products",
            "labeled_images",
            &SelectorOptions::default(),
            &ProductFilter::default(),
        )
        .await
        .unwrap();

        assert_eq!(links(&plan), vec![("B".to_string(), "Y".to_string())]);
    }

    #[tokio::test]
    async fn test_plan_dispatch_without_catalog_fails() {
        let pool = crate::db::init_memory_database().await.unwrap();
        let result = plan_dispatch(
            &pool,
            "products",
            "labeled_images",
            &SelectorOptions::default(),
            &ProductFilter::default(),
        )
        .await;

        assert!(matches!(result, Err(crate::Error::Selection(_))));
    }
}
