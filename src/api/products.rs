use actix_web::{web, HttpResponse};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use super::nullable;
use crate::db::{newest_first, Db};
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{new_id, ts, Inventory, Product, ProductType, ProductVariant};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VariantInput {
    #[validate(length(min = 1))]
    pub name: String,
    pub capacity: Option<String>,
    #[validate(range(exclusive_min = 0.0))]
    pub price: f64,
    pub sku: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateProductRequest {
    #[validate(length(min = 1))]
    pub name: String,
    #[serde(rename = "type")]
    pub product_type: ProductType,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub base_price: Option<f64>,
    pub image_url: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub variants: Vec<VariantInput>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProductRequest {
    #[validate(length(min = 1))]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub description: Option<Option<String>>,
    #[serde(rename = "type")]
    pub product_type: Option<ProductType>,
    #[serde(default, deserialize_with = "nullable")]
    pub base_price: Option<Option<f64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub image_url: Option<Option<String>>,
    pub is_active: Option<bool>,
}

/// A product with whatever related records the caller asked for.
#[derive(Debug, Clone, Serialize)]
pub struct ProductView {
    #[serde(flatten)]
    pub product: Product,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<ProductVariant>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Vec<Inventory>>,
}

pub(crate) async fn active_variants(db: &Db, product_id: &str) -> ApiResult<Vec<ProductVariant>> {
    Ok(db
        .find::<ProductVariant>(doc! { "productId": product_id, "isActive": true }, None)
        .await?)
}

async fn inventory_of(db: &Db, product_id: &str) -> ApiResult<Vec<Inventory>> {
    Ok(db.find::<Inventory>(doc! { "productId": product_id }, None).await?)
}

pub async fn create_product(db: &Db, req: CreateProductRequest) -> ApiResult<ProductView> {
    req.validate()?;
    let now = Utc::now();
    let product = Product {
        id: new_id(),
        name: req.name,
        description: req.description,
        product_type: req.product_type,
        base_price: req.base_price,
        image_url: req.image_url,
        is_active: true,
        created_at: now,
        updated_at: now,
    };
    db.insert(&product).await?;

    let variants: Vec<ProductVariant> = req
        .variants
        .into_iter()
        .map(|v| ProductVariant {
            id: new_id(),
            product_id: product.id.clone(),
            name: v.name,
            capacity: v.capacity,
            price: v.price,
            sku: v.sku,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
        .collect();
    if !variants.is_empty() {
        db.insert_many(&variants).await?;
    }
    log::info!("Created product {} with {} variants", product.id, variants.len());

    Ok(ProductView {
        product,
        variants: Some(variants),
        inventory: None,
    })
}

/// Active products, newest first. Inventory is always attached.
pub async fn list_products(
    db: &Db,
    product_type: Option<ProductType>,
    include_variants: bool,
) -> ApiResult<Vec<ProductView>> {
    let mut filter = doc! { "isActive": true };
    if let Some(product_type) = product_type {
        filter.insert("type", product_type);
    }

    let products = db.find::<Product>(filter, newest_first()).await?;
    let mut views = Vec::with_capacity(products.len());
    for product in products {
        let variants = if include_variants {
            Some(active_variants(db, &product.id).await?)
        } else {
            None
        };
        let inventory = Some(inventory_of(db, &product.id).await?);
        views.push(ProductView { product, variants, inventory });
    }
    Ok(views)
}

/// Any product by id, including soft-deleted ones.
pub async fn get_product(db: &Db, id: &str) -> ApiResult<ProductView> {
    let product = db
        .get::<Product>(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product not found".to_string()))?;
    let variants = active_variants(db, id).await?;
    let inventory = inventory_of(db, id).await?;
    Ok(ProductView {
        product,
        variants: Some(variants),
        inventory: Some(inventory),
    })
}

pub async fn update_product(db: &Db, id: &str, req: UpdateProductRequest) -> ApiResult<Product> {
    req.validate()?;
    let mut set = doc! { "updatedAt": ts::bson(&Utc::now()) };
    if let Some(name) = req.name {
        set.insert("name", name);
    }
    if let Some(description) = req.description {
        set.insert("description", description);
    }
    if let Some(product_type) = req.product_type {
        set.insert("type", product_type);
    }
    if let Some(base_price) = req.base_price {
        if base_price.map_or(false, |p| p < 0.0) {
            return Err(ApiError::Validation("Invalid or missing fields: basePrice".to_string()));
        }
        set.insert("basePrice", base_price);
    }
    if let Some(image_url) = req.image_url {
        set.insert("imageUrl", image_url);
    }
    if let Some(is_active) = req.is_active {
        set.insert("isActive", is_active);
    }

    if !db.update::<Product>(id, set).await? {
        return Err(ApiError::NotFound("Product not found".to_string()));
    }
    db.get::<Product>(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product not found".to_string()))
}

/// Soft delete: the record stays so order history can still resolve it.
pub async fn delete_product(db: &Db, id: &str) -> ApiResult<()> {
    let set: Document = doc! { "isActive": false, "updatedAt": ts::bson(&Utc::now()) };
    if !db.update::<Product>(id, set).await? {
        return Err(ApiError::NotFound("Product not found".to_string()));
    }
    log::info!("Deactivated product {}", id);
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(rename = "type")]
    product_type: Option<ProductType>,
    #[serde(default)]
    include_variants: bool,
}

pub async fn list(state: web::Data<AppState>, query: web::Query<ListQuery>) -> ApiResult<HttpResponse> {
    let query = query.into_inner();
    let products = list_products(&state.db, query.product_type, query.include_variants).await?;
    Ok(HttpResponse::Ok().json(products))
}

pub async fn get(state: web::Data<AppState>, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let product = get_product(&state.db, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(product))
}

pub async fn create(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<CreateProductRequest>,
) -> ApiResult<HttpResponse> {
    let product = create_product(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(product))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    path: web::Path<String>,
    body: web::Json<UpdateProductRequest>,
) -> ApiResult<HttpResponse> {
    let product = update_product(&state.db, &path.into_inner(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(product))
}

pub async fn delete(state: web::Data<AppState>, _admin: Admin, path: web::Path<String>) -> ApiResult<HttpResponse> {
    delete_product(&state.db, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Product deleted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing;

    fn incubator() -> CreateProductRequest {
        CreateProductRequest {
            name: "Egg Incubator".to_string(),
            product_type: ProductType::MainProduct,
            description: None,
            base_price: Some(100.0),
            image_url: None,
            variants: vec![
                VariantInput {
                    name: "48 eggs".to_string(),
                    capacity: Some("48".to_string()),
                    price: 100.0,
                    sku: None,
                },
                VariantInput {
                    name: "96 eggs".to_string(),
                    capacity: Some("96".to_string()),
                    price: 180.0,
                    sku: Some("INC-96".to_string()),
                },
            ],
        }
    }

    #[actix_web::test]
    async fn creates_product_with_variants() {
        let app = testing::app();
        let view = create_product(&app.state.db, incubator()).await.unwrap();
        assert!(view.product.is_active);
        let variants = view.variants.unwrap();
        assert_eq!(variants.len(), 2);
        assert!(variants.iter().all(|v| v.product_id == view.product.id));
    }

    #[actix_web::test]
    async fn rejects_non_positive_variant_price() {
        let app = testing::app();
        let mut req = incubator();
        req.variants[0].price = 0.0;
        let err = create_product(&app.state.db, req).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(list_products(&app.state.db, None, false).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn soft_deleted_product_leaves_listing_but_stays_readable() {
        let app = testing::app();
        let db = &app.state.db;
        let kept = create_product(db, incubator()).await.unwrap().product;
        let removed = create_product(db, incubator()).await.unwrap().product;

        delete_product(db, &removed.id).await.unwrap();

        let listed = list_products(db, None, false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].product.id, kept.id);
        assert!(listed[0].variants.is_none());

        let fetched = get_product(db, &removed.id).await.unwrap();
        assert!(!fetched.product.is_active);
        assert!(matches!(
            delete_product(db, "missing").await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[actix_web::test]
    async fn listing_filters_by_type_and_attaches_variants() {
        let app = testing::app();
        let db = &app.state.db;
        create_product(db, incubator()).await.unwrap();
        let mut spare = incubator();
        spare.product_type = ProductType::SparePart;
        spare.variants.clear();
        create_product(db, spare).await.unwrap();

        let spares = list_products(db, Some(ProductType::SparePart), true).await.unwrap();
        assert_eq!(spares.len(), 1);
        assert_eq!(spares[0].variants.as_ref().map(Vec::len), Some(0));
        assert_eq!(spares[0].inventory.as_ref().map(Vec::len), Some(0));
    }

    #[actix_web::test]
    async fn partial_update_touches_only_given_fields() {
        let app = testing::app();
        let db = &app.state.db;
        let product = create_product(db, incubator()).await.unwrap().product;

        let patch = UpdateProductRequest {
            description: Some(Some("Fully automatic".to_string())),
            base_price: Some(None),
            ..Default::default()
        };
        let updated = update_product(db, &product.id, patch).await.unwrap();
        assert_eq!(updated.name, product.name);
        assert_eq!(updated.description.as_deref(), Some("Fully automatic"));
        assert_eq!(updated.base_price, None);
    }
}
