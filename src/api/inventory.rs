use actix_web::{web, HttpResponse};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use super::nullable;
use crate::db::{newest_first, Db, StoreError};
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{new_id, ts, Inventory, Product, ProductVariant};
use crate::qr;
use crate::state::AppState;

/// Conditional writes attempted before an adjustment gives up.
const MAX_ADJUST_ATTEMPTS: usize = 5;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInventoryRequest {
    #[validate(length(min = 1))]
    pub product_id: String,
    pub variant_id: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub quantity: i64,
    pub location: Option<String>,
    pub notes: Option<String>,
    #[validate(length(max = 256))]
    pub qr_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInventoryRequest {
    pub id: String,
    pub quantity: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub location: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: Option<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    Add,
    Remove,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[validate(length(min = 1))]
    pub qr_code: String,
    pub action: ScanAction,
    #[validate(range(min = 1))]
    pub quantity: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct InventoryView {
    #[serde(flatten)]
    pub inventory: Inventory,
    pub product: Option<Product>,
    pub variant: Option<ProductVariant>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedInventory {
    #[serde(flatten)]
    pub view: InventoryView,
    pub qr_code_image: String,
}

async fn view(db: &Db, inventory: Inventory) -> ApiResult<InventoryView> {
    let product = db.get::<Product>(&inventory.product_id).await?;
    let variant = match &inventory.variant_id {
        Some(id) => db.get::<ProductVariant>(id).await?,
        None => None,
    };
    Ok(InventoryView { inventory, product, variant })
}

/// The ledger entry for a (product, variant) pair; `None` means no variant.
pub(crate) async fn find_for(db: &Db, product_id: &str, variant_id: Option<&str>) -> ApiResult<Option<Inventory>> {
    Ok(db
        .find_one::<Inventory>(doc! { "productId": product_id, "variantId": variant_id })
        .await?)
}

/// Applies `next` to the stored quantity with a compare-and-swap on the
/// value that was read. The result is clamped at zero; `next` returning
/// `None` means the arithmetic overflowed.
pub(crate) async fn adjust_quantity<F>(db: &Db, mut current: Inventory, next: F) -> ApiResult<Inventory>
where
    F: Fn(i64) -> Option<i64>,
{
    for _ in 0..MAX_ADJUST_ATTEMPTS {
        let quantity = next(current.quantity)
            .ok_or_else(|| ApiError::Validation("Quantity is out of range".to_string()))?
            .max(0);
        let now = Utc::now();
        let applied = db
            .update_where::<Inventory>(
                doc! { "id": &current.id, "quantity": current.quantity },
                doc! { "quantity": quantity, "updatedAt": ts::bson(&now) },
            )
            .await?;
        if applied {
            current.quantity = quantity;
            current.updated_at = now;
            return Ok(current);
        }
        log::debug!("Inventory {} changed underneath an adjustment, retrying", current.id);
        current = db
            .get::<Inventory>(&current.id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Inventory not found".to_string()))?;
    }
    Err(ApiError::Conflict(
        "Inventory is being updated concurrently, please retry".to_string(),
    ))
}

pub async fn record_inventory(db: &Db, req: CreateInventoryRequest) -> ApiResult<CreatedInventory> {
    req.validate()?;
    let product = db
        .get::<Product>(&req.product_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Product not found".to_string()))?;
    let variant_id = req.variant_id.filter(|id| !id.is_empty());
    let variant = match &variant_id {
        Some(id) => Some(
            db.find_one::<ProductVariant>(doc! { "id": id, "productId": &product.id })
                .await?
                .ok_or_else(|| ApiError::NotFound("Variant not found".to_string()))?,
        ),
        None => None,
    };

    if find_for(db, &product.id, variant_id.as_deref()).await?.is_some() {
        return Err(ApiError::Conflict(
            "Inventory already exists for this product and variant".to_string(),
        ));
    }

    let qr_code = req
        .qr_code
        .filter(|code| !code.trim().is_empty())
        .unwrap_or_else(qr::generate_code);
    let code_taken = || ApiError::Conflict("QR code already exists".to_string());
    if db.find_one::<Inventory>(doc! { "qrCode": &qr_code }).await?.is_some() {
        return Err(code_taken());
    }

    let qr_code_image = qr::image_data_url(&qr_code)?;

    let now = Utc::now();
    let inventory = Inventory {
        id: new_id(),
        product_id: product.id.clone(),
        variant_id,
        quantity: req.quantity,
        qr_code,
        location: req.location,
        notes: req.notes,
        created_at: now,
        updated_at: now,
    };
    db.insert(&inventory).await.map_err(|e| match e {
        StoreError::Duplicate(_) => code_taken(),
        other => other.into(),
    })?;
    log::info!("Recorded inventory {} ({})", inventory.id, inventory.qr_code);

    Ok(CreatedInventory {
        view: InventoryView {
            inventory,
            product: Some(product),
            variant,
        },
        qr_code_image,
    })
}

pub async fn list_inventory(
    db: &Db,
    product_id: Option<&str>,
    variant_id: Option<&str>,
) -> ApiResult<Vec<InventoryView>> {
    let mut filter = Document::new();
    if let Some(product_id) = product_id {
        filter.insert("productId", product_id);
    }
    if let Some(variant_id) = variant_id {
        filter.insert("variantId", variant_id);
    }
    let records = db.find::<Inventory>(filter, newest_first()).await?;
    let mut views = Vec::with_capacity(records.len());
    for inventory in records {
        views.push(view(db, inventory).await?);
    }
    Ok(views)
}

pub async fn update_inventory(db: &Db, req: UpdateInventoryRequest) -> ApiResult<InventoryView> {
    let mut set = doc! { "updatedAt": ts::bson(&Utc::now()) };
    if let Some(quantity) = req.quantity {
        set.insert("quantity", quantity.max(0));
    }
    if let Some(location) = req.location {
        set.insert("location", location);
    }
    if let Some(notes) = req.notes {
        set.insert("notes", notes);
    }
    if !db.update::<Inventory>(&req.id, set).await? {
        return Err(ApiError::NotFound("Inventory not found".to_string()));
    }
    let inventory = db
        .get::<Inventory>(&req.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Inventory not found".to_string()))?;
    view(db, inventory).await
}

pub async fn delete_inventory(db: &Db, id: Option<&str>) -> ApiResult<()> {
    let id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::Validation("ID is required".to_string()))?;
    if !db.delete::<Inventory>(id).await? {
        return Err(ApiError::NotFound("Inventory not found".to_string()));
    }
    Ok(())
}

pub async fn scan(db: &Db, req: ScanRequest) -> ApiResult<InventoryView> {
    req.validate()?;
    let inventory = db
        .find_one::<Inventory>(doc! { "qrCode": &req.qr_code })
        .await?
        .ok_or_else(|| ApiError::NotFound("QR code not found".to_string()))?;

    let amount = req.quantity.unwrap_or(1);
    let adjusted = match req.action {
        ScanAction::Add => adjust_quantity(db, inventory, |q| q.checked_add(amount)).await?,
        ScanAction::Remove => adjust_quantity(db, inventory, |q| q.checked_sub(amount)).await?,
    };
    log::info!(
        "QR scan {:?} {} on {} -> {}",
        req.action,
        amount,
        adjusted.qr_code,
        adjusted.quantity
    );
    view(db, adjusted).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    product_id: Option<String>,
    variant_id: Option<String>,
}

#[derive(Deserialize)]
pub struct IdQuery {
    id: Option<String>,
}

pub async fn list(state: web::Data<AppState>, _admin: Admin, query: web::Query<ListQuery>) -> ApiResult<HttpResponse> {
    let records = list_inventory(&state.db, query.product_id.as_deref(), query.variant_id.as_deref()).await?;
    Ok(HttpResponse::Ok().json(records))
}

pub async fn create(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<CreateInventoryRequest>,
) -> ApiResult<HttpResponse> {
    let created = record_inventory(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(created))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<UpdateInventoryRequest>,
) -> ApiResult<HttpResponse> {
    let updated = update_inventory(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated))
}

pub async fn delete(state: web::Data<AppState>, _admin: Admin, query: web::Query<IdQuery>) -> ApiResult<HttpResponse> {
    delete_inventory(&state.db, query.id.as_deref()).await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "Inventory deleted" })))
}

pub async fn scan_code(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<ScanRequest>,
) -> ApiResult<HttpResponse> {
    let adjusted = scan(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(adjusted))
}
