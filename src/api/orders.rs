//! Order placement and the payment-verification workflow.
//!
//! An order is checked against stock when it is placed but nothing is
//! reserved; stock only leaves the ledger once an admin marks the payment
//! verified. That transition is claimed with a conditional write on
//! `paymentVerified == false`, so the deduction, the confirmation PDF and
//! the mail happen at most once per order.

use actix_web::{web, HttpResponse};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use rand::Rng;
use serde::Deserialize;
use validator::Validate;

use super::inventory::{adjust_quantity, find_for};
use super::nullable;
use crate::auth::Session;
use crate::db::{newest_first, Db};
use crate::emails;
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{
    new_id, ts, Order, OrderItem, OrderItemView, OrderStatus, OrderView, Product, ProductVariant, User,
    UserSummary,
};
use crate::pdf;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemInput {
    #[validate(length(min = 1))]
    pub product_id: String,
    pub variant_id: Option<String>,
    #[validate(range(min = 1))]
    pub quantity: i64,
    #[validate(range(min = 0.0))]
    pub price: f64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(nested)]
    pub items: Vec<OrderItemInput>,
    pub shipping_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderRequest {
    pub status: Option<OrderStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub payment_link: Option<Option<String>>,
    pub payment_verified: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    pub shipping_address: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: Option<Option<String>>,
}

/// `ORD-<millis>-<0..999>`
pub fn generate_order_number() -> String {
    let random: u32 = rand::thread_rng().gen_range(0..1000);
    format!("ORD-{}-{}", Utc::now().timestamp_millis(), random)
}

fn not_found() -> ApiError {
    ApiError::NotFound("Order not found".to_string())
}

async fn load_view(db: &Db, order: Order) -> ApiResult<OrderView> {
    let user = db.get::<User>(&order.user_id).await?.as_ref().map(UserSummary::from);
    let items = db.find::<OrderItem>(doc! { "orderId": &order.id }, None).await?;

    let mut views = Vec::with_capacity(items.len());
    for item in items {
        let product = db.get::<Product>(&item.product_id).await?;
        let variant = match &item.variant_id {
            Some(id) => db.get::<ProductVariant>(id).await?,
            None => None,
        };
        views.push(OrderItemView { item, product, variant });
    }
    Ok(OrderView { order, user, items: views })
}

/// Requested quantity per (product, variant) pair, in first-seen order.
fn requested_per_pair(items: &[OrderItemInput]) -> ApiResult<Vec<((&str, Option<&str>), i64)>> {
    let mut requested: Vec<((&str, Option<&str>), i64)> = Vec::new();
    for item in items {
        let key = (item.product_id.as_str(), item.variant_id.as_deref());
        if let Some((_, quantity)) = requested.iter_mut().find(|(k, _)| *k == key) {
            *quantity = quantity.checked_add(item.quantity).ok_or_else(|| {
                ApiError::Validation(format!("Quantity for product {} is out of range", key.0))
            })?;
            continue;
        }
        requested.push((key, item.quantity));
    }
    Ok(requested)
}

pub async fn create_order(db: &Db, req: CreateOrderRequest) -> ApiResult<OrderView> {
    if req.items.is_empty() {
        return Err(ApiError::Validation("Order must contain at least one item".to_string()));
    }
    req.validate()?;
    if db.get::<User>(&req.user_id).await?.is_none() {
        return Err(ApiError::Validation(format!("User {} not found", req.user_id)));
    }

    let items: Vec<OrderItemInput> = req
        .items
        .into_iter()
        .map(|mut item| {
            item.variant_id = item.variant_id.filter(|id| !id.is_empty());
            item
        })
        .collect();

    // Prices are taken as submitted; only admins can place orders.
    let total_amount: f64 = items.iter().map(|i| i.price * i.quantity as f64).sum();

    for ((product_id, variant_id), quantity) in requested_per_pair(&items)? {
        let inventory = find_for(db, product_id, variant_id)
            .await?
            .ok_or_else(|| ApiError::Validation(format!("No inventory found for product {product_id}")))?;
        if inventory.quantity < quantity {
            return Err(ApiError::Validation(format!(
                "Insufficient inventory for product {product_id}"
            )));
        }
    }

    let now = Utc::now();
    let order = Order {
        id: new_id(),
        order_number: generate_order_number(),
        user_id: req.user_id,
        status: OrderStatus::PaymentPending,
        total_amount,
        payment_link: None,
        payment_verified: false,
        payment_verified_at: None,
        shipping_address: req.shipping_address,
        notes: req.notes,
        created_at: now,
        updated_at: now,
    };
    let order_items: Vec<OrderItem> = items
        .into_iter()
        .map(|item| OrderItem {
            id: new_id(),
            order_id: order.id.clone(),
            product_id: item.product_id,
            variant_id: item.variant_id,
            quantity: item.quantity,
            price: item.price,
            created_at: now,
        })
        .collect();

    db.insert(&order).await?;
    if let Err(e) = db.insert_many(&order_items).await {
        if let Err(cleanup) = db.delete::<Order>(&order.id).await {
            log::error!("Failed to remove order {} after its items failed: {}", order.id, cleanup);
        }
        return Err(e.into());
    }
    log::info!(
        "Created order {} for user {} totalling {:.2}",
        order.order_number,
        order.user_id,
        order.total_amount
    );

    load_view(db, order).await
}

/// Owners and admins only.
pub async fn get_order(db: &Db, caller: &Session, id: &str) -> ApiResult<OrderView> {
    let order = db.get::<Order>(id).await?.ok_or_else(not_found)?;
    if !caller.can_access(Some(order.user_id.as_str())) {
        return Err(ApiError::Forbidden("You do not have access to this order".to_string()));
    }
    load_view(db, order).await
}

pub async fn list_orders(db: &Db, caller: &Session, status: Option<OrderStatus>) -> ApiResult<Vec<OrderView>> {
    let mut filter = Document::new();
    if !caller.is_admin() {
        filter.insert("userId", caller.id.clone());
    }
    if let Some(status) = status {
        filter.insert("status", status);
    }
    let orders = db.find::<Order>(filter, newest_first()).await?;
    let mut views = Vec::with_capacity(orders.len());
    for order in orders {
        views.push(load_view(db, order).await?);
    }
    Ok(views)
}

async fn deduct_inventory(db: &Db, items: &[OrderItemView]) {
    for entry in items {
        let item = &entry.item;
        let inventory = match find_for(db, &item.product_id, item.variant_id.as_deref()).await {
            Ok(Some(inventory)) => inventory,
            Ok(None) => {
                log::warn!("No inventory to deduct for product {}", item.product_id);
                continue;
            }
            Err(e) => {
                log::error!("Inventory lookup failed for product {}: {}", item.product_id, e);
                continue;
            }
        };
        let quantity = item.quantity;
        match adjust_quantity(db, inventory, |q| q.checked_sub(quantity)).await {
            Ok(adjusted) => log::info!(
                "Deducted {} from inventory {}, {} left",
                quantity,
                adjusted.id,
                adjusted.quantity
            ),
            Err(e) => log::error!("Failed to deduct inventory for order item {}: {}", item.id, e),
        }
    }
}

fn send_confirmation(state: &AppState, view: &OrderView) {
    let Some(user) = &view.user else {
        log::warn!("Order {} has no customer to confirm to", view.order.order_number);
        return;
    };
    let attachment = match pdf::order_confirmation(&state.config.app_name, view) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::error!("Confirmation PDF for {} failed: {}", view.order.order_number, e);
            None
        }
    };
    state.mail(emails::order_confirmation(
        &state.config,
        &user.email,
        &user.name,
        &view.order,
        attachment,
    ));
}

pub async fn update_order(state: &AppState, id: &str, req: UpdateOrderRequest) -> ApiResult<OrderView> {
    let db = &state.db;
    let order = db.get::<Order>(id).await?.ok_or_else(not_found)?;

    if let Some(status) = req.status {
        if order.status.is_terminal() && status != order.status {
            return Err(ApiError::Validation(format!(
                "Order is {} and its status can no longer change",
                order.status.as_str()
            )));
        }
    }

    let now = Utc::now();
    let mut set = doc! { "updatedAt": ts::bson(&now) };
    if let Some(status) = req.status {
        set.insert("status", status);
    }
    if let Some(link) = req.payment_link {
        set.insert("paymentLink", link);
    }
    if let Some(address) = req.shipping_address {
        set.insert("shippingAddress", address);
    }
    if let Some(notes) = req.notes {
        set.insert("notes", notes);
    }

    let mut verifying = false;
    match req.payment_verified {
        Some(true) if !order.payment_verified => {
            let mut claim = set.clone();
            claim.insert("paymentVerified", true);
            claim.insert("paymentVerifiedAt", ts::bson(&now));
            verifying = db
                .update_where::<Order>(doc! { "id": id, "paymentVerified": false }, claim)
                .await?;
            if !verifying {
                log::info!("Payment for order {} was verified by another request", order.order_number);
            }
        }
        Some(false) => {
            set.insert("paymentVerified", false);
        }
        _ => {}
    }
    if !verifying && !db.update::<Order>(id, set).await? {
        return Err(not_found());
    }

    let updated = db.get::<Order>(id).await?.ok_or_else(not_found)?;
    let view = load_view(db, updated).await?;

    if verifying {
        log::info!("Payment verified for order {}", view.order.order_number);
        deduct_inventory(db, &view.items).await;
        send_confirmation(state, &view);
    }
    Ok(view)
}

#[derive(Deserialize)]
pub struct StatusQuery {
    status: Option<OrderStatus>,
}

pub async fn list(
    state: web::Data<AppState>,
    session: Session,
    query: web::Query<StatusQuery>,
) -> ApiResult<HttpResponse> {
    let orders = list_orders(&state.db, &session, query.into_inner().status).await?;
    Ok(HttpResponse::Ok().json(orders))
}

pub async fn create(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<CreateOrderRequest>,
) -> ApiResult<HttpResponse> {
    let order = create_order(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(order))
}

pub async fn get(state: web::Data<AppState>, session: Session, path: web::Path<String>) -> ApiResult<HttpResponse> {
    let order = get_order(&state.db, &session, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    path: web::Path<String>,
    body: web::Json<UpdateOrderRequest>,
) -> ApiResult<HttpResponse> {
    let order = update_order(&state, &path.into_inner(), body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(order))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::testing::wait_for;
    use crate::models::{Inventory, Role};
    use crate::state::testing::{self, seed_inventory, seed_product, seed_user, ContestedStore, Interference};
    use std::sync::Arc;

    fn item(product_id: &str, variant_id: Option<&str>, quantity: i64, price: f64) -> OrderItemInput {
        OrderItemInput {
            product_id: product_id.to_string(),
            variant_id: variant_id.map(str::to_string),
            quantity,
            price,
        }
    }

    fn order_for(user: &User, items: Vec<OrderItemInput>) -> CreateOrderRequest {
        CreateOrderRequest {
            user_id: user.id.clone(),
            items,
            shipping_address: Some("12 Farm Road".to_string()),
            notes: None,
        }
    }

    fn verify() -> UpdateOrderRequest {
        UpdateOrderRequest {
            payment_verified: Some(true),
            ..Default::default()
        }
    }

    async fn stock(db: &Db, id: &str) -> i64 {
        db.get::<Inventory>(id).await.unwrap().unwrap().quantity
    }

    #[actix_web::test]
    async fn total_is_fixed_at_creation() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, variant) = seed_product(&app.state).await;
        seed_inventory(&app.state, &product.id, Some(&variant.id), 10).await;
        seed_inventory(&app.state, &product.id, None, 10).await;

        let req = order_for(
            &customer,
            vec![
                item(&product.id, Some(&variant.id), 2, 100.0),
                item(&product.id, None, 1, 50.0),
            ],
        );
        let view = create_order(db, req).await.unwrap();
        assert_eq!(view.order.total_amount, 250.0);
        assert_eq!(view.order.status, OrderStatus::PaymentPending);
        assert!(!view.order.payment_verified);
        assert_eq!(view.items.len(), 2);
        assert!(view.order.order_number.starts_with("ORD-"));

        db.update::<ProductVariant>(&variant.id, doc! { "price": 999.0 }).await.unwrap();
        let admin = seed_user(&app.state, "root@example.com", Role::Admin).await;
        let again = get_order(db, &testing::session(&admin), &view.order.id).await.unwrap();
        assert_eq!(again.order.total_amount, 250.0);
        assert_eq!(again.items[0].item.price, 100.0);
    }

    #[actix_web::test]
    async fn insufficient_stock_persists_nothing() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, variant) = seed_product(&app.state).await;
        seed_inventory(&app.state, &product.id, Some(&variant.id), 3).await;

        let split = order_for(
            &customer,
            vec![
                item(&product.id, Some(&variant.id), 2, 100.0),
                item(&product.id, Some(&variant.id), 2, 100.0),
            ],
        );
        let err = create_order(db, split).await.unwrap_err();
        assert!(err.to_string().starts_with("Insufficient inventory"));

        let unstocked = order_for(&customer, vec![item(&product.id, None, 1, 10.0)]);
        let err = create_order(db, unstocked).await.unwrap_err();
        assert!(err.to_string().starts_with("No inventory found"));

        assert!(db.find::<Order>(Document::new(), None).await.unwrap().is_empty());
        assert!(db.find::<OrderItem>(Document::new(), None).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn rejects_bad_items_and_unknown_users() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, _) = seed_product(&app.state).await;

        let empty = order_for(&customer, vec![]);
        assert!(matches!(create_order(db, empty).await.unwrap_err(), ApiError::Validation(_)));

        let zero = order_for(&customer, vec![item(&product.id, None, 0, 10.0)]);
        assert!(matches!(create_order(db, zero).await.unwrap_err(), ApiError::Validation(_)));

        let negative = order_for(&customer, vec![item(&product.id, None, 1, -1.0)]);
        assert!(matches!(create_order(db, negative).await.unwrap_err(), ApiError::Validation(_)));

        let mut stranger = order_for(&customer, vec![item(&product.id, None, 1, 10.0)]);
        stranger.user_id = "missing".to_string();
        assert!(matches!(create_order(db, stranger).await.unwrap_err(), ApiError::Validation(_)));
    }

    #[actix_web::test]
    async fn verification_deducts_exactly_once_and_mails_pdf() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, variant) = seed_product(&app.state).await;
        let inventory = seed_inventory(&app.state, &product.id, Some(&variant.id), 5).await;

        let order = create_order(
            db,
            order_for(&customer, vec![item(&product.id, Some(&variant.id), 2, 100.0)]),
        )
        .await
        .unwrap();
        assert_eq!(stock(db, &inventory.id).await, 5);

        let verified = update_order(&app.state, &order.order.id, verify()).await.unwrap();
        assert!(verified.order.payment_verified);
        let stamped = verified.order.payment_verified_at.unwrap();
        assert_eq!(stock(db, &inventory.id).await, 3);

        let again = update_order(&app.state, &order.order.id, verify()).await.unwrap();
        assert_eq!(stock(db, &inventory.id).await, 3);
        assert_eq!(again.order.payment_verified_at, Some(stamped));

        let sent = wait_for(&app.mailer, 1).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["c@example.com".to_string()]);
        let attachment = sent[0].attachment.as_ref().unwrap();
        assert_eq!(attachment.filename, format!("order-{}.pdf", order.order.order_number));
        assert!(attachment.content.starts_with(b"%PDF"));
    }

    #[actix_web::test]
    async fn deduction_clamps_at_zero() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, _) = seed_product(&app.state).await;
        let inventory = seed_inventory(&app.state, &product.id, None, 3).await;

        let order = create_order(db, order_for(&customer, vec![item(&product.id, None, 3, 10.0)]))
            .await
            .unwrap();
        db.update::<Inventory>(&inventory.id, doc! { "quantity": 1_i64 }).await.unwrap();

        update_order(&app.state, &order.order.id, verify()).await.unwrap();
        assert_eq!(stock(db, &inventory.id).await, 0);
    }

    #[actix_web::test]
    async fn overflowing_quantities_are_rejected() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, _) = seed_product(&app.state).await;
        seed_inventory(&app.state, &product.id, None, 10).await;

        let huge = order_for(
            &customer,
            vec![
                item(&product.id, None, i64::MAX, 1.0),
                item(&product.id, None, i64::MAX, 1.0),
            ],
        );
        let err = create_order(db, huge).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert!(db.find::<Order>(Document::new(), None).await.unwrap().is_empty());
    }

    #[actix_web::test]
    async fn losing_the_verification_claim_skips_side_effects() {
        let store = ContestedStore::new(|collection, filter| {
            match (collection, filter.get_str("id")) {
                ("orders", Ok(id)) if filter.contains_key("paymentVerified") => Interference::Race {
                    filter: doc! { "id": id },
                    set: doc! { "paymentVerified": true },
                },
                _ => Interference::None,
            }
        });
        let app = testing::app_with(Arc::new(store));
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, variant) = seed_product(&app.state).await;
        let inventory = seed_inventory(&app.state, &product.id, Some(&variant.id), 5).await;
        let order = create_order(
            db,
            order_for(&customer, vec![item(&product.id, Some(&variant.id), 2, 100.0)]),
        )
        .await
        .unwrap();

        let req = UpdateOrderRequest {
            payment_verified: Some(true),
            notes: Some(Some("Paid by bank transfer".to_string())),
            ..Default::default()
        };
        let view = update_order(&app.state, &order.order.id, req).await.unwrap();
        assert!(view.order.payment_verified);
        assert_eq!(view.order.notes.as_deref(), Some("Paid by bank transfer"));
        assert_eq!(stock(db, &inventory.id).await, 5);
        assert!(wait_for(&app.mailer, 1).await.is_empty());
    }

    #[actix_web::test]
    async fn terminal_orders_keep_their_status() {
        let app = testing::app();
        let db = &app.state.db;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let (product, _) = seed_product(&app.state).await;
        seed_inventory(&app.state, &product.id, None, 3).await;
        let order = create_order(db, order_for(&customer, vec![item(&product.id, None, 1, 10.0)]))
            .await
            .unwrap();

        let cancel = UpdateOrderRequest {
            status: Some(OrderStatus::Cancelled),
            ..Default::default()
        };
        update_order(&app.state, &order.order.id, cancel).await.unwrap();

        let reopen = UpdateOrderRequest {
            status: Some(OrderStatus::Processing),
            ..Default::default()
        };
        let err = update_order(&app.state, &order.order.id, reopen).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        let note = UpdateOrderRequest {
            notes: Some(Some("Refunded".to_string())),
            ..Default::default()
        };
        let updated = update_order(&app.state, &order.order.id, note).await.unwrap();
        assert_eq!(updated.order.status, OrderStatus::Cancelled);
        assert_eq!(updated.order.notes.as_deref(), Some("Refunded"));
    }

    #[actix_web::test]
    async fn customers_see_only_their_orders() {
        let app = testing::app();
        let db = &app.state.db;
        let alice = seed_user(&app.state, "alice@example.com", Role::Customer).await;
        let bob = seed_user(&app.state, "bob@example.com", Role::Customer).await;
        let (product, _) = seed_product(&app.state).await;
        seed_inventory(&app.state, &product.id, None, 10).await;
        let order = create_order(db, order_for(&alice, vec![item(&product.id, None, 1, 10.0)]))
            .await
            .unwrap();

        let err = get_order(db, &testing::session(&bob), &order.order.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        assert!(list_orders(db, &testing::session(&bob), None).await.unwrap().is_empty());
        assert_eq!(list_orders(db, &testing::session(&alice), None).await.unwrap().len(), 1);
        assert!(matches!(
            get_order(db, &testing::session(&alice), "missing").await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }
}
