use actix_web::{web, HttpResponse};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::nullable;
use crate::auth::Session;
use crate::db::{newest_first, Db};
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{new_id, ts, Complaint, ComplaintStatus, Order, OrderStatus, User, UserSummary};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateComplaintRequest {
    #[validate(length(min = 1))]
    pub order_id: String,
    /// Accepted for compatibility; the order's own number is stored.
    pub order_number: Option<String>,
    #[validate(length(min = 1))]
    pub subject: String,
    #[validate(length(min = 1))]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateComplaintRequest {
    pub id: String,
    pub status: Option<ComplaintStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub resolution: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub id: String,
    pub order_number: String,
    pub status: OrderStatus,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        OrderSummary {
            id: order.id.clone(),
            order_number: order.order_number.clone(),
            status: order.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ComplaintView {
    #[serde(flatten)]
    pub complaint: Complaint,
    pub user: Option<UserSummary>,
    pub order: Option<OrderSummary>,
}

async fn view(db: &Db, complaint: Complaint) -> ApiResult<ComplaintView> {
    let user = db.get::<User>(&complaint.user_id).await?.as_ref().map(UserSummary::from);
    let order = db.get::<Order>(&complaint.order_id).await?.as_ref().map(OrderSummary::from);
    Ok(ComplaintView { complaint, user, order })
}

pub async fn create_complaint(db: &Db, caller: &Session, req: CreateComplaintRequest) -> ApiResult<ComplaintView> {
    req.validate()?;
    let order = db
        .get::<Order>(&req.order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Order not found".to_string()))?;
    if !caller.can_access(Some(order.user_id.as_str())) {
        return Err(ApiError::Forbidden("You do not have access to this order".to_string()));
    }
    if let Some(number) = req.order_number.as_deref() {
        if number != order.order_number {
            log::debug!(
                "Complaint for {} quoted order number {}, storing {}",
                order.id,
                number,
                order.order_number
            );
        }
    }

    let now = Utc::now();
    let complaint = Complaint {
        id: new_id(),
        user_id: caller.id.clone(),
        order_id: order.id.clone(),
        order_number: order.order_number.clone(),
        subject: req.subject,
        description: req.description,
        status: ComplaintStatus::Open,
        resolution: None,
        created_at: now,
        updated_at: now,
    };
    db.insert(&complaint).await?;
    log::info!("Complaint {} opened on order {}", complaint.id, complaint.order_number);
    view(db, complaint).await
}

pub async fn list_complaints(
    db: &Db,
    caller: &Session,
    status: Option<ComplaintStatus>,
) -> ApiResult<Vec<ComplaintView>> {
    let mut filter = Document::new();
    if !caller.is_admin() {
        filter.insert("userId", caller.id.clone());
    }
    if let Some(status) = status {
        filter.insert("status", status);
    }
    let complaints = db.find::<Complaint>(filter, newest_first()).await?;
    let mut views = Vec::with_capacity(complaints.len());
    for complaint in complaints {
        views.push(view(db, complaint).await?);
    }
    Ok(views)
}

pub async fn update_complaint(db: &Db, req: UpdateComplaintRequest) -> ApiResult<ComplaintView> {
    let mut set = doc! { "updatedAt": ts::bson(&Utc::now()) };
    if let Some(status) = req.status {
        set.insert("status", status);
    }
    if let Some(resolution) = req.resolution {
        set.insert("resolution", resolution);
    }
    if !db.update::<Complaint>(&req.id, set).await? {
        return Err(ApiError::NotFound("Complaint not found".to_string()));
    }
    let complaint = db
        .get::<Complaint>(&req.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Complaint not found".to_string()))?;
    view(db, complaint).await
}

#[derive(Deserialize)]
pub struct StatusQuery {
    status: Option<ComplaintStatus>,
}

pub async fn create(
    state: web::Data<AppState>,
    session: Session,
    body: web::Json<CreateComplaintRequest>,
) -> ApiResult<HttpResponse> {
    let complaint = create_complaint(&state.db, &session, body.into_inner()).await?;
    Ok(HttpResponse::Created().json(complaint))
}

pub async fn list(
    state: web::Data<AppState>,
    session: Session,
    query: web::Query<StatusQuery>,
) -> ApiResult<HttpResponse> {
    let complaints = list_complaints(&state.db, &session, query.into_inner().status).await?;
    Ok(HttpResponse::Ok().json(complaints))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<UpdateComplaintRequest>,
) -> ApiResult<HttpResponse> {
    let complaint = update_complaint(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(complaint))
}
