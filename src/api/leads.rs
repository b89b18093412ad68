use actix_web::{web, HttpResponse};
use chrono::Utc;
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::nullable;
use super::products::{active_variants, ProductView};
use crate::auth::Session;
use crate::db::{newest_first, Db};
use crate::emails;
use crate::error::{ApiError, ApiResult};
use crate::middleware::Admin;
use crate::models::{new_id, ts, Lead, LeadStatus, Product, Role, User, UserSummary};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateLeadRequest {
    pub product_id: Option<String>,
    pub user_id: Option<String>,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub phone: String,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLeadRequest {
    pub id: String,
    pub status: Option<LeadStatus>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub converted_to_order_id: Option<Option<String>>,
}

#[derive(Debug, Serialize)]
pub struct LeadView {
    #[serde(flatten)]
    pub lead: Lead,
    pub product: Option<ProductView>,
    pub user: Option<UserSummary>,
}

async fn view(db: &Db, lead: Lead) -> ApiResult<LeadView> {
    let product = match &lead.product_id {
        Some(id) => match db.get::<Product>(id).await? {
            Some(product) => {
                let variants = active_variants(db, &product.id).await?;
                Some(ProductView {
                    product,
                    variants: Some(variants),
                    inventory: None,
                })
            }
            None => None,
        },
        None => None,
    };
    let user = match &lead.user_id {
        Some(id) => db.get::<User>(id).await?.as_ref().map(UserSummary::from),
        None => None,
    };
    Ok(LeadView { lead, product, user })
}

/// Admins are told about the enquiry and the submitter gets a thank-you.
/// Neither mail holds up the response.
fn notify(state: &AppState, lead: &Lead, product_name: Option<String>) {
    state.mail(emails::lead_thank_you(
        &state.config,
        &lead.email,
        &lead.name,
        product_name.as_deref(),
    ));

    let state = state.clone();
    let lead = lead.clone();
    actix_web::rt::spawn(async move {
        let admins = match state.db.find::<User>(doc! { "role": Role::Admin }, None).await {
            Ok(admins) => admins,
            Err(e) => {
                log::error!("Failed to look up admins for lead {}: {}", lead.id, e);
                return;
            }
        };
        let recipients: Vec<String> = admins.into_iter().map(|a| a.email).collect();
        if recipients.is_empty() {
            return;
        }
        let delivered = match emails::lead_notification(&state.config, recipients, &lead, product_name.as_deref()) {
            Ok(email) => state.mailer.send(email).await,
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            log::error!("Failed to notify admins about lead {}: {}", lead.id, e);
        }
    });
}

pub async fn create_lead(state: &AppState, caller: Option<&Session>, req: CreateLeadRequest) -> ApiResult<LeadView> {
    req.validate()?;
    let now = Utc::now();
    let lead = Lead {
        id: new_id(),
        product_id: req.product_id.filter(|id| !id.is_empty()),
        user_id: req
            .user_id
            .filter(|id| !id.is_empty())
            .or_else(|| caller.map(|s| s.id.clone())),
        name: req.name,
        email: req.email,
        phone: req.phone,
        message: req.message,
        status: LeadStatus::New,
        notes: None,
        converted_to_order_id: None,
        created_at: now,
        updated_at: now,
    };
    state.db.insert(&lead).await?;
    log::info!("Lead {} received from {}", lead.id, lead.email);

    let view = view(&state.db, lead).await?;
    notify(state, &view.lead, view.product.as_ref().map(|p| p.product.name.clone()));
    Ok(view)
}

/// Customers only ever see leads recorded against their own account.
pub async fn list_leads(db: &Db, caller: &Session, status: Option<LeadStatus>) -> ApiResult<Vec<LeadView>> {
    let mut filter = Document::new();
    if !caller.is_admin() {
        filter.insert("userId", caller.id.clone());
    }
    if let Some(status) = status {
        filter.insert("status", status);
    }
    let leads = db.find::<Lead>(filter, newest_first()).await?;
    let mut views = Vec::with_capacity(leads.len());
    for lead in leads {
        views.push(view(db, lead).await?);
    }
    Ok(views)
}

pub async fn update_lead(db: &Db, req: UpdateLeadRequest) -> ApiResult<LeadView> {
    let mut set = doc! { "updatedAt": ts::bson(&Utc::now()) };
    if let Some(status) = req.status {
        set.insert("status", status);
    }
    if let Some(notes) = req.notes {
        set.insert("notes", notes);
    }
    if let Some(order_id) = req.converted_to_order_id {
        set.insert("convertedToOrderId", order_id);
    }
    if !db.update::<Lead>(&req.id, set).await? {
        return Err(ApiError::NotFound("Lead not found".to_string()));
    }
    let lead = db
        .get::<Lead>(&req.id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Lead not found".to_string()))?;
    view(db, lead).await
}

#[derive(Deserialize)]
pub struct StatusQuery {
    status: Option<LeadStatus>,
}

pub async fn create(
    state: web::Data<AppState>,
    caller: Option<Session>,
    body: web::Json<CreateLeadRequest>,
) -> ApiResult<HttpResponse> {
    let lead = create_lead(&state, caller.as_ref(), body.into_inner()).await?;
    Ok(HttpResponse::Created().json(lead))
}

pub async fn list(
    state: web::Data<AppState>,
    session: Session,
    query: web::Query<StatusQuery>,
) -> ApiResult<HttpResponse> {
    let leads = list_leads(&state.db, &session, query.into_inner().status).await?;
    Ok(HttpResponse::Ok().json(leads))
}

pub async fn update(
    state: web::Data<AppState>,
    _admin: Admin,
    body: web::Json<UpdateLeadRequest>,
) -> ApiResult<HttpResponse> {
    let lead = update_lead(&state.db, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(lead))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::testing::wait_for;
    use crate::state::testing::{self, seed_product, seed_user};

    fn enquiry(product_id: Option<&str>) -> CreateLeadRequest {
        CreateLeadRequest {
            product_id: product_id.map(str::to_string),
            user_id: None,
            name: "Ravi".to_string(),
            email: "ravi@example.com".to_string(),
            phone: "9876543210".to_string(),
            message: Some("Need a quote".to_string()),
        }
    }

    #[actix_web::test]
    async fn new_lead_notifies_admins_and_thanks_submitter() {
        let app = testing::app();
        seed_user(&app.state, "root@example.com", Role::Admin).await;
        seed_user(&app.state, "ops@example.com", Role::Admin).await;
        let (product, _) = seed_product(&app.state).await;

        let lead = create_lead(&app.state, None, enquiry(Some(&product.id))).await.unwrap();
        assert_eq!(lead.lead.status, LeadStatus::New);
        assert_eq!(lead.product.as_ref().map(|p| p.product.id.as_str()), Some(product.id.as_str()));

        let sent = wait_for(&app.mailer, 2).await;
        assert_eq!(sent.len(), 2);
        let to_admins = sent.iter().find(|m| m.subject.starts_with("New Lead")).unwrap();
        assert_eq!(to_admins.to.len(), 2);
        assert!(sent
            .iter()
            .any(|m| m.to == vec!["ravi@example.com".to_string()] && m.subject.contains("Egg Incubator")));
    }

    #[actix_web::test]
    async fn signed_in_submitter_is_recorded() {
        let app = testing::app();
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let session = testing::session(&customer);
        let lead = create_lead(&app.state, Some(&session), enquiry(None)).await.unwrap();
        assert_eq!(lead.lead.user_id.as_deref(), Some(customer.id.as_str()));
        assert_eq!(lead.user.map(|u| u.id), Some(customer.id));
    }

    #[actix_web::test]
    async fn customers_only_list_their_own_leads() {
        let app = testing::app();
        let admin = seed_user(&app.state, "root@example.com", Role::Admin).await;
        let customer = seed_user(&app.state, "c@example.com", Role::Customer).await;
        let mine = testing::session(&customer);
        create_lead(&app.state, Some(&mine), enquiry(None)).await.unwrap();
        create_lead(&app.state, None, enquiry(None)).await.unwrap();

        assert_eq!(list_leads(&app.state.db, &mine, None).await.unwrap().len(), 1);
        let all = list_leads(&app.state.db, &testing::session(&admin), None).await.unwrap();
        assert_eq!(all.len(), 2);
        let closed = list_leads(&app.state.db, &testing::session(&admin), Some(LeadStatus::Closed))
            .await
            .unwrap();
        assert!(closed.is_empty());
    }

    #[actix_web::test]
    async fn triage_patches_status_and_notes() {
        let app = testing::app();
        let lead = create_lead(&app.state, None, enquiry(None)).await.unwrap();
        let req = UpdateLeadRequest {
            id: lead.lead.id.clone(),
            status: Some(LeadStatus::Contacted),
            notes: Some(Some("Called back".to_string())),
            converted_to_order_id: None,
        };
        let updated = update_lead(&app.state.db, req).await.unwrap();
        assert_eq!(updated.lead.status, LeadStatus::Contacted);
        assert_eq!(updated.lead.notes.as_deref(), Some("Called back"));
        assert_eq!(updated.lead.message.as_deref(), Some("Need a quote"));

        let missing = UpdateLeadRequest {
            id: "missing".to_string(),
            status: None,
            notes: None,
            converted_to_order_id: None,
        };
        assert!(matches!(
            update_lead(&app.state.db, missing).await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }
}
