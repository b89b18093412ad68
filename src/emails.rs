//! HTML bodies for the messages the store sends. Templates are rendered
//! with handlebars, which escapes every `{{value}}`; only `{{{body}}}` and
//! the verify link are inserted raw.

use handlebars::Handlebars;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::mailer::{Attachment, Email, MailError};
use crate::models::{Lead, Order};

const LAYOUT: &str = r#"<!DOCTYPE html>
<html>
  <body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
      <h1>{{heading}}</h1>
      {{{body}}}
      <p style="text-align: center; color: #666; font-size: 12px;">{{app}}<br>{{url}}</p>
    </div>
  </body>
</html>"#;

const VERIFICATION: &str = r#"<p>Dear {{name}},</p>
<p>Please confirm your email address to finish setting up your account.</p>
<p><a href="{{{link}}}">Verify Email</a></p>
<p>This link expires in 24 hours.</p>"#;

const WELCOME: &str = r#"<p>Dear {{name}},</p>
<p>An account has been created for you at {{app}}. You can now browse our products, submit enquiries and track your orders.</p>
<p><a href="{{{link}}}">Verify Email</a></p>"#;

const LEAD_NOTIFICATION: &str = r#"<p><strong>Name:</strong> {{lead.name}}</p>
<p><strong>Email:</strong> {{lead.email}}</p>
<p><strong>Phone:</strong> {{lead.phone}}</p>
{{#if product}}<p><strong>Product:</strong> {{product}}</p>{{/if}}
{{#if lead.message}}<p><strong>Message:</strong> {{lead.message}}</p>{{/if}}
<p>Lead ID: {{lead.id}}</p>"#;

const LEAD_THANK_YOU: &str = r#"<p>Dear {{name}},</p>
<p>Thank you for showing interest in {{#if product}}our product: <strong>{{product}}</strong>{{else}}our products{{/if}}!</p>
<p>Our sales team will contact you soon to discuss your requirements.</p>"#;

const ORDER_CONFIRMATION: &str = r#"<p>Dear {{name}},</p>
<p>Thank you for your order! Your payment has been confirmed.</p>
<p><strong>Order Number:</strong> {{number}}</p>
<p><strong>Total Amount:</strong> {{total}}</p>
<p><strong>Status:</strong> {{status}}</p>
<p>We will notify you once it ships.</p>"#;

fn page<T: Serialize>(config: &Config, heading: &str, template: &str, data: &T) -> Result<String, MailError> {
    let registry = Handlebars::new();
    let body = registry.render_template(template, data)?;
    let html = registry.render_template(
        LAYOUT,
        &json!({
            "heading": heading,
            "body": body,
            "app": config.app_name,
            "url": config.app_url,
        }),
    )?;
    Ok(html)
}

fn verify_link(config: &Config, token: &str) -> String {
    format!("{}/auth/verify?token={}", config.app_url.trim_end_matches('/'), token)
}

/// Sent after a public registration.
pub fn verification(config: &Config, to: &str, name: &str, token: &str) -> Result<Email, MailError> {
    let data = json!({ "name": name, "link": verify_link(config, token) });
    Ok(Email {
        to: vec![to.to_string()],
        subject: format!("Verify your email - {}", config.app_name),
        html: page(config, "Verify Your Email", VERIFICATION, &data)?,
        attachment: None,
    })
}

/// Sent when an admin creates the account; still carries the verify link.
pub fn welcome(config: &Config, to: &str, name: &str, token: &str) -> Result<Email, MailError> {
    let data = json!({
        "name": name,
        "app": config.app_name,
        "link": verify_link(config, token),
    });
    Ok(Email {
        to: vec![to.to_string()],
        subject: format!("Welcome to {}!", config.app_name),
        html: page(config, &format!("Welcome {name}!"), WELCOME, &data)?,
        attachment: None,
    })
}

pub fn lead_notification(
    config: &Config,
    admins: Vec<String>,
    lead: &Lead,
    product_name: Option<&str>,
) -> Result<Email, MailError> {
    let data = json!({ "lead": lead, "product": product_name });
    Ok(Email {
        to: admins,
        subject: format!("New Lead Generated - {}", product_name.unwrap_or("Product Enquiry")),
        html: page(config, "New Lead", LEAD_NOTIFICATION, &data)?,
        attachment: None,
    })
}

pub fn lead_thank_you(config: &Config, to: &str, name: &str, product_name: Option<&str>) -> Result<Email, MailError> {
    let data = json!({ "name": name, "product": product_name });
    Ok(Email {
        to: vec![to.to_string()],
        subject: format!(
            "Thank You for Your Interest - {}",
            product_name.unwrap_or("Product Enquiry")
        ),
        html: page(config, "Thank You for Your Interest!", LEAD_THANK_YOU, &data)?,
        attachment: None,
    })
}

pub fn order_confirmation(
    config: &Config,
    to: &str,
    name: &str,
    order: &Order,
    pdf: Option<Vec<u8>>,
) -> Result<Email, MailError> {
    let data = json!({
        "name": name,
        "number": order.order_number,
        "total": format!("{:.2}", order.total_amount),
        "status": order.status.as_str(),
    });
    Ok(Email {
        to: vec![to.to_string()],
        subject: format!("Order Confirmation - {}", order.order_number),
        html: page(config, "Order Confirmation", ORDER_CONFIRMATION, &data)?,
        attachment: pdf.map(|content| Attachment {
            filename: format!("order-{}.pdf", order.order_number),
            content_type: "application/pdf".to_string(),
            content,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_id, LeadStatus};
    use chrono::Utc;

    #[test]
    fn user_text_is_escaped() {
        let config = Config::in_memory("secret");
        let email = verification(&config, "a@b.c", "<script>", "tok").unwrap();
        assert!(email.html.contains("&lt;script&gt;"));
        assert!(!email.html.contains("<script>"));
    }

    #[test]
    fn verify_link_points_at_app_url() {
        let mut config = Config::in_memory("secret");
        config.app_url = "https://shop.example.com/".to_string();
        let email = welcome(&config, "a@b.c", "Asha", "abc123").unwrap();
        assert!(email
            .html
            .contains("https://shop.example.com/auth/verify?token=abc123"));
        assert!(email.html.contains("<h1>Welcome Asha!</h1>"));
        assert_eq!(email.subject, "Welcome to Storefront!");
    }

    #[test]
    fn lead_notification_skips_missing_sections() {
        let config = Config::in_memory("secret");
        let now = Utc::now();
        let lead = Lead {
            id: new_id(),
            product_id: None,
            user_id: None,
            name: "Ravi & Sons".to_string(),
            email: "ravi@example.com".to_string(),
            phone: "9876543210".to_string(),
            message: None,
            status: LeadStatus::New,
            notes: None,
            converted_to_order_id: None,
            created_at: now,
            updated_at: now,
        };
        let email = lead_notification(&config, vec!["root@example.com".to_string()], &lead, None).unwrap();
        assert!(email.html.contains("Ravi &amp; Sons"));
        assert!(!email.html.contains("Product:"));
        assert!(!email.html.contains("Message:"));
        assert_eq!(email.subject, "New Lead Generated - Product Enquiry");

        let thanks = lead_thank_you(&config, "ravi@example.com", "Ravi", Some("Egg Incubator")).unwrap();
        assert!(thanks.html.contains("our product: <strong>Egg Incubator</strong>"));
    }
}
