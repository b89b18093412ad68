use chrono::Utc;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use thiserror::Error;

use crate::models::OrderView;

#[derive(Debug, Error)]
#[error("failed to render pdf: {0}")]
pub struct PdfError(String);

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 56;
const LINES_PER_PAGE: usize = 44;

struct Line {
    size: i64,
    indent: i64,
    text: String,
}

impl Line {
    fn new(size: i64, indent: i64, text: impl Into<String>) -> Self {
        Line { size, indent, text: text.into() }
    }
}

/// Only printable ASCII is written; anything else becomes `?`.
fn printable(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c as u8 } else { b'?' })
        .collect()
}

fn confirmation_lines(app_name: &str, order: &OrderView) -> Vec<Line> {
    let mut lines = vec![
        Line::new(20, 0, "Order Confirmation"),
        Line::new(10, 0, app_name),
        Line::new(12, 0, ""),
        Line::new(12, 0, format!("Order Number: {}", order.order.order_number)),
        Line::new(12, 0, format!("Date: {}", Utc::now().format("%Y-%m-%d"))),
        Line::new(12, 0, ""),
        Line::new(14, 0, "Customer Details"),
    ];

    if let Some(user) = &order.user {
        lines.push(Line::new(10, 0, format!("Name: {}", user.name)));
        lines.push(Line::new(10, 0, format!("Email: {}", user.email)));
    }
    if let Some(address) = &order.order.shipping_address {
        lines.push(Line::new(10, 0, format!("Address: {address}")));
    }

    lines.push(Line::new(12, 0, ""));
    lines.push(Line::new(14, 0, "Order Items"));
    for (index, item) in order.items.iter().enumerate() {
        let product = item
            .product
            .as_ref()
            .map(|p| p.name.as_str())
            .unwrap_or("Unknown");
        lines.push(Line::new(10, 8, format!("{}. {}", index + 1, product)));
        if let Some(variant) = &item.variant {
            lines.push(Line::new(10, 24, format!("Variant: {}", variant.name)));
        }
        lines.push(Line::new(10, 24, format!("Quantity: {}", item.item.quantity)));
        lines.push(Line::new(10, 24, format!("Price: {:.2}", item.item.price)));
    }

    lines.push(Line::new(12, 0, ""));
    lines.push(Line::new(12, 0, format!("Total Amount: {:.2}", order.order.total_amount)));
    lines.push(Line::new(10, 0, ""));
    lines.push(Line::new(10, 0, "Thank you for your order!"));
    lines
}

fn page_content(lines: &[Line]) -> Content {
    let mut operations = Vec::new();
    let mut y = PAGE_HEIGHT - MARGIN;
    for line in lines {
        y -= line.size + 6;
        if line.text.is_empty() {
            continue;
        }
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), Object::Integer(line.size)]));
        operations.push(Operation::new(
            "Td",
            vec![Object::Integer(MARGIN + line.indent), Object::Integer(y)],
        ));
        operations.push(Operation::new("Tj", vec![Object::string_literal(printable(&line.text))]));
        operations.push(Operation::new("ET", vec![]));
    }
    Content { operations }
}

/// Renders the order confirmation attached to the payment-verified mail.
pub fn order_confirmation(app_name: &str, order: &OrderView) -> Result<Vec<u8>, PdfError> {
    let lines = confirmation_lines(app_name, order);

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut page_ids: Vec<ObjectId> = Vec::new();
    for chunk in lines.chunks(LINES_PER_PAGE) {
        let encoded = page_content(chunk)
            .encode()
            .map_err(|e| PdfError(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        page_ids.push(page_id);
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => page_ids.iter().map(|id| Object::Reference(*id)).collect::<Vec<_>>(),
        "Count" => page_ids.len() as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(PAGE_WIDTH),
            Object::Integer(PAGE_HEIGHT),
        ],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).map_err(|e| PdfError(e.to_string()))?;
    Ok(buffer)
}
