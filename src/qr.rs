use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use qrcode::render::svg;
use qrcode::QrCode;
use rand::Rng;

use crate::error::ApiError;

/// `QR-<millis>-<0..9999>`, the label printed under a stock code.
pub fn generate_code() -> String {
    let random: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("QR-{}-{}", Utc::now().timestamp_millis(), random)
}

/// Renders `code` as an SVG QR symbol wrapped in a data URL.
pub fn image_data_url(code: &str) -> Result<String, ApiError> {
    let symbol = QrCode::new(code.as_bytes())
        .map_err(|e| ApiError::internal(format!("failed to encode QR code: {e}")))?;
    let image = symbol
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}
