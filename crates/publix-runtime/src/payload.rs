//! Request body normalization for result, session and log data.

use crate::error::PublixError;

fn media_type(content_type: Option<&str>) -> String {
    content_type
        .and_then(|raw| raw.split(';').next())
        .map(|essence| essence.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Turns a text, JSON or XML body into the string that gets stored. JSON is
/// re-serialized compactly; text and XML are kept as sent. A missing content
/// type is read as text.
pub fn normalize_request_body(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<String, PublixError> {
    let media = media_type(content_type);
    let as_text = || {
        std::str::from_utf8(body)
            .map(str::to_string)
            .map_err(|_| PublixError::bad_request("request body is not valid UTF-8"))
    };
    match media.as_str() {
        "" | "text/plain" => as_text(),
        m if m == "application/json" || m == "text/json" || m.ends_with("+json") => {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(String::new());
            }
            let value: serde_json::Value = serde_json::from_slice(body)
                .map_err(|e| PublixError::bad_request(format!("invalid JSON body: {}", e)))?;
            Ok(value.to_string())
        }
        m if m == "application/xml" || m == "text/xml" || m.ends_with("+xml") => as_text(),
        other => Err(PublixError::UnsupportedMediaType(other.to_string())),
    }
}

/// Collapses every run of whitespace into a single space.
pub fn single_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}
