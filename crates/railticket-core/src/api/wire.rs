//! Upstream wire format.
//!
//! Request payloads, response schemas, and the translation of every upstream
//! reply into a typed result. The `interpret_*` functions take the transport
//! status and raw body and never touch the network, so each upstream failure
//! shape can be exercised directly.
//!
//! The upstream is a WCF-style JSON service: HTTP 200 does not imply success.
//! Application errors arrive as a non-empty `Uzenetek` list, which is checked
//! before any payload is trusted.

use reqwest::StatusCode;
use serde::{de, de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::ApiError;
use crate::models::{AuthGrant, PolicyDocument, TicketImage, TicketRecord};

pub(crate) const LOGIN_ENDPOINT: &str = "Bejelentkezes";
pub(crate) const ORDER_SEARCH_ENDPOINT: &str = "MegrendelesKereses";
pub(crate) const TICKET_IMAGE_ENDPOINT: &str = "GetJegykep";

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    #[serde(rename = "FelhasznaloAzonosito")]
    pub username: &'a str,
    #[serde(rename = "Jelszo")]
    pub password: &'a str,
    #[serde(rename = "Nyelv")]
    pub language: &'a str,
    #[serde(rename = "UAID")]
    pub client_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct OrderSearchRequest<'a> {
    /// Only currently valid tickets
    #[serde(rename = "Ervenyes")]
    pub valid_only: bool,
    #[serde(rename = "FelhasznaloAzonosito")]
    pub username: &'a str,
    #[serde(rename = "Token")]
    pub token: &'a str,
    #[serde(rename = "Nyelv")]
    pub language: &'a str,
    #[serde(rename = "UAID")]
    pub client_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct TicketImageRequest<'a> {
    #[serde(rename = "FelhasznaloAzonosito")]
    pub username: &'a str,
    /// The upstream only accepts a list, even for a single document.
    #[serde(rename = "BizonylatAzonosito")]
    pub document_ids: Vec<&'a str>,
    #[serde(rename = "Token")]
    pub token: &'a str,
    #[serde(rename = "Nyelv")]
    pub language: &'a str,
    #[serde(rename = "UAID")]
    pub client_id: &'a str,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "Uzenetek", default)]
    messages: Option<Vec<UpstreamMessage>>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(rename = "Szoveg", default)]
    text: Option<String>,
}

impl Envelope {
    fn first_text(&self) -> Option<String> {
        self.messages
            .iter()
            .flatten()
            .find_map(|m| m.text.clone().filter(|t| !t.trim().is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "Token", default)]
    token: Option<String>,
    #[serde(rename = "ErvenyessegVege", default, deserialize_with = "opt_epoch")]
    expires_at: Option<i64>,
    #[serde(rename = "ElfogadandoDoksik", default)]
    documents: Option<Vec<LoginDocument>>,
}

#[derive(Debug, Deserialize)]
struct LoginDocument {
    #[serde(rename = "DokumentumKod", default)]
    code: Option<String>,
    #[serde(rename = "Verzio", default)]
    version: Option<i64>,
    #[serde(rename = "HtmlUrl", default)]
    html_url: Option<String>,
    #[serde(rename = "PdfUrl", default)]
    pdf_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderSearchResponse {
    #[serde(rename = "Megrendelesek", default)]
    orders: Option<Vec<Order>>,
}

#[derive(Debug, Deserialize)]
struct Order {
    #[serde(rename = "MegrendelesAzonosito", deserialize_with = "id_string")]
    order_id: String,
    #[serde(rename = "JegykepAdatok", default)]
    documents: Vec<OrderDocument>,
}

#[derive(Debug, Deserialize)]
struct OrderDocument {
    #[serde(rename = "BizonylatAzonosito", deserialize_with = "id_string")]
    document_id: String,
    #[serde(rename = "Jegysorszam", default, deserialize_with = "opt_text")]
    serial_number: Option<String>,
    #[serde(rename = "UtasNeve", default)]
    passenger_name: Option<String>,
    #[serde(rename = "Jegyek", default)]
    line_items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
struct LineItem {
    #[serde(rename = "TetelAzonosito", deserialize_with = "id_string")]
    line_item_id: String,
    #[serde(rename = "Nev")]
    name: String,
    #[serde(rename = "Kedvezmeny", default, deserialize_with = "opt_text")]
    discount: Option<String>,
    #[serde(rename = "ErvKezd", default, deserialize_with = "opt_epoch")]
    valid_from: Option<i64>,
    #[serde(rename = "ErvVeg", default, deserialize_with = "opt_epoch")]
    valid_to: Option<i64>,
    #[serde(rename = "Ar", default)]
    price: Option<f64>,
    #[serde(rename = "Allapot", default, deserialize_with = "opt_text")]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TicketImageResponse {
    #[serde(rename = "Bizonylatok", default)]
    documents: Option<Vec<ImageDocument>>,
}

#[derive(Debug, Deserialize)]
struct ImageDocument {
    #[serde(rename = "BizonylatTechnikaiAzonosito", deserialize_with = "id_string")]
    document_id: String,
    #[serde(rename = "Jegykep", default)]
    image: Option<String>,
    #[serde(rename = "Jegysorszam", default, deserialize_with = "opt_text")]
    serial_number: Option<String>,
    #[serde(rename = "BizonylatFajta", default, deserialize_with = "opt_text")]
    kind: Option<String>,
}

// ============================================================================
// Lenient field decoding
// ============================================================================

/// Identifiers arrive as strings or as bare numbers depending on the endpoint.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a non-empty identifier, got {}",
            other
        ))),
    }
}

fn opt_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            return Err(de::Error::custom(format!("expected text, got {}", other)));
        }
    })
}

/// Seconds since epoch, from a number, a numeric string, or a WCF
/// `/Date(milliseconds+zone)/` literal.
fn opt_epoch<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => parse_epoch_text(&s),
        Some(other) => {
            return Err(de::Error::custom(format!("expected a timestamp, got {}", other)));
        }
    })
}

fn parse_epoch_text(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Some(secs);
    }
    let inner = s.strip_prefix("/Date(")?.strip_suffix(")/")?;
    let digits_end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    inner[..digits_end].parse::<i64>().ok().map(|ms| ms / 1000)
}

// ============================================================================
// Interpretation
// ============================================================================

fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string())
}

/// Reject anything that is not a domain-level success, whatever the
/// transport status said.
fn check_envelope(status: StatusCode, body: &str) -> Result<(), ApiError> {
    let envelope: Envelope = serde_json::from_str(body).unwrap_or_default();

    if !status.is_success() {
        let structured = envelope.first_text().or_else(|| {
            envelope
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
        });
        return Err(match structured {
            Some(message) => ApiError::UpstreamDomain(message),
            None => ApiError::UpstreamTransport {
                status: Some(status.as_u16()),
                message: format!("MAV API Error: {}", status_text(status)),
            },
        });
    }

    match envelope.messages {
        Some(ref messages) if !messages.is_empty() => {
            let message = envelope
                .first_text()
                .unwrap_or_else(|| "The ticketing service rejected the request".to_string());
            Err(ApiError::UpstreamDomain(message))
        }
        _ => Ok(()),
    }
}

fn parse<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, ApiError> {
    serde_json::from_str(body).map_err(|e| {
        debug!(body = %ApiError::truncate_body(body), "Unparseable {} response", what);
        ApiError::MalformedUpstreamResponse(format!("{} response could not be parsed: {}", what, e))
    })
}

pub fn interpret_login(status: StatusCode, body: &str) -> Result<AuthGrant, ApiError> {
    check_envelope(status, body)?;
    let response: LoginResponse = parse(body, "login")?;

    let token = response
        .token
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            ApiError::MalformedUpstreamResponse("login succeeded but no token was returned".into())
        })?;
    let expires_at = response.expires_at.ok_or_else(|| {
        ApiError::MalformedUpstreamResponse("login succeeded but no token expiry was returned".into())
    })?;

    let documents_to_accept = response
        .documents
        .unwrap_or_default()
        .into_iter()
        .filter_map(|d| {
            d.code.map(|code| PolicyDocument {
                code,
                version: d.version,
                html_url: d.html_url,
                pdf_url: d.pdf_url,
            })
        })
        .collect();

    Ok(AuthGrant {
        token,
        expires_at,
        documents_to_accept,
    })
}

pub fn interpret_orders(status: StatusCode, body: &str) -> Result<Vec<TicketRecord>, ApiError> {
    check_envelope(status, body)?;
    let response: OrderSearchResponse = parse(body, "order search")?;

    let Some(orders) = response.orders else {
        debug!("Order search returned no order list");
        return Ok(Vec::new());
    };

    let mut tickets = Vec::new();
    for order in orders {
        for document in order.documents {
            let ticket_key =
                TicketRecord::ticket_key(&document.document_id, document.serial_number.as_deref());
            for item in document.line_items {
                tickets.push(TicketRecord {
                    id: TicketRecord::composite_id(
                        &order.order_id,
                        &document.document_id,
                        &item.line_item_id,
                    ),
                    order_id: order.order_id.clone(),
                    document_id: document.document_id.clone(),
                    line_item_id: item.line_item_id,
                    ticket_key: ticket_key.clone(),
                    serial_number: document.serial_number.clone(),
                    passenger_name: document.passenger_name.clone(),
                    ticket_name: item.name,
                    discount: item.discount,
                    valid_from: item.valid_from,
                    valid_to: item.valid_to,
                    price: item.price,
                    status: item.status,
                });
            }
        }
    }

    Ok(tickets)
}

pub fn interpret_ticket_image(
    status: StatusCode,
    body: &str,
    document_id: &str,
) -> Result<TicketImage, ApiError> {
    check_envelope(status, body)?;
    let response: TicketImageResponse = parse(body, "ticket image")?;

    let documents = response.documents.unwrap_or_default();
    if documents.is_empty() {
        return Err(ApiError::MalformedUpstreamResponse(
            "no ticket images in the upstream response".into(),
        ));
    }

    let document = documents
        .into_iter()
        .find(|d| d.document_id == document_id)
        .ok_or_else(|| {
            ApiError::NotFound(format!("Ticket image not found for document {}", document_id))
        })?;

    let image_base64 = document.image.filter(|i| !i.is_empty()).ok_or_else(|| {
        ApiError::MalformedUpstreamResponse(format!("document {} carries no image", document_id))
    })?;

    Ok(TicketImage {
        document_id: document.document_id,
        image_base64,
        serial_number: document.serial_number,
        document_kind: document.kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ticket_image_request_wraps_id_in_list() {
        let request = TicketImageRequest {
            username: "alice",
            document_ids: vec!["B-100"],
            token: "tok",
            language: "HU",
            client_id: "uaid",
        };
        let json = serde_json::to_value(&request).expect("serialize request");
        assert_eq!(json["BizonylatAzonosito"], serde_json::json!(["B-100"]));
        assert_eq!(json["Nyelv"], "HU");
        assert_eq!(json["UAID"], "uaid");
    }

    // -------------------------------------------------------------------------
    // Login
    // -------------------------------------------------------------------------

    #[test]
    fn test_login_success() {
        let body = r#"{"Token":"abc123","ErvenyessegVege":1900000000,"ElfogadandoDoksik":[{"DokumentumKod":"ASZF","Nyelv":"HU","Verzio":3,"HtmlUrl":"https://example.test/aszf.html","PdfUrl":null,"ErvKezd":0}],"Uzenetek":[]}"#;
        let grant = interpret_login(StatusCode::OK, body).expect("login should succeed");
        assert_eq!(grant.token, "abc123");
        assert_eq!(grant.expires_at, 1_900_000_000);
        assert_eq!(grant.documents_to_accept.len(), 1);
        assert_eq!(grant.documents_to_accept[0].code, "ASZF");
        assert_eq!(grant.documents_to_accept[0].version, Some(3));
    }

    #[test]
    fn test_login_domain_error_under_200() {
        let body = r#"{"Token":null,"Uzenetek":[{"Szoveg":"Invalid credentials","Kod":17}]}"#;
        let err = interpret_login(StatusCode::OK, body).unwrap_err();
        assert_eq!(err, ApiError::UpstreamDomain("Invalid credentials".into()));
    }

    #[test]
    fn test_login_message_list_without_text_is_still_failure() {
        let body = r#"{"Token":"abc","ErvenyessegVege":1900000000,"Uzenetek":[{"Kod":1}]}"#;
        let err = interpret_login(StatusCode::OK, body).unwrap_err();
        assert!(matches!(err, ApiError::UpstreamDomain(_)));
    }

    #[test]
    fn test_login_missing_token_is_malformed() {
        let body = r#"{"ErvenyessegVege":1900000000}"#;
        let err = interpret_login(StatusCode::OK, body).unwrap_err();
        assert_eq!(err.kind(), crate::api::ErrorKind::MalformedUpstreamResponse);

        let body = r#"{"Token":"","ErvenyessegVege":1900000000}"#;
        assert!(matches!(
            interpret_login(StatusCode::OK, body),
            Err(ApiError::MalformedUpstreamResponse(_))
        ));
    }

    #[test]
    fn test_login_missing_expiry_is_malformed() {
        let body = r#"{"Token":"abc"}"#;
        assert!(matches!(
            interpret_login(StatusCode::OK, body),
            Err(ApiError::MalformedUpstreamResponse(_))
        ));
    }

    #[test]
    fn test_login_transport_error_prefers_structured_message() {
        let body = r#"{"Uzenetek":[{"Szoveg":"Hibás jelszó"}]}"#;
        let err = interpret_login(StatusCode::UNAUTHORIZED, body).unwrap_err();
        assert_eq!(err, ApiError::UpstreamDomain("Hibás jelszó".into()));

        let body = r#"{"Message":"Request Error"}"#;
        let err = interpret_login(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert_eq!(err, ApiError::UpstreamDomain("Request Error".into()));
    }

    #[test]
    fn test_login_transport_error_without_structure() {
        let err = interpret_login(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").unwrap_err();
        assert_eq!(
            err,
            ApiError::UpstreamTransport {
                status: Some(502),
                message: "MAV API Error: Bad Gateway".into(),
            }
        );
    }

    #[test]
    fn test_login_non_json_success_is_malformed() {
        let err = interpret_login(StatusCode::OK, "<html>maintenance</html>").unwrap_err();
        assert!(matches!(err, ApiError::MalformedUpstreamResponse(_)));
    }

    #[test]
    fn test_wcf_date_expiry() {
        let body = r#"{"Token":"abc","ErvenyessegVege":"/Date(1900000000000+0100)/"}"#;
        let grant = interpret_login(StatusCode::OK, body).expect("login should succeed");
        assert_eq!(grant.expires_at, 1_900_000_000);
        assert_eq!(parse_epoch_text("/Date(-1000)/"), Some(-1));
        assert_eq!(parse_epoch_text("soon"), None);
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    const ORDERS: &str = r#"{
        "Megrendelesek": [
            {
                "MegrendelesAzonosito": "M-1",
                "JegykepAdatok": [
                    {
                        "BizonylatAzonosito": 5001,
                        "Jegysorszam": "0042",
                        "UtasNeve": "Alice Example",
                        "Jegyek": [
                            {"TetelAzonosito": 1, "Nev": "Budapest - Debrecen", "Kedvezmeny": "Teljes árú", "ErvKezd": 1700000000, "ErvVeg": 1700086400, "Ar": 4475, "Allapot": "Érvényes"},
                            {"TetelAzonosito": 2, "Nev": "Helyjegy", "Ar": 280}
                        ]
                    }
                ]
            },
            {
                "MegrendelesAzonosito": "M-2",
                "JegykepAdatok": [
                    {"BizonylatAzonosito": "5002", "Jegyek": [{"TetelAzonosito": "9", "Nev": "Szeged - Miskolc"}]}
                ]
            }
        ],
        "Uzenetek": null
    }"#;

    #[test]
    fn test_orders_are_flattened() {
        let tickets = interpret_orders(StatusCode::OK, ORDERS).expect("orders should parse");
        assert_eq!(tickets.len(), 3);

        let first = &tickets[0];
        assert_eq!(first.id, "M-1-5001-1");
        assert_eq!(first.order_id, "M-1");
        assert_eq!(first.document_id, "5001");
        assert_eq!(first.ticket_key, "5001_0042");
        assert_eq!(first.passenger_name.as_deref(), Some("Alice Example"));
        assert_eq!(first.ticket_name, "Budapest - Debrecen");
        assert_eq!(first.valid_to, Some(1_700_086_400));
        assert_eq!(first.price, Some(4475.0));
        assert_eq!(first.status.as_deref(), Some("Érvényes"));

        assert_eq!(tickets[1].id, "M-1-5001-2");
        assert_eq!(tickets[2].id, "M-2-5002-9");
        assert_eq!(tickets[2].ticket_key, "5002_");
    }

    #[test]
    fn test_orders_ids_are_stable() {
        let first = interpret_orders(StatusCode::OK, ORDERS).expect("orders should parse");
        let second = interpret_orders(StatusCode::OK, ORDERS).expect("orders should parse");
        let ids = |t: &[TicketRecord]| t.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_orders_empty_and_absent() {
        let tickets = interpret_orders(StatusCode::OK, r#"{"Megrendelesek":[]}"#).expect("parse");
        assert!(tickets.is_empty());
        let tickets = interpret_orders(StatusCode::OK, r#"{"Uzenetek":[]}"#).expect("parse");
        assert!(tickets.is_empty());
    }

    #[test]
    fn test_orders_missing_required_id_is_malformed() {
        let body = r#"{"Megrendelesek":[{"JegykepAdatok":[]}]}"#;
        assert!(matches!(
            interpret_orders(StatusCode::OK, body),
            Err(ApiError::MalformedUpstreamResponse(_))
        ));
    }

    #[test]
    fn test_orders_expired_token_domain_error() {
        let body = r#"{"Uzenetek":[{"Szoveg":"Lejárt munkamenet"}]}"#;
        assert_eq!(
            interpret_orders(StatusCode::OK, body).unwrap_err(),
            ApiError::UpstreamDomain("Lejárt munkamenet".into())
        );
    }

    // -------------------------------------------------------------------------
    // Ticket image
    // -------------------------------------------------------------------------

    #[test]
    fn test_ticket_image_found() {
        let body = r#"{"Bizonylatok":[{"BizonylatTechnikaiAzonosito":"B-1","Jegykep":"iVBORw0KGgo=","Jegysorszam":"0042","BizonylatFajta":"Menetjegy"}]}"#;
        let image = interpret_ticket_image(StatusCode::OK, body, "B-1").expect("image");
        assert_eq!(image.document_id, "B-1");
        assert_eq!(image.image_base64, "iVBORw0KGgo=");
        assert_eq!(image.serial_number.as_deref(), Some("0042"));
        assert_eq!(image.document_kind.as_deref(), Some("Menetjegy"));
    }

    #[test]
    fn test_ticket_image_not_found_is_distinct() {
        let body = r#"{"Bizonylatok":[{"BizonylatTechnikaiAzonosito":"B-2","Jegykep":"AAAA"}]}"#;
        let err = interpret_ticket_image(StatusCode::OK, body, "B-1").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(err.status(), 404);

        let transport = interpret_ticket_image(StatusCode::SERVICE_UNAVAILABLE, "", "B-1").unwrap_err();
        assert!(matches!(transport, ApiError::UpstreamTransport { .. }));
        assert_ne!(err.kind(), transport.kind());
    }

    #[test]
    fn test_ticket_image_empty_result() {
        let err = interpret_ticket_image(StatusCode::OK, r#"{"Bizonylatok":[]}"#, "B-1").unwrap_err();
        assert!(matches!(err, ApiError::MalformedUpstreamResponse(_)));
        let err = interpret_ticket_image(StatusCode::OK, r#"{}"#, "B-1").unwrap_err();
        assert!(matches!(err, ApiError::MalformedUpstreamResponse(_)));
    }

    #[test]
    fn test_ticket_image_without_payload_is_malformed() {
        let body = r#"{"Bizonylatok":[{"BizonylatTechnikaiAzonosito":"B-1","Jegykep":""}]}"#;
        assert!(matches!(
            interpret_ticket_image(StatusCode::OK, body, "B-1"),
            Err(ApiError::MalformedUpstreamResponse(_))
        ));
    }
}
