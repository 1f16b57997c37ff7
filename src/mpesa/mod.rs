//! Daraja-style STK push client.
//!
//! Two-hop protocol: exchange long-lived service credentials for a
//! short-lived bearer token, then submit a time-stamped, password-signed
//! push request. A "0" acknowledgement only means the payment prompt
//! reached the payer's device; the real outcome arrives later via the
//! result callback or the status-query endpoint.

use crate::config::MpesaConfig;
use crate::errors::ServiceError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Clearance kept below the gateway's stated validity so a token is never
/// presented right at its expiry edge.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MpesaClient {
    http: reqwest::Client,
    config: MpesaConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// The gateway reports validity in seconds, as a string
    expires_in: String,
}

/// Initiation acknowledgement for a push request.
#[derive(Debug, Clone, Deserialize)]
pub struct StkPushAck {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResponseDescription")]
    pub response_description: String,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: &'static str,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    #[serde(rename = "PhoneNumber")]
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    #[serde(rename = "AccountReference")]
    account_reference: &'a str,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: &'a str,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

/// Outcome of a status query against the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct StkQueryResponse {
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    pub response_code: String,
    #[serde(rename = "ResultCode", deserialize_with = "lenient_i32")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: Option<String>,
}

/// Error body the gateway returns on a rejected request.
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Asynchronous result callback envelope, exactly as the gateway posts it.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode", deserialize_with = "lenient_i32")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata", default)]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    /// Number or string, depending on the item
    #[serde(rename = "Value", default)]
    #[schema(value_type = Option<Object>)]
    pub value: Option<serde_json::Value>,
}

impl StkCallback {
    pub fn succeeded(&self) -> bool {
        self.result_code == 0
    }

    /// Gateway receipt number from the callback metadata, when present.
    pub fn receipt(&self) -> Option<String> {
        self.callback_metadata.as_ref().and_then(|meta| {
            meta.items
                .iter()
                .find(|item| item.name == "MpesaReceiptNumber")
                .and_then(|item| item.value.as_ref())
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
    }
}

/// The gateway reports result codes as numbers or numeric strings
/// depending on the endpoint.
fn lenient_i32<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(|x| x as i32)
            .ok_or_else(|| Error::custom("non-integer result code")),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| Error::custom("non-numeric result code")),
        other => Err(Error::custom(format!(
            "unexpected result code value: {other}"
        ))),
    }
}

/// Canonicalizes a payer number to international form without the plus.
///
/// Accepts `+254712345678`, `254712345678` and trunk-prefixed
/// `0712345678`; anything else, or a subscriber number not starting with
/// 1 or 7, is rejected before any network call.
pub fn normalize_msisdn(country_code: &str, raw: &str) -> Result<String, ServiceError> {
    let trimmed = raw.trim();
    let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let canonical = if let Some(rest) = without_plus.strip_prefix('0') {
        format!("{country_code}{rest}")
    } else {
        without_plus.to_string()
    };

    let subscriber = canonical.strip_prefix(country_code).ok_or_else(|| {
        ServiceError::ValidationError(format!("phone number must be a {country_code} mobile"))
    })?;

    let valid = subscriber.len() == 9
        && subscriber.chars().all(|c| c.is_ascii_digit())
        && matches!(subscriber.as_bytes()[0], b'1' | b'7');

    if valid {
        Ok(canonical)
    } else {
        Err(ServiceError::ValidationError(
            "phone number does not match the expected mobile format".to_string(),
        ))
    }
}

/// Request password: Base64 of short code + passkey + timestamp. This is
/// the gateway's own reversible-encoding convention, kept verbatim for
/// interoperability; it is not an integrity primitive.
pub fn lipa_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{short_code}{passkey}{timestamp}"))
}

/// Timestamp format the gateway expects in requests and passwords.
pub fn gateway_timestamp(at: chrono::DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            config,
            token: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    pub fn normalize(&self, raw: &str) -> Result<String, ServiceError> {
        normalize_msisdn(&self.config.country_code, raw)
    }

    /// Whole-unit amount pre-flight check against the gateway's range.
    pub fn validate_amount(&self, amount: u64) -> Result<(), ServiceError> {
        if amount < self.config.min_amount || amount > self.config.max_amount {
            return Err(ServiceError::ValidationError(format!(
                "amount {} outside the accepted range {}..={}",
                amount, self.config.min_amount, self.config.max_amount
            )));
        }
        Ok(())
    }

    /// Exchanges the service credentials for a short-lived access token,
    /// reusing a cached one only while it is still valid. Exchange failure
    /// aborts the payment attempt; it is never retried automatically.
    async fn access_token(&self) -> Result<String, ServiceError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "credential exchange failed with status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let validity = token
            .expires_in
            .parse::<u64>()
            .unwrap_or(3600)
            .saturating_sub(TOKEN_EXPIRY_SKEW.as_secs());

        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(validity),
        });

        Ok(token.access_token)
    }

    /// Submits a push request asking the gateway to prompt the payer's
    /// device. A successful acknowledgement means prompt delivery only.
    #[instrument(skip(self, description))]
    pub async fn stk_push(
        &self,
        msisdn: &str,
        amount: u64,
        account_reference: &str,
        description: &str,
    ) -> Result<StkPushAck, ServiceError> {
        self.validate_amount(amount)?;
        let token = self.access_token().await?;

        let timestamp = gateway_timestamp(Utc::now());
        let request = StkPushRequest {
            business_short_code: &self.config.short_code,
            password: lipa_password(&self.config.short_code, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: msisdn,
            party_b: &self.config.short_code,
            phone_number: msisdn,
            callback_url: &self.config.callback_url,
            account_reference,
            transaction_desc: description,
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url);
        let response = self.http.post(&url).bearer_auth(token).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<GatewayErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error_message)
                .unwrap_or_else(|| format!("gateway returned status {status}"));
            warn!(%status, "STK push rejected: {detail}");
            return Err(ServiceError::GatewayDeclined(detail));
        }

        let ack: StkPushAck = response.json().await?;
        if ack.response_code != "0" {
            warn!(
                code = %ack.response_code,
                "STK push not accepted: {}",
                ack.response_description
            );
            return Err(ServiceError::GatewayDeclined(ack.response_description));
        }

        info!(
            checkout_request_id = %ack.checkout_request_id,
            "STK push prompt delivered"
        );
        Ok(ack)
    }

    /// Queries the gateway for the outcome of an earlier push request.
    #[instrument(skip(self))]
    pub async fn query_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<StkQueryResponse, ServiceError> {
        let token = self.access_token().await?;

        let timestamp = gateway_timestamp(Utc::now());
        let request = StkQueryRequest {
            business_short_code: &self.config.short_code,
            password: lipa_password(&self.config.short_code, &self.config.passkey, &timestamp),
            timestamp,
            checkout_request_id,
        };

        let url = format!("{}/mpesa/stkpushquery/v1/query", self.config.base_url);
        let response = self.http.post(&url).bearer_auth(token).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "status query failed with status {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn password_is_reversible_base64_of_the_concatenation() {
        let ts = "20260829143000";
        let password = lipa_password("174379", "passkey123", ts);
        let decoded = BASE64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey12320260829143000");
    }

    #[test]
    fn gateway_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2026, 8, 29, 14, 30, 0).unwrap();
        assert_eq!(gateway_timestamp(at), "20260829143000");
    }

    #[test]
    fn normalizes_trunk_prefixed_numbers() {
        assert_eq!(
            normalize_msisdn("254", "0712345678").unwrap(),
            "254712345678"
        );
        assert_eq!(
            normalize_msisdn("254", "0112345678").unwrap(),
            "254112345678"
        );
    }

    #[test]
    fn normalizes_plus_prefixed_numbers() {
        assert_eq!(
            normalize_msisdn("254", "+254712345678").unwrap(),
            "254712345678"
        );
    }

    #[test]
    fn leaves_canonical_numbers_unchanged() {
        assert_eq!(
            normalize_msisdn("254", "254712345678").unwrap(),
            "254712345678"
        );
    }

    #[test]
    fn rejects_invalid_leading_subscriber_digit() {
        assert!(normalize_msisdn("254", "0812345678").is_err());
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(normalize_msisdn("254", "71234").is_err());
        assert!(normalize_msisdn("254", "2547123456789").is_err());
        assert!(normalize_msisdn("254", "25471234567a").is_err());
        assert!(normalize_msisdn("254", "44712345678").is_err());
        assert!(normalize_msisdn("254", "").is_err());
    }

    #[test]
    fn amount_bounds_are_enforced() {
        let mut config = MpesaConfig::default();
        config.min_amount = 1;
        config.max_amount = 250_000;
        let client = MpesaClient::new(config).unwrap();

        assert!(client.validate_amount(0).is_err());
        assert!(client.validate_amount(1).is_ok());
        assert!(client.validate_amount(250_000).is_ok());
        assert!(client.validate_amount(250_001).is_err());
    }

    #[test]
    fn parses_a_success_callback() {
        let payload = serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 3000.0 },
                            { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                            { "Name": "PhoneNumber", "Value": 254712345678u64 }
                        ]
                    }
                }
            }
        });

        let envelope: StkCallbackEnvelope = serde_json::from_value(payload).unwrap();
        let callback = envelope.body.stk_callback;
        assert!(callback.succeeded());
        assert_eq!(callback.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(callback.receipt().as_deref(), Some("NLJ7RT61SV"));
    }

    #[test]
    fn parses_a_cancellation_callback() {
        let payload = serde_json::json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user."
                }
            }
        });

        let envelope: StkCallbackEnvelope = serde_json::from_value(payload).unwrap();
        let callback = envelope.body.stk_callback;
        assert!(!callback.succeeded());
        assert!(callback.receipt().is_none());
    }

    #[test]
    fn query_response_accepts_string_result_codes() {
        let payload = serde_json::json!({
            "CheckoutRequestID": "ws_CO_191220191020363925",
            "ResponseCode": "0",
            "ResultCode": "1032",
            "ResultDesc": "Request cancelled by user."
        });

        let response: StkQueryResponse = serde_json::from_value(payload).unwrap();
        assert_eq!(response.result_code, 1032);
    }
}
