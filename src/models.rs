// afc-server: Inquiry message data models

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Supported request versions; the last one is the default response version
pub const SUPPORTED_VERSIONS: &[&str] = &["1.4"];

/// Default version used when the request's own version is unusable
pub fn latest_version() -> &'static str {
    SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1]
}

/// Response codes of the spectrum inquiry protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    GeneralFailure,
    Success,
    VersionNotSupported,
    DeviceDisallowed,
    MissingParam,
    InvalidValue,
    UnexpectedParam,
    UnsupportedSpectrum,
    UnsupportedBasis,
}

impl ResponseCode {
    pub fn code(self) -> i32 {
        match self {
            ResponseCode::GeneralFailure => -1,
            ResponseCode::Success => 0,
            ResponseCode::VersionNotSupported => 100,
            ResponseCode::DeviceDisallowed => 101,
            ResponseCode::MissingParam => 102,
            ResponseCode::InvalidValue => 103,
            ResponseCode::UnexpectedParam => 106,
            ResponseCode::UnsupportedSpectrum => 300,
            ResponseCode::UnsupportedBasis => 301,
        }
    }

    /// Prefix prepended to the short description; `None` means the code
    /// carries no short description at all
    pub fn prefix(self) -> Option<String> {
        match self {
            ResponseCode::GeneralFailure => Some(String::new()),
            ResponseCode::Success => None,
            ResponseCode::VersionNotSupported => Some(format!(
                "The requested version number is invalid. Supported versions are: {}",
                SUPPORTED_VERSIONS.join(", ")
            )),
            ResponseCode::DeviceDisallowed => Some(
                "This specific device is not allowed to operate under AFC control. ".to_string(),
            ),
            ResponseCode::MissingParam => Some(
                "One or more fields required to be included in the request are missing."
                    .to_string(),
            ),
            ResponseCode::InvalidValue => {
                Some("One or more fields have an invalid value.".to_string())
            }
            ResponseCode::UnexpectedParam => Some(
                "Unknown parameter found, or conditional parameter found, but condition is \
                 not met."
                    .to_string(),
            ),
            ResponseCode::UnsupportedSpectrum => Some(
                "The frequency range indicated in the Available Spectrum Inquiry Request is at \
                 least partially outside of the frequency band under the management of the AFC."
                    .to_string(),
            ),
            ResponseCode::UnsupportedBasis => Some(String::new()),
        }
    }
}

/// Parameter lists attached to validation failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplementalInfo {
    #[serde(rename = "missingParams", skip_serializing_if = "Option::is_none")]
    pub missing_params: Option<Vec<String>>,
    #[serde(rename = "invalidParams", skip_serializing_if = "Option::is_none")]
    pub invalid_params: Option<Vec<String>>,
    #[serde(rename = "unexpectedParams", skip_serializing_if = "Option::is_none")]
    pub unexpected_params: Option<Vec<String>>,
}

/// The `response` object of a sub-response (result code and diagnostics)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(rename = "responseCode")]
    pub response_code: i32,
    #[serde(rename = "shortDescription", skip_serializing_if = "Option::is_none")]
    pub short_description: Option<String>,
    #[serde(rename = "supplementalInfo", skip_serializing_if = "Option::is_none")]
    pub supplemental_info: Option<SupplementalInfo>,
}

impl ResponseInfo {
    /// Builds a response object, applying the code's description prefix
    pub fn new(
        code: ResponseCode,
        detail: &str,
        supplemental_info: Option<SupplementalInfo>,
    ) -> ResponseInfo {
        ResponseInfo {
            response_code: code.code(),
            short_description: code.prefix().map(|prefix| format!("{prefix}{detail}")),
            supplemental_info,
        }
    }
}

/// Vendor extension attached to messages, requests and responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorExtension {
    #[serde(rename = "extensionId")]
    pub extension_id: String,
    pub parameters: Value,
}

/// Builds one failed sub-response
pub fn failed_response(request_id: &str, ruleset_id: &str, info: &ResponseInfo) -> Value {
    json!({
        "requestId": request_id,
        "rulesetId": ruleset_id,
        "response": info,
    })
}

/// Assembles the response message from per-request sub-responses
pub fn response_message(version: &str, responses: Vec<Value>) -> Value {
    json!({
        "version": version,
        "availableSpectrumInquiryResponses": responses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_applied() {
        let info = ResponseInfo::new(ResponseCode::GeneralFailure, "Request processing timed out", None);
        assert_eq!(info.response_code, -1);
        assert_eq!(
            info.short_description.as_deref(),
            Some("Request processing timed out")
        );
    }

    #[test]
    fn test_success_has_no_description() {
        let info = ResponseInfo::new(ResponseCode::Success, "ignored", None);
        assert_eq!(info.response_code, 0);
        assert!(info.short_description.is_none());
    }

    #[test]
    fn test_version_not_supported_lists_versions() {
        let info = ResponseInfo::new(ResponseCode::VersionNotSupported, "", None);
        assert_eq!(info.response_code, 100);
        assert!(info.short_description.unwrap().contains("1.4"));
    }

    #[test]
    fn test_supplemental_info_serialization() {
        let info = ResponseInfo::new(
            ResponseCode::MissingParam,
            "",
            Some(SupplementalInfo {
                missing_params: Some(vec!["deviceDescriptor".to_string()]),
                ..SupplementalInfo::default()
            }),
        );
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value["supplementalInfo"]["missingParams"][0],
            "deviceDescriptor"
        );
        assert!(value["supplementalInfo"].get("invalidParams").is_none());
    }
}
