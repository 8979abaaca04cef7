// afc-server: Structural validation of inquiry messages
//
// Validation is performed over raw JSON values so that a failure can name
// every offending parameter instead of stopping at the first one. Message
// and sub-request envelopes tolerate unknown fields; device descriptors,
// certifications and vendor extensions are strict objects.

use serde_json::Value;

use crate::models::{ResponseCode, ResponseInfo, SupplementalInfo};

/// Accumulated validation problems of one message or sub-request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationFailure {
    /// Names of required fields that are absent
    pub missing: Vec<String>,
    /// Alternating field names and observed values (`?` when unprintable)
    pub invalid: Vec<String>,
    /// Names of fields a strict object does not accept
    pub unexpected: Vec<String>,
}

impl ValidationFailure {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty() && self.unexpected.is_empty()
    }

    /// Maps the failure to its response code and supplemental parameter
    /// lists: missing parameters win over unexpected ones, which win over
    /// invalid values
    pub fn to_response_info(&self) -> ResponseInfo {
        if !self.missing.is_empty() {
            return ResponseInfo::new(
                ResponseCode::MissingParam,
                "",
                Some(SupplementalInfo {
                    missing_params: Some(self.missing.clone()),
                    ..SupplementalInfo::default()
                }),
            );
        }
        if !self.unexpected.is_empty() {
            return ResponseInfo::new(
                ResponseCode::UnexpectedParam,
                "",
                Some(SupplementalInfo {
                    unexpected_params: Some(self.unexpected.clone()),
                    ..SupplementalInfo::default()
                }),
            );
        }
        ResponseInfo::new(
            ResponseCode::InvalidValue,
            "",
            Some(SupplementalInfo {
                invalid_params: Some(self.invalid.clone()),
                ..SupplementalInfo::default()
            }),
        )
    }
}

fn observed(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(_) | Value::Array(_) => "?".to_string(),
        other => other.to_string(),
    }
}

struct Checker {
    failure: ValidationFailure,
}

impl Checker {
    fn new() -> Checker {
        Checker {
            failure: ValidationFailure::default(),
        }
    }

    fn finish(self) -> Result<(), ValidationFailure> {
        if self.failure.is_empty() {
            Ok(())
        } else {
            Err(self.failure)
        }
    }

    fn mark_invalid(&mut self, name: &str, value: &Value) {
        self.failure.invalid.push(name.to_string());
        self.failure.invalid.push(observed(value));
    }

    /// Required string; `min1` additionally rejects the empty string
    fn require_str(&mut self, obj: &Value, name: &str, min1: bool) {
        match obj.get(name) {
            None | Some(Value::Null) => self.failure.missing.push(name.to_string()),
            Some(Value::String(text)) if !min1 || !text.is_empty() => {}
            Some(value) => self.mark_invalid(name, value),
        }
    }

    /// Rejects fields of a strict object that are not in `allowed`
    fn forbid_extras(&mut self, obj: &Value, allowed: &[&str]) {
        if let Some(map) = obj.as_object() {
            for key in map.keys() {
                if !allowed.contains(&key.as_str()) {
                    self.failure.unexpected.push(key.clone());
                }
            }
        }
    }

    fn check_vendor_extensions(&mut self, container: &Value) {
        let extensions = match container.get("vendorExtensions") {
            None | Some(Value::Null) => return,
            Some(Value::Array(extensions)) => extensions,
            Some(value) => {
                self.mark_invalid("vendorExtensions", value);
                return;
            }
        };
        for ext in extensions {
            if !ext.is_object() {
                self.mark_invalid("vendorExtensions", ext);
                continue;
            }
            self.require_str(ext, "extensionId", true);
            self.forbid_extras(ext, &["extensionId", "parameters"]);
        }
    }
}

/// Validates the top-level message envelope. Sub-requests are only checked
/// to carry a `requestId`; their full validation happens per request so an
/// invalid sibling cannot fail the whole message.
pub fn validate_message(msg: &Value) -> Result<(), ValidationFailure> {
    let mut checker = Checker::new();
    checker.require_str(msg, "version", false);
    match msg.get("availableSpectrumInquiryRequests") {
        None | Some(Value::Null) => checker
            .failure
            .missing
            .push("availableSpectrumInquiryRequests".to_string()),
        Some(Value::Array(requests)) => {
            for req in requests {
                if req.is_object() {
                    checker.require_str(req, "requestId", false);
                } else {
                    checker.mark_invalid("availableSpectrumInquiryRequests", req);
                }
            }
        }
        Some(value) => checker.mark_invalid("availableSpectrumInquiryRequests", value),
    }
    checker.check_vendor_extensions(msg);
    checker.finish()
}

/// Validates one sub-request: `requestId`, the strict device descriptor
/// with at least one strict certification, and vendor extensions
pub fn validate_request(req: &Value) -> Result<(), ValidationFailure> {
    let mut checker = Checker::new();
    checker.require_str(req, "requestId", true);
    match req.get("deviceDescriptor") {
        None | Some(Value::Null) => checker
            .failure
            .missing
            .push("deviceDescriptor".to_string()),
        Some(descriptor) if descriptor.is_object() => {
            checker.require_str(descriptor, "serialNumber", true);
            checker.forbid_extras(descriptor, &["serialNumber", "certificationId"]);
            match descriptor.get("certificationId") {
                None | Some(Value::Null) => checker
                    .failure
                    .missing
                    .push("certificationId".to_string()),
                Some(Value::Array(certifications)) if !certifications.is_empty() => {
                    for cert in certifications {
                        if !cert.is_object() {
                            checker.mark_invalid("certificationId", cert);
                            continue;
                        }
                        checker.require_str(cert, "rulesetId", true);
                        checker.require_str(cert, "id", true);
                        checker.forbid_extras(cert, &["rulesetId", "id"]);
                    }
                }
                Some(value) => checker.mark_invalid("certificationId", value),
            }
        }
        Some(value) => checker.mark_invalid("deviceDescriptor", value),
    }
    checker.check_vendor_extensions(req);
    checker.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_request() -> Value {
        json!({
            "requestId": "1",
            "deviceDescriptor": {
                "serialNumber": "SN",
                "certificationId": [{"rulesetId": "US_47_CFR_PART_15_SUBPART_E", "id": "CID"}]
            },
            "location": {"ellipse": {"center": {"latitude": 37.0, "longitude": -122.0}}},
            "inquiredChannels": [{"globalOperatingClass": 133}]
        })
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_request(&valid_request()).is_ok());
    }

    #[test]
    fn test_missing_descriptor_maps_to_missing_param() {
        let mut req = valid_request();
        req.as_object_mut().unwrap().remove("deviceDescriptor");
        let failure = validate_request(&req).unwrap_err();
        assert_eq!(failure.missing, vec!["deviceDescriptor"]);
        let info = failure.to_response_info();
        assert_eq!(info.response_code, 102);
        assert_eq!(
            info.supplemental_info.unwrap().missing_params.unwrap(),
            vec!["deviceDescriptor"]
        );
    }

    #[test]
    fn test_extra_field_in_strict_object_maps_to_unexpected_param() {
        let mut req = valid_request();
        req["deviceDescriptor"]["color"] = json!("blue");
        let failure = validate_request(&req).unwrap_err();
        assert_eq!(failure.unexpected, vec!["color"]);
        assert_eq!(failure.to_response_info().response_code, 106);
    }

    #[test]
    fn test_invalid_value_lists_name_and_observed_value() {
        let mut req = valid_request();
        req["deviceDescriptor"]["serialNumber"] = json!(17);
        let failure = validate_request(&req).unwrap_err();
        assert_eq!(failure.invalid, vec!["serialNumber", "17"]);
        let info = failure.to_response_info();
        assert_eq!(info.response_code, 103);
        assert_eq!(
            info.supplemental_info.unwrap().invalid_params.unwrap(),
            vec!["serialNumber", "17"]
        );
    }

    #[test]
    fn test_empty_certification_list_is_invalid() {
        let mut req = valid_request();
        req["deviceDescriptor"]["certificationId"] = json!([]);
        let failure = validate_request(&req).unwrap_err();
        assert_eq!(failure.invalid[0], "certificationId");
    }

    #[test]
    fn test_missing_wins_over_invalid() {
        let mut req = valid_request();
        req.as_object_mut().unwrap().remove("requestId");
        req["deviceDescriptor"]["serialNumber"] = json!(5);
        let failure = validate_request(&req).unwrap_err();
        assert_eq!(failure.to_response_info().response_code, 102);
    }

    #[test]
    fn test_message_envelope() {
        let msg = json!({
            "version": "1.4",
            "availableSpectrumInquiryRequests": [{"requestId": "1"}]
        });
        assert!(validate_message(&msg).is_ok());

        let failure = validate_message(&json!({"version": "1.4"})).unwrap_err();
        assert_eq!(failure.missing, vec!["availableSpectrumInquiryRequests"]);
    }

    #[test]
    fn test_unknown_envelope_fields_allowed() {
        let msg = json!({
            "version": "1.4",
            "availableSpectrumInquiryRequests": [{"requestId": "1"}],
            "somethingElse": true
        });
        assert!(validate_message(&msg).is_ok());
    }

    #[test]
    fn test_vendor_extension_structure() {
        let msg = json!({
            "version": "1.4",
            "availableSpectrumInquiryRequests": [{"requestId": "1"}],
            "vendorExtensions": [{"extensionId": "x", "parameters": {}, "extra": 1}]
        });
        let failure = validate_message(&msg).unwrap_err();
        assert_eq!(failure.unexpected, vec!["extra"]);
    }
}
