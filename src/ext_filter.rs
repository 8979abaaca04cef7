// afc-server: Vendor-extension whitelist
//
// Extensions are admitted per (message/sub-object, input/output, gui,
// internal) tuple. The rule list below uses partial tuples (None = both);
// at construction it is flattened into a map over all 16 concrete tuples
// so the drop pass is O(number of extensions).

use std::collections::{HashMap, HashSet};

use serde_json::Value;

/// One whitelist entry: extension IDs admitted for the message kinds
/// selected by the partial tuple
struct Rule {
    extensions: &'static [&'static str],
    is_message: Option<bool>,
    is_input: Option<bool>,
    is_gui: Option<bool>,
    is_internal: Option<bool>,
}

const RULES: &[Rule] = &[
    // Sub-request extensions accepted from AFC services (not from APs)
    Rule {
        extensions: &["openAfc.overrideAfcConfig"],
        is_message: Some(false),
        is_input: Some(true),
        is_gui: None,
        is_internal: Some(true),
    },
    // Sub-request extensions accepted from APs
    Rule {
        extensions: &["rlanAntenna"],
        is_message: Some(false),
        is_input: Some(true),
        is_gui: None,
        is_internal: None,
    },
    // Sub-response extensions returned to the Web GUI
    Rule {
        extensions: &["openAfc.redBlackData", "openAfc.mapinfo"],
        is_message: Some(false),
        is_input: Some(false),
        is_gui: Some(true),
        is_internal: None,
    },
    // Heat map requests from the Web GUI
    Rule {
        extensions: &["openAfc.heatMap"],
        is_message: None,
        is_input: Some(true),
        is_gui: Some(true),
        is_internal: None,
    },
];

type FilterKey = (bool, bool, bool, bool);

/// Flattened whitelist with an in-place drop pass over messages
pub struct VendorExtensionFilter {
    allowed: HashMap<FilterKey, HashSet<&'static str>>,
}

impl VendorExtensionFilter {
    pub fn new() -> VendorExtensionFilter {
        let mut allowed: HashMap<FilterKey, HashSet<&'static str>> = HashMap::new();
        for is_message in [true, false] {
            for is_input in [true, false] {
                for is_gui in [true, false] {
                    for is_internal in [true, false] {
                        let key = (is_message, is_input, is_gui, is_internal);
                        for rule in RULES {
                            let selected = rule.is_message.map_or(true, |v| v == is_message)
                                && rule.is_input.map_or(true, |v| v == is_input)
                                && rule.is_gui.map_or(true, |v| v == is_gui)
                                && rule.is_internal.map_or(true, |v| v == is_internal);
                            if selected {
                                allowed
                                    .entry(key)
                                    .or_default()
                                    .extend(rule.extensions.iter().copied());
                            }
                        }
                    }
                }
            }
        }
        VendorExtensionFilter { allowed }
    }

    /// True if the extension survives for the given message kind
    pub fn allowed_extension(
        &self,
        extension: &str,
        is_message: bool,
        is_input: bool,
        is_gui: bool,
        is_internal: bool,
    ) -> bool {
        self.allowed
            .get(&(is_message, is_input, is_gui, is_internal))
            .map_or(false, |ids| ids.contains(extension))
    }

    /// Removes unallowed vendor extensions in place, from the message
    /// object and from every sub-request/sub-response within it. An
    /// emptied `vendorExtensions` array is removed entirely.
    pub fn drop_unwanted(&self, msg: &mut Value, is_input: bool, is_gui: bool, is_internal: bool) {
        self.drop_in_container(msg, true, is_input, is_gui, is_internal);
        let list_key = if is_input {
            "availableSpectrumInquiryRequests"
        } else {
            "availableSpectrumInquiryResponses"
        };
        if let Some(Value::Array(containers)) = msg.get_mut(list_key) {
            for container in containers {
                self.drop_in_container(container, false, is_input, is_gui, is_internal);
            }
        }
    }

    fn drop_in_container(
        &self,
        container: &mut Value,
        is_message: bool,
        is_input: bool,
        is_gui: bool,
        is_internal: bool,
    ) {
        let Some(obj) = container.as_object_mut() else {
            return;
        };
        let mut emptied = false;
        if let Some(Value::Array(extensions)) = obj.get_mut("vendorExtensions") {
            extensions.retain(|ext| {
                ext.get("extensionId")
                    .and_then(Value::as_str)
                    .map_or(false, |id| {
                        self.allowed_extension(id, is_message, is_input, is_gui, is_internal)
                    })
            });
            emptied = extensions.is_empty();
        }
        if emptied {
            obj.remove("vendorExtensions");
        }
    }
}

impl Default for VendorExtensionFilter {
    fn default() -> Self {
        Self::new()
    }
}
