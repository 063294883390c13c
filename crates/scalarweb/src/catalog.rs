// Method catalog synthesis.
//
// `getMethodTypes` reports one raw spec per method: a list of strings that
// is either a scalar type tag ("bool", "int*", ...), a JSON object mapping
// argument names to type tags, or free-form. From that, plus the options
// reported by the matching `getSupported*` call, we synthesize a typed
// argument specification per method. Three camera methods use layouts that
// the generic rules cannot express and get explicit overrides.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SPECIAL_METHODS: [&str; 3] = [
    "setExposureCompensation",
    "setWhiteBalance",
    "setStillSize",
];

const SCALAR_TYPES: [&str; 4] = ["bool", "int", "double", "string"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expects {
    Object,
    List,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgSpec {
    #[serde(rename = "type")]
    pub arg_type: String,
    pub options: Vec<Value>,
}

impl ArgSpec {
    fn new(arg_type: &str, options: Vec<Value>) -> Self {
        Self {
            arg_type: arg_type.to_string(),
            options,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub version: String,
    pub expects: Expects,
    pub parameters: BTreeMap<String, ArgSpec>,
}

/// Which shape of `params` the method expects on invocation.
pub fn response_type(prms: &[String]) -> Expects {
    match prms.first() {
        Some(first) if first.starts_with('{') => Expects::Object,
        Some(first) if !first.is_empty() => Expects::List,
        _ => Expects::None,
    }
}

fn is_scalar_type(tag: &str) -> bool {
    if SCALAR_TYPES.contains(&tag) {
        return true;
    }
    // Array variant: a scalar tag with a trailing '*'.
    match tag.strip_suffix('*') {
        Some(base) => SCALAR_TYPES.contains(&base),
        None => false,
    }
}

fn options_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Generic argument-spec synthesis for one method.
pub fn parse_arg_spec(prms: &[String], opts: &[Value]) -> BTreeMap<String, ArgSpec> {
    let mut args = BTreeMap::new();
    let mut index = 0usize;
    for spec in prms {
        if is_scalar_type(spec) {
            let options = opts.first().map(options_list).unwrap_or_default();
            args.insert(format!("arg{index}"), ArgSpec::new(spec, options));
            index += 1;
        } else if spec.ends_with('*') {
            // Multiple freely specified arguments; present as generic JSON.
            args.insert(format!("arg{index}"), ArgSpec::new("JSON*", Vec::new()));
            index += 1;
        } else {
            match serde_json::from_str::<Value>(spec) {
                Ok(Value::Object(fields)) => {
                    if opts.is_empty() {
                        // No candidates from getSupported*. Nested values make
                        // the whole argument a generic JSON input.
                        let nested = fields.values().any(|v| v.is_array() || v.is_object());
                        if nested {
                            args.insert(format!("arg{index}"), ArgSpec::new("JSON", Vec::new()));
                            index += 1;
                        } else {
                            for (name, tag) in &fields {
                                let tag = tag.as_str().unwrap_or_default();
                                let arg_type = if is_scalar_type(tag) {
                                    tag
                                } else if tag.ends_with('*') {
                                    "string*"
                                } else {
                                    "string"
                                };
                                args.insert(name.clone(), ArgSpec::new(arg_type, Vec::new()));
                            }
                        }
                    } else {
                        // Candidates exist, merge them in.
                        let candidates = opts
                            .first()
                            .and_then(|o| o.get("candidate"))
                            .map(options_list)
                            .unwrap_or_default();
                        for (name, tag) in &fields {
                            let arg_type = tag
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| tag.to_string());
                            args.insert(
                                name.clone(),
                                ArgSpec {
                                    arg_type,
                                    options: candidates.clone(),
                                },
                            );
                        }
                    }
                }
                // Not an object (or not JSON at all): present as generic JSON.
                Ok(_) | Err(_) => {
                    args.insert(format!("arg{index}"), ArgSpec::new("JSON", Vec::new()));
                    index += 1;
                }
            }
        }
    }
    args
}

/// Overrides for the methods whose supported-options layout does not follow
/// the generic scheme.
pub fn special_method_spec(method: &str, opts: &[Value]) -> BTreeMap<String, ArgSpec> {
    let mut args = BTreeMap::new();
    match method {
        "setExposureCompensation" => {
            args.insert(
                "EV".to_string(),
                ArgSpec::new("int", int_values(exposure_compensation_range(opts))),
            );
        }
        "setWhiteBalance" => {
            let mut modes = Vec::new();
            let mut temps = BTreeSet::new();
            if let Some(candidates) = opts.first().and_then(Value::as_array) {
                for obj in candidates {
                    if let Some(mode) = obj.get("whiteBalanceMode") {
                        modes.push(mode.clone());
                    }
                    let range = obj
                        .get("colorTemperatureRange")
                        .and_then(Value::as_array)
                        .filter(|r| !r.is_empty());
                    if let Some(range) = range {
                        // The range is reported as [max, min, step].
                        fill_range(&mut temps, range);
                    }
                }
            }
            args.insert("WhiteBalanceMode".to_string(), ArgSpec::new("string", modes));
            args.insert("ColorTempEnable".to_string(), ArgSpec::new("bool", Vec::new()));
            args.insert("ColorTemp".to_string(), ArgSpec::new("int", int_values(temps)));
        }
        "setStillSize" => {
            let mut aspects = BTreeSet::new();
            let mut sizes = BTreeSet::new();
            if let Some(candidates) = opts.first().and_then(Value::as_array) {
                for obj in candidates {
                    if let Some(aspect) = obj.get("aspect").and_then(Value::as_str) {
                        aspects.insert(aspect.to_string());
                    }
                    if let Some(size) = obj.get("size").and_then(Value::as_str) {
                        sizes.insert(size.to_string());
                    }
                }
            }
            args.insert(
                "aspect".to_string(),
                ArgSpec::new("string", aspects.into_iter().map(Value::from).collect()),
            );
            args.insert(
                "size".to_string(),
                ArgSpec::new("string", sizes.into_iter().map(Value::from).collect()),
            );
        }
        _ => {}
    }
    args
}

/// `getSupportedExposureCompensation` reports three parallel lists:
/// [[max...], [min...], [step...]]. The EV options are the sorted union of
/// every `min..=max` range stepped by `step`.
fn exposure_compensation_range(opts: &[Value]) -> BTreeSet<i64> {
    let mut evs = BTreeSet::new();
    if opts.len() < 3 {
        return evs;
    }
    let maxi = int_list(&opts[0]);
    let mini = int_list(&opts[1]);
    let step = int_list(&opts[2]);
    let len = maxi.len().min(mini.len()).min(step.len());
    for i in 0..len {
        if step[i] <= 0 {
            continue;
        }
        let mut v = mini[i];
        while v <= maxi[i] {
            evs.insert(v);
            v += step[i];
        }
    }
    evs
}

fn fill_range(out: &mut BTreeSet<i64>, range: &[Value]) {
    if range.len() < 3 {
        return;
    }
    let (max, min, step) = (
        range[0].as_i64().unwrap_or(0),
        range[1].as_i64().unwrap_or(0),
        range[2].as_i64().unwrap_or(0),
    );
    if step <= 0 {
        return;
    }
    let mut v = min;
    while v <= max {
        out.insert(v);
        v += step;
    }
}

fn int_list(value: &Value) -> Vec<i64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn int_values(values: BTreeSet<i64>) -> Vec<Value> {
    values.into_iter().map(Value::from).collect()
}
