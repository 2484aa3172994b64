//! Port Attribute Definitions
//!
//! Attributes are described declaratively by [`AttrDef`]s: type, range,
//! choices, whether they can be modified and for which ports they exist at all.
//! The standard table below applies to every port; drivers add their own
//! through `PortDriver::additional_attrdefs`.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use crate::error::{AttrError, AttrResult};

// ─────────────────────────────────────────────────────────────────────────────
// Types
// ─────────────────────────────────────────────────────────────────────────────

/// Value type of a port; fixed for the port's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Boolean,
    Number,
}

impl PortType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Boolean => "boolean",
            PortType::Number => "number",
        }
    }
}

impl std::fmt::Display for PortType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value type of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Boolean,
    Number,
    String,
    List,
}

/// One allowed value of a choice-constrained attribute or port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// What an attribute's `enabled` predicate gets to look at
#[derive(Debug, Clone, Copy)]
pub struct PortTraits {
    pub port_type: PortType,
    pub writable: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Attribute Definition
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AttrDef {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub attr_type: AttrType,
    pub modifiable: bool,
    /// May be null/unset
    pub optional: bool,
    /// Numeric range, or length range for strings
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub integer: bool,
    pub step: Option<f64>,
    pub choices: Option<Vec<Choice>>,
    pub default: Option<JsonValue>,
    /// Whether the attribute exists for a given port; always when `None`
    pub enabled: Option<fn(&PortTraits) -> bool>,
}

impl AttrDef {
    pub fn new(name: impl Into<String>, attr_type: AttrType) -> Self {
        let name = name.into();
        Self {
            display_name: name.replace('_', " "),
            name,
            description: String::new(),
            attr_type,
            modifiable: false,
            optional: false,
            min: None,
            max: None,
            integer: false,
            step: None,
            choices: None,
            default: None,
            enabled: None,
        }
    }

    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn modifiable(mut self) -> Self {
        self.modifiable = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn integer(mut self) -> Self {
        self.integer = true;
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn choices(mut self, choices: Vec<Choice>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn default_value(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }

    pub fn enabled_if(mut self, predicate: fn(&PortTraits) -> bool) -> Self {
        self.enabled = Some(predicate);
        self
    }

    pub fn is_enabled_for(&self, traits: &PortTraits) -> bool {
        self.enabled.is_none_or(|f| f(traits))
    }

    /// Check a candidate value against type, range and choices
    pub fn validate(&self, value: &JsonValue) -> AttrResult<()> {
        if value.is_null() {
            return if self.optional {
                Ok(())
            } else {
                Err(AttrError::invalid(&self.name, "value is required"))
            };
        }

        match self.attr_type {
            AttrType::Boolean => {
                if !value.is_boolean() {
                    return Err(AttrError::invalid(&self.name, "expected a boolean"));
                }
            }
            AttrType::Number => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| AttrError::invalid(&self.name, "expected a number"))?;
                check_number(&self.name, n, self.min, self.max, self.integer, self.step)?;
            }
            AttrType::String => {
                let s = value
                    .as_str()
                    .ok_or_else(|| AttrError::invalid(&self.name, "expected a string"))?;
                let len = s.chars().count() as f64;
                if self.min.is_some_and(|min| len < min) || self.max.is_some_and(|max| len > max) {
                    return Err(AttrError::invalid(&self.name, "length out of range"));
                }
            }
            AttrType::List => {
                if !value.is_array() {
                    return Err(AttrError::invalid(&self.name, "expected a list"));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.iter().any(|c| qtoggle_persist::values_equal(&c.value, value)) {
                return Err(AttrError::invalid(&self.name, "not one of the allowed choices"));
            }
        }

        Ok(())
    }

    /// JSON schema fragment for this attribute
    pub fn to_json_schema(&self) -> JsonValue {
        let mut schema = Map::new();

        let ty = match self.attr_type {
            AttrType::Boolean => "boolean",
            AttrType::Number if self.integer => "integer",
            AttrType::Number => "number",
            AttrType::String => "string",
            AttrType::List => "array",
        };
        schema.insert("type".into(), json!(ty));
        schema.insert("title".into(), json!(self.display_name));
        if !self.description.is_empty() {
            schema.insert("description".into(), json!(self.description));
        }

        let (min_key, max_key) = match self.attr_type {
            AttrType::String => ("minLength", "maxLength"),
            AttrType::List => ("minItems", "maxItems"),
            _ => ("minimum", "maximum"),
        };
        if let Some(min) = self.min {
            schema.insert(min_key.into(), schema_number(min, self.attr_type != AttrType::Number));
        }
        if let Some(max) = self.max {
            schema.insert(max_key.into(), schema_number(max, self.attr_type != AttrType::Number));
        }
        if let Some(step) = self.step {
            schema.insert("multipleOf".into(), json!(step));
        }
        if let Some(choices) = &self.choices {
            let values: Vec<JsonValue> = choices.iter().map(|c| c.value.clone()).collect();
            schema.insert("enum".into(), JsonValue::Array(values));
        }
        if let Some(default) = &self.default {
            schema.insert("default".into(), default.clone());
        }

        JsonValue::Object(schema)
    }
}

fn schema_number(v: f64, as_count: bool) -> JsonValue {
    if as_count { json!(v as u64) } else { json!(v) }
}

/// Range/integer/step check shared by attributes and number port values
pub fn check_number(
    attr: &str,
    n: f64,
    min: Option<f64>,
    max: Option<f64>,
    integer: bool,
    step: Option<f64>,
) -> AttrResult<()> {
    if !n.is_finite() {
        return Err(AttrError::invalid(attr, "not a finite number"));
    }
    if integer && n.fract() != 0.0 {
        return Err(AttrError::invalid(attr, "expected an integer"));
    }
    if let Some(min) = min.filter(|min| n < *min) {
        return Err(AttrError::invalid(attr, format!("{} is below minimum {}", n, min)));
    }
    if let Some(max) = max.filter(|max| n > *max) {
        return Err(AttrError::invalid(attr, format!("{} is above maximum {}", n, max)));
    }
    if let Some(step) = step.filter(|s| *s > 0.0) {
        let steps = (n - min.unwrap_or(0.0)) / step;
        if (steps - steps.round()).abs() > 1e-9 {
            return Err(AttrError::invalid(attr, format!("{} is not a multiple of {}", n, step)));
        }
    }
    Ok(())
}

/// JSON schema of an object whose properties are the given attributes
pub fn attrdefs_schema<'a>(defs: impl IntoIterator<Item = &'a AttrDef>) -> JsonValue {
    let properties: Map<String, JsonValue> = defs
        .into_iter()
        .filter(|d| d.modifiable)
        .map(|d| (d.name.clone(), d.to_json_schema()))
        .collect();

    json!({
        "type": "object",
        "properties": properties,
        "additionalProperties": false,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Standard Attributes
// ─────────────────────────────────────────────────────────────────────────────

fn is_number(t: &PortTraits) -> bool {
    t.port_type == PortType::Number
}

fn is_writable(t: &PortTraits) -> bool {
    t.writable
}

static STANDARD: LazyLock<Vec<AttrDef>> = LazyLock::new(|| {
    use AttrType::*;
    vec![
        AttrDef::new("id", String).display_name("Identifier"),
        AttrDef::new("type", String).choices(vec![
            Choice { value: json!("boolean"), display_name: Some("Boolean".into()) },
            Choice { value: json!("number"), display_name: Some("Number".into()) },
        ]),
        AttrDef::new("display_name", String).modifiable().optional().max(64.0),
        AttrDef::new("unit", String)
            .modifiable()
            .optional()
            .max(64.0)
            .enabled_if(is_number),
        AttrDef::new("writable", Boolean),
        AttrDef::new("enabled", Boolean).modifiable(),
        AttrDef::new("persisted", Boolean)
            .modifiable()
            .description("Keep the last value across restarts"),
        AttrDef::new("internal", Boolean)
            .modifiable()
            .description("Do not emit value-change events"),
        AttrDef::new("virtual", Boolean),
        AttrDef::new("tag", String).modifiable().optional().max(64.0),
        AttrDef::new("expression", String)
            .modifiable()
            .optional()
            .max(1024.0)
            .enabled_if(is_writable),
        AttrDef::new("transform_read", String).modifiable().optional().max(1024.0),
        AttrDef::new("transform_write", String)
            .modifiable()
            .optional()
            .max(1024.0)
            .enabled_if(is_writable),
        AttrDef::new("history_interval", Number)
            .modifiable()
            .integer()
            .min(-1.0)
            .max(2_147_483_647.0)
            .default_value(json!(0))
            .description("Seconds between samples; -1 samples every change, 0 disables"),
        AttrDef::new("history_retention", Number)
            .modifiable()
            .integer()
            .min(0.0)
            .default_value(json!(0))
            .description("Seconds to keep samples; 0 keeps them forever"),
        AttrDef::new("min", Number).modifiable().optional().enabled_if(is_number),
        AttrDef::new("max", Number).modifiable().optional().enabled_if(is_number),
        AttrDef::new("integer", Boolean).modifiable().enabled_if(is_number),
        AttrDef::new("step", Number)
            .modifiable()
            .optional()
            .min(0.0)
            .enabled_if(is_number),
        AttrDef::new("choices", List).modifiable().optional(),
    ]
});

/// Attributes every port has (subject to each def's `enabled` predicate)
pub fn standard_attrdefs() -> &'static [AttrDef] {
    &STANDARD
}

pub fn is_standard(name: &str) -> bool {
    STANDARD.iter().any(|d| d.name == name)
}

/// Order in which persisted attributes are applied on load:
/// `enabled` first, then alphabetically, `expression` last.
pub fn load_order<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_by_key(|n| {
        let rank = match *n {
            "enabled" => 0,
            "expression" => 2,
            _ => 1,
        };
        (rank, *n)
    });
    names
}
