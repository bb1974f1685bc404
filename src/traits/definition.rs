//! Trait and model type declarations.
//!
//! A [`ModelTypeDef`] declares, for one `type` tag, every trait a model of
//! that type may carry, the trait's value type and how values from several
//! strata combine. Definitions are built in code or loaded from YAML:
//!
//! ```yaml
//! type: wms
//! mappable: true
//! traits:
//!   - name: layers
//!     type: string
//!   - name: styles
//!     type: object-array
//!     idProperty: layerName
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CatalogError, CatalogResult};

// ---------------------------------------------------------------------------
// TraitType / MergePolicy
// ---------------------------------------------------------------------------

/// Value type of a trait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraitType {
    String,
    Number,
    Boolean,
    /// A string restricted to the listed values.
    Enum(Vec<String>),
    /// A JSON object, shallow-merged across strata.
    Object,
    /// An array of JSON objects.
    ObjectArray,
    /// An array of strings, replaced wholesale per stratum.
    StringArray,
}

impl TraitType {
    fn tag(&self) -> &'static str {
        match self {
            TraitType::String => "string",
            TraitType::Number => "number",
            TraitType::Boolean => "boolean",
            TraitType::Enum(_) => "enum",
            TraitType::Object => "object",
            TraitType::ObjectArray => "object-array",
            TraitType::StringArray => "string-array",
        }
    }

    fn is_array(&self) -> bool {
        matches!(self, TraitType::ObjectArray | TraitType::StringArray)
    }
}

impl fmt::Display for TraitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// How array elements are matched across strata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdProperty {
    /// Elements with equal values of this field are the same element.
    Field(String),
    /// Elements at the same position are the same element.
    Index,
}

/// How values from several strata combine into one effective value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergePolicy {
    /// Highest-priority value wins. Objects are shallow-merged in the same order.
    Override,
    /// Highest-priority array wins as a whole.
    ReplaceArray,
    /// Array elements with the same id are deep-merged, higher strata patching
    /// lower ones.
    MergeArrayById(IdProperty),
}

impl MergePolicy {
    fn tag(&self) -> &'static str {
        match self {
            MergePolicy::Override => "override",
            MergePolicy::ReplaceArray => "replace-array",
            MergePolicy::MergeArrayById(_) => "merge-array-by-id",
        }
    }
}

// ---------------------------------------------------------------------------
// TraitDef
// ---------------------------------------------------------------------------

/// Declaration of one trait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTraitDef", into = "RawTraitDef")]
pub struct TraitDef {
    pub name: String,
    pub trait_type: TraitType,
    pub merge: MergePolicy,
    pub description: String,
}

impl TraitDef {
    fn with_type(name: impl Into<String>, trait_type: TraitType, merge: MergePolicy) -> Self {
        Self {
            name: name.into(),
            trait_type,
            merge,
            description: String::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::with_type(name, TraitType::String, MergePolicy::Override)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::with_type(name, TraitType::Number, MergePolicy::Override)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::with_type(name, TraitType::Boolean, MergePolicy::Override)
    }

    pub fn enumeration<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        Self::with_type(name, TraitType::Enum(values), MergePolicy::Override)
    }

    pub fn object(name: impl Into<String>) -> Self {
        Self::with_type(name, TraitType::Object, MergePolicy::Override)
    }

    /// Array of objects merged element-wise by `id_property`.
    pub fn object_array(name: impl Into<String>, id_property: IdProperty) -> Self {
        Self::with_type(name, TraitType::ObjectArray, MergePolicy::MergeArrayById(id_property))
    }

    /// Array of strings; the highest stratum's array wins.
    pub fn string_array(name: impl Into<String>) -> Self {
        Self::with_type(name, TraitType::StringArray, MergePolicy::ReplaceArray)
    }

    /// Override the merge policy. Follow with [`TraitDef::check`] when the
    /// combination comes from untrusted input.
    pub fn with_merge(mut self, merge: MergePolicy) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Whether the effective value is the first one found scanning top-down.
    pub fn is_first_wins(&self) -> bool {
        self.merge == MergePolicy::Override && self.trait_type != TraitType::Object
    }

    /// Check that the merge policy fits the value type.
    pub fn check(&self) -> CatalogResult<()> {
        let ok = match &self.merge {
            MergePolicy::Override => true,
            MergePolicy::ReplaceArray => self.trait_type.is_array(),
            MergePolicy::MergeArrayById(_) => self.trait_type == TraitType::ObjectArray,
        };
        if ok {
            Ok(())
        } else {
            Err(CatalogError::InvalidDescription(format!(
                "trait `{}` of type {} cannot use merge policy {}",
                self.name,
                self.trait_type,
                self.merge.tag()
            )))
        }
    }

    /// Check that `value` matches the declared type. `null` is always accepted
    /// and clears the trait.
    pub fn validate(&self, value: &Value) -> CatalogResult<()> {
        if value.is_null() {
            return Ok(());
        }
        let ok = match &self.trait_type {
            TraitType::String => value.is_string(),
            TraitType::Number => value.is_number(),
            TraitType::Boolean => value.is_boolean(),
            TraitType::Enum(values) => value.as_str().map_or(false, |s| values.iter().any(|v| v == s)),
            TraitType::Object => value.is_object(),
            TraitType::ObjectArray => value
                .as_array()
                .map_or(false, |items| items.iter().all(Value::is_object)),
            TraitType::StringArray => value
                .as_array()
                .map_or(false, |items| items.iter().all(Value::is_string)),
        };
        if ok {
            return Ok(());
        }
        let expected = match &self.trait_type {
            TraitType::Enum(values) => format!("one of {:?}", values),
            other => format!("a value of type {}", other),
        };
        Err(CatalogError::InvalidTraitValue {
            trait_name: self.name.clone(),
            message: format!("expected {}, got {}", expected, value),
        })
    }
}

/// Serialized shape of a [`TraitDef`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTraitDef {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id_property: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
}

impl TryFrom<RawTraitDef> for TraitDef {
    type Error = CatalogError;

    fn try_from(raw: RawTraitDef) -> Result<Self, Self::Error> {
        let id_property = match raw.id_property.as_deref() {
            Some("index") => IdProperty::Index,
            Some(field) => IdProperty::Field(field.to_string()),
            None => IdProperty::Field("id".to_string()),
        };
        let mut def = match raw.kind.as_str() {
            "string" => TraitDef::string(raw.name),
            "number" => TraitDef::number(raw.name),
            "boolean" => TraitDef::boolean(raw.name),
            "enum" => TraitDef::enumeration(raw.name, raw.values),
            "object" => TraitDef::object(raw.name),
            "object-array" => TraitDef::object_array(raw.name, id_property.clone()),
            "string-array" => TraitDef::string_array(raw.name),
            other => {
                return Err(CatalogError::InvalidDescription(format!(
                    "unknown trait type `{}`",
                    other
                )))
            }
        };
        match raw.merge.as_deref() {
            None => {}
            Some("override") => def.merge = MergePolicy::Override,
            Some("replace-array") => def.merge = MergePolicy::ReplaceArray,
            Some("merge-array-by-id") => def.merge = MergePolicy::MergeArrayById(id_property),
            Some(other) => {
                return Err(CatalogError::InvalidDescription(format!(
                    "unknown merge policy `{}`",
                    other
                )))
            }
        }
        def.description = raw.description;
        def.check()?;
        Ok(def)
    }
}

impl From<TraitDef> for RawTraitDef {
    fn from(def: TraitDef) -> Self {
        let id_property = match &def.merge {
            MergePolicy::MergeArrayById(IdProperty::Index) => Some("index".to_string()),
            MergePolicy::MergeArrayById(IdProperty::Field(f)) => Some(f.clone()),
            _ => None,
        };
        let values = match &def.trait_type {
            TraitType::Enum(values) => values.clone(),
            _ => Vec::new(),
        };
        RawTraitDef {
            kind: def.trait_type.tag().to_string(),
            merge: Some(def.merge.tag().to_string()),
            name: def.name,
            values,
            id_property,
            description: def.description,
        }
    }
}

// ---------------------------------------------------------------------------
// ModelTypeDef
// ---------------------------------------------------------------------------

/// Behaviors a model type opts into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Has a `members` list of child model ids.
    #[serde(default)]
    pub group: bool,
    /// Produces map items and may sit on the workbench.
    #[serde(default)]
    pub mappable: bool,
    /// Resolves into a separate target model.
    #[serde(default)]
    pub reference: bool,
}

/// Trait declarations for one model `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawModelTypeDef")]
pub struct ModelTypeDef {
    type_name: String,
    traits: BTreeMap<String, TraitDef>,
    capabilities: Capabilities,
}

impl ModelTypeDef {
    /// A leaf type carrying the base traits every model has.
    pub fn new(type_name: impl Into<String>) -> Self {
        let mut def = Self {
            type_name: type_name.into(),
            traits: BTreeMap::new(),
            capabilities: Capabilities::default(),
        };
        for base in [
            TraitDef::string("name").with_description("Display name"),
            TraitDef::string("description"),
            TraitDef::string("url"),
            TraitDef::object_array("info", IdProperty::Field("name".into()))
                .with_description("Info sections, merged by section name"),
        ] {
            def.traits.insert(base.name.clone(), base);
        }
        def
    }

    /// A type whose models hold an ordered list of member ids.
    pub fn group(type_name: impl Into<String>) -> Self {
        Self::new(type_name).as_group()
    }

    /// A type whose models dereference a catalog record into a target.
    pub fn record_reference(type_name: impl Into<String>) -> Self {
        Self::new(type_name).as_reference()
    }

    fn as_group(mut self) -> Self {
        self.capabilities.group = true;
        self.with_trait(TraitDef::string_array("members"))
            .with_trait(TraitDef::boolean("isOpen"))
    }

    fn as_reference(mut self) -> Self {
        self.capabilities.reference = true;
        self.with_trait(TraitDef::string("recordId"))
            .with_trait(TraitDef::object("record").with_description("Inline record; skips fetching"))
            .with_trait(TraitDef::object("override").with_description("Traits re-applied onto the target"))
    }

    /// Mark models of this type as mappable.
    pub fn mappable(mut self) -> Self {
        self.capabilities.mappable = true;
        self
    }

    /// Declare an additional trait, replacing any trait of the same name.
    pub fn with_trait(mut self, def: TraitDef) -> Self {
        self.traits.insert(def.name.clone(), def);
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_group(&self) -> bool {
        self.capabilities.group
    }

    pub fn is_mappable(&self) -> bool {
        self.capabilities.mappable
    }

    pub fn is_reference(&self) -> bool {
        self.capabilities.reference
    }

    pub fn trait_def(&self, name: &str) -> Option<&TraitDef> {
        self.traits.get(name)
    }

    /// Look up a trait, failing with [`CatalogError::UnknownTrait`].
    pub fn require_trait(&self, name: &str) -> CatalogResult<&TraitDef> {
        self.traits.get(name).ok_or_else(|| CatalogError::UnknownTrait {
            model_type: self.type_name.clone(),
            trait_name: name.to_string(),
        })
    }

    pub fn traits(&self) -> impl Iterator<Item = &TraitDef> {
        self.traits.values()
    }
}

#[derive(Debug, Deserialize)]
struct RawModelTypeDef {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(flatten)]
    capabilities: Capabilities,
    #[serde(default)]
    traits: Vec<TraitDef>,
}

impl From<RawModelTypeDef> for ModelTypeDef {
    fn from(raw: RawModelTypeDef) -> Self {
        let mut def = ModelTypeDef::new(raw.type_name);
        if raw.capabilities.group {
            def = def.as_group();
        }
        if raw.capabilities.reference {
            def = def.as_reference();
        }
        if raw.capabilities.mappable {
            def = def.mappable();
        }
        raw.traits.into_iter().fold(def, ModelTypeDef::with_trait)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
