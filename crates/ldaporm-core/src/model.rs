//! Model name-mapping table
//!
//! The object-mapping layer describes each model with a plain table: field
//! names, the directory attributes they are stored in, which one is the
//! primary key, where entries live and which object classes they carry.

use serde::{Deserialize, Serialize};

use crate::error::{DirectoryError, DirectoryResult};

/// Name of the implicit object class attribute.
pub const OBJECTCLASS_ATTRIBUTE: &str = "objectclass";

/// `ldap_options` flag enabling cookie-paged searches for full fetches.
pub const PAGED_SEARCH_OPTION: &str = "paged_search";

/// Value kind of a field, as far as the engine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    String,
    Integer,
    Binary,
    Boolean,
    DateTime,
    List,
}

impl FieldKind {
    /// Whether ordering comparisons (`gt`, `lte`, ...) are allowed.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Integer)
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Name used by callers in filters and projections.
    pub name: String,
    /// Directory attribute the field is stored in.
    pub attribute: String,
    #[serde(default)]
    pub kind: FieldKind,
    /// Whether the engine may write this attribute.
    #[serde(default = "default_true")]
    pub editable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

fn default_true() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            attribute: name.clone(),
            name,
            kind,
            editable: true,
            primary_key: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Binary)
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::List)
    }

    /// Store the field under a different attribute name.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = attribute.into();
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.editable = false;
        self
    }
}

/// Everything the engine needs to know about one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Model name used in error messages.
    pub name: String,
    /// Server name in the configuration mapping.
    pub server: String,
    /// Base DN under which entries live; empty means the server's `basedn`.
    #[serde(default)]
    pub basedn: String,
    /// Structural object class used to scope every query.
    pub objectclass: Option<String>,
    /// Additional object classes written on add.
    #[serde(default)]
    pub extra_objectclasses: Vec<String>,
    /// Default ordering, field names with optional leading `-`.
    #[serde(default)]
    pub ordering: Vec<String>,
    /// Engine options such as `paged_search`.
    #[serde(default)]
    pub ldap_options: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

impl ModelMeta {
    /// Start describing a model.
    pub fn builder(name: impl Into<String>) -> ModelMetaBuilder {
        ModelMetaBuilder {
            meta: ModelMeta {
                name: name.into(),
                server: "default".to_string(),
                basedn: String::new(),
                objectclass: None,
                extra_objectclasses: Vec::new(),
                ordering: Vec::new(),
                ldap_options: Vec::new(),
                fields: Vec::new(),
            },
        }
    }

    /// Check the table is usable.
    pub fn validate(&self) -> DirectoryResult<()> {
        let pks = self.fields.iter().filter(|f| f.primary_key).count();
        if pks != 1 {
            return Err(DirectoryError::config(format!(
                "model {} must declare exactly one primary key field, found {pks}",
                self.name
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(DirectoryError::config(format!(
                    "model {} declares field '{}' twice",
                    self.name, field.name
                )));
            }
        }
        for name in &self.ordering {
            self.field(name.trim_start_matches('-'))?;
        }
        Ok(())
    }

    /// Primary key field.
    pub fn pk(&self) -> DirectoryResult<&FieldSpec> {
        self.fields.iter().find(|f| f.primary_key).ok_or_else(|| {
            DirectoryError::config(format!("model {} has no primary key field", self.name))
        })
    }

    /// Primary key attribute name.
    pub fn pk_attribute(&self) -> DirectoryResult<&str> {
        Ok(&self.pk()?.attribute)
    }

    /// Look up a field by name; `pk` resolves to the primary key.
    pub fn field(&self, name: &str) -> DirectoryResult<&FieldSpec> {
        if name == "pk" {
            return self.pk();
        }
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DirectoryError::InvalidField {
                field: name.to_string(),
                model: self.name.clone(),
            })
    }

    /// Look up a field by its directory attribute, case-insensitively.
    pub fn field_for_attribute(&self, attribute: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.attribute.eq_ignore_ascii_case(attribute))
    }

    /// Whether the engine may write the given attribute.
    pub fn is_editable_attribute(&self, attribute: &str) -> bool {
        if attribute.eq_ignore_ascii_case(OBJECTCLASS_ATTRIBUTE) {
            return true;
        }
        self.field_for_attribute(attribute)
            .map(|f| f.editable)
            .unwrap_or(false)
    }

    /// All object classes written on add.
    pub fn all_objectclasses(&self) -> Vec<String> {
        self.extra_objectclasses
            .iter()
            .cloned()
            .chain(self.objectclass.iter().cloned())
            .collect()
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.ldap_options.iter().any(|o| o == option)
    }
}

/// Builder for [`ModelMeta`].
#[derive(Debug, Clone)]
pub struct ModelMetaBuilder {
    meta: ModelMeta,
}

impl ModelMetaBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.meta.server = server.into();
        self
    }

    pub fn basedn(mut self, basedn: impl Into<String>) -> Self {
        self.meta.basedn = basedn.into();
        self
    }

    pub fn objectclass(mut self, objectclass: impl Into<String>) -> Self {
        self.meta.objectclass = Some(objectclass.into());
        self
    }

    pub fn extra_objectclasses<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.extra_objectclasses = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.ordering = ordering.into_iter().map(Into::into).collect();
        self
    }

    pub fn option(mut self, option: impl Into<String>) -> Self {
        self.meta.ldap_options.push(option.into());
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.meta.fields.push(field);
        self
    }

    /// Validate and finish.
    pub fn build(self) -> DirectoryResult<ModelMeta> {
        self.meta.validate()?;
        Ok(self.meta)
    }
}
