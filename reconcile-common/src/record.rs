use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A single row as handed over by a spreadsheet parser: header name to cell value.
pub type RawRow = Map<String, Value>;

pub const NAME_FIELD: &str = "name";
pub const EMAIL_FIELD: &str = "email";
pub const PHONE_FIELD: &str = "phone";
pub const ID_FIELD: &str = "id";
pub const INSERTED_AT_FIELD: &str = "inserted_at";

// Header spellings found in older uploads, only honoured when the canonical column is absent.
const EMAIL_ALIAS: &str = "email_id";
const PHONE_ALIAS: &str = "phone_number";

/// The fixed identity fields used to recognise a real-world entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl Identity {
    pub fn new(name: Option<&str>, email: Option<&str>, phone: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_owned),
            email: email.map(str::to_owned),
            phone: phone.map(str::to_owned),
        }
    }

    /// Overlay the fields present in `other`, keeping ours where `other` has none.
    pub fn merge(&mut self, other: &Identity) {
        if other.name.is_some() {
            self.name.clone_from(&other.name);
        }
        if other.email.is_some() {
            self.email.clone_from(&other.email);
        }
        if other.phone.is_some() {
            self.phone.clone_from(&other.phone);
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        match field {
            NAME_FIELD => self.name.as_deref(),
            EMAIL_FIELD => self.email.as_deref(),
            PHONE_FIELD => self.phone.as_deref(),
            _ => None,
        }
    }
}

/// Identity values are compared as text. Spreadsheets hand phone numbers back as
/// floats, so integral numbers are rendered without a fractional part.
pub fn identity_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                n.as_f64().map(|f| {
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        (f as i64).to_string()
                    } else {
                        f.to_string()
                    }
                })
            }
        }
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// A row after normalization: field names canonicalized, ingestion time stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub fields: Map<String, Value>,
    pub inserted_at: DateTime<Utc>,
}

/// The identity/attribute split of a normalized row, ready for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRecord {
    pub identity: Identity,
    pub attributes: Map<String, Value>,
    pub inserted_at: DateTime<Utc>,
}

impl InboundRecord {
    pub fn new(
        identity: Identity,
        attributes: Map<String, Value>,
        inserted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity,
            attributes,
            inserted_at,
        }
    }

    /// Blank cells carry no information, so null values are dropped here and never
    /// reach the store.
    pub fn from_normalized(record: NormalizedRecord) -> Self {
        let NormalizedRecord {
            mut fields,
            inserted_at,
        } = record;

        fields.retain(|_, value| !value.is_null());

        let name = take_identity(&mut fields, NAME_FIELD, None);
        let email = take_identity(&mut fields, EMAIL_FIELD, Some(EMAIL_ALIAS));
        let phone = take_identity(&mut fields, PHONE_FIELD, Some(PHONE_ALIAS));

        // These two belong to the stored entity, a column with the same name is not an attribute.
        fields.remove(ID_FIELD);
        fields.remove(INSERTED_AT_FIELD);

        Self {
            identity: Identity { name, email, phone },
            attributes: fields,
            inserted_at,
        }
    }

    /// True when the row carried nothing worth storing.
    pub fn is_blank(&self) -> bool {
        self.identity == Identity::default() && self.attributes.is_empty()
    }
}

fn take_identity(
    fields: &mut Map<String, Value>,
    canonical: &str,
    alias: Option<&str>,
) -> Option<String> {
    let value = match fields.remove(canonical) {
        Some(value) => Some(value),
        None => alias.and_then(|alias| fields.remove(alias)),
    };
    value.as_ref().and_then(identity_text)
}

/// A persisted entity. Serializes flat, the way it is exported and returned by filters.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub id: String,
    pub identity: Identity,
    pub attributes: Map<String, Value>,
    pub inserted_at: DateTime<Utc>,
}

impl StoredEntity {
    /// Look up any field by name, identity fields and bookkeeping columns included.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            ID_FIELD => Some(Value::String(self.id.clone())),
            INSERTED_AT_FIELD => Some(Value::String(self.inserted_at.to_rfc3339())),
            NAME_FIELD | EMAIL_FIELD | PHONE_FIELD => self
                .identity
                .get(name)
                .map(|value| Value::String(value.to_owned())),
            _ => self.attributes.get(name).cloned(),
        }
    }
}

impl Serialize for StoredEntity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(ID_FIELD, &self.id)?;
        for field in [NAME_FIELD, EMAIL_FIELD, PHONE_FIELD] {
            if let Some(value) = self.identity.get(field) {
                map.serialize_entry(field, value)?;
            }
        }
        for (key, value) in &self.attributes {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(INSERTED_AT_FIELD, &self.inserted_at.to_rfc3339())?;
        map.end()
    }
}
