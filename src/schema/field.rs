//! Field declarations.

use regex::Regex;
use sea_orm::sea_query::ForeignKeyAction;
use serde_json::Value as JsonValue;

/// Storage type of a plain column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    BigInteger,
    Boolean,
    Float,
    Uuid,
    Timestamp,
    Date,
    Json,
}

impl ColumnType {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            ColumnType::Text => "a string",
            ColumnType::Integer | ColumnType::BigInteger => "an integer",
            ColumnType::Boolean => "either true or false",
            ColumnType::Float => "a float",
            ColumnType::Uuid => "a valid UUID",
            ColumnType::Timestamp => "a valid RFC 3339 datetime",
            ColumnType::Date => "a valid date in YYYY-MM-DD format",
            ColumnType::Json => "valid JSON",
        }
    }
}

/// What happens to referencing rows when the target row is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnDelete {
    #[default]
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl From<OnDelete> for ForeignKeyAction {
    fn from(value: OnDelete) -> Self {
        match value {
            OnDelete::Cascade => ForeignKeyAction::Cascade,
            OnDelete::SetNull => ForeignKeyAction::SetNull,
            OnDelete::Restrict => ForeignKeyAction::Restrict,
            OnDelete::NoAction => ForeignKeyAction::NoAction,
        }
    }
}

/// Value checks applied by full-clean before a record is written.
#[derive(Debug, Clone)]
pub enum Validator {
    MaxLength(usize),
    MinValue(i64),
    MaxValue(i64),
    Pattern(Regex),
}

impl Validator {
    /// Builds a [`Validator::Pattern`], failing on an invalid expression.
    pub fn pattern(expression: &str) -> Result<Self, regex::Error> {
        Regex::new(expression).map(Validator::Pattern)
    }

    /// Returns the user-facing message when `value` fails this check.
    pub(crate) fn check(&self, value: &JsonValue) -> Option<String> {
        match self {
            Validator::MaxLength(max) => {
                let length = value.as_str()?.chars().count();
                (length > *max).then(|| {
                    format!("Ensure this value has at most {max} characters (it has {length}).")
                })
            }
            Validator::MinValue(min) => {
                let number = value.as_f64()?;
                (number < *min as f64)
                    .then(|| format!("Ensure this value is greater than or equal to {min}."))
            }
            Validator::MaxValue(max) => {
                let number = value.as_f64()?;
                (number > *max as f64)
                    .then(|| format!("Ensure this value is less than or equal to {max}."))
            }
            Validator::Pattern(regex) => {
                let text = value.as_str()?;
                (!regex.is_match(text)).then(|| "Enter a valid value.".to_string())
            }
        }
    }
}

/// Declared shape of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Column(ColumnType),
    /// `to` is `"self"`, `"Model"` (same app) or `"app.Model"`.
    ForeignKey { to: String, on_delete: OnDelete },
    ManyToMany { to: String, through: Option<String> },
}

/// A field as authored on a declaration.
#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub kind: FieldKind,
    pub null: bool,
    pub blank: bool,
    pub unique: bool,
    pub default: Option<JsonValue>,
    pub validators: Vec<Validator>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            null: false,
            blank: false,
            unique: false,
            default: None,
            validators: Vec::new(),
        }
    }

    pub fn column(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self::new(name, FieldKind::Column(column_type))
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Integer)
    }

    pub fn big_integer(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::BigInteger)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Boolean)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Float)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Uuid)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Timestamp)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Date)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::column(name, ColumnType::Json)
    }

    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ForeignKey {
                to: to.into(),
                on_delete: OnDelete::default(),
            },
        )
    }

    pub fn many_to_many(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ManyToMany {
                to: to.into(),
                through: None,
            },
        )
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn allow_blank(mut self) -> Self {
        self.blank = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Sets the delete action of a foreign key. No-op on other kinds.
    pub fn on_delete(mut self, action: OnDelete) -> Self {
        if let FieldKind::ForeignKey { on_delete, .. } = &mut self.kind {
            *on_delete = action;
        }
        self
    }

    /// Routes a many-to-many through an explicit junction model. No-op on other kinds.
    pub fn through(mut self, model: impl Into<String>) -> Self {
        if let FieldKind::ManyToMany { through, .. } = &mut self.kind {
            *through = Some(model.into());
        }
        self
    }

    pub fn is_relation(&self) -> bool {
        !matches!(self.kind, FieldKind::Column(_))
    }

    /// The raw reference of a relational field.
    pub fn relation_target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Column(_) => None,
            FieldKind::ForeignKey { to, .. } | FieldKind::ManyToMany { to, .. } => Some(to),
        }
    }
}
