//! Core domain model for the mandi price warehouse: raw and canonical price records,
//! dimension keys and rows, fact rows, and the dimension catalog.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// One reported price observation exactly as it arrives in a daily batch file.
///
/// Every field is optional because the upstream feed has gaps; prices stay textual
/// until the normalizer validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "District")]
    pub district: Option<String>,
    #[serde(rename = "Market")]
    pub market: Option<String>,
    #[serde(rename = "Commodity")]
    pub commodity: Option<String>,
    #[serde(rename = "Variety")]
    pub variety: Option<String>,
    #[serde(rename = "Grade")]
    pub grade: Option<String>,
    #[serde(rename = "Arrival_Date")]
    pub arrival_date: Option<String>,
    #[serde(rename = "Min_Price")]
    pub min_price: Option<String>,
    #[serde(rename = "Max_Price")]
    pub max_price: Option<String>,
    #[serde(rename = "Modal_Price")]
    pub modal_price: Option<String>,
}

/// Calendar attributes derived from an arrival date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DateParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub weekday: &'static str,
}

impl DateParts {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
            weekday: weekday_name(date.weekday()),
        }
    }
}

/// A cleaned record: every field present, labels title-cased, prices validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub state: String,
    pub district: String,
    pub market: String,
    pub commodity: String,
    pub variety: String,
    pub grade: String,
    pub arrival_date: NaiveDate,
    pub date_parts: DateParts,
    pub min_price: f64,
    pub max_price: f64,
    pub modal_price: f64,
}

impl CanonicalRecord {
    pub fn prices_ordered(&self) -> bool {
        self.min_price <= self.modal_price && self.modal_price <= self.max_price
    }

    pub fn state_record(&self) -> DimensionRecord {
        DimensionRecord::new(vec![Value::Text(self.state.clone())], Vec::new())
    }

    pub fn commodity_record(&self) -> DimensionRecord {
        DimensionRecord::new(
            vec![
                Value::Text(self.commodity.clone()),
                Value::Text(self.variety.clone()),
                Value::Text(self.grade.clone()),
            ],
            Vec::new(),
        )
    }

    /// The market key embeds the resolved state surrogate id, so it only exists once
    /// the state dimension has been resolved for this record.
    pub fn market_record(&self, state_id: i64) -> DimensionRecord {
        DimensionRecord::new(
            vec![
                Value::Text(self.market.clone()),
                Value::Text(self.district.clone()),
                Value::Int(state_id),
            ],
            Vec::new(),
        )
    }

    pub fn date_record(&self) -> DimensionRecord {
        let parts = self.date_parts;
        DimensionRecord::new(
            vec![Value::Date(self.arrival_date)],
            vec![
                Value::Int(i64::from(parts.day)),
                Value::Int(i64::from(parts.month)),
                Value::Int(i64::from(parts.year)),
                Value::Text(parts.weekday.to_string()),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    Text,
    Int,
    Date,
}

/// A single typed cell of a dimension row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Date(NaiveDate),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Int(_) => ValueKind::Int,
            Value::Date(_) => ValueKind::Date,
        }
    }

    /// Canonical comparison form. Fresh batch values and values read back from the
    /// warehouse both pass through here, so they compare equal iff they denote the
    /// same natural key.
    pub fn normalized(self) -> Self {
        match self {
            Value::Text(s) => {
                let trimmed = s.trim();
                if trimmed.len() == s.len() {
                    Value::Text(s)
                } else {
                    Value::Text(trimmed.to_string())
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// Ordered natural-key tuple of one dimension. Construction normalizes every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DimensionKey(Vec<Value>);

impl DimensionKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values.into_iter().map(Value::normalized).collect())
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "({})", parts.join(", "))
    }
}

/// A batch-side candidate for a dimension row: natural key plus derived attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionRecord {
    pub key: DimensionKey,
    pub attributes: Vec<Value>,
}

impl DimensionRecord {
    pub fn new(key: Vec<Value>, attributes: Vec<Value>) -> Self {
        Self {
            key: DimensionKey::new(key),
            attributes,
        }
    }

    /// Key values followed by attribute values, in table column order.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.key.values().iter().chain(self.attributes.iter())
    }
}

/// A persisted dimension row with its warehouse-assigned surrogate id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionRow {
    pub id: i64,
    pub key: DimensionKey,
    pub attributes: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ValueKind,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: ValueKind::Text,
    }
}

const fn int(name: &'static str) -> Column {
    Column {
        name,
        kind: ValueKind::Int,
    }
}

const fn date(name: &'static str) -> Column {
    Column {
        name,
        kind: ValueKind::Date,
    }
}

/// Static description of a dimension table: surrogate id column, natural-key columns
/// (under a uniqueness constraint) and derived attribute columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionTable {
    pub name: &'static str,
    pub id_column: &'static str,
    pub key_columns: &'static [Column],
    pub attribute_columns: &'static [Column],
}

impl DimensionTable {
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.key_columns.iter().chain(self.attribute_columns.iter())
    }

    /// Whether the record's shape matches this table's columns.
    pub fn accepts(&self, record: &DimensionRecord) -> bool {
        record.key.len() == self.key_columns.len()
            && record.attributes.len() == self.attribute_columns.len()
            && record
                .values()
                .zip(self.columns())
                .all(|(value, column)| value.kind() == column.kind)
    }
}

pub const STATE_DIM: DimensionTable = DimensionTable {
    name: "state_dim",
    id_column: "state_id",
    key_columns: &[text("state")],
    attribute_columns: &[],
};

pub const COMMODITY_DIM: DimensionTable = DimensionTable {
    name: "commodity_dim",
    id_column: "commodity_id",
    key_columns: &[text("commodity"), text("variety"), text("grade")],
    attribute_columns: &[],
};

pub const MARKET_DIM: DimensionTable = DimensionTable {
    name: "market_dim",
    id_column: "market_id",
    key_columns: &[text("market"), text("district"), int("state_id")],
    attribute_columns: &[],
};

pub const DATE_DIM: DimensionTable = DimensionTable {
    name: "date_dim",
    id_column: "date_id",
    key_columns: &[date("arrival_date")],
    attribute_columns: &[int("day"), int("month"), int("year"), text("weekday")],
};

/// Resolution order: the market key depends on the resolved state id.
pub const DIMENSIONS: [DimensionTable; 4] = [STATE_DIM, COMMODITY_DIM, MARKET_DIM, DATE_DIM];

pub const FACT_TABLE: &str = "fact_market_prices";

/// One row of `fact_market_prices`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FactRow {
    pub date_id: i64,
    pub market_id: i64,
    pub commodity_id: i64,
    pub min_price: f64,
    pub max_price: f64,
    pub modal_price: f64,
}

/// Title-cases the way Python's `str.title` does: a letter is upper-cased iff the
/// character before it is not a letter, everything else is lower-cased.
pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_is_letter = false;
    for ch in input.chars() {
        if ch.is_alphabetic() {
            if prev_is_letter {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            out.push(ch);
            prev_is_letter = false;
        }
    }
    out
}

/// Trimmed, title-cased label.
pub fn clean_label(input: &str) -> String {
    title_case(input.trim())
}

/// Strips a parenthetical qualifier: `"Tomato (Desi)"` becomes `"Tomato"`.
pub fn base_commodity(name: &str) -> String {
    let head = match name.find('(') {
        Some(idx) => &name[..idx],
        None => name,
    };
    clean_label(head)
}

/// Parses a day-first date (`DD/MM/YYYY`, `DD-MM-YYYY`, `DD.MM.YYYY`, two-digit years)
/// or an ISO `YYYY-MM-DD` date. A trailing time component is ignored.
pub fn parse_day_first(input: &str) -> Option<NaiveDate> {
    let token = input
        .trim()
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()?;
    let parts = token.split(['/', '-', '.']).collect::<Vec<_>>();
    let [a, b, c] = parts.as_slice() else {
        return None;
    };
    if [a, b, c]
        .iter()
        .any(|p| p.is_empty() || !p.bytes().all(|byte| byte.is_ascii_digit()))
    {
        return None;
    }

    if a.len() == 4 {
        let year = a.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, b.parse().ok()?, c.parse().ok()?);
    }

    let day = a.parse().ok()?;
    let month = b.parse().ok()?;
    let year: i32 = match c.len() {
        2 => {
            let yy: i32 = c.parse().ok()?;
            if yy < 69 {
                2000 + yy
            } else {
                1900 + yy
            }
        }
        4 => c.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
