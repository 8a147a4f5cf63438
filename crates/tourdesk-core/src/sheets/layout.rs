//! Per-kind column layouts of the spreadsheet tabs

use serde_json::Value;

use crate::models::{EntityKind, EntityRecord};

/// What a spreadsheet column holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// The record's business identifier
    Id,
    /// A business field copied verbatim
    Field(&'static str),
    /// Computed by a sheet formula; never written
    Formula(&'static str),
}

impl Column {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Field(name) | Self::Formula(name) => name,
        }
    }
}

/// Ordered columns of one entity kind's tab
#[derive(Debug)]
pub struct SheetLayout {
    pub kind: EntityKind,
    pub columns: &'static [Column],
}

static REQUEST_LAYOUT: SheetLayout = SheetLayout {
    kind: EntityKind::Request,
    columns: &[
        Column::Id,
        Column::Field("booking_code"),
        Column::Field("seller_code"),
        Column::Field("seller_name"),
        Column::Field("customer_name"),
        Column::Field("customer_phone"),
        Column::Field("country"),
        Column::Field("pax"),
        Column::Field("start_date"),
        Column::Field("end_date"),
        Column::Field("tour_status"),
        Column::Field("stage"),
        Column::Field("expected_revenue"),
        Column::Field("expected_cost"),
        Column::Formula("expected_profit"),
        Column::Field("note"),
    ],
};

static OPERATOR_LAYOUT: SheetLayout = SheetLayout {
    kind: EntityKind::Operator,
    columns: &[
        Column::Id,
        Column::Field("request_id"),
        Column::Field("booking_code"),
        Column::Field("service_date"),
        Column::Field("service_type"),
        Column::Field("service_name"),
        Column::Field("supplier"),
        Column::Field("quantity"),
        Column::Field("unit_price"),
        Column::Formula("total_cost"),
        Column::Field("paid_amount"),
        Column::Formula("debt"),
        Column::Field("payment_status"),
        Column::Field("note"),
    ],
};

static REVENUE_LAYOUT: SheetLayout = SheetLayout {
    kind: EntityKind::Revenue,
    columns: &[
        Column::Id,
        Column::Field("request_id"),
        Column::Field("booking_code"),
        Column::Field("payment_date"),
        Column::Field("description"),
        Column::Field("currency"),
        Column::Field("foreign_amount"),
        Column::Field("exchange_rate"),
        Column::Formula("amount_vnd"),
        Column::Field("payment_method"),
        Column::Field("payment_source"),
        Column::Field("note"),
    ],
};

/// Registered layout for `kind`
pub const fn layout_for(kind: EntityKind) -> &'static SheetLayout {
    match kind {
        EntityKind::Request => &REQUEST_LAYOUT,
        EntityKind::Operator => &OPERATOR_LAYOUT,
        EntityKind::Revenue => &REVENUE_LAYOUT,
    }
}

impl SheetLayout {
    /// One cell per column. Formula columns are `Null` so the API skips them;
    /// missing fields are written as empty strings.
    pub fn row_values(&self, record: &EntityRecord) -> Vec<Value> {
        self.columns
            .iter()
            .map(|column| match column {
                Column::Id => Value::String(record.id.clone()),
                Column::Formula(_) => Value::Null,
                Column::Field(name) => cell_value(record.field(name)),
            })
            .collect()
    }

    pub fn formula_columns(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().filter_map(|column| match column {
            Column::Formula(name) => Some(*name),
            _ => None,
        })
    }

    pub fn last_column(&self) -> String {
        column_letter(self.columns.len().saturating_sub(1))
    }

    /// `'Tab'!A12:P12`
    pub fn row_range(&self, tab: &str, row: i64) -> String {
        format!("{}!A{row}:{}{row}", quote_tab(tab), self.last_column())
    }

    /// `'Tab'!A:P`, the table an append extends
    pub fn table_range(&self, tab: &str) -> String {
        format!("{}!A:{}", quote_tab(tab), self.last_column())
    }
}

fn cell_value(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::String(String::new()),
        Some(nested @ (Value::Array(_) | Value::Object(_))) => Value::String(nested.to_string()),
        Some(scalar) => scalar.clone(),
    }
}

fn quote_tab(tab: &str) -> String {
    format!("'{}'", tab.replace('\'', "''"))
}

/// Zero-based column index to A1 letters (`0` -> `A`, `26` -> `AA`)
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(char::from(b'A' + u8::try_from(rem).unwrap_or(0)));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}
