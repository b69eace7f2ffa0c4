//! Declared layouts of the retail files.
//!
//! Every dataset has a fixed, versioned column list. Files are checked against
//! it when parsed and rejected on any mismatch instead of guessing a layout
//! from their contents.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dataset {
    Transactions,
    Clients,
    Products,
    Stores,
}

/// Undated files that can be refreshed alongside the daily transactions
pub const REFERENCE_BLOBS: [&str; 3] = ["clients.csv", "products.csv", "stores.csv"];

impl Dataset {
    /// Picks the dataset for a blob from its file name
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        match file_name {
            "clients.csv" => Some(Self::Clients),
            "products.csv" => Some(Self::Products),
            "stores.csv" => Some(Self::Stores),
            name if name.starts_with("transactions_") => Some(Self::Transactions),
            _ => None,
        }
    }

    /// Undated datasets that replace their whole table when their file changes
    pub fn is_reference(&self) -> bool {
        !matches!(self, Self::Transactions)
    }

    pub fn schema(&self) -> &'static DatasetSchema {
        match self {
            Self::Transactions => &TRANSACTIONS_V1,
            Self::Clients => &CLIENTS_V1,
            Self::Products => &PRODUCTS_V1,
            Self::Stores => &STORES_V1,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Clients => "clients",
            Self::Products => "products",
            Self::Stores => "stores",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
    Date,
    Time,
    /// `(latitude, longitude)` packed in one field
    Coordinates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

const fn required(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        nullable: false,
    }
}

const fn optional(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        nullable: true,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct DatasetSchema {
    pub dataset: Dataset,
    pub version: u32,
    pub delimiter: u8,
    pub columns: &'static [ColumnSpec],
}

impl DatasetSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Maps each declared column to its position in `header`.
    ///
    /// The header must contain every declared column exactly once and nothing else.
    pub fn resolve_header<'h, I>(&self, header: I) -> Result<Vec<usize>, String>
    where
        I: IntoIterator<Item = &'h str>,
    {
        let names: Vec<&str> = header.into_iter().map(str::trim).collect();

        if let Some(unknown) = names.iter().find(|n| self.column(n).is_none()) {
            return Err(format!(
                "unexpected column '{}' for {} schema v{}",
                unknown, self.dataset, self.version
            ));
        }

        let mut positions = Vec::with_capacity(self.columns.len());
        for column in self.columns {
            let mut found = names.iter().enumerate().filter(|(_, n)| **n == column.name);
            match (found.next(), found.next()) {
                (Some((idx, _)), None) => positions.push(idx),
                (Some(_), Some(_)) => {
                    return Err(format!("column '{}' appears more than once", column.name))
                }
                (None, _) => {
                    return Err(format!(
                        "missing column '{}' for {} schema v{}",
                        column.name, self.dataset, self.version
                    ))
                }
            }
        }
        Ok(positions)
    }
}

pub static TRANSACTIONS_V1: DatasetSchema = DatasetSchema {
    dataset: Dataset::Transactions,
    version: 1,
    delimiter: b';',
    columns: &[
        required("transaction_id", ColumnKind::Integer),
        required("client_id", ColumnKind::Integer),
        required("product_id", ColumnKind::Integer),
        required("store_id", ColumnKind::Integer),
        required("date", ColumnKind::Date),
        required("hour", ColumnKind::Integer),
        required("minute", ColumnKind::Integer),
        required("quantity", ColumnKind::Integer),
    ],
};

pub static CLIENTS_V1: DatasetSchema = DatasetSchema {
    dataset: Dataset::Clients,
    version: 1,
    delimiter: b';',
    columns: &[
        required("id", ColumnKind::Integer),
        required("name", ColumnKind::Text),
        optional("job", ColumnKind::Text),
        optional("email", ColumnKind::Text),
        required("account_id", ColumnKind::Text),
    ],
};

pub static PRODUCTS_V1: DatasetSchema = DatasetSchema {
    dataset: Dataset::Products,
    version: 1,
    delimiter: b';',
    columns: &[
        required("id", ColumnKind::Integer),
        required("ean", ColumnKind::Integer),
        optional("brand", ColumnKind::Text),
        optional("description", ColumnKind::Text),
    ],
};

pub static STORES_V1: DatasetSchema = DatasetSchema {
    dataset: Dataset::Stores,
    version: 1,
    delimiter: b';',
    columns: &[
        required("id", ColumnKind::Integer),
        required("latlng", ColumnKind::Coordinates),
        required("opening", ColumnKind::Time),
        required("closing", ColumnKind::Time),
        required("type", ColumnKind::Text),
    ],
};
